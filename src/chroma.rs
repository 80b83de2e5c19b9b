// Green-screen removal for generated overlays.
// Visual expectation: the flat green backdrop the image service paints behind the
// subject disappears, so only the hat/mask/glasses land on your face.
// Runs once per new overlay image, never per frame.

use crate::config::ChromaConfig;
use image::RgbaImage;

#[derive(Debug, Clone, Copy)]
pub struct ChromaKey {
    min_green: u8,
    dominance: f32,
}

impl Default for ChromaKey {
    fn default() -> Self {
        Self::from_config(&ChromaConfig::default())
    }
}

impl ChromaKey {
    pub fn from_config(cfg: &ChromaConfig) -> Self {
        Self { min_green: cfg.min_green, dominance: cfg.dominance }
    }

    /// True when (r,g,b) counts as green-screen background.
    /// A fixed threshold rule: dark or washed-out greens survive, and greenish
    /// skin can be keyed out.
    #[inline]
    pub fn is_background(&self, r: u8, g: u8, b: u8) -> bool {
        let g = g as f32;
        g > self.min_green as f32 && g > self.dominance * r as f32 && g > self.dominance * b as f32
    }

    /// Return a copy of `src` with every background pixel made fully transparent.
    /// Colour channels are never touched, only alpha.
    pub fn process(&self, src: &RgbaImage) -> RgbaImage {
        let mut out = src.clone();
        self.process_in_place(&mut out);
        out
    }

    /// Same as `process`, for callers that own the image. Returns how many pixels were keyed out.
    pub fn process_in_place(&self, img: &mut RgbaImage) -> usize {
        let mut keyed = 0;
        for px in img.pixels_mut() {
            let [r, g, b, _] = px.0;
            if self.is_background(r, g, b) {
                px.0[3] = 0;
                keyed += 1;
            }
        }
        keyed
    }
}
