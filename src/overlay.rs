// Overlay compositing: the render surface that sits on top of the live video,
// and the per-frame pass that stamps the processed overlay onto every face.
// Visual expectation: a hat (or whatever was generated) twice the size of each
// face box, centred on the face, follows you around with the video underneath.

use crate::error::Error;
use crate::types::{Detection, DrawRect, FrameBuffer, Size};
use image::RgbaImage;

/// Transparent ARGB layer the size of the live video.
/// Pixels are 0xAARRGGBB with straight (non-premultiplied) alpha; 0 = fully clear.
pub struct RenderSurface {
    width: usize,
    height: usize,
    pixels: Vec<u32>,
}

impl Default for RenderSurface {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl RenderSurface {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height, pixels: vec![0; width * height] }
    }

    pub fn size(&self) -> Size {
        Size { width: self.width, height: self.height }
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    pub fn pixel(&self, x: usize, y: usize) -> u32 {
        self.pixels[y * self.width + x]
    }

    /// Match the live video resolution. Returns true if the surface changed size.
    pub fn resize_to(&mut self, size: Size) -> bool {
        if size == self.size() {
            return false;
        }
        self.width = size.width;
        self.height = size.height;
        self.pixels = vec![0; size.width * size.height];
        true
    }

    /// Make every pixel transparent.
    pub fn clear(&mut self) {
        self.pixels.fill(0);
    }

    pub fn is_clear(&self) -> bool {
        self.pixels.iter().all(|&p| p == 0)
    }

    /// Draw `bitmap` stretched to `rect` (nearest neighbour), blending source-over.
    /// Parts of `rect` outside the surface are skipped.
    pub fn draw_scaled(&mut self, bitmap: &RgbaImage, rect: DrawRect) {
        let (bw, bh) = bitmap.dimensions();
        if bw == 0 || bh == 0 || rect.width <= 0.0 || rect.height <= 0.0 {
            return;
        }

        // Destination pixel span, clipped to the surface.
        let x0 = (rect.x.round() as i64).max(0);
        let y0 = (rect.y.round() as i64).max(0);
        let x1 = ((rect.x + rect.width).round() as i64).min(self.width as i64);
        let y1 = ((rect.y + rect.height).round() as i64).min(self.height as i64);
        if x0 >= x1 || y0 >= y1 {
            return;
        }

        let sx = bw as f32 / rect.width;
        let sy = bh as f32 / rect.height;

        for dy in y0..y1 {
            // Sample the source at the destination pixel centre.
            let v = (((dy as f32 + 0.5 - rect.y) * sy) as u32).min(bh - 1);
            let row = dy as usize * self.width;
            for dx in x0..x1 {
                let u = (((dx as f32 + 0.5 - rect.x) * sx) as u32).min(bw - 1);
                let src = bitmap.get_pixel(u, v).0;
                if src[3] == 0 {
                    continue; // keyed-out background
                }
                let idx = row + dx as usize;
                self.pixels[idx] = blend_over(src, self.pixels[idx]);
            }
        }
    }

    /// Composite this surface over the live frame into `out` (what the window shows).
    pub fn present_over(&self, live: &FrameBuffer, out: &mut FrameBuffer) -> Result<(), Error> {
        if live.width != self.width || live.height != self.height {
            return Err(Error::CameraFrame("present: surface/video size mismatch".into()));
        }
        if out.width != live.width || out.height != live.height {
            out.width = live.width;
            out.height = live.height;
            out.pixels.resize(live.width * live.height, 0);
        }

        for ((dst, &bg), &fg) in out.pixels.iter_mut().zip(&live.pixels).zip(&self.pixels) {
            let a = fg >> 24;
            *dst = match a {
                0 => bg,
                255 => fg & 0x00FF_FFFF,
                _ => {
                    let mix = |shift: u32| {
                        let f = (fg >> shift) & 0xFF;
                        let b = (bg >> shift) & 0xFF;
                        (f * a + b * (255 - a) + 127) / 255
                    };
                    (mix(16) << 16) | (mix(8) << 8) | mix(0)
                }
            };
        }
        Ok(())
    }
}

/// Straight-alpha "source over" of an RGBA pixel onto an ARGB surface pixel.
#[inline]
fn blend_over(src: [u8; 4], dst: u32) -> u32 {
    let sa = src[3] as f32 / 255.0;
    if src[3] == 255 {
        return 0xFF00_0000 | (src[0] as u32) << 16 | (src[1] as u32) << 8 | src[2] as u32;
    }
    let da = (dst >> 24) as f32 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    if out_a <= 0.0 {
        return 0;
    }
    let ch = |s: u8, shift: u32| {
        let d = ((dst >> shift) & 0xFF) as f32;
        let c = (s as f32 * sa + d * da * (1.0 - sa)) / out_a;
        c.round().clamp(0.0, 255.0) as u32
    };
    let a = (out_a * 255.0).round().clamp(0.0, 255.0) as u32;
    (a << 24) | (ch(src[0], 16) << 16) | (ch(src[1], 8) << 8) | ch(src[2], 0)
}

/// Rectangle `scale` times the size of the face box, sharing its centre.
pub fn overlay_rect(det: &Detection, scale: f32) -> DrawRect {
    let width = det.width * scale;
    let height = det.height * scale;
    DrawRect {
        x: det.x - (width - det.width) / 2.0,
        y: det.y - (height - det.height) / 2.0,
        width,
        height,
    }
}

/// What one compositing pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FrameReport {
    pub resized: bool,
    pub draws: Vec<DrawRect>,
}

/// One compositing pass: resize, clear, one draw per detection.
#[derive(Debug, Clone, Copy)]
pub struct Compositor {
    scale: f32,
}

impl Compositor {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }

    pub fn render(
        &self,
        surface: &mut RenderSurface,
        video: Size,
        overlay: Option<&RgbaImage>,
        detections: &[Detection],
    ) -> FrameReport {
        let resized = surface.resize_to(video);
        surface.clear();

        let mut draws = Vec::with_capacity(detections.len());
        if let Some(bitmap) = overlay {
            for det in detections {
                let rect = overlay_rect(det, self.scale);
                surface.draw_scaled(bitmap, rect);
                draws.push(rect);
            }
        }
        FrameReport { resized, draws }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn det(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection { x, y, width: w, height: h }
    }

    fn solid(w: u32, h: u32, px: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba(px))
    }

    const VGA: Size = Size { width: 640, height: 480 };

    #[test]
    fn overlay_rect_is_doubled_and_centred() {
        let d = det(100.0, 50.0, 80.0, 60.0);
        let r = overlay_rect(&d, 2.0);
        assert_eq!(r.width, 160.0);
        assert_eq!(r.height, 120.0);
        assert_eq!(r.x, 60.0);
        assert_eq!(r.y, 20.0);
        assert_eq!(r.center(), d.center());
    }

    #[test]
    fn no_detections_leaves_surface_clear() {
        let mut surface = RenderSurface::default();
        let overlay = solid(4, 4, [255, 0, 0, 255]);
        let report = Compositor::new(2.0).render(&mut surface, VGA, Some(&overlay), &[]);
        assert!(report.draws.is_empty());
        assert!(surface.is_clear());
    }

    #[test]
    fn no_overlay_leaves_surface_clear() {
        let mut surface = RenderSurface::default();
        let dets = [det(10.0, 10.0, 20.0, 20.0)];
        let report = Compositor::new(2.0).render(&mut surface, VGA, None, &dets);
        assert!(report.draws.is_empty());
        assert!(surface.is_clear());
    }

    #[test]
    fn one_draw_per_detection() {
        let mut surface = RenderSurface::default();
        let overlay = solid(4, 4, [0, 0, 255, 255]);
        let dets = [
            det(10.0, 10.0, 40.0, 40.0),
            det(200.0, 100.0, 60.0, 80.0),
            det(400.0, 300.0, 30.0, 30.0),
        ];
        let report = Compositor::new(2.0).render(&mut surface, VGA, Some(&overlay), &dets);
        assert_eq!(report.draws.len(), 3);
        for (rect, d) in report.draws.iter().zip(&dets) {
            assert_eq!(rect.width, d.width * 2.0);
            assert_eq!(rect.height, d.height * 2.0);
            assert_eq!(rect.center(), d.center());
        }
        // centre of the second face is painted opaque blue
        assert_eq!(surface.pixel(230, 140), 0xFF00_00FF);
    }

    #[test]
    fn previous_frame_is_cleared() {
        let mut surface = RenderSurface::default();
        let overlay = solid(2, 2, [255, 255, 255, 255]);
        let c = Compositor::new(2.0);
        c.render(&mut surface, VGA, Some(&overlay), &[det(100.0, 100.0, 50.0, 50.0)]);
        assert!(!surface.is_clear());
        c.render(&mut surface, VGA, Some(&overlay), &[]);
        assert!(surface.is_clear());
    }

    #[test]
    fn surface_follows_video_resolution_change() {
        let mut surface = RenderSurface::default();
        let overlay = solid(2, 2, [255, 0, 0, 255]);
        let c = Compositor::new(2.0);
        let dets = [det(300.0, 200.0, 40.0, 40.0)];

        let first = c.render(&mut surface, VGA, Some(&overlay), &dets);
        assert!(first.resized);
        assert_eq!(surface.size(), VGA);

        let steady = c.render(&mut surface, VGA, Some(&overlay), &dets);
        assert!(!steady.resized);

        let hd = Size { width: 1280, height: 720 };
        let next = c.render(&mut surface, hd, Some(&overlay), &dets);
        assert!(next.resized);
        assert_eq!(surface.size(), hd);
        assert_eq!(surface.pixels().len(), 1280 * 720);
    }

    #[test]
    fn transparent_pixels_are_not_drawn() {
        let mut surface = RenderSurface::new(10, 10);
        let mut overlay = solid(2, 1, [255, 0, 0, 255]);
        overlay.put_pixel(1, 0, Rgba([0, 255, 0, 0]));
        surface.draw_scaled(&overlay, DrawRect { x: 0.0, y: 0.0, width: 10.0, height: 10.0 });
        assert_eq!(surface.pixel(2, 5), 0xFFFF_0000);
        assert_eq!(surface.pixel(7, 5), 0);
    }

    #[test]
    fn off_screen_overlay_is_clipped() {
        let mut surface = RenderSurface::new(20, 20);
        let overlay = solid(3, 3, [0, 255, 255, 255]);
        surface.draw_scaled(&overlay, DrawRect { x: -15.0, y: -15.0, width: 30.0, height: 30.0 });
        assert_eq!(surface.pixel(0, 0), 0xFF00_FFFF);
        assert_eq!(surface.pixel(14, 14), 0xFF00_FFFF);
        assert_eq!(surface.pixel(15, 15), 0);
        surface.draw_scaled(&overlay, DrawRect { x: 100.0, y: 100.0, width: 30.0, height: 30.0 });
    }

    #[test]
    fn half_alpha_blends_over_video() {
        let mut surface = RenderSurface::new(1, 1);
        surface.draw_scaled(
            &solid(1, 1, [255, 255, 255, 128]),
            DrawRect { x: 0.0, y: 0.0, width: 1.0, height: 1.0 },
        );
        let live = FrameBuffer::filled(1, 1, 0x0000_0000);
        let mut out = FrameBuffer::filled(1, 1, 0);
        surface.present_over(&live, &mut out).expect("present");
        assert_eq!(out.pixels[0], 0x0080_8080);
    }

    #[test]
    fn clear_surface_shows_video_unchanged() {
        let surface = RenderSurface::new(2, 2);
        let live = FrameBuffer::filled(2, 2, 0x0012_3456);
        let mut out = FrameBuffer::filled(0, 0, 0);
        surface.present_over(&live, &mut out).expect("present");
        assert_eq!(out.pixels, live.pixels);
    }

    #[test]
    fn present_rejects_mismatched_video() {
        let surface = RenderSurface::new(2, 2);
        let live = FrameBuffer::filled(3, 2, 0);
        let mut out = FrameBuffer::filled(3, 2, 0);
        assert!(surface.present_over(&live, &mut out).is_err());
    }
}
