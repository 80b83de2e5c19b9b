// Core types shared by the camera, detector, compositor and window.

#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub width: usize,      // how wide the frame is on screen (pixels)
    pub height: usize,     // how tall the frame is on screen (pixels)
    pub pixels: Vec<u32>,  // each entry is 0x00RRGGBB for minifb
}

impl FrameBuffer {
    /// A solid-colour frame.
    pub fn filled(width: usize, height: usize, color: u32) -> Self {
        Self { width, height, pixels: vec![color; width * height] }
    }

    pub fn size(&self) -> Size {
        Size { width: self.width, height: self.height }
    }

    /// Luma plane (BT.601 integer weights), row-major, one byte per pixel.
    /// This is what the face detector consumes.
    pub fn to_gray(&self) -> Vec<u8> {
        self.pixels
            .iter()
            .map(|&px| {
                let r = (px >> 16) & 0xFF;
                let g = (px >> 8) & 0xFF;
                let b = px & 0xFF;
                ((r * 77 + g * 150 + b * 29) >> 8) as u8
            })
            .collect()
    }
}

/// Pixel dimensions of the live video (and therefore of the render surface).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: usize,
    pub height: usize,
}

/// One face found by the detector, in video-pixel coordinates.
/// Replaced wholesale every detection cycle; there is no identity across frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Detection {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Where an overlay lands on the render surface for one detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl DrawRect {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}
