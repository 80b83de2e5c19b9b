// Face detection: a small trait over the detector backend, the SeetaFace backend
// from `rustface`, and the pump that runs it at most ~30 times a second.
// Visual expectation: the overlay follows your face with a slight lag but never
// stalls the video, because detection is skipped (not queued) when it is not due.

use crate::config::DetectorConfig;
use crate::error::Error;
use crate::render_loop::Throttle;
use crate::types::{Detection, FrameBuffer};
use std::time::{Duration, Instant};

/// Pluggable face detection backend.
pub trait FaceDetector {
    /// Detect faces in a row-major grayscale buffer of `width` × `height` bytes.
    fn detect(&mut self, gray: &[u8], width: u32, height: u32) -> Vec<Detection>;
}

/// SeetaFace frontal detector.
pub struct RustfaceDetector {
    inner: Box<dyn rustface::Detector>,
}

impl RustfaceDetector {
    pub fn load(cfg: &DetectorConfig) -> Result<Self, Error> {
        let path = cfg
            .model_path
            .to_str()
            .ok_or_else(|| Error::DetectorInit("model path is not valid UTF-8".into()))?;
        let mut inner = rustface::create_detector(path)
            .map_err(|e| Error::DetectorInit(format!("load {path}: {e}")))?;

        inner.set_min_face_size(cfg.min_face_size);
        inner.set_score_thresh(cfg.score_thresh);
        inner.set_pyramid_scale_factor(cfg.pyramid_scale_factor);
        inner.set_slide_window_step(cfg.slide_window_step, cfg.slide_window_step);
        Ok(Self { inner })
    }
}

impl FaceDetector for RustfaceDetector {
    fn detect(&mut self, gray: &[u8], width: u32, height: u32) -> Vec<Detection> {
        let image = rustface::ImageData::new(gray, width, height);
        self.inner
            .detect(&image)
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                Detection {
                    x: bbox.x() as f32,
                    y: bbox.y() as f32,
                    width: bbox.width() as f32,
                    height: bbox.height() as f32,
                }
            })
            .collect()
    }
}

/// Feeds camera frames to the detector when a detection is due.
pub struct DetectionPump {
    detector: Option<Box<dyn FaceDetector>>,
    throttle: Throttle,
}

impl DetectionPump {
    pub fn new(detector: Option<Box<dyn FaceDetector>>, interval: Duration) -> Self {
        Self { detector, throttle: Throttle::new(interval) }
    }

    /// Load the configured model. A missing or broken model leaves the pump idle:
    /// the app keeps running, it just never sees a face.
    pub fn from_config(cfg: &DetectorConfig) -> Self {
        let detector: Option<Box<dyn FaceDetector>> = match RustfaceDetector::load(cfg) {
            Ok(d) => {
                log::info!("face detector loaded from {}", cfg.model_path.display());
                Some(Box::new(d))
            }
            Err(e) => {
                log::warn!("{e}; face detection disabled");
                None
            }
        };
        Self::new(detector, Duration::from_millis(cfg.interval_ms))
    }

    pub fn is_active(&self) -> bool {
        self.detector.is_some()
    }

    /// Run detection on `frame` if one is due at `now`. `None` means "keep the previous boxes".
    pub fn poll(&mut self, now: Instant, frame: &FrameBuffer) -> Option<Vec<Detection>> {
        let detector = self.detector.as_mut()?;
        if frame.width == 0 || frame.height == 0 || !self.throttle.ready(now) {
            return None;
        }
        let gray = frame.to_gray();
        Some(detector.detect(&gray, frame.width as u32, frame.height as u32))
    }
}
