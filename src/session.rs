// Everything the frame loop reads and the callbacks write, owned in one place:
// the latest face boxes, the overlay currently drawn, a few recent alternatives,
// the request in flight and the notice on the HUD.
// All access happens on the UI thread, so a write is visible to the very next frame.

use crate::chroma::ChromaKey;
use crate::config::Config;
use crate::generation::{GenerationOutcome, RequestId};
use crate::types::Detection;
use image::{Rgba, RgbaImage};
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlaySource {
    Generated { prompt: String, url: String },
    Placeholder,
}

/// A chroma-keyed overlay, ready to draw.
#[derive(Debug)]
pub struct Overlay {
    pub source: OverlaySource,
    pub bitmap: RgbaImage,
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub text: String,
    pub raised: Instant,
}

pub const GENERATION_FAILED_NOTICE: &str = "GENERATION FAILED - SHOWING PLACEHOLDER";

pub struct Session {
    chroma: ChromaKey,
    placeholder: Rc<Overlay>,
    detections: Vec<Detection>,
    current: Option<Rc<Overlay>>,
    alternatives: VecDeque<Rc<Overlay>>,
    max_alternatives: usize,
    pending: Option<(RequestId, String)>,
    next_id: RequestId,
    prompts: Vec<String>,
    prompt_index: usize,
    notice: Option<Notice>,
    notice_ttl: Duration,
    notices_raised: u32,
}

impl Session {
    pub fn new(cfg: &Config, placeholder: RgbaImage) -> Self {
        let chroma = ChromaKey::from_config(&cfg.chroma);
        let mut placeholder = placeholder;
        chroma.process_in_place(&mut placeholder);

        Self {
            chroma,
            placeholder: Rc::new(Overlay { source: OverlaySource::Placeholder, bitmap: placeholder }),
            detections: Vec::new(),
            current: None,
            alternatives: VecDeque::with_capacity(cfg.overlay.alternatives),
            max_alternatives: cfg.overlay.alternatives.max(1),
            pending: None,
            next_id: 0,
            prompts: cfg.generation.prompts.clone(),
            prompt_index: 0,
            notice: None,
            notice_ttl: Duration::from_secs(cfg.overlay.notice_secs),
            notices_raised: 0,
        }
    }

    /* ---------- detections ---------- */

    /// Replace the face boxes wholesale.
    pub fn set_detections(&mut self, detections: Vec<Detection>) {
        self.detections = detections;
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    /* ---------- overlay ---------- */

    pub fn overlay(&self) -> Option<&Overlay> {
        self.current.as_deref()
    }

    pub fn overlay_bitmap(&self) -> Option<&RgbaImage> {
        self.current.as_deref().map(|o| &o.bitmap)
    }

    pub fn alternatives(&self) -> usize {
        self.alternatives.len()
    }

    /// Show one of the recent overlays again (0 = newest). False if there is none at `index`.
    pub fn select_alternative(&mut self, index: usize) -> bool {
        match self.alternatives.get(index) {
            Some(alt) => {
                self.current = Some(Rc::clone(alt));
                true
            }
            None => false,
        }
    }

    /* ---------- prompts ---------- */

    pub fn prompt(&self) -> &str {
        self.prompts.get(self.prompt_index).map(String::as_str).unwrap_or("")
    }

    /// 1-based position of the current prompt, and how many there are.
    pub fn prompt_position(&self) -> (usize, usize) {
        (self.prompt_index + 1, self.prompts.len())
    }

    pub fn next_prompt(&mut self) -> &str {
        if !self.prompts.is_empty() {
            self.prompt_index = (self.prompt_index + 1) % self.prompts.len();
        }
        self.prompt()
    }

    /* ---------- generation ---------- */

    pub fn is_generating(&self) -> bool {
        self.pending.is_some()
    }

    /// Start a new generation for the current prompt. The overlay on screen goes away
    /// until the result arrives, and any older request in flight is superseded.
    pub fn begin_generation(&mut self) -> (RequestId, String) {
        self.next_id += 1;
        let id = self.next_id;
        let prompt = self.prompt().to_string();
        self.current = None;
        self.pending = Some((id, prompt.clone()));
        log::info!("generation #{id} started: {prompt:?}");
        (id, prompt)
    }

    /// Apply a finished request. Outcomes for anything but the latest request are dropped.
    pub fn complete_generation(&mut self, id: RequestId, outcome: GenerationOutcome, now: Instant) {
        let prompt = match &self.pending {
            Some((pending, prompt)) if *pending == id => prompt.clone(),
            _ => {
                log::debug!("ignoring outcome of superseded generation #{id}");
                return;
            }
        };
        self.pending = None;

        match outcome {
            GenerationOutcome::Ready { url, image } => {
                let mut bitmap = image;
                let keyed = self.chroma.process_in_place(&mut bitmap);
                log::info!(
                    "generation #{id} ready: {}x{}, {keyed} background pixels removed",
                    bitmap.width(),
                    bitmap.height()
                );
                let overlay = Rc::new(Overlay {
                    source: OverlaySource::Generated { prompt, url },
                    bitmap,
                });
                self.alternatives.push_front(Rc::clone(&overlay));
                self.alternatives.truncate(self.max_alternatives);
                self.current = Some(overlay);
            }
            GenerationOutcome::RequestFailed(err) => {
                log::warn!("generation #{id} failed: {err}");
                self.raise_notice(GENERATION_FAILED_NOTICE, now);
                self.current = Some(Rc::clone(&self.placeholder));
            }
            GenerationOutcome::ImageUnavailable { url, error } => {
                // Nothing is drawn until the next image arrives.
                log::error!("generation #{id}: overlay image {url} unavailable: {error}");
            }
        }
    }

    /* ---------- notices ---------- */

    fn raise_notice(&mut self, text: &str, now: Instant) {
        self.notices_raised += 1;
        self.notice = Some(Notice { text: text.to_string(), raised: now });
    }

    /// The notice to show at `now`, if one is still fresh.
    pub fn notice(&self, now: Instant) -> Option<&Notice> {
        self.notice
            .as_ref()
            .filter(|n| now.saturating_duration_since(n.raised) < self.notice_ttl)
    }

    pub fn notices_raised(&self) -> u32 {
        self.notices_raised
    }
}

/// The configured placeholder image, or the built-in one if that cannot be read.
pub fn load_placeholder(path: Option<&Path>) -> RgbaImage {
    if let Some(path) = path {
        match image::open(path) {
            Ok(img) => return img.to_rgba8(),
            Err(e) => log::warn!("placeholder {} unreadable ({e}); using built-in", path.display()),
        }
    }
    builtin_placeholder()
}

/// A purple domino mask on a green backdrop; the backdrop and eye holes key out.
pub fn builtin_placeholder() -> RgbaImage {
    const SIZE: u32 = 256;
    const GREEN: Rgba<u8> = Rgba([0, 200, 0, 255]);
    const PURPLE: Rgba<u8> = Rgba([128, 0, 160, 255]);

    RgbaImage::from_fn(SIZE, SIZE, |x, y| {
        // Normalised coords in [-1, 1]
        let u = (x as f32 + 0.5) / SIZE as f32 * 2.0 - 1.0;
        let v = (y as f32 + 0.5) / SIZE as f32 * 2.0 - 1.0;

        let in_band = u.abs() < 0.6 && (-0.3..0.0).contains(&v);
        let in_eye = |cx: f32| (u - cx).powi(2) / 0.02 + (v + 0.15).powi(2) / 0.008 < 1.0;
        if in_band && !in_eye(-0.25) && !in_eye(0.25) { PURPLE } else { GREEN }
    })
}
