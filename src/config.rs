// Runtime configuration: an optional TOML file, then command-line overrides.
// Every section and every key is optional; anything missing takes the default below.

use crate::error::Error;
use clap::{Arg, ArgMatches, Command};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub camera: CameraConfig,
    pub detector: DetectorConfig,
    pub chroma: ChromaConfig,
    pub overlay: OverlayConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    /// Frame pacing for the compositing loop (one pass per refresh).
    pub target_fps: usize,
    /// Shown instead of the camera when no device can be opened.
    pub fallback_image: Option<PathBuf>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Face Filter".into(),
            target_fps: 60,
            fallback_image: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// How long to wait for the first frame before falling back to the still image.
    pub first_frame_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self { index: 0, width: 640, height: 480, fps: 30, first_frame_ms: 5000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// SeetaFace frontal model (seeta_fd_frontal_v1.0.bin).
    pub model_path: PathBuf,
    /// Minimum gap between detector runs; ~30 Hz.
    pub interval_ms: u64,
    pub min_face_size: u32,
    pub score_thresh: f64,
    pub pyramid_scale_factor: f32,
    pub slide_window_step: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model/seeta_fd_frontal_v1.0.bin"),
            interval_ms: 33,
            min_face_size: 40,
            score_thresh: 2.0,
            pyramid_scale_factor: 0.8,
            slide_window_step: 4,
        }
    }
}

/// Green-screen thresholds. Untuned approximations; adjust per light setup.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ChromaConfig {
    pub min_green: u8,
    pub dominance: f32,
}

impl Default for ChromaConfig {
    fn default() -> Self {
        Self { min_green: 100, dominance: 1.5 }
    }
}

/// Recent overlays are picked with keys 1-4, so no more than four are kept.
pub const MAX_ALTERNATIVES: usize = 4;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Overlay size relative to the face box, in each dimension.
    pub scale: f32,
    /// How many recent overlays stay selectable with the number keys (1 to `MAX_ALTERNATIVES`).
    pub alternatives: usize,
    /// Used whenever generation fails. A built-in image is drawn if unset or unreadable.
    pub placeholder_image: Option<PathBuf>,
    /// How long a notice stays on the HUD.
    pub notice_secs: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            scale: 2.0,
            alternatives: 4,
            placeholder_image: None,
            notice_secs: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub endpoint: String,
    /// Name of the environment variable holding the API key (never the key itself).
    pub api_key_env: String,
    /// Authorization scheme put in front of the key ("Key" for fal, "Bearer" for most others).
    pub auth_scheme: String,
    pub prompts: Vec<String>,
    pub aspect_ratio: String,
    pub output_format: String,
    pub sync_mode: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://fal.run/fal-ai/flux/schnell".into(),
            api_key_env: "FAL_KEY".into(),
            auth_scheme: "Key".into(),
            prompts: vec![
                "cartoon pirate hat and eye patch on a solid green background".into(),
                "golden crown with jewels on a solid green background".into(),
                "pixel-art sunglasses on a solid green background".into(),
            ],
            aspect_ratio: "1:1".into(),
            output_format: "png".into(),
            sync_mode: true,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Build the final config from parsed command-line arguments.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, Error> {
        let mut cfg = match matches.get_one::<String>("config") {
            Some(path) => Self::load(Path::new(path))?,
            None => Self::default(),
        };

        if let Some(prompt) = matches.get_one::<String>("prompt") {
            // A prompt from the command line goes first in the rotation.
            cfg.generation.prompts.insert(0, prompt.clone());
        }
        if let Some(index) = matches.get_one::<u32>("camera") {
            cfg.camera.index = *index;
        }
        if let Some(model) = matches.get_one::<String>("model") {
            cfg.detector.model_path = PathBuf::from(model);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.generation.prompts.is_empty() {
            return Err(Error::Config("generation.prompts must not be empty".into()));
        }
        if !(self.overlay.scale > 0.0) {
            return Err(Error::Config("overlay.scale must be positive".into()));
        }
        if !(1..=MAX_ALTERNATIVES).contains(&self.overlay.alternatives) {
            return Err(Error::Config(format!(
                "overlay.alternatives must be between 1 and {MAX_ALTERNATIVES}"
            )));
        }
        Ok(())
    }
}

/// Builds the command-line parser.
pub fn build_cli() -> Command {
    Command::new("face-filter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Live camera filter with generated, chroma-keyed face overlays")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML config file"),
        )
        .arg(
            Arg::new("prompt")
                .short('p')
                .long("prompt")
                .value_name("TEXT")
                .help("Prompt to generate first"),
        )
        .arg(
            Arg::new("camera")
                .long("camera")
                .value_name("INDEX")
                .value_parser(clap::value_parser!(u32))
                .help("Camera device index"),
        )
        .arg(
            Arg::new("model")
                .long("model")
                .value_name("FILE")
                .help("SeetaFace model file"),
        )
}
