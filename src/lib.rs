//! Live camera face filter: generated overlays, keyed off their green backdrop,
//! drawn onto every detected face each frame.

pub mod camera;
pub mod chroma;
pub mod config;
pub mod detector;
pub mod draw;
pub mod error;
pub mod generation;
pub mod overlay;
pub mod render_loop;
pub mod session;
pub mod types;
