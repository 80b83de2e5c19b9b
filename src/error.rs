// Application error type.
// Every variant states *where* things went wrong; the generation client has
// its own error (see generation.rs) because those failures never leave the session.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Window init error: {0}")]
    WindowInit(String), // Creating the window failed
    #[error("Window update error: {0}")]
    WindowUpdate(String), // Updating the window buffer failed
    #[error("Camera init error: {0}")]
    CameraInit(String), // Opening/starting the camera failed
    #[error("Camera frame error: {0}")]
    CameraFrame(String), // Grabbing/decoding a frame failed
    #[error("Detector init error: {0}")]
    DetectorInit(String), // Loading the face model failed
    #[error("Generation client error: {0}")]
    Generation(#[from] crate::generation::GenerationError),
    #[error("Config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
