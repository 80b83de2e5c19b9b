// Opens the camera and converts frames into a buffer suitable for the window.
// Visual expectation: each frame main.rs asks the feed for `latest()` and gets a
// Vec<u32> where each pixel is 0x00RRGGBB, ready to composite and push to the screen.
// When no camera can be opened, a still image stands in and nothing else runs on top.

use crate::config::CameraConfig;
use crate::error::Error;
use crate::types::FrameBuffer;

// Bring in nokhwa types for camera control.
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    utils::{
        CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
    },
};

use image::RgbImage;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const RETRY_MIN: Duration = Duration::from_millis(10);
const RETRY_MAX: Duration = Duration::from_millis(500);

// A small wrapper around nokhwa::Camera so our main loop stays clean.
pub struct CameraCapture {
    cam: Camera,
}

impl CameraCapture {
    /// Open the configured device at (roughly) the configured resolution.
    /// Fails with `CameraInit` when there is no device or access is denied.
    pub fn open(cfg: &CameraConfig) -> Result<Self, Error> {
        let idx = CameraIndex::Index(cfg.index);

        let fmt = CameraFormat::new(
            Resolution::new(cfg.width, cfg.height),
            FrameFormat::YUYV, // uncompressed; cheap to convert to RGB
            cfg.fps,
        );

        // Ask for RGB frames, closest to our request.
        let req = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(fmt));

        let mut cam = Camera::new(idx, req)
            .map_err(|e| Error::CameraInit(format!("Create camera: {e}")))?;

        cam.open_stream()
            .map_err(|e| Error::CameraInit(format!("Open stream: {e}")))?;

        let actual = cam.resolution();
        log::info!(
            "camera {} streaming at {}x{}",
            cfg.index,
            actual.width(),
            actual.height()
        );
        Ok(Self { cam })
    }

    /// Grab one frame. The resolution may differ from the previous frame;
    /// callers size everything from the returned buffer.
    pub fn next_frame(&mut self) -> Result<FrameBuffer, Error> {
        let frame = self
            .cam
            .frame()
            .map_err(|e| Error::CameraFrame(format!("Fetch frame: {e}")))?;

        let rgb_img = frame
            .decode_image::<RgbFormat>()
            .map_err(|e| Error::CameraFrame(format!("Decode RGB: {e}")))?;

        // Packed by hand: nokhwa's ImageBuffer may come from a different `image` release.
        let (w, h) = rgb_img.dimensions();
        let mut out = Vec::with_capacity((w as usize) * (h as usize));
        for pixel in rgb_img.pixels() {
            out.push(((pixel[0] as u32) << 16) | ((pixel[1] as u32) << 8) | pixel[2] as u32);
        }

        Ok(FrameBuffer {
            width: w as usize,
            height: h as usize,
            pixels: out,
        })
    }
}

impl Drop for CameraCapture {
    fn drop(&mut self) {
        // Release the device so the camera light goes off on teardown.
        if let Err(e) = self.cam.stop_stream() {
            log::warn!("stopping camera stream: {e}");
        }
    }
}

/// Pack an RGB image as 0x00RRGGBB pixels.
pub fn rgb_to_frame(img: &RgbImage) -> FrameBuffer {
    let (w, h) = img.dimensions();
    let pixels = img
        .pixels()
        .map(|p| ((p[0] as u32) << 16) | ((p[1] as u32) << 8) | p[2] as u32)
        .collect();
    FrameBuffer { width: w as usize, height: h as usize, pixels }
}

/// Pause between attempts while the device keeps failing: doubles from
/// `RETRY_MIN` up to `RETRY_MAX`, back to the minimum once a frame arrives.
#[derive(Debug)]
struct FrameRetry {
    delay: Duration,
    failures: u32,
}

impl Default for FrameRetry {
    fn default() -> Self {
        Self { delay: RETRY_MIN, failures: 0 }
    }
}

impl FrameRetry {
    /// Record a failure. Returns how long to wait and whether this starts a new run of failures.
    fn failed(&mut self) -> (Duration, bool) {
        let delay = self.delay;
        self.failures += 1;
        self.delay = (self.delay * 2).min(RETRY_MAX);
        (delay, self.failures == 1)
    }

    /// Record a good frame. True if it ends a run of failures.
    fn recovered(&mut self) -> bool {
        let was_failing = self.failures > 0;
        *self = Self::default();
        was_failing
    }
}

/// Camera running on its own thread, so a slow device never holds up a frame.
/// Frames are handed over through a one-slot channel: if the UI has not taken the
/// previous frame yet, the new one is dropped rather than queued.
pub struct CameraFeed {
    frames: Receiver<FrameBuffer>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CameraFeed {
    /// Open the camera on a capture thread. Returns once the device is streaming
    /// (or has failed to open).
    pub fn start(cfg: &CameraConfig) -> Result<Self, Error> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), Error>>();
        let (frame_tx, frames) = mpsc::sync_channel::<FrameBuffer>(1);
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let cfg = cfg.clone();

        let handle = thread::Builder::new().name("camera".into()).spawn(move || {
            let mut cam = match CameraCapture::open(&cfg) {
                Ok(cam) => {
                    let _ = ready_tx.send(Ok(()));
                    cam
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let mut retry = FrameRetry::default();
            while flag.load(Ordering::Relaxed) {
                match cam.next_frame() {
                    Ok(frame) => {
                        if retry.recovered() {
                            log::info!("camera frames flowing again");
                        }
                        match frame_tx.try_send(frame) {
                            Ok(()) | Err(TrySendError::Full(_)) => {}
                            Err(TrySendError::Disconnected(_)) => break,
                        }
                    }
                    Err(e) => {
                        let (delay, first) = retry.failed();
                        if first {
                            log::warn!("{e}; retrying");
                        } else {
                            log::debug!("{e}");
                        }
                        thread::sleep(delay);
                    }
                }
            }
        })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { frames, running, handle: Some(handle) }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(Error::CameraInit("capture thread exited before opening".into())),
        }
    }

    /// Newest frame since the last call, if any.
    pub fn latest(&self) -> Option<FrameBuffer> {
        self.frames.try_iter().last()
    }

    /// Block until a frame arrives (start-up only; the window is sized from it).
    pub fn wait_frame(&self, timeout: Duration) -> Result<FrameBuffer, Error> {
        self.frames
            .recv_timeout(timeout)
            .map_err(|e| Error::CameraFrame(format!("No frame from camera: {e}")))
    }

    /// Teardown: the capture thread finishes its current frame and releases the device.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("camera thread panicked");
            }
        }
    }
}

impl Drop for CameraFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Where frames come from this session.
pub enum VideoSource {
    /// A streaming camera and the first frame it delivered.
    Live { feed: CameraFeed, first: FrameBuffer },
    /// Camera unavailable: a still image, with no detection or overlay on top.
    Still(FrameBuffer),
}

impl VideoSource {
    /// Try the camera and wait for its first frame; fall back to a still image
    /// (configured, or a plain card) if either step fails.
    pub fn open(cfg: &CameraConfig, fallback: Option<&Path>) -> Self {
        let mut feed = match CameraFeed::start(cfg) {
            Ok(feed) => feed,
            Err(e) => {
                log::warn!("{e}; showing fallback image, face filter disabled");
                return VideoSource::Still(fallback_frame(fallback, cfg.width, cfg.height));
            }
        };
        let first = feed.wait_frame(Duration::from_millis(cfg.first_frame_ms));
        match first_frame_or_still(first, cfg, fallback) {
            Ok(first) => VideoSource::Live { feed, first },
            Err(still) => {
                feed.stop();
                VideoSource::Still(still)
            }
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, VideoSource::Live { .. })
    }
}

/// A stream that opened but never produced a frame is treated like no camera at all.
/// `Err` carries the still frame to show instead.
pub fn first_frame_or_still(
    first: Result<FrameBuffer, Error>,
    cfg: &CameraConfig,
    fallback: Option<&Path>,
) -> Result<FrameBuffer, FrameBuffer> {
    first.map_err(|e| {
        log::warn!("{e}; showing fallback image, face filter disabled");
        fallback_frame(fallback, cfg.width, cfg.height)
    })
}

/// The still frame shown without a camera.
pub fn fallback_frame(path: Option<&Path>, width: u32, height: u32) -> FrameBuffer {
    if let Some(path) = path {
        match image::open(path) {
            Ok(img) => return rgb_to_frame(&img.to_rgb8()),
            Err(e) => log::warn!("fallback image {} unreadable: {e}", path.display()),
        }
    }
    FrameBuffer::filled(width.max(1) as usize, height.max(1) as usize, 0x0020_2428)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn packs_rgb_as_0rgb() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([0x12, 0x34, 0x56]));
        img.put_pixel(1, 0, Rgb([0xFF, 0x00, 0x80]));
        let fb = rgb_to_frame(&img);
        assert_eq!((fb.width, fb.height), (2, 1));
        assert_eq!(fb.pixels, vec![0x0012_3456, 0x00FF_0080]);
    }

    #[test]
    fn unreadable_fallback_gives_plain_card() {
        let fb = fallback_frame(Some(Path::new("/nonexistent/fallback.png")), 320, 240);
        assert_eq!((fb.width, fb.height), (320, 240));
        assert!(fb.pixels.iter().all(|&p| p == 0x0020_2428));
    }

    #[test]
    fn silent_camera_falls_back_to_still() {
        let cfg = CameraConfig { width: 320, height: 240, ..CameraConfig::default() };
        let timed_out = Err(Error::CameraFrame("No frame from camera: timed out".into()));
        let still = first_frame_or_still(timed_out, &cfg, None).expect_err("still");
        assert_eq!((still.width, still.height), (320, 240));
        assert!(still.pixels.iter().all(|&p| p == 0x0020_2428));

        let frame = FrameBuffer::filled(2, 2, 0x00AB_CDEF);
        let live = first_frame_or_still(Ok(frame), &cfg, None).expect("live");
        assert_eq!(live.pixels, vec![0x00AB_CDEF; 4]);
    }

    #[test]
    fn retry_backs_off_and_warns_once() {
        let mut retry = FrameRetry::default();
        assert_eq!(retry.failed(), (RETRY_MIN, true));
        assert_eq!(retry.failed(), (RETRY_MIN * 2, false));
        let mut last = RETRY_MIN;
        for _ in 0..20 {
            let (delay, first) = retry.failed();
            assert!(!first);
            last = delay;
        }
        assert_eq!(last, RETRY_MAX);

        assert!(retry.recovered());
        assert!(!retry.recovered());
        assert_eq!(retry.failed(), (RETRY_MIN, true));
    }

    #[test]
    fn still_source_is_not_live() {
        let src = VideoSource::Still(FrameBuffer::filled(4, 4, 7));
        assert!(!src.is_live());
    }
}
