// Frame pacing and lifecycle for the compositing pass.
// The window loop calls `RenderLoop::frame` once per display refresh; after `stop()`
// the loop does nothing, so no work is spent on a camera that is gone.

use crate::overlay::{Compositor, FrameReport, RenderSurface};
use crate::types::{Detection, Size};
use image::RgbaImage;
use std::time::{Duration, Instant};

/// Source of "now". Swapped for a hand-driven clock in tests.
pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    now: std::cell::Cell<Instant>,
}

#[cfg(test)]
impl Default for ManualClock {
    fn default() -> Self {
        Self { now: std::cell::Cell::new(Instant::now()) }
    }
}

#[cfg(test)]
impl ManualClock {
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// Lets an action through at most once per `interval`.
/// Calls that arrive early are dropped, not queued.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Frames-per-second over one-second windows.
#[derive(Debug)]
pub struct FpsCounter {
    window_start: Instant,
    frames: u32,
    last_fps: f32,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self { window_start: now, frames: 0, last_fps: 0.0 }
    }

    /// Count one frame. Returns the new rate whenever a full second has passed.
    pub fn tick(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        self.last_fps = self.frames as f32 / elapsed.as_secs_f32();
        self.frames = 0;
        self.window_start = now;
        Some(self.last_fps)
    }

    pub fn fps(&self) -> f32 {
        self.last_fps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Running,
    Stopped,
}

/// Owns the render surface and runs one compositing pass per call while running.
pub struct RenderLoop<C: Clock = SystemClock> {
    clock: C,
    state: LoopState,
    compositor: Compositor,
    surface: RenderSurface,
    fps: FpsCounter,
    frames: u64,
}

impl<C: Clock> RenderLoop<C> {
    pub fn new(compositor: Compositor, clock: C) -> Self {
        let fps = FpsCounter::new(clock.now());
        Self {
            clock,
            state: LoopState::Idle,
            compositor,
            surface: RenderSurface::default(),
            fps,
            frames: 0,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Begin compositing. A stopped loop stays stopped.
    pub fn start(&mut self) {
        if self.state == LoopState::Idle {
            self.fps = FpsCounter::new(self.clock.now());
            self.state = LoopState::Running;
        }
    }

    /// Teardown: no further passes run and the surface is released.
    pub fn stop(&mut self) {
        self.state = LoopState::Stopped;
        self.surface = RenderSurface::default();
    }

    pub fn is_running(&self) -> bool {
        self.state == LoopState::Running
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn fps(&self) -> f32 {
        self.fps.fps()
    }

    pub fn surface(&self) -> &RenderSurface {
        &self.surface
    }

    /// One compositing pass against whatever is current. `None` once stopped (or before start).
    pub fn frame(
        &mut self,
        video: Size,
        overlay: Option<&RgbaImage>,
        detections: &[Detection],
    ) -> Option<FrameReport> {
        if !self.is_running() {
            return None;
        }
        let report = self.compositor.render(&mut self.surface, video, overlay, detections);
        if report.resized {
            log::debug!("render surface resized to {}x{}", video.width, video.height);
        }
        self.frames += 1;
        if let Some(fps) = self.fps.tick(self.clock.now()) {
            log::debug!("compositing at {fps:.1} FPS");
        }
        Some(report)
    }
}
