// What you SEE:
// • Live camera is always the base image.
// • Press G: an overlay is generated for the current prompt; its green backdrop is
//   keyed out and it is drawn on every face, twice the face size, centred.
// • N cycles prompts, 1-4 bring back recent overlays. ESC quits.
// • No camera: a still card is shown and nothing is drawn on top.
// • Generation fails: a placeholder mask goes on instead and a red notice shows.

use face_filter::camera::{CameraFeed, VideoSource};
use face_filter::config::{Config, build_cli};
use face_filter::detector::DetectionPump;
use face_filter::draw::{Drawer, draw_notice, draw_text_5x7, fit_text};
use face_filter::error::Error;
use face_filter::generation::{GenerationWorker, HttpImageGenerator};
use face_filter::overlay::Compositor;
use face_filter::render_loop::{Clock, RenderLoop, SystemClock};
use face_filter::session::{OverlaySource, Session, load_placeholder};
use face_filter::types::FrameBuffer;
use std::time::Instant;

const HUD_COLOR: u32 = 0x00_FF_FF_FF;

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = build_cli().get_matches();
    let cfg = Config::from_matches(&matches)?;
    let generate_now = matches.get_one::<String>("prompt").is_some();

    let source = VideoSource::open(&cfg.camera, cfg.window.fallback_image.as_deref());
    log::info!("video source: {}", if source.is_live() { "live camera" } else { "still image" });
    match source {
        VideoSource::Live { feed, first } => run_live(&cfg, feed, first, generate_now),
        VideoSource::Still(frame) => run_still(&cfg, frame),
    }
}

/// Camera unavailable: show the still card until the window closes.
fn run_still(cfg: &Config, mut frame: FrameBuffer) -> Result<(), Error> {
    let mut drawer = Drawer::new(&cfg.window.title, frame.width, frame.height, cfg.window.target_fps)?;
    draw_text_5x7(&mut frame, 8, 8, "NO CAMERA AVAILABLE", HUD_COLOR);
    while drawer.is_open() && !drawer.esc_pressed() {
        drawer.present(&frame)?;
    }
    Ok(())
}

fn run_live(
    cfg: &Config,
    mut feed: CameraFeed,
    first: FrameBuffer,
    generate_now: bool,
) -> Result<(), Error> {
    /* --- First frame sizes the window ---
       Visual: window opens at the camera's resolution. */
    let mut live = first;
    let mut drawer = Drawer::new(&cfg.window.title, live.width, live.height, cfg.window.target_fps)?;
    let mut screen = FrameBuffer::filled(live.width, live.height, 0);

    /* --- Collaborators ---
       Detector may be missing (no model): faces are simply never found. */
    let mut pump = DetectionPump::from_config(&cfg.detector);
    let worker = GenerationWorker::new(HttpImageGenerator::new(&cfg.generation)?);
    let mut session = Session::new(cfg, load_placeholder(cfg.overlay.placeholder_image.as_deref()));
    let mut render = RenderLoop::new(Compositor::new(cfg.overlay.scale), SystemClock);
    render.start();

    if generate_now {
        let (id, prompt) = session.begin_generation();
        worker.request(id, prompt);
    }

    let mut fresh = true; // a frame the detector has not seen yet

    /* ------------------------------ Main loop ------------------------------
       One pass per display refresh (the window paces us at target_fps). */
    while drawer.is_open() && !drawer.esc_pressed() {
        let now = render.now();

        /* 1) Inputs */
        if drawer.next_prompt_pressed_once() {
            log::info!("prompt: {}", session.next_prompt());
        }
        if drawer.generate_pressed_once() {
            let (id, prompt) = session.begin_generation();
            worker.request(id, prompt);
        }
        if let Some(i) = drawer.alternative_pressed_once() {
            if !session.select_alternative(i) {
                log::debug!("no recent overlay #{}", i + 1);
            }
        }

        /* 2) Finished generations (their chroma-key pass runs here, once per image) */
        for (id, outcome) in worker.poll() {
            session.complete_generation(id, outcome, now);
        }

        /* 3) Newest camera frame; detection at most ~30 Hz on frames it has not seen */
        if let Some(frame) = feed.latest() {
            live = frame;
            fresh = true;
        }
        if fresh {
            if let Some(found) = pump.poll(now, &live) {
                session.set_detections(found);
                fresh = false;
            }
        }

        /* 4) Composite overlay over video, then HUD on top */
        render.frame(live.size(), session.overlay_bitmap(), session.detections());
        render.surface().present_over(&live, &mut screen)?;
        draw_hud(&mut screen, &session, &render, pump.is_active(), cfg.overlay.alternatives, now);

        /* 5) Present (this is when the on-screen image updates) */
        drawer.present(&screen)?;
    }

    /* --- Teardown: stop compositing, release the camera --- */
    render.stop();
    feed.stop();
    log::info!("stopped after {} frames", render.frames());
    Ok(())
}

/// Status, prompt and key hints in the top-left; notice strip at the bottom.
fn draw_hud<C: Clock>(
    screen: &mut FrameBuffer,
    session: &Session,
    render: &RenderLoop<C>,
    detecting: bool,
    alternatives: usize,
    now: Instant,
) {
    let status = match session.overlay().map(|o| &o.source) {
        _ if session.is_generating() => "GENERATING...",
        Some(OverlaySource::Placeholder) => "PLACEHOLDER",
        Some(OverlaySource::Generated { .. }) => "FILTER ON",
        None => "NO FILTER",
    };
    let faces = if detecting {
        format!("FACES: {}", session.detections().len())
    } else {
        "NO FACE MODEL".to_string()
    };
    let (pos, total) = session.prompt_position();
    let width = screen.width.saturating_sub(16);

    let lines = [
        format!("{status} | {faces} | FPS: {:.1}", render.fps()),
        format!("PROMPT {pos}/{total}: {}", session.prompt()),
        format!(
            "G: GENERATE  N: NEXT PROMPT  1-{}: RECENT ({})  ESC: QUIT",
            alternatives,
            session.alternatives()
        ),
    ];
    for (row, line) in lines.iter().enumerate() {
        draw_text_5x7(screen, 8, 8 + row as i32 * 10, &fit_text(line, width), HUD_COLOR);
    }

    if let Some(notice) = session.notice(now) {
        draw_notice(screen, &notice.text);
    }
}
