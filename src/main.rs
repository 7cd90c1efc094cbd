// Drives a bridge session the way a decoder would: attach, resize from a
// simulated UI thread, render paced frames, detach and tear down.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver};
use frameshare::{
    log_error, log_info, log_warn, BridgeConfig, CallbackSlot, GpuBackend, OutputCallbacks, RawHandle,
    RecordingBackend, RenderConfig, ReportSizeFn, ReportToken, SurfaceKind, SurfaceMode, VideoBridge,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct ProbeArgs {
    config_path: PathBuf,
    frames: u32,
    width: u32,
    height: u32,
    mode: Option<SurfaceKind>,
    dry_run: bool,
}

impl ProbeArgs {
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut parsed = ProbeArgs {
            config_path: PathBuf::from("frameshare.json"),
            frames: 120,
            width: 1280,
            height: 720,
            mode: None,
            dry_run: false,
        };

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {
                    if i + 1 < args.len() {
                        parsed.config_path = PathBuf::from(&args[i + 1]);
                        i += 1;
                    }
                }
                "--frames" => {
                    if i + 1 < args.len() {
                        parsed.frames = args[i + 1].parse().context("--frames expects a number")?;
                        i += 1;
                    }
                }
                "--width" => {
                    if i + 1 < args.len() {
                        parsed.width = args[i + 1].parse().context("--width expects a number")?;
                        i += 1;
                    }
                }
                "--height" => {
                    if i + 1 < args.len() {
                        parsed.height = args[i + 1].parse().context("--height expects a number")?;
                        i += 1;
                    }
                }
                "--mode" => {
                    if i + 1 < args.len() {
                        parsed.mode = Some(match args[i + 1].as_str() {
                            "composition" => SurfaceKind::Composition,
                            "window" => SurfaceKind::Window,
                            other => anyhow::bail!("unknown --mode {}", other),
                        });
                        i += 1;
                    }
                }
                "--dry-run" => parsed.dry_run = true,
                other => log_warn!("Ignoring unknown argument {}", other),
            }
            i += 1;
        }

        Ok(parsed)
    }
}

/// What the probe needs from the window it renders into.
trait ProbeHost {
    fn surface(&self, config: &BridgeConfig) -> Result<SurfaceMode>;
    fn attach(&self, swap_chain: RawHandle) -> Result<()>;
    fn detach(&self) -> Result<()>;
    /// `false` once the user closed the host.
    fn pump(&self) -> bool;
}

struct Headless;

impl ProbeHost for Headless {
    fn surface(&self, config: &BridgeConfig) -> Result<SurfaceMode> {
        // No real window; the recording backend never dereferences it
        let window = frameshare::NativeWindow(0x1);
        Ok(config.surface(Some(window))?)
    }

    fn attach(&self, _swap_chain: RawHandle) -> Result<()> {
        Ok(())
    }

    fn detach(&self) -> Result<()> {
        Ok(())
    }

    fn pump(&self) -> bool {
        true
    }
}

#[cfg(windows)]
impl ProbeHost for frameshare::host::PreviewWindow {
    fn surface(&self, config: &BridgeConfig) -> Result<SurfaceMode> {
        Ok(config.surface(Some(self.window()))?)
    }

    fn attach(&self, swap_chain: RawHandle) -> Result<()> {
        self.attach_swap_chain(swap_chain)
    }

    fn detach(&self) -> Result<()> {
        self.detach_swap_chain()
    }

    fn pump(&self) -> bool {
        self.pump_messages()
    }
}

fn main() -> Result<()> {
    let result = run_probe();
    let _ = frameshare::logger::finalize_logs();
    result
}

fn run_probe() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let args = ProbeArgs::parse()?;

    let mut config = BridgeConfig::load(&args.config_path)?;
    if let Some(mode) = args.mode {
        config.surface_mode = mode;
    }

    let log_dir = args
        .config_path
        .parent()
        .map(|p| p.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    frameshare::logger::init_logger(&log_dir, "frameshare", config.log_retention_count, config.stream_logs)?;

    log_info!("=== Probe Session Started ===");
    if let Some(path) = frameshare::logger::log_path() {
        log_info!("Log file: {}", path.display());
    }

    #[cfg(windows)]
    {
        if !args.dry_run {
            let window = frameshare::host::PreviewWindow::open(
                args.width,
                args.height,
                config.surface_mode == SurfaceKind::Composition,
            )?;
            return drive(frameshare::D3D11Backend::default(), &window, &args, &config);
        }
    }

    if !args.dry_run {
        log_info!("No native graphics backend on this platform, using the recording backend");
    }
    let backend = RecordingBackend::new();
    let result = drive(backend.clone(), &Headless, &args, &config);
    log_info!(
        "Recording backend: {} native calls, {} objects still live",
        backend.calls().len(),
        backend.live_total()
    );
    result
}

fn drive<B: GpuBackend + Clone>(backend: B, host: &dyn ProbeHost, args: &ProbeArgs, config: &BridgeConfig) -> Result<()> {
    let mode = host.surface(config)?;
    let bridge = VideoBridge::new(backend, mode, config.clone());
    let engine = Arc::new(CallbackSlot::new());

    // The surface has no size yet, so this only remembers the engine
    bridge.attach_producer(engine.clone())?;
    bridge.notify_surface_loaded(args.width, args.height)?;
    host.attach(bridge.swap_chain_ptr()?)?;

    let callbacks = engine.callbacks().context("engine has no output callbacks after attach")?;
    let context = callbacks.setup()?;
    log_info!("Decoder received producer context {:?}", context.as_ptr());

    let (resize_tx, resize_rx) = unbounded();
    let report: ReportSizeFn = Arc::new(move |_token, width, height| {
        let _ = resize_tx.send((width, height));
    });
    callbacks.set_resize(Some(report), ReportToken(1));

    let ui = spawn_ui_thread(Arc::clone(&bridge), args);
    let outcome = render_frames(callbacks.as_ref(), &resize_rx, host, args.frames);

    if ui.join().is_err() {
        log_error!("Simulated UI thread panicked");
    }

    callbacks.set_resize(None, ReportToken(1));
    callbacks.cleanup();
    bridge.detach_producer();
    host.detach()?;
    let teardown = bridge.teardown_session();

    outcome?;
    teardown.context("session teardown reported a problem")?;
    log_info!("=== Probe Session Finished ===");
    Ok(())
}

/// Resizes the surface a few times, the way a user dragging the window
/// would, then returns to the original size.
fn spawn_ui_thread<B: GpuBackend + Clone>(bridge: Arc<VideoBridge<B>>, args: &ProbeArgs) -> std::thread::JoinHandle<()> {
    let (width, height) = (args.width, args.height);
    let steps = [
        (width * 3 / 4, height * 3 / 4),
        (width / 2, height / 2),
        (width, height),
    ];

    std::thread::spawn(move || {
        for (w, h) in steps {
            spin_sleep::sleep(Duration::from_millis(250));
            log_info!("UI resize to {}x{}", w, h);
            bridge.notify_surface_resize(w.max(1), h.max(1));
        }
    })
}

fn render_frames(callbacks: &dyn OutputCallbacks, resizes: &Receiver<(u32, u32)>, host: &dyn ProbeHost, frames: u32) -> Result<()> {
    let frame_duration = Duration::from_secs_f32(1.0 / 60.0);
    let mut rendered = 0u32;
    let mut failed_frames = 0u32;
    let started = Instant::now();

    for frame in 0..frames {
        let frame_start = Instant::now();
        if !host.pump() {
            log_info!("Host closed after {} frames", frame);
            break;
        }

        // Only the latest requested size matters
        if let Some((width, height)) = resizes.try_iter().last() {
            let desc = callbacks.update_output(RenderConfig { width, height })?;
            log_info!(
                "Output {}x{}: format {}, full range {}, {:?}/{:?}",
                width,
                height,
                desc.dxgi_format,
                desc.full_range,
                desc.color_space,
                desc.orientation
            );
        }

        if !callbacks.select_plane(0) {
            anyhow::bail!("plane 0 was refused");
        }
        let entered = callbacks.start_rendering(true);
        let finished = callbacks.start_rendering(false);
        if !(entered && finished) {
            failed_frames += 1;
            continue;
        }
        callbacks.swap()?;
        rendered += 1;

        let elapsed = frame_start.elapsed();
        if elapsed < frame_duration {
            spin_sleep::sleep(frame_duration - elapsed);
        }
    }

    // Let any late UI resizes land before teardown
    for (width, height) in resizes.try_iter() {
        callbacks.update_output(RenderConfig { width, height })?;
    }

    log_info!(
        "Rendered {} frames in {:.2}s ({} skipped)",
        rendered,
        started.elapsed().as_secs_f32(),
        failed_frames
    );
    Ok(())
}
