// =============================================================================
// FRAME RING - Frame-pipelined swap chain renderer
// =============================================================================
//
// Clears a window every frame while keeping N frames in flight. The CPU
// records the next frame as soon as that frame's slot is free, the GPU works
// through earlier ones, and a single monotonic fence keeps them apart.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (input, resize, redraw)                       │
// │    └── Engine (frame state machine)                             │
// │          ├── SwapChainManager (back buffers, views, resize)     │
// │          ├── FrameRing (allocator + checkpoint per buffer)      │
// │          └── FenceSynchronizer (signal / wait / flush)          │
// │                └── Vulkan backend, or the headless timeline     │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

use anyhow::{Context, Result};
use clap::Parser;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, ModifiersState, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

use frame_ring::backend::headless::{Headless, HeadlessInstance, HeadlessSurface};
use frame_ring::backend::vulkan::{Vulkan, VulkanInstance};
use frame_ring::cli::Args;
use frame_ring::config::{self, Config};
use frame_ring::engine::{provision, Engine, FenceStats, FrameReport};
use frame_ring::gpu::GpuResult;
use frame_ring::timing::FrameTimer;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration, then let the command line override it
    let loaded = match &args.config {
        Some(path) => Config::load_or_default(path),
        None => Config::load_or_default(config::DEFAULT_PATH),
    };
    let mut config = loaded.config.clone();
    config.apply_args(&args);

    // Initialize logging, then report how the config was loaded
    init_logging(&config)?;
    log::info!("Starting frame ring renderer");
    loaded.report();
    log::info!(
        "Window: {}x{}, {} buffers, v-sync {}",
        config.window.width,
        config.window.height,
        config.graphics.buffer_count,
        if config.graphics.vsync { "on" } else { "off" }
    );

    if let Some(frames) = args.headless {
        let stats = run_headless(&config, frames)?;
        log_fence_stats(&stats);
        return Ok(());
    }

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging, optionally into the configured log file
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    if config.debug.log_to_file {
        let file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file {}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn log_fence_stats(stats: &FenceStats) {
    log::info!(
        "Fence: {} signals, {} waits ({} blocking, {} timed out), {} flushes, \
         stalled {:.2}ms total / {:.2}ms max",
        stats.signals,
        stats.waits,
        stats.blocking_waits,
        stats.timeouts,
        stats.flushes,
        stats.total_stall.as_secs_f64() * 1000.0,
        stats.max_stall.as_secs_f64() * 1000.0
    );
}

/// Renders one frame, bounded by the configured wait if there is one.
fn render_frame<B: frame_ring::gpu::Backend>(
    engine: &mut Engine<B>,
    timeout: Option<Duration>,
) -> GpuResult<Option<FrameReport>> {
    match timeout {
        Some(timeout) => engine.try_render(timeout),
        None => engine.render().map(Some),
    }
}

// =============================================================================
// HEADLESS RUN
// =============================================================================

/// Renders `frames` frames on the software timeline, resizing once halfway.
fn run_headless(config: &Config, frames: u64) -> Result<FenceStats> {
    log::info!("Headless run: {} frames", frames);

    let instance = HeadlessInstance::new(config.headless_config());
    let device = provision::<Headless, _>(instance, &config.provision_options())
        .context("Failed to provision headless device")?;
    let mut engine = Engine::<Headless>::new(device, HeadlessSurface::default(), &config.engine_settings())
        .context("Failed to create frame engine")?;

    let timeout = config.frame_wait_timeout();
    let mut timer = FrameTimer::new();
    let mut skipped = 0u64;
    let mut resized = false;

    while engine.frames_rendered() < frames {
        if !resized && frames > 1 && engine.frames_rendered() == frames / 2 {
            let (width, height) = engine.swap_chain().extent();
            engine.resize((width / 2).max(1), (height / 2).max(1))?;
            resized = true;
        }

        match render_frame(&mut engine, timeout)? {
            Some(report) => {
                if let Some(sample) = timer.tick() {
                    log::info!(
                        "{:.0} FPS ({:.2}ms), slot {} at fence {}",
                        sample.fps,
                        sample.frame_time_ms,
                        report.index,
                        report.fence_value
                    );
                }
            }
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        log::info!("{} frame attempts timed out waiting for a free slot", skipped);
    }
    Ok(engine.shutdown()?)
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct KeyBindings {
    vsync: KeyCode,
    fullscreen: KeyCode,
    quit: KeyCode,
}

impl KeyBindings {
    fn from_config(config: &Config) -> Self {
        Self {
            vsync: parse_key(&config.controls.vsync_key, KeyCode::KeyV),
            fullscreen: parse_key(&config.controls.fullscreen_key, KeyCode::F11),
            quit: parse_key(&config.controls.quit_key, KeyCode::Escape),
        }
    }
}

fn parse_key(name: &str, fallback: KeyCode) -> KeyCode {
    let key = match name.to_ascii_uppercase().as_str() {
        "ESCAPE" | "ESC" => Some(KeyCode::Escape),
        "F1" => Some(KeyCode::F1),
        "F2" => Some(KeyCode::F2),
        "F3" => Some(KeyCode::F3),
        "F4" => Some(KeyCode::F4),
        "F5" => Some(KeyCode::F5),
        "F6" => Some(KeyCode::F6),
        "F7" => Some(KeyCode::F7),
        "F8" => Some(KeyCode::F8),
        "F9" => Some(KeyCode::F9),
        "F10" => Some(KeyCode::F10),
        "F11" => Some(KeyCode::F11),
        "F12" => Some(KeyCode::F12),
        "SPACE" => Some(KeyCode::Space),
        "TAB" => Some(KeyCode::Tab),
        "V" => Some(KeyCode::KeyV),
        "Q" => Some(KeyCode::KeyQ),
        "F" => Some(KeyCode::KeyF),
        _ => None,
    };
    key.unwrap_or_else(|| {
        log::warn!("Unknown key '{}', using {:?}", name, fallback);
        fallback
    })
}

/// Main application struct.
///
/// The engine owns every GPU object, so dropping it before the window is all
/// the teardown ordering needed.
struct App {
    config: Config,
    keys: KeyBindings,

    // ─────────────────────────────────────────────────────────────────────────
    // RENDERING
    // ─────────────────────────────────────────────────────────────────────────
    engine: Option<Engine<Vulkan>>,
    frame_timeout: Option<Duration>,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    /// Window has zero area, nothing to present to
    is_minimized: bool,
    modifiers: ModifiersState,

    timer: FrameTimer,
    /// First unrecoverable error, returned from `main`
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            keys: KeyBindings::from_config(&config),
            frame_timeout: config.frame_wait_timeout(),
            is_fullscreen: config.window.fullscreen,
            config,
            engine: None,
            window: None,
            is_minimized: false,
            modifiers: ModifiersState::empty(),
            timer: FrameTimer::new(),
            fatal: None,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_engine(&mut self, window: &Window) -> Result<Engine<Vulkan>> {
        let options = self.config.provision_options();
        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Instance + surface (adapters must be able to present to it)
        // ─────────────────────────────────────────────────────────────────────
        let mut instance = VulkanInstance::new(&self.config.window.title, display, options.enable_debug_layer)
            .context("Failed to create Vulkan instance. Is Vulkan installed?")?;
        let surface = instance
            .create_surface(display, window_handle)
            .context("Failed to create window surface")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Adapter + device
        // ─────────────────────────────────────────────────────────────────────
        let device = provision::<Vulkan, _>(instance, &options).context("Failed to provision a GPU")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Frame engine at the window's actual size
        // ─────────────────────────────────────────────────────────────────────
        let size = window.inner_size();
        let mut settings = self.config.engine_settings();
        settings.width = size.width;
        settings.height = size.height;

        Engine::new(device, surface, &settings).context("Failed to create frame engine")
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        if self.is_minimized {
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };

        match render_frame(engine, self.frame_timeout) {
            Ok(Some(_)) => self.update_fps(),
            Ok(None) => log::trace!("Frame slot still busy, skipping this redraw"),
            Err(e) => self.fail(event_loop, anyhow::Error::new(e).context("Render failed")),
        }
    }

    fn resize(&mut self, event_loop: &ActiveEventLoop, width: u32, height: u32) {
        log::debug!("Window resized to {}x{}", width, height);

        if width == 0 || height == 0 {
            self.is_minimized = true;
            return;
        }
        if self.is_minimized {
            self.is_minimized = false;
            self.timer.reset();
        }

        if let Some(engine) = self.engine.as_mut() {
            if let Err(e) = engine.resize(width, height) {
                self.fail(event_loop, anyhow::Error::new(e).context("Resize failed"));
            }
        }
    }

    // =========================================================================
    // FULLSCREEN / VSYNC
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The Resized event that follows resizes the buffers
        }
    }

    fn toggle_vsync(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.toggle_vsync();
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        let Some(sample) = self.timer.tick() else {
            return;
        };

        if let (Some(window), Some(engine)) = (&self.window, &self.engine) {
            let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms) [{}, v-sync {}]",
                self.config.window.title,
                sample.fps,
                sample.frame_time_ms,
                mode,
                if engine.vsync() { "on" } else { "off" }
            ));
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width.max(1),
                self.config.window.height.max(1),
            ));
        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match self.init_engine(&window) {
            Ok(engine) => {
                self.engine = Some(engine);
                self.window = Some(window);
            }
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => self.resize(event_loop, size.width, size.height),

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            WindowEvent::ModifiersChanged(modifiers) => {
                self.modifiers = modifiers.state();
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() || event.repeat {
                    return;
                }
                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };

                if key == self.keys.quit {
                    log::info!("{:?} pressed, exiting...", key);
                    event_loop.exit();
                } else if key == self.keys.fullscreen
                    || (key == KeyCode::Enter && self.modifiers.alt_key())
                {
                    self.toggle_fullscreen();
                } else if key == self.keys.vsync {
                    self.toggle_vsync();
                }
            }

            _ => {}
        }
    }

    /// Called when the event loop is about to block waiting for events.
    /// We use this to request continuous redraws for maximum FPS.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.is_minimized {
            return;
        }
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    /// Drain the GPU before the window goes away.
    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        match engine.shutdown() {
            Ok(stats) => log_fence_stats(&stats),
            Err(e) => {
                log::error!("Shutdown failed: {}", e);
                if self.fatal.is_none() {
                    self.fatal = Some(anyhow::Error::new(e).context("Shutdown failed"));
                }
            }
        }
    }
}
