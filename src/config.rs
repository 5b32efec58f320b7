// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.
// Command-line flags are applied on top with `apply_args`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::HeadlessConfig;
use crate::cli::Args;
use crate::engine::{EngineSettings, ProvisionOptions};

pub const DEFAULT_PATH: &str = "config.toml";

/// Swap chains need at least two buffers and the ring caps at sixteen
pub const MIN_BUFFER_COUNT: usize = 2;
pub const MAX_BUFFER_COUNT: usize = 16;

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub adapter: AdapterConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
    pub headless: HeadlessSection,
}

/// Window settings
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Ring".to_string(),
            width: 1920,
            height: 1080,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GraphicsConfig {
    pub vsync: bool,
    /// Back buffers = frames in flight
    pub buffer_count: usize,
    pub clear_color: [f32; 4],
    /// Bound on the per-frame fence wait, 0 waits forever
    pub frame_wait_timeout_ms: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            buffer_count: 3,
            clear_color: [0.4, 0.6, 0.9, 1.0],
            frame_wait_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct AdapterConfig {
    pub use_software: bool,
}

/// Debug settings
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "frame_ring.log".to_string(),
            show_fps: true,
        }
    }
}

/// Control key bindings, by winit `KeyCode` name
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ControlsConfig {
    pub vsync_key: String,
    pub fullscreen_key: String,
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            vsync_key: "V".to_string(),
            fullscreen_key: "F11".to_string(),
            quit_key: "Escape".to_string(),
        }
    }
}

/// Software GPU timeline used by `--headless`
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HeadlessSection {
    pub gpu_latency_ms: u64,
    pub tearing_supported: bool,
}

impl Default for HeadlessSection {
    fn default() -> Self {
        Self {
            gpu_latency_ms: 2,
            tearing_supported: true,
        }
    }
}

/// How `Config::load_or_default` came by its configuration.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded,
    Missing,
    /// The file could not be read or parsed, defaults are in use
    Fallback(anyhow::Error),
}

/// A configuration together with what happened while loading it. Loading
/// runs before the logger exists, so the caller reports it afterwards.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: Config,
    pub path: PathBuf,
    pub outcome: LoadOutcome,
    /// Values that were out of range and got replaced
    pub adjustments: Vec<String>,
}

impl LoadedConfig {
    pub fn is_fallback(&self) -> bool {
        matches!(self.outcome, LoadOutcome::Fallback(_))
    }

    /// Logs the load outcome and any adjusted values.
    pub fn report(&self) {
        match &self.outcome {
            LoadOutcome::Loaded => log::info!("Loaded configuration from {:?}", self.path),
            LoadOutcome::Missing => log::info!("Config file not found at {:?}, using defaults", self.path),
            LoadOutcome::Fallback(e) => {
                log::warn!("Failed to load {:?}: {:#}. Using defaults.", self.path, e)
            }
        }
        for adjustment in &self.adjustments {
            log::warn!("{}", adjustment);
        }
        log::debug!("Config: {:?}", self.config);
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults if the file
    /// is missing or broken. Nothing is logged until `report`.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> LoadedConfig {
        let path = path.as_ref().to_path_buf();
        let (mut config, outcome) = match Self::read(&path) {
            Ok(Some(config)) => (config, LoadOutcome::Loaded),
            Ok(None) => (Config::default(), LoadOutcome::Missing),
            Err(e) => (Config::default(), LoadOutcome::Fallback(e)),
        };
        let adjustments = config.sanitize();

        LoadedConfig {
            config,
            path,
            outcome,
            adjustments,
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::read(path.as_ref())?.unwrap_or_default();
        for adjustment in config.sanitize() {
            log::warn!("{}", adjustment);
        }
        Ok(config)
    }

    /// `None` if there is no file at `path`.
    fn read(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(Some(config))
    }

    /// Command-line flags win over the file.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(width) = args.width {
            self.window.width = width;
        }
        if let Some(height) = args.height {
            self.window.height = height;
        }
        if args.warp {
            self.adapter.use_software = true;
        }
        if args.no_vsync {
            self.graphics.vsync = false;
        }
    }

    /// Clamps out-of-range values, describing each change.
    fn sanitize(&mut self) -> Vec<String> {
        let mut adjustments = Vec::new();
        let clamped = self.graphics.buffer_count.clamp(MIN_BUFFER_COUNT, MAX_BUFFER_COUNT);
        if clamped != self.graphics.buffer_count {
            adjustments.push(format!(
                "buffer_count {} outside {}..={}, using {}",
                self.graphics.buffer_count, MIN_BUFFER_COUNT, MAX_BUFFER_COUNT, clamped
            ));
            self.graphics.buffer_count = clamped;
        }
        adjustments
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            width: self.window.width,
            height: self.window.height,
            buffer_count: self.graphics.buffer_count,
            vsync: self.graphics.vsync,
            clear_color: self.graphics.clear_color,
        }
    }

    /// Validation only in debug builds, as the layers cost real frame time
    pub fn provision_options(&self) -> ProvisionOptions {
        ProvisionOptions {
            use_software_adapter: self.adapter.use_software,
            enable_debug_layer: cfg!(debug_assertions) && self.debug.validation_layers,
        }
    }

    pub fn frame_wait_timeout(&self) -> Option<Duration> {
        match self.graphics.frame_wait_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn headless_config(&self) -> HeadlessConfig {
        HeadlessConfig {
            gpu_latency: Duration::from_millis(self.headless.gpu_latency_ms),
            tearing_supported: self.headless.tearing_supported,
            ..HeadlessConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.window.width, 1920);
        assert_eq!(config.window.height, 1080);
        assert_eq!(config.graphics.buffer_count, 3);
        assert!(config.graphics.vsync);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let file = write_config(
            r#"
            [graphics]
            vsync = false
            frame_wait_timeout_ms = 250

            [adapter]
            use_software = true
            "#,
        );
        let config = Config::load_from_path(file.path()).unwrap();

        assert!(!config.graphics.vsync);
        assert_eq!(config.frame_wait_timeout(), Some(Duration::from_millis(250)));
        assert!(config.adapter.use_software);
        assert_eq!(config.window, WindowConfig::default());
        assert_eq!(config.controls.vsync_key, "V");
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let file = write_config("[window\nwidth = ");
        assert!(Config::load_from_path(file.path()).is_err());

        let loaded = Config::load_or_default(file.path());
        assert_eq!(loaded.config, Config::default());
        assert!(loaded.is_fallback());
        match &loaded.outcome {
            LoadOutcome::Fallback(e) => assert!(format!("{:#}", e).contains("Failed to parse")),
            other => panic!("expected a fallback, got {:?}", other),
        }
        assert_eq!(loaded.path, file.path());
    }

    #[test]
    fn missing_file_is_not_a_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load_or_default(dir.path().join("nope.toml"));
        assert!(matches!(loaded.outcome, LoadOutcome::Missing));
        assert!(!loaded.is_fallback());
        assert!(loaded.adjustments.is_empty());
    }

    #[test]
    fn buffer_count_is_clamped() {
        let file = write_config("[graphics]\nbuffer_count = 64\n");
        assert_eq!(Config::load_from_path(file.path()).unwrap().graphics.buffer_count, 16);

        let file = write_config("[graphics]\nbuffer_count = 1\n");
        let loaded = Config::load_or_default(file.path());
        assert!(matches!(loaded.outcome, LoadOutcome::Loaded));
        assert_eq!(loaded.config.graphics.buffer_count, 2);
        assert_eq!(loaded.adjustments, vec!["buffer_count 1 outside 2..=16, using 2".to_string()]);
    }

    #[test]
    fn args_override_file() {
        let mut config = Config::default();
        config.apply_args(&Args {
            width: Some(640),
            height: Some(360),
            warp: true,
            no_vsync: true,
            ..Args::default()
        });

        let settings = config.engine_settings();
        assert_eq!((settings.width, settings.height), (640, 360));
        assert!(!settings.vsync);
        assert!(config.provision_options().use_software_adapter);
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        assert_eq!(Config::default().frame_wait_timeout(), None);
    }
}
