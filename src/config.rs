use crate::backend::{ClearColor, NativeWindow, RenderFormat, SurfaceKind, SurfaceMode};
use crate::error::BridgeError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub surface_mode: SurfaceKind,
    #[serde(default)]
    pub render_format: RenderFormat,
    #[serde(default)]
    pub debug_layer: bool,
    #[serde(default = "default_abort_on_leak")]
    pub abort_on_leak: bool,
    #[serde(default = "default_producer_clear")]
    pub producer_clear_color: ClearColor,
    #[serde(default = "default_consumer_clear")]
    pub consumer_clear_color: ClearColor,
    #[serde(default = "default_log_retention")]
    pub log_retention_count: usize,
    #[serde(default)]
    pub stream_logs: bool,
}

fn default_abort_on_leak() -> bool {
    cfg!(debug_assertions)
}

fn default_producer_clear() -> ClearColor {
    [0.5, 0.5, 0.0, 1.0]
}

fn default_consumer_clear() -> ClearColor {
    [1.0, 0.5, 0.0, 1.0]
}

fn default_log_retention() -> usize {
    10
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            surface_mode: SurfaceKind::default(),
            render_format: RenderFormat::default(),
            debug_layer: false,
            abort_on_leak: default_abort_on_leak(),
            producer_clear_color: default_producer_clear(),
            consumer_clear_color: default_consumer_clear(),
            log_retention_count: default_log_retention(),
            stream_logs: false,
        }
    }
}

impl BridgeConfig {
    /// Reads the config at `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: BridgeConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize config")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        Ok(())
    }

    /// Resolves the configured surface kind. Window mode needs the window
    /// the swap chain will be bound to.
    pub fn surface(&self, window: Option<NativeWindow>) -> std::result::Result<SurfaceMode, BridgeError> {
        match (self.surface_mode, window) {
            (SurfaceKind::Composition, _) => Ok(SurfaceMode::CompositionTarget),
            (SurfaceKind::Window, Some(window)) => Ok(SurfaceMode::WindowBound(window)),
            (SurfaceKind::Window, None) => Err(BridgeError::Config(
                "surface_mode \"window\" requires a native window".to_string(),
            )),
        }
    }
}
