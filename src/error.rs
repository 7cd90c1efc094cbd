use thiserror::Error;

/// Failures surfaced by the bridge. Native failures carry the HRESULT-style
/// code reported by the driver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("device creation failed during {stage} (code 0x{code:08X})")]
    DeviceCreation { stage: &'static str, code: i32 },

    #[error("shader compilation failed for {stage}: {diagnostics}")]
    ShaderCompile { stage: &'static str, diagnostics: String },

    #[error("invalid surface dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("{object} still has {remaining} outstanding reference(s) after release")]
    ResourceLeak { object: &'static str, remaining: u32 },

    #[error("shared handle {stage} failed (code 0x{code:08X})")]
    SharedHandle { stage: &'static str, code: i32 },

    #[error("session has been torn down")]
    SessionClosed,

    #[error("no shared frame texture is live; resize the output first")]
    NoSharedTexture,

    #[error("no render session exists yet")]
    NoSession,

    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether the caller can recover by retrying with different input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidDimensions { .. }
                | BridgeError::SharedHandle { .. }
                | BridgeError::NoSharedTexture
                | BridgeError::NoSession
        )
    }

    pub(crate) fn device(stage: &'static str, code: i32) -> Self {
        BridgeError::DeviceCreation { stage, code }
    }

    pub(crate) fn handle(stage: &'static str, code: i32) -> Self {
        BridgeError::SharedHandle { stage, code }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
