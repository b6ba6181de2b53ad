// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the virtual camera service
//!
//! Errors are split by the component that raises them. Pipeline errors are
//! consumed by the supervisor as restart triggers; provisioning and control
//! errors are surfaced to the operator with a distinct exit code.

use crate::constants::exit_codes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Top-level error returned by CLI commands
#[derive(Debug, Clone)]
pub enum AppError {
    /// Control surface errors
    Control(ControlError),
    /// Device provisioning errors
    Provisioning(ProvisioningError),
    /// Configuration errors
    Config(ConfigError),
    /// Generic error with message
    Other(String),
}

/// Errors raised while creating or removing a loopback device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningError {
    /// A device already occupies the index with a different configuration
    Conflict {
        index: u32,
        existing: String,
        requested: String,
    },
    /// A pipeline (or another consumer) is attached to the device
    Busy { index: u32 },
    /// The loopback module or its tooling is not available
    Unsupported(String),
    /// Filesystem or tooling failure
    Io(String),
}

/// Which half of the pipeline terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Capture,
    Transform,
}

/// Errors raised before a pipeline has produced its first frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStartError {
    /// Camera or loopback node missing, busy or exited during startup
    DeviceUnavailable(String),
    /// Access to the camera or loopback node was refused
    PermissionDenied(String),
    /// No frame reached the device within the startup timeout
    Timeout(Duration),
}

/// Errors raised by a pipeline that was already producing frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineRuntimeError {
    /// A stage terminated without a stop request
    UnexpectedExit {
        stage: PipelineStage,
        code: Option<i32>,
    },
    /// Writing to the loopback node failed
    WriteFailure(String),
}

/// What a control command could not find
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Missing {
    /// No device record for this index
    Device(u32),
    /// The loopback device node does not exist
    DeviceNode(PathBuf),
    /// No pipeline process to attach to
    Pipeline,
    /// No daemon listening on the control socket
    Daemon(PathBuf),
}

/// Errors surfaced synchronously by the control surface
///
/// Serialisable so the daemon can hand them back over the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ControlError {
    /// A pipeline is already starting or running for this device
    AlreadyRunning,
    /// The command's target does not exist
    NotFound(Missing),
    /// The per-device lock could not be acquired in time
    LockContention { index: u32, waited: Duration },
    /// Provisioning failed
    Provisioning(ProvisioningError),
    /// Persisted state could not be read or written
    Config(ConfigError),
    /// The device node exists but failed the capability query
    Capability(String),
    /// Control socket failure
    Transport(String),
}

/// Configuration and persistence errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    /// Failed to read or write a file
    Io { path: PathBuf, message: String },
    /// Failed to parse a file
    Parse { path: PathBuf, message: String },
    /// Values parsed but are not usable
    Invalid(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Control(e) => write!(f, "{}", e),
            AppError::Provisioning(e) => write!(f, "Provisioning error: {}", e),
            AppError::Config(e) => write!(f, "Configuration error: {}", e),
            AppError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for ProvisioningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningError::Conflict {
                index,
                existing,
                requested,
            } => write!(
                f,
                "video{} is already provisioned as {} (requested {})",
                index, existing, requested
            ),
            ProvisioningError::Busy { index } => {
                write!(f, "video{} is in use by a running pipeline", index)
            }
            ProvisioningError::Unsupported(msg) => write!(f, "Loopback unsupported: {}", msg),
            ProvisioningError::Io(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Capture => write!(f, "capture"),
            PipelineStage::Transform => write!(f, "transform"),
        }
    }
}

impl fmt::Display for PipelineStartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStartError::DeviceUnavailable(msg) => write!(f, "Device unavailable: {}", msg),
            PipelineStartError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            PipelineStartError::Timeout(after) => {
                write!(f, "No frame written within {:.1}s", after.as_secs_f64())
            }
        }
    }
}

impl fmt::Display for PipelineRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineRuntimeError::UnexpectedExit {
                stage,
                code: Some(code),
            } => write!(f, "{} stage exited unexpectedly (code {})", stage, code),
            PipelineRuntimeError::UnexpectedExit { stage, code: None } => {
                write!(f, "{} stage exited unexpectedly", stage)
            }
            PipelineRuntimeError::WriteFailure(msg) => write!(f, "Device write failed: {}", msg),
        }
    }
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Device(index) => write!(f, "video{} is not provisioned (run provision)", index),
            Missing::DeviceNode(path) => {
                write!(f, "device node {} does not exist (run provision)", path.display())
            }
            Missing::Pipeline => write!(f, "no pipeline process to attach to"),
            Missing::Daemon(socket) => {
                write!(f, "no daemon listening on {}", socket.display())
            }
        }
    }
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::AlreadyRunning => write!(f, "Pipeline is already running"),
            ControlError::NotFound(what) => write!(f, "Not found: {}", what),
            ControlError::LockContention { index, waited } => write!(
                f,
                "Another command holds the lock for video{} (waited {:.1}s)",
                index,
                waited.as_secs_f64()
            ),
            ControlError::Provisioning(e) => write!(f, "Provisioning error: {}", e),
            ControlError::Config(e) => write!(f, "Configuration error: {}", e),
            ControlError::Capability(msg) => write!(f, "Capability check failed: {}", msg),
            ControlError::Transport(msg) => write!(f, "Control socket error: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, message } => write!(f, "{}: {}", path.display(), message),
            ConfigError::Parse { path, message } => {
                write!(f, "Failed to parse {}: {}", path.display(), message)
            }
            ConfigError::Invalid(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for AppError {}
impl std::error::Error for ProvisioningError {}
impl std::error::Error for PipelineStartError {}
impl std::error::Error for PipelineRuntimeError {}
impl std::error::Error for ControlError {}
impl std::error::Error for ConfigError {}

impl PipelineStartError {
    /// Classify an I/O error raised while opening a stage
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied => {
                PipelineStartError::PermissionDenied(format!("{}: {}", context, err))
            }
            _ => PipelineStartError::DeviceUnavailable(format!("{}: {}", context, err)),
        }
    }

    /// Exit code recorded in the service state
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineStartError::DeviceUnavailable(_) => 1,
            PipelineStartError::PermissionDenied(_) => 126,
            PipelineStartError::Timeout(_) => 124,
        }
    }
}

impl PipelineRuntimeError {
    /// Exit code recorded in the service state
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineRuntimeError::UnexpectedExit { code, .. } => code.unwrap_or(1),
            PipelineRuntimeError::WriteFailure(_) => 1,
        }
    }
}

impl ProvisioningError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisioningError::Conflict { .. } => exit_codes::CONFLICT,
            ProvisioningError::Busy { .. } => exit_codes::BUSY,
            ProvisioningError::Unsupported(_) => exit_codes::UNSUPPORTED,
            ProvisioningError::Io(_) => exit_codes::FAILURE,
        }
    }
}

impl ControlError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ControlError::AlreadyRunning => exit_codes::SUCCESS,
            ControlError::NotFound(Missing::Device(_) | Missing::DeviceNode(_)) => {
                exit_codes::DEVICE_ABSENT
            }
            ControlError::NotFound(_) => exit_codes::NOT_ATTACHED,
            ControlError::LockContention { .. } => exit_codes::LOCK_CONTENTION,
            ControlError::Provisioning(e) => e.exit_code(),
            ControlError::Config(e) => e.exit_code(),
            ControlError::Capability(_) => exit_codes::FAILURE,
            ControlError::Transport(_) => exit_codes::FAILURE,
        }
    }

    /// Stable machine-readable name, used on the control socket
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::AlreadyRunning => "already_running",
            ControlError::NotFound(Missing::Device(_)) => "not_provisioned",
            ControlError::NotFound(Missing::DeviceNode(_)) => "device_absent",
            ControlError::NotFound(Missing::Pipeline) => "no_pipeline",
            ControlError::NotFound(Missing::Daemon(_)) => "no_daemon",
            ControlError::LockContention { .. } => "lock_contention",
            ControlError::Provisioning(ProvisioningError::Conflict { .. }) => "conflict",
            ControlError::Provisioning(ProvisioningError::Busy { .. }) => "busy",
            ControlError::Provisioning(ProvisioningError::Unsupported(_)) => "unsupported",
            ControlError::Provisioning(ProvisioningError::Io(_)) => "provisioning",
            ControlError::Config(ConfigError::Invalid(_)) => "invalid",
            ControlError::Config(_) => "persistence",
            ControlError::Capability(_) => "capability",
            ControlError::Transport(_) => "transport",
        }
    }
}

impl ConfigError {
    /// Invalid values are a usage error, everything else a persistence failure
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::Invalid(_) => exit_codes::USAGE,
            ConfigError::Io { .. } | ConfigError::Parse { .. } => exit_codes::PERSISTENCE,
        }
    }
}

impl AppError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Control(e) => e.exit_code(),
            AppError::Provisioning(e) => e.exit_code(),
            AppError::Config(e) => e.exit_code(),
            AppError::Other(_) => exit_codes::FAILURE,
        }
    }
}

impl From<ControlError> for AppError {
    fn from(err: ControlError) -> Self {
        AppError::Control(err)
    }
}

impl From<ProvisioningError> for AppError {
    fn from(err: ProvisioningError) -> Self {
        AppError::Provisioning(err)
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl From<ProvisioningError> for ControlError {
    fn from(err: ProvisioningError) -> Self {
        ControlError::Provisioning(err)
    }
}

impl From<ConfigError> for ControlError {
    fn from(err: ConfigError) -> Self {
        ControlError::Config(err)
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Other(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Other(msg.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Other(err.to_string())
    }
}

impl From<ConfigError> for ProvisioningError {
    fn from(err: ConfigError) -> Self {
        ProvisioningError::Io(err.to_string())
    }
}

impl From<std::io::Error> for ProvisioningError {
    fn from(err: std::io::Error) -> Self {
        ProvisioningError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_absent_has_distinct_exit_code() {
        let absent = ControlError::NotFound(Missing::DeviceNode(PathBuf::from("/dev/video10")));
        let no_pipeline = ControlError::NotFound(Missing::Pipeline);
        assert_eq!(absent.exit_code(), exit_codes::DEVICE_ABSENT);
        assert_ne!(absent.exit_code(), no_pipeline.exit_code());
        assert_ne!(absent.exit_code(), exit_codes::FAILURE);
    }

    #[test]
    fn test_already_running_is_not_a_failure() {
        assert_eq!(ControlError::AlreadyRunning.exit_code(), 0);
    }

    #[test]
    fn test_start_error_classification() {
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(
            PipelineStartError::from_io("open /dev/video10", &denied),
            PipelineStartError::PermissionDenied(_)
        ));

        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(
            PipelineStartError::from_io("spawn rpicam-vid", &missing),
            PipelineStartError::DeviceUnavailable(_)
        ));
    }

    #[test]
    fn test_control_error_survives_the_wire() {
        let err = ControlError::LockContention {
            index: 10,
            waited: Duration::from_millis(1500),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: ControlError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), "lock_contention");
        assert_eq!(back.exit_code(), exit_codes::LOCK_CONTENTION);
    }

    #[test]
    fn test_invalid_config_is_a_usage_error() {
        let err = ControlError::Config(ConfigError::Invalid("bad".into()));
        assert_eq!(err.exit_code(), exit_codes::USAGE);
    }

    #[test]
    fn test_runtime_error_display() {
        let err = PipelineRuntimeError::UnexpectedExit {
            stage: PipelineStage::Capture,
            code: Some(137),
        };
        assert_eq!(err.to_string(), "capture stage exited unexpectedly (code 137)");
        assert_eq!(err.exit_code(), 137);
    }
}
