// SPDX-License-Identifier: GPL-3.0-only

//! Device, pipeline and daemon configuration
//!
//! [`VirtualDeviceConfig`] and [`PipelineConfig`] are the durable per-device
//! records; [`Settings`] carries the daemon tuning and platform paths.

use crate::constants::{self, paths, timing};
use crate::errors::ConfigError;
use crate::media::PixelFormat;
use crate::storage;
use crate::supervisor::{RestartPolicy, SupervisorPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One loopback device slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDeviceConfig {
    /// Creates `/dev/video<device_index>`
    pub device_index: u32,
    /// Card label shown to consuming applications
    pub label: String,
    /// Loopback buffer count (`max_buffers`)
    pub buffer_capacity_frames: u32,
}

impl VirtualDeviceConfig {
    pub fn new(device_index: u32, label: impl Into<String>, buffer_capacity_frames: u32) -> Self {
        Self {
            device_index,
            label: label.into(),
            buffer_capacity_frames,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.label.trim().is_empty() {
            return Err(ConfigError::Invalid("device label must not be empty".into()));
        }
        // The label ends up inside a comma-separated modprobe option
        if self.label.contains(['"', ',', '\n']) {
            return Err(ConfigError::Invalid(format!(
                "device label {:?} must not contain quotes, commas or newlines",
                self.label
            )));
        }
        if !(1..=constants::MAX_BUFFER_FRAMES).contains(&self.buffer_capacity_frames) {
            return Err(ConfigError::Invalid(format!(
                "buffer capacity must be between 1 and {} frames",
                constants::MAX_BUFFER_FRAMES
            )));
        }
        Ok(())
    }

    /// Compact description used in conflict messages
    pub fn describe(&self) -> String {
        format!(
            "\"{}\" ({} buffers)",
            self.label, self.buffer_capacity_frames
        )
    }
}

/// Transform applied between capture and device write
///
/// Immutable for the lifetime of a pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Format written to the loopback device
    pub pixel_format: PixelFormat,
    #[serde(default)]
    pub flip_horizontal: bool,
    #[serde(default)]
    pub flip_vertical: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: constants::DEFAULT_WIDTH,
            height: constants::DEFAULT_HEIGHT,
            frame_rate: constants::DEFAULT_FRAME_RATE,
            pixel_format: PixelFormat::default(),
            flip_horizontal: false,
            flip_vertical: false,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid("width and height must be non-zero".into()));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "{}x{} is not supported, width and height must be even",
                self.width, self.height
            )));
        }
        if !(1..=constants::MAX_FRAME_RATE).contains(&self.frame_rate) {
            return Err(ConfigError::Invalid(format!(
                "frame rate must be between 1 and {}",
                constants::MAX_FRAME_RATE
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{} @ {}fps {}",
            self.width, self.height, self.frame_rate, self.pixel_format
        )?;
        match (self.flip_horizontal, self.flip_vertical) {
            (true, true) => write!(f, " (flipped both ways)"),
            (true, false) => write!(f, " (flipped horizontally)"),
            (false, true) => write!(f, " (flipped vertically)"),
            (false, false) => Ok(()),
        }
    }
}

/// Device record reloaded at process start to recreate state after reboot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedBootConfig {
    pub device: VirtualDeviceConfig,
    /// Start the pipeline automatically when the daemon starts
    #[serde(default)]
    pub enabled: bool,
}

/// External capture program producing raw frames on stdout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub program: String,
    /// Arguments; `{width}`, `{height}` and `{fps}` are substituted
    pub args: Vec<String>,
    /// Format of the frames the program writes
    pub source_format: PixelFormat,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            program: "rpicam-vid".to_string(),
            args: [
                "-t", "0", "-n", "--codec", "yuv420", "--width", "{width}", "--height",
                "{height}", "--framerate", "{fps}", "-o", "-",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            source_format: PixelFormat::I420,
        }
    }
}

impl CaptureSettings {
    /// Arguments with placeholders filled in from the pipeline config
    pub fn expand_args(&self, config: &PipelineConfig) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{width}", &config.width.to_string())
                    .replace("{height}", &config.height.to_string())
                    .replace("{fps}", &config.frame_rate.to_string())
            })
            .collect()
    }
}

/// Platform locations used by the loopback backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackPaths {
    pub dev_root: PathBuf,
    pub sysfs_video_root: PathBuf,
    pub sysfs_module_root: PathBuf,
    pub modprobe_dir: PathBuf,
    pub modules_load_dir: PathBuf,
    /// `v4l2loopback-ctl` binary
    pub ctl_program: String,
    /// Only advertise capture caps once a writer is attached
    pub exclusive_caps: bool,
}

impl Default for LoopbackPaths {
    fn default() -> Self {
        Self {
            dev_root: PathBuf::from(paths::DEV_ROOT),
            sysfs_video_root: PathBuf::from(paths::SYSFS_VIDEO_ROOT),
            sysfs_module_root: PathBuf::from(paths::SYSFS_MODULE_ROOT),
            modprobe_dir: PathBuf::from(paths::MODPROBE_DIR),
            modules_load_dir: PathBuf::from(paths::MODULES_LOAD_DIR),
            ctl_program: "v4l2loopback-ctl".to_string(),
            exclusive_caps: true,
        }
    }
}

impl LoopbackPaths {
    pub fn device_node(&self, index: u32) -> PathBuf {
        self.dev_root.join(format!("video{}", index))
    }
}

/// Daemon tuning and platform settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Overrides the default state directory
    pub state_dir: Option<PathBuf>,
    pub capture: CaptureSettings,
    pub restart: RestartPolicy,
    pub startup_timeout_ms: u64,
    pub stability_threshold_ms: u64,
    pub stop_grace_ms: u64,
    pub lock_timeout_ms: u64,
    /// Lines of history replayed to `logs`
    pub log_history: usize,
    pub loopback: LoopbackPaths,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: None,
            capture: CaptureSettings::default(),
            restart: RestartPolicy::default(),
            startup_timeout_ms: timing::STARTUP_TIMEOUT.as_millis() as u64,
            stability_threshold_ms: timing::STABILITY_THRESHOLD.as_millis() as u64,
            stop_grace_ms: timing::STOP_GRACE.as_millis() as u64,
            lock_timeout_ms: timing::LOCK_TIMEOUT.as_millis() as u64,
            log_history: constants::LOG_HISTORY_LINES,
            loopback: LoopbackPaths::default(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from the user config dir when present
    ///
    /// An explicit path must exist; the implicit one falls back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = match path {
            Some(path) => storage::read_json(path)?.ok_or_else(|| ConfigError::Io {
                path: path.to_path_buf(),
                message: "settings file not found".into(),
            })?,
            None => match default_settings_path() {
                Some(path) => storage::read_json(&path)?.unwrap_or_default(),
                None => Settings::default(),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.program.trim().is_empty() {
            return Err(ConfigError::Invalid("capture program must not be empty".into()));
        }
        if self.startup_timeout_ms == 0 {
            return Err(ConfigError::Invalid("startup timeout must be non-zero".into()));
        }
        self.restart.validate()
    }

    /// State directory: explicit override, settings, then a per-user default
    pub fn resolve_state_dir(&self, explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| self.state_dir.clone())
            .unwrap_or_else(default_state_dir)
    }

    pub fn supervisor_policy(&self) -> SupervisorPolicy {
        SupervisorPolicy {
            restart: self.restart.clone(),
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
            stability_threshold: Duration::from_millis(self.stability_threshold_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// `$XDG_CONFIG_HOME/loopcam/settings.json`
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("loopcam").join("settings.json"))
}

/// `/var/lib/loopcam` for root, the user data dir otherwise
pub fn default_state_dir() -> PathBuf {
    if constants::app_info::is_root() {
        return PathBuf::from(paths::SYSTEM_STATE_DIR);
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("loopcam"))
        .unwrap_or_else(|| PathBuf::from(paths::SYSTEM_STATE_DIR))
}
