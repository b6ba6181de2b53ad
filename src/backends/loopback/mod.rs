// SPDX-License-Identifier: GPL-3.0-only

//! Loopback device backends
//!
//! [`LoopbackBackend`] manages kernel device registration, [`SinkFactory`]
//! opens a registered node for writing frames. The real implementations
//! drive `v4l2loopback`; tests substitute in-memory fakes.

mod ctl;
mod device;

pub use ctl::CtlLoopback;
pub use device::{LoopbackSinkFactory, V4l2LoopbackSink, inspect_node};

use crate::config::{PipelineConfig, VirtualDeviceConfig};
use crate::errors::{ControlError, PipelineStartError, ProvisioningError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Device registration as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackInfo {
    pub index: u32,
    pub label: String,
    /// Unknown when the driver does not expose it
    pub buffer_capacity_frames: Option<u32>,
    /// False when a different driver owns the index
    pub is_loopback: bool,
}

impl LoopbackInfo {
    /// Whether this registration satisfies `config`
    pub fn matches(&self, config: &VirtualDeviceConfig) -> bool {
        self.is_loopback
            && self.index == config.device_index
            && self.label == config.label
            && self
                .buffer_capacity_frames
                .is_none_or(|buffers| buffers == config.buffer_capacity_frames)
    }

    pub fn describe(&self) -> String {
        if !self.is_loopback {
            return format!("non-loopback device \"{}\"", self.label);
        }
        match self.buffer_capacity_frames {
            Some(buffers) => format!("\"{}\" ({} buffers)", self.label, buffers),
            None => format!("\"{}\"", self.label),
        }
    }
}

/// Result of a side-effect free capability query on a device node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub path: PathBuf,
    pub driver: String,
    pub card: String,
    pub is_loopback: bool,
    pub video_output: bool,
    pub video_capture: bool,
}

impl std::fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut caps = Vec::new();
        if self.video_output {
            caps.push("output");
        }
        if self.video_capture {
            caps.push("capture");
        }
        write!(
            f,
            "{}: \"{}\" driver={} caps=[{}]",
            self.path.display(),
            self.card,
            self.driver,
            caps.join(",")
        )
    }
}

/// Kernel-level registration of loopback devices
pub trait LoopbackBackend: Send + Sync {
    /// Make sure the module and tooling are usable, loading the module if needed
    fn ensure_available(&self) -> Result<(), ProvisioningError>;

    /// Current registration at `index`, `None` when nothing is there
    fn query(&self, index: u32) -> Result<Option<LoopbackInfo>, ProvisioningError>;

    /// Register a new device; the index must be free
    fn create(&self, config: &VirtualDeviceConfig) -> Result<(), ProvisioningError>;

    /// Unregister the device at `index`
    fn remove(&self, index: u32) -> Result<(), ProvisioningError>;

    /// Rewrite the boot-time registration to cover exactly `devices`
    fn register_boot(&self, devices: &[VirtualDeviceConfig]) -> Result<(), ProvisioningError>;

    /// Node path for `index`
    fn device_node(&self, index: u32) -> PathBuf;

    /// Existence check plus capability query, no side effects
    fn inspect(&self, index: u32) -> Result<DeviceReport, ControlError>;
}

/// Writer end of a loopback node
pub trait DeviceSink: Send {
    /// Write one whole frame; may block while the device is not consumed
    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;
}

/// Opens loopback nodes for the transform stage
pub trait SinkFactory: Send + Sync {
    fn open(
        &self,
        index: u32,
        config: &PipelineConfig,
    ) -> Result<Box<dyn DeviceSink>, PipelineStartError>;
}

/// Render the `modprobe.d` options line for `devices`
pub fn modprobe_options(devices: &[VirtualDeviceConfig], exclusive_caps: bool) -> String {
    let join = |values: Vec<String>| values.join(",");
    let max_buffers = devices
        .iter()
        .map(|d| d.buffer_capacity_frames)
        .max()
        .unwrap_or(crate::constants::DEFAULT_BUFFER_FRAMES);

    format!(
        "options {} devices={} video_nr={} card_label={} max_buffers={} exclusive_caps={}",
        crate::constants::LOOPBACK_MODULE,
        devices.len(),
        join(devices.iter().map(|d| d.device_index.to_string()).collect()),
        join(devices.iter().map(|d| format!("\"{}\"", d.label)).collect()),
        max_buffers,
        join(
            devices
                .iter()
                .map(|_| if exclusive_caps { "1" } else { "0" }.to_string())
                .collect()
        ),
    )
}

/// Write or delete a boot registration file
pub(crate) fn write_or_remove(path: &Path, contents: Option<&str>) -> std::io::Result<()> {
    match contents {
        Some(contents) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, contents)
        }
        None => match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_matches_config() {
        let config = VirtualDeviceConfig::new(10, "Cam", 4);
        let mut info = LoopbackInfo {
            index: 10,
            label: "Cam".into(),
            buffer_capacity_frames: Some(4),
            is_loopback: true,
        };
        assert!(info.matches(&config));

        info.buffer_capacity_frames = None;
        assert!(info.matches(&config));

        info.buffer_capacity_frames = Some(8);
        assert!(!info.matches(&config));

        info.buffer_capacity_frames = Some(4);
        info.is_loopback = false;
        assert!(!info.matches(&config));
    }

    #[test]
    fn test_modprobe_options_cover_every_device() {
        let devices = vec![
            VirtualDeviceConfig::new(10, "Cam", 4),
            VirtualDeviceConfig::new(11, "Desk Cam", 8),
        ];
        assert_eq!(
            modprobe_options(&devices, true),
            "options v4l2loopback devices=2 video_nr=10,11 card_label=\"Cam\",\"Desk Cam\" max_buffers=8 exclusive_caps=1,1"
        );
    }
}
