// SPDX-License-Identifier: GPL-3.0-only

//! `v4l2loopback-ctl` + sysfs implementation of [`LoopbackBackend`]

use super::{DeviceReport, LoopbackBackend, LoopbackInfo, modprobe_options, write_or_remove};
use crate::config::{LoopbackPaths, VirtualDeviceConfig};
use crate::constants::{LOOPBACK_MODULE, paths, timing};
use crate::errors::{ControlError, ProvisioningError};
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Loopback registration through the kernel module's control tool
#[derive(Debug, Clone)]
pub struct CtlLoopback {
    paths: LoopbackPaths,
}

impl CtlLoopback {
    pub fn new(paths: LoopbackPaths) -> Self {
        Self { paths }
    }

    fn sysfs_dir(&self, index: u32) -> PathBuf {
        self.paths.sysfs_video_root.join(format!("video{}", index))
    }

    fn module_loaded(&self) -> bool {
        self.paths.sysfs_module_root.join(LOOPBACK_MODULE).exists()
    }

    /// Run the control tool, returning trimmed stderr on failure
    fn run_ctl(&self, args: &[String]) -> Result<(), ProvisioningError> {
        debug!(program = %self.paths.ctl_program, ?args, "Running loopback control tool");
        let output = Command::new(&self.paths.ctl_program)
            .args(args)
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ProvisioningError::Unsupported(format!(
                        "{} not found, install v4l2loopback-utils",
                        self.paths.ctl_program
                    ))
                } else {
                    ProvisioningError::Io(format!("{}: {}", self.paths.ctl_program, e))
                }
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(ProvisioningError::Io(format!(
            "{} {} failed: {}",
            self.paths.ctl_program,
            args.first().map(String::as_str).unwrap_or_default(),
            if stderr.is_empty() {
                output.status.to_string()
            } else {
                stderr
            }
        )))
    }

    /// Wait for udev to create the node after registration
    fn wait_for_node(&self, index: u32) -> Result<(), ProvisioningError> {
        let node = self.device_node(index);
        let started = Instant::now();
        while !node.exists() {
            if started.elapsed() >= timing::NODE_APPEAR_TIMEOUT {
                return Err(ProvisioningError::Io(format!(
                    "{} did not appear after registration",
                    node.display()
                )));
            }
            std::thread::sleep(timing::LOCK_POLL_INTERVAL);
        }
        Ok(())
    }
}

impl LoopbackBackend for CtlLoopback {
    fn ensure_available(&self) -> Result<(), ProvisioningError> {
        if self.module_loaded() {
            return Ok(());
        }

        info!(module = LOOPBACK_MODULE, "Loading kernel module");
        // devices=0 so loading does not create a stray default device
        let output = Command::new("modprobe")
            .args([LOOPBACK_MODULE, "devices=0"])
            .output()
            .map_err(|e| ProvisioningError::Unsupported(format!("modprobe: {}", e)))?;

        if !output.status.success() || !self.module_loaded() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProvisioningError::Unsupported(format!(
                "{} module could not be loaded: {}",
                LOOPBACK_MODULE,
                if stderr.is_empty() {
                    "module not present after modprobe".to_string()
                } else {
                    stderr
                }
            )));
        }
        Ok(())
    }

    fn query(&self, index: u32) -> Result<Option<LoopbackInfo>, ProvisioningError> {
        let dir = self.sysfs_dir(index);
        let label = match std::fs::read_to_string(dir.join("name")) {
            Ok(name) => name.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ProvisioningError::Io(format!("{}: {}", dir.display(), e))),
        };

        // Only v4l2loopback exposes the `buffers` attribute
        let buffers_path = dir.join("buffers");
        let is_loopback = buffers_path.exists();
        let buffer_capacity_frames = std::fs::read_to_string(&buffers_path)
            .ok()
            .and_then(|buffers| buffers.trim().parse().ok());

        Ok(Some(LoopbackInfo {
            index,
            label,
            buffer_capacity_frames,
            is_loopback,
        }))
    }

    fn create(&self, config: &VirtualDeviceConfig) -> Result<(), ProvisioningError> {
        let node = self.device_node(config.device_index);
        info!(
            index = config.device_index,
            label = %config.label,
            buffers = config.buffer_capacity_frames,
            "Creating loopback device"
        );
        self.run_ctl(&[
            "add".to_string(),
            "-n".to_string(),
            config.label.clone(),
            "-b".to_string(),
            config.buffer_capacity_frames.to_string(),
            "-x".to_string(),
            if self.paths.exclusive_caps { "1" } else { "0" }.to_string(),
            node.display().to_string(),
        ])?;
        self.wait_for_node(config.device_index)
    }

    fn remove(&self, index: u32) -> Result<(), ProvisioningError> {
        info!(index, "Removing loopback device");
        let node = self.device_node(index);
        match self.run_ctl(&["delete".to_string(), node.display().to_string()]) {
            // The kernel refuses while any process holds the node open
            Err(ProvisioningError::Io(msg)) if msg.to_lowercase().contains("busy") => {
                warn!(index, error = %msg, "Loopback device is busy");
                Err(ProvisioningError::Busy { index })
            }
            other => other,
        }
    }

    fn register_boot(&self, devices: &[VirtualDeviceConfig]) -> Result<(), ProvisioningError> {
        let modules_load = self.paths.modules_load_dir.join(paths::BOOT_CONF_NAME);
        let modprobe = self.paths.modprobe_dir.join(paths::BOOT_CONF_NAME);

        let (load_contents, options) = if devices.is_empty() {
            (None, None)
        } else {
            (
                Some(format!("{}\n", LOOPBACK_MODULE)),
                Some(format!(
                    "{}\n",
                    modprobe_options(devices, self.paths.exclusive_caps)
                )),
            )
        };

        write_or_remove(&modules_load, load_contents.as_deref())
            .and_then(|_| write_or_remove(&modprobe, options.as_deref()))
            .map_err(|e| ProvisioningError::Io(format!("boot registration: {}", e)))?;

        debug!(count = devices.len(), "Updated boot registration");
        Ok(())
    }

    fn device_node(&self, index: u32) -> PathBuf {
        self.paths.device_node(index)
    }

    fn inspect(&self, index: u32) -> Result<DeviceReport, ControlError> {
        super::inspect_node(&self.device_node(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(root: &std::path::Path) -> CtlLoopback {
        CtlLoopback::new(LoopbackPaths {
            dev_root: root.join("dev"),
            sysfs_video_root: root.join("sys/class/video4linux"),
            sysfs_module_root: root.join("sys/module"),
            modprobe_dir: root.join("etc/modprobe.d"),
            modules_load_dir: root.join("etc/modules-load.d"),
            ctl_program: "v4l2loopback-ctl".into(),
            exclusive_caps: true,
        })
    }

    #[test]
    fn test_query_reads_sysfs() {
        let root = tempfile::tempdir().unwrap();
        let backend = backend(root.path());
        assert_eq!(backend.query(10).unwrap(), None);

        let dir = root.path().join("sys/class/video4linux/video10");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("name"), "Cam\n").unwrap();
        std::fs::write(dir.join("buffers"), "4\n").unwrap();

        let info = backend.query(10).unwrap().unwrap();
        assert_eq!(info.label, "Cam");
        assert_eq!(info.buffer_capacity_frames, Some(4));
        assert!(info.is_loopback);
    }

    #[test]
    fn test_non_loopback_node_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("sys/class/video4linux/video0");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("name"), "Integrated Camera\n").unwrap();

        let info = backend(root.path()).query(0).unwrap().unwrap();
        assert!(!info.is_loopback);
    }

    #[test]
    fn test_boot_registration_written_and_cleared() {
        let root = tempfile::tempdir().unwrap();
        let backend = backend(root.path());
        backend
            .register_boot(&[VirtualDeviceConfig::new(10, "Cam", 4)])
            .unwrap();

        let load = root.path().join("etc/modules-load.d/loopcam.conf");
        let options = root.path().join("etc/modprobe.d/loopcam.conf");
        assert_eq!(std::fs::read_to_string(&load).unwrap(), "v4l2loopback\n");
        assert!(
            std::fs::read_to_string(&options)
                .unwrap()
                .contains("video_nr=10 card_label=\"Cam\"")
        );

        backend.register_boot(&[]).unwrap();
        assert!(!load.exists());
        assert!(!options.exists());
    }

    #[test]
    fn test_missing_tool_is_unsupported() {
        let root = tempfile::tempdir().unwrap();
        let mut paths = backend(root.path()).paths;
        paths.ctl_program = "/nonexistent/v4l2loopback-ctl".into();
        let backend = CtlLoopback::new(paths);
        assert!(matches!(
            backend.create(&VirtualDeviceConfig::new(10, "Cam", 4)),
            Err(ProvisioningError::Unsupported(_))
        ));
    }

    #[test]
    fn test_missing_node_is_device_absent() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            backend(root.path()).inspect(10),
            Err(ControlError::NotFound(crate::errors::Missing::DeviceNode(_)))
        ));
    }
}
