// SPDX-License-Identifier: GPL-3.0-only

//! Operator command surface
//!
//! [`DeviceContext`] covers the commands that act on persisted records and
//! the device itself, and works without a daemon. [`ControlInterface`] adds
//! the lifecycle commands, which need the supervisor living in the daemon.
//! Every mutating command holds the per-device lock while it runs.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use protocol::{Request, Response};

use crate::backends::loopback::DeviceReport;
use crate::config::{PersistedBootConfig, PipelineConfig, VirtualDeviceConfig};
use crate::errors::{ControlError, Missing};
use crate::lock::{DeviceLock, FileLock};
use crate::logging::{LogBus, LogLine};
use crate::media::PixelFormat;
use crate::provisioner::DeviceProvisioner;
use crate::storage::DeviceStore;
use crate::supervisor::{Lifecycle, ServiceState, ServiceSupervisor};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Field-wise changes to the persisted pipeline config
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineChanges {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    pub pixel_format: Option<PixelFormat>,
    pub flip_horizontal: Option<bool>,
    pub flip_vertical: Option<bool>,
}

impl PipelineChanges {
    pub fn is_empty(&self) -> bool {
        *self == PipelineChanges::default()
    }

    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(frame_rate) = self.frame_rate {
            config.frame_rate = frame_rate;
        }
        if let Some(pixel_format) = self.pixel_format {
            config.pixel_format = pixel_format;
        }
        if let Some(flip) = self.flip_horizontal {
            config.flip_horizontal = flip;
        }
        if let Some(flip) = self.flip_vertical {
            config.flip_vertical = flip;
        }
    }
}

/// Result of `edit`; changes only apply to the next pipeline instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOutcome {
    pub previous: PipelineConfig,
    pub current: PipelineConfig,
}

impl EditOutcome {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Snapshot returned by `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub device_index: u32,
    pub device_node: PathBuf,
    pub provisioned: bool,
    /// Autostart at boot
    pub enabled: bool,
    /// False when no daemon answered; the state is then a Stopped placeholder
    pub daemon: bool,
    pub state: ServiceState,
    pub pipeline: Option<PipelineConfig>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = &self.state;
        writeln!(
            f,
            "video{} ({}): {}",
            self.device_index,
            self.device_node.display(),
            state.lifecycle
        )?;
        if !self.daemon {
            writeln!(f, "  daemon:          not running")?;
        }
        if !self.provisioned {
            writeln!(f, "  device:          not provisioned")?;
        }
        let since = (Utc::now() - state.last_transition_time).num_seconds().max(0);
        writeln!(f, "  since:           {}s ago", since)?;
        writeln!(f, "  restart count:   {}", state.restart_count)?;
        writeln!(f, "  last exit code:  {}", state.last_exit_code)?;
        if let Some(error) = &state.last_error {
            writeln!(f, "  last error:      {}", error)?;
        }
        writeln!(f, "  frames written:  {}", state.frames_written)?;
        if let Some(pid) = state.pid {
            writeln!(f, "  capture pid:     {}", pid)?;
        }
        writeln!(
            f,
            "  autostart:       {}",
            if self.enabled { "enabled" } else { "disabled" }
        )?;
        if let Some(pipeline) = &self.pipeline {
            write!(f, "  pipeline:        {}", pipeline)?;
        }
        Ok(())
    }
}

/// Records, device and lock for one index
#[derive(Clone)]
pub struct DeviceContext {
    store: DeviceStore,
    provisioner: DeviceProvisioner,
    lock_timeout: Duration,
}

impl DeviceContext {
    pub fn new(store: DeviceStore, provisioner: DeviceProvisioner, lock_timeout: Duration) -> Self {
        Self {
            store,
            provisioner,
            lock_timeout,
        }
    }

    pub fn index(&self) -> u32 {
        self.store.index()
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    pub fn device_node(&self) -> PathBuf {
        self.provisioner.backend().device_node(self.index())
    }

    /// Take the per-device command lock
    pub async fn lock(&self) -> Result<FileLock, ControlError> {
        DeviceLock::new(self.store.lock_path(), self.index(), self.lock_timeout)
            .acquire()
            .await
    }

    pub async fn provision(&self, label: &str, buffer_frames: u32) -> Result<(), ControlError> {
        let config = VirtualDeviceConfig::new(self.index(), label, buffer_frames);
        config.validate()?;

        let _guard = self.lock().await?;
        let provisioner = self.provisioner.clone();
        blocking(move || provisioner.provision(&config)).await??;
        Ok(())
    }

    pub async fn deprovision(&self) -> Result<(), ControlError> {
        let _guard = self.lock().await?;
        let provisioner = self.provisioner.clone();
        let index = self.index();
        blocking(move || provisioner.deprovision(index)).await??;
        Ok(())
    }

    /// Toggle autostart; independent of the running state
    pub async fn set_enabled(&self, enabled: bool) -> Result<PersistedBootConfig, ControlError> {
        let _guard = self.lock().await?;
        let mut boot = self
            .store
            .load_boot()?
            .ok_or(ControlError::NotFound(Missing::Device(self.index())))?;

        if boot.enabled != enabled {
            boot.enabled = enabled;
            self.store.save_boot(&boot)?;
        }
        info!(index = self.index(), enabled, "Updated autostart");
        Ok(boot)
    }

    /// Device node existence plus capability query, without side effects
    pub fn test(&self) -> Result<DeviceReport, ControlError> {
        let report = self.provisioner.backend().inspect(self.index())?;
        if !report.is_loopback {
            return Err(ControlError::Capability(format!(
                "{} is driven by \"{}\", not v4l2loopback",
                report.path.display(),
                report.driver
            )));
        }
        if !report.video_output && !report.video_capture {
            return Err(ControlError::Capability(format!(
                "{} advertises neither output nor capture",
                report.path.display()
            )));
        }
        Ok(report)
    }

    /// Persist an edited pipeline config
    ///
    /// `edit` receives the current config under the lock. The result is
    /// validated before it is saved; it only takes effect on the next
    /// start or restart.
    pub async fn edit<F>(&self, edit: F) -> Result<EditOutcome, ControlError>
    where
        F: FnOnce(PipelineConfig) -> Result<PipelineConfig, ControlError>,
    {
        let _guard = self.lock().await?;
        let previous = self.store.load_pipeline()?;
        let current = edit(previous.clone())?;
        current.validate()?;

        if current != previous {
            self.store.save_pipeline(&current)?;
            info!(index = self.index(), config = %current, "Saved pipeline config");
        }
        Ok(EditOutcome { previous, current })
    }

    /// Status assembled from records alone
    pub fn offline_status(&self) -> StatusReport {
        self.report(ServiceState::default(), false)
    }

    fn report(&self, state: ServiceState, daemon: bool) -> StatusReport {
        let boot = self.store.load_boot().unwrap_or_else(|e| {
            warn!(index = self.index(), error = %e, "Could not read boot record");
            None
        });
        let pipeline = self.store.load_pipeline().ok();
        StatusReport {
            device_index: self.index(),
            device_node: self.device_node(),
            provisioned: boot.is_some(),
            enabled: boot.map(|b| b.enabled).unwrap_or(false),
            daemon,
            state,
            pipeline,
        }
    }
}

/// Run blocking provisioning work off the async runtime
async fn blocking<T, F>(work: F) -> Result<T, ControlError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ControlError::Transport(format!("worker task failed: {}", e)))
}

/// Commands served by the daemon for one device
pub struct ControlInterface {
    context: DeviceContext,
    supervisor: Arc<ServiceSupervisor>,
    logs: LogBus,
}

impl ControlInterface {
    pub fn new(context: DeviceContext, supervisor: Arc<ServiceSupervisor>, logs: LogBus) -> Self {
        Self {
            context,
            supervisor,
            logs,
        }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn supervisor(&self) -> &Arc<ServiceSupervisor> {
        &self.supervisor
    }

    pub async fn start(&self) -> Result<(), ControlError> {
        let _guard = self.context.lock().await?;
        self.supervisor.start().await
    }

    pub async fn stop(&self) -> Result<(), ControlError> {
        let _guard = self.context.lock().await?;
        self.supervisor.stop().await
    }

    /// Stop then start under one lock hold, with the persisted config
    pub async fn restart(&self) -> Result<(), ControlError> {
        let _guard = self.context.lock().await?;
        self.supervisor.restart().await
    }

    /// Never fails; reflects the supervisor's live state
    pub fn status(&self) -> StatusReport {
        self.context.report(self.supervisor.status(), true)
    }

    /// History plus live subscription, while a pipeline process exists
    pub fn logs(&self) -> Result<(Vec<LogLine>, broadcast::Receiver<LogLine>), ControlError> {
        if self.supervisor.status().lifecycle == Lifecycle::Stopped {
            return Err(ControlError::NotFound(Missing::Pipeline));
        }
        Ok(self.logs.subscribe())
    }

    pub async fn edit(&self, changes: &PipelineChanges) -> Result<EditOutcome, ControlError> {
        self.context
            .edit(|mut config| {
                changes.apply(&mut config);
                Ok(config)
            })
            .await
    }

    /// Stop the pipeline for daemon shutdown
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "Stop under lock failed during shutdown, stopping anyway");
            let _ = self.supervisor.stop().await;
        }
    }
}
