// SPDX-License-Identifier: GPL-3.0-only

//! Per-device daemon hosting the supervisor and the control socket

use crate::backends::LoopbackBackend;
use crate::backends::capture::CommandCapture;
use crate::backends::loopback::{CtlLoopback, LoopbackSinkFactory};
use crate::config::Settings;
use crate::control::server;
use crate::control::{ControlInterface, DeviceContext};
use crate::errors::{AppError, AppResult};
use crate::lock::{FileLock, try_lock_exclusive};
use crate::logging::LogBus;
use crate::pipeline::CapturePipeline;
use crate::provisioner::DeviceProvisioner;
use crate::storage::DeviceStore;
use crate::supervisor::ServiceSupervisor;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{error, info, warn};

pub struct Daemon {
    control: Arc<ControlInterface>,
    socket: PathBuf,
    _lock: FileLock,
}

impl Daemon {
    /// Claim the device; fails when another daemon already serves it
    pub fn new(control: Arc<ControlInterface>) -> AppResult<Self> {
        let store = control.context().store();
        store.ensure_dir()?;
        let lock = try_lock_exclusive(&store.daemon_lock_path())?.ok_or_else(|| {
            AppError::Other(format!(
                "a daemon for video{} is already running",
                store.index()
            ))
        })?;
        let socket = store.socket_path();
        Ok(Self {
            socket,
            control,
            _lock: lock,
        })
    }

    /// Daemon wired to v4l2loopback and the configured capture command
    pub fn from_settings(
        settings: &Settings,
        state_dir: &Path,
        index: u32,
        logs: LogBus,
    ) -> AppResult<Self> {
        let store = DeviceStore::new(state_dir, index);
        let loopback: Arc<dyn LoopbackBackend> = Arc::new(CtlLoopback::new(settings.loopback.clone()));
        let pipeline = CapturePipeline::new(
            Arc::new(CommandCapture::new(settings.capture.clone())),
            Arc::new(LoopbackSinkFactory::new(settings.loopback.clone())),
            state_dir,
        );
        let supervisor = Arc::new(ServiceSupervisor::new(
            pipeline,
            store.clone(),
            settings.supervisor_policy(),
        ));
        let context = DeviceContext::new(
            store,
            DeviceProvisioner::new(loopback, state_dir),
            settings.lock_timeout(),
        );
        Self::new(Arc::new(ControlInterface::new(context, supervisor, logs)))
    }

    pub fn control(&self) -> &Arc<ControlInterface> {
        &self.control
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// Re-create the device and start the pipeline when autostart is enabled
    ///
    /// Failures are logged; the daemon keeps serving so the operator can fix
    /// things and issue `start`.
    pub async fn autostart(&self) {
        let context = self.control.context();
        let boot = match context.store().load_boot() {
            Ok(Some(boot)) if boot.enabled => boot,
            Ok(_) => return,
            Err(e) => {
                error!(error = %e, "Could not read boot record, skipping autostart");
                return;
            }
        };

        info!(device = %boot.device.describe(), "Autostart enabled");
        if let Err(e) = context
            .provision(&boot.device.label, boot.device.buffer_capacity_frames)
            .await
        {
            error!(error = %e, "Could not provision device at startup");
            return;
        }
        if let Err(e) = self.control.start().await {
            error!(error = %e, "Autostart failed");
        }
    }

    /// Serve until `shutdown` resolves, then stop the pipeline
    pub async fn run_until<F>(self, shutdown: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        let listener = bind_socket(&self.socket)?;
        info!(socket = %self.socket.display(), "Control socket listening");

        let serving = async {
            self.autostart().await;
            server::serve(listener, Arc::clone(&self.control)).await;
        };

        tokio::select! {
            _ = serving => {}
            _ = shutdown => {}
        }

        info!("Shutting down");
        self.control.shutdown().await;
        if let Err(e) = std::fs::remove_file(&self.socket) {
            warn!(error = %e, "Could not remove control socket");
        }
        Ok(())
    }

    pub async fn run(self) -> AppResult<()> {
        self.run_until(shutdown_signal()).await
    }
}

/// Bind the control socket, replacing a stale one
///
/// Only the daemon lock holder gets here, so a socket left on disk belongs
/// to a daemon that died.
fn bind_socket(path: &Path) -> AppResult<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => warn!(socket = %path.display(), "Removed stale control socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    UnixListener::bind(path)
        .map_err(|e| AppError::Other(format!("bind {}: {}", path.display(), e)))
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
        }
        _ = async {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Could not install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        } => {
            info!("Received SIGTERM");
        }
    }
}
