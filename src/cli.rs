// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! Lifecycle commands (`start`, `stop`, `restart`, `status`, `logs`) talk to
//! the device's daemon over its control socket. The others act directly on
//! the persisted records and the loopback device.

use loopcam::backends::LoopbackBackend;
use loopcam::backends::loopback::CtlLoopback;
use loopcam::config::{PipelineConfig, Settings};
use loopcam::constants::app_info;
use loopcam::control::client::LogEvent;
use loopcam::control::{ControlClient, DeviceContext, PipelineChanges, Request};
use loopcam::daemon::Daemon;
use loopcam::errors::{AppResult, ConfigError, ControlError, Missing};
use loopcam::logging::LogBus;
use loopcam::provisioner::DeviceProvisioner;
use loopcam::storage::DeviceStore;
use loopcam::supervisor::Lifecycle;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// Resolved global options
pub struct CliContext {
    pub settings: Settings,
    pub state_dir: PathBuf,
    pub index: u32,
}

impl CliContext {
    fn store(&self) -> DeviceStore {
        DeviceStore::new(&self.state_dir, self.index)
    }

    fn client(&self) -> ControlClient {
        ControlClient::new(self.store().socket_path())
    }

    fn device(&self) -> DeviceContext {
        let backend: Arc<dyn LoopbackBackend> =
            Arc::new(CtlLoopback::new(self.settings.loopback.clone()));
        DeviceContext::new(
            self.store(),
            DeviceProvisioner::new(backend, &self.state_dir),
            self.settings.lock_timeout(),
        )
    }
}

/// Run the supervisory daemon in the foreground
pub async fn daemon(ctx: &CliContext, logs: LogBus) -> AppResult<()> {
    let daemon = Daemon::from_settings(&ctx.settings, &ctx.state_dir, ctx.index, logs)?;
    tracing::info!(
        version = app_info::version(),
        index = ctx.index,
        state_dir = %ctx.state_dir.display(),
        "loopcam daemon starting"
    );
    daemon.run().await
}

pub async fn provision(ctx: &CliContext, label: String, buffers: u32) -> AppResult<()> {
    let device = ctx.device();
    device.provision(&label, buffers).await?;
    println!(
        "Provisioned {} (\"{}\", {} buffers)",
        device.device_node().display(),
        label,
        buffers
    );
    Ok(())
}

pub async fn deprovision(ctx: &CliContext) -> AppResult<()> {
    let device = ctx.device();
    device.deprovision().await?;
    println!("Removed {}", device.device_node().display());
    Ok(())
}

pub async fn start(ctx: &CliContext) -> AppResult<()> {
    match ctx.client().command(Request::Start).await {
        Ok(message) => println!("{}", message),
        Err(ControlError::AlreadyRunning) => println!("video{} is already running", ctx.index),
        Err(e @ ControlError::NotFound(Missing::Daemon(_))) => {
            eprintln!("Start the daemon first: loopcam --device {} daemon", ctx.index);
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

pub async fn stop(ctx: &CliContext) -> AppResult<()> {
    match ctx.client().command(Request::Stop).await {
        Ok(message) => println!("{}", message),
        // Nothing can be running without a daemon
        Err(ControlError::NotFound(Missing::Daemon(_))) => {
            println!("video{} is not running", ctx.index)
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

pub async fn restart(ctx: &CliContext) -> AppResult<()> {
    let message = ctx.client().command(Request::Restart).await?;
    println!("{}", message);
    Ok(())
}

/// Never fails: without a daemon the report is built from the records
pub async fn status(ctx: &CliContext, json: bool) -> AppResult<()> {
    let report = match ctx.client().status().await {
        Ok(report) => report,
        Err(e) => {
            tracing::debug!(error = %e, "Daemon unreachable, reporting from records");
            ctx.device().offline_status()
        }
    };

    if json {
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| format!("Failed to encode status: {}", e))?;
        println!("{}", text);
    } else {
        println!("{}", report);
    }
    Ok(())
}

/// Follow the pipeline's log until the daemon ends the stream or Ctrl-C
pub async fn logs(ctx: &CliContext, lines: Option<usize>) -> AppResult<()> {
    let client = ctx.client();
    let follow = client.follow_logs(lines, |event| match event {
        LogEvent::Line(line) => println!("{}", line),
        LogEvent::Skipped(count) => println!("... skipped {} lines", count),
    });

    tokio::select! {
        result = follow => result?,
        _ = tokio::signal::ctrl_c() => {}
    }
    Ok(())
}

pub async fn set_enabled(ctx: &CliContext, enabled: bool) -> AppResult<()> {
    ctx.device().set_enabled(enabled).await?;
    println!(
        "Autostart {} for video{}",
        if enabled { "enabled" } else { "disabled" },
        ctx.index
    );
    Ok(())
}

pub fn test(ctx: &CliContext) -> AppResult<()> {
    let report = ctx.device().test()?;
    println!("{}", report);
    Ok(())
}

pub async fn edit(ctx: &CliContext, changes: PipelineChanges) -> AppResult<()> {
    let device = ctx.device();

    let outcome = if changes.is_empty() {
        let loaded = device.store().load_pipeline()?;
        let edited = edit_in_editor(&device.store().dir(), &loaded)?;
        device
            .edit(|current| {
                if current != loaded {
                    return Err(ControlError::Config(ConfigError::Invalid(
                        "pipeline config changed while editing, try again".to_string(),
                    )));
                }
                Ok(edited)
            })
            .await?
    } else {
        device
            .edit(|mut config| {
                changes.apply(&mut config);
                Ok(config)
            })
            .await?
    };

    if !outcome.changed() {
        println!("No changes");
        return Ok(());
    }
    println!("Saved: {}", outcome.current);
    println!("Changes take effect on the next start or restart, not live.");

    if let Ok(report) = ctx.client().status().await
        && report.state.lifecycle != Lifecycle::Stopped
    {
        println!(
            "The running pipeline still uses the previous config; run `loopcam --device {} restart`",
            ctx.index
        );
    }
    Ok(())
}

pub fn version() {
    println!("loopcam {}", app_info::version());
}

/// Open the config in `$VISUAL`/`$EDITOR` and parse the result
fn edit_in_editor(dir: &Path, current: &PipelineConfig) -> AppResult<PipelineConfig> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("pipeline.edit.json");
    let text = serde_json::to_string_pretty(current)
        .map_err(|e| format!("Failed to encode pipeline config: {}", e))?;
    std::fs::write(&path, format!("{}\n", text))?;

    let result = run_editor(&path).and_then(|()| {
        let edited = std::fs::read_to_string(&path)?;
        serde_json::from_str::<PipelineConfig>(&edited).map_err(|e| {
            ConfigError::Parse {
                path: path.clone(),
                message: e.to_string(),
            }
            .into()
        })
    });
    let _ = std::fs::remove_file(&path);

    let edited = result?;
    edited.validate()?;
    Ok(edited)
}

fn run_editor(path: &Path) -> AppResult<()> {
    let editor = std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string());

    // Through the shell so EDITOR may carry arguments
    let status = Command::new("sh")
        .arg("-c")
        .arg(format!("{} \"$1\"", editor))
        .arg("sh")
        .arg(path)
        .status()
        .map_err(|e| format!("Failed to launch editor '{}': {}", editor, e))?;

    if !status.success() {
        return Err(format!("Editor '{}' exited with {}", editor, status).into());
    }
    Ok(())
}
