// SPDX-License-Identifier: GPL-3.0-only

//! Supervision of one pipeline per device
//!
//! The supervisor owns a run loop task that drives the five-state machine:
//!
//! ```text
//! Stopped ──start──▶ Starting ──first frame──▶ Running
//!    ▲                 │  │                      │
//!    │          failure│  │stop            failure│  │stop
//!    │                 ▼  ▼                      ▼  ▼
//!    └──stop── FailedBackoff    Stopping ──▶ Stopped
//!                  │
//!                  └──backoff elapsed──▶ Starting
//! ```
//!
//! Operator commands only send intents to the loop; every state change is
//! made by the loop itself and published through a watch channel.

pub mod policy;
pub mod state;

pub use policy::{BackoffStrategy, RestartPolicy, SupervisorPolicy};
pub use state::{InvalidTransition, Lifecycle, ServiceState};

use crate::config::{PipelineConfig, VirtualDeviceConfig};
use crate::constants::timing;
use crate::errors::{ControlError, Missing, PipelineRuntimeError, PipelineStartError};
use crate::pipeline::{CapturePipeline, PipelineExit, PipelineHandle};
use crate::storage::DeviceStore;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Requests from the control surface to the run loop
enum Intent {
    Stop,
    /// Skip the rest of the backoff delay
    RetryNow {
        config: PipelineConfig,
        device: VirtualDeviceConfig,
    },
}

struct RunHandle {
    intents: mpsc::UnboundedSender<Intent>,
    task: JoinHandle<()>,
}

/// State shared between the supervisor and its run loop
struct Shared {
    index: u32,
    pipeline: CapturePipeline,
    policy: SupervisorPolicy,
    state: watch::Sender<ServiceState>,
}

impl Shared {
    /// Apply a validated transition and publish it
    fn transition(&self, next: Lifecycle, apply: impl FnOnce(&mut ServiceState)) {
        self.state.send_modify(|state| match state.transition(next) {
            Ok(from) => {
                apply(state);
                info!(
                    index = self.index,
                    from = %from,
                    to = %next,
                    restart_count = state.restart_count,
                    "Service state transition"
                );
            }
            Err(e) => error!(index = self.index, error = %e, "Rejected state transition"),
        });
    }

    /// Update fields that are not part of the lifecycle
    fn update(&self, apply: impl FnOnce(&mut ServiceState)) {
        self.state.send_modify(apply);
    }

    /// Enter FailedBackoff and return the new restart count
    fn enter_backoff(&self, failure: &Failure) -> u32 {
        self.transition(Lifecycle::FailedBackoff, |state| {
            state.restart_count = state.restart_count.saturating_add(1);
            state.last_exit_code = failure.exit_code;
            state.last_error = Some(failure.error.clone());
            state.pid = None;
        });
        self.state.borrow().restart_count
    }
}

/// Why an attempt ended in FailedBackoff
#[derive(Debug)]
struct Failure {
    exit_code: i32,
    error: String,
}

impl Failure {
    fn start(err: &PipelineStartError) -> Self {
        Self {
            exit_code: err.exit_code(),
            error: err.to_string(),
        }
    }
}

enum Attempt {
    /// Stop intent handled, state is Stopped
    Stopped,
    Failed(Failure),
}

enum StartOutcome {
    Confirmed,
    StopRequested,
    Exited(PipelineExit),
    TimedOut,
}

/// Owns the pipeline lifecycle for one device
pub struct ServiceSupervisor {
    shared: Arc<Shared>,
    store: DeviceStore,
    run: Mutex<Option<RunHandle>>,
}

impl ServiceSupervisor {
    pub fn new(pipeline: CapturePipeline, store: DeviceStore, policy: SupervisorPolicy) -> Self {
        let (state, _) = watch::channel(ServiceState::default());
        Self {
            shared: Arc::new(Shared {
                index: store.index(),
                pipeline,
                policy,
                state,
            }),
            store,
            run: Mutex::new(None),
        }
    }

    pub fn index(&self) -> u32 {
        self.shared.index
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.shared.policy
    }

    /// Current snapshot
    pub fn status(&self) -> ServiceState {
        self.shared.state.borrow().clone()
    }

    /// Follow every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.shared.state.subscribe()
    }

    /// Persisted inputs for the next pipeline instance
    fn load_inputs(&self) -> Result<(PipelineConfig, VirtualDeviceConfig), ControlError> {
        let boot = self
            .store
            .load_boot()?
            .ok_or(ControlError::NotFound(Missing::Device(self.shared.index)))?;
        let config = self.store.load_pipeline()?;
        Ok((config, boot.device))
    }

    /// Stopped -> Starting, or cut a pending backoff short
    ///
    /// Re-reads the persisted pipeline config. Returns `AlreadyRunning` when
    /// the service is Starting or Running.
    pub async fn start(&self) -> Result<(), ControlError> {
        let mut run = self.run.lock().await;

        let lifecycle = self.shared.state.borrow().lifecycle;
        if lifecycle.is_active() {
            return Err(ControlError::AlreadyRunning);
        }

        let (config, device) = self.load_inputs()?;

        if lifecycle == Lifecycle::FailedBackoff
            && let Some(current) = run.as_ref()
            && current
                .intents
                .send(Intent::RetryNow {
                    config: config.clone(),
                    device: device.clone(),
                })
                .is_ok()
        {
            info!(index = self.shared.index, "Retrying pipeline now");
            return Ok(());
        }

        // A loop that gave up has already finished
        if let Some(previous) = run.take() {
            let _ = previous.task.await;
        }

        self.shared.transition(Lifecycle::Starting, |state| {
            state.restart_count = 0;
            state.frames_written = 0;
        });

        let (intents, intent_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_loop(
            Arc::clone(&self.shared),
            config,
            device,
            intent_rx,
        ));
        *run = Some(RunHandle { intents, task });
        Ok(())
    }

    /// Stop the pipeline and wait until the state is Stopped
    ///
    /// Stopping a stopped service succeeds.
    pub async fn stop(&self) -> Result<(), ControlError> {
        let mut run = self.run.lock().await;
        let Some(current) = run.take() else {
            return Ok(());
        };

        let _ = current.intents.send(Intent::Stop);
        if let Err(e) = current.task.await {
            error!(index = self.shared.index, error = %e, "Supervisor loop failed");
            self.shared.update(|state| {
                state.lifecycle = Lifecycle::Stopped;
                state.last_error = Some(format!("supervisor loop failed: {}", e));
                state.pid = None;
            });
        }
        Ok(())
    }

    /// Stop, then start with the persisted config
    pub async fn restart(&self) -> Result<(), ControlError> {
        self.stop().await?;
        self.start().await
    }
}

impl Drop for ServiceSupervisor {
    fn drop(&mut self) {
        // Aborting drops the pipeline handle, which kills the capture stage
        if let Some(current) = self.run.get_mut().take() {
            current.task.abort();
        }
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    mut config: PipelineConfig,
    mut device: VirtualDeviceConfig,
    mut intents: mpsc::UnboundedReceiver<Intent>,
) {
    loop {
        let failure = match attempt(&shared, &config, &device, &mut intents).await {
            Attempt::Stopped => return,
            Attempt::Failed(failure) => failure,
        };

        let restart_count = shared.enter_backoff(&failure);
        if shared.policy.restart.exhausted(restart_count) {
            warn!(
                index = shared.index,
                restart_count,
                "Restart budget exhausted, giving up"
            );
            shared.transition(Lifecycle::Stopped, |_| {});
            return;
        }

        let delay = shared.policy.restart.delay_for(restart_count);
        warn!(
            index = shared.index,
            restart_count,
            delay_ms = delay.as_millis() as u64,
            error = %failure.error,
            "Pipeline failed, restarting after backoff"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            intent = intents.recv() => match intent {
                Some(Intent::RetryNow { config: next, device: next_device }) => {
                    config = next;
                    device = next_device;
                }
                Some(Intent::Stop) | None => {
                    shared.transition(Lifecycle::Stopped, |_| {});
                    return;
                }
            },
        }

        shared.transition(Lifecycle::Starting, |state| state.frames_written = 0);
    }
}

/// One pipeline instance from Starting until failure or stop
async fn attempt(
    shared: &Shared,
    config: &PipelineConfig,
    device: &VirtualDeviceConfig,
    intents: &mut mpsc::UnboundedReceiver<Intent>,
) -> Attempt {
    let pipeline = shared.pipeline.clone();
    let (start_config, start_device) = (config.clone(), device.clone());
    let started =
        tokio::task::spawn_blocking(move || pipeline.start(&start_config, &start_device)).await;

    let mut handle = match started {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            warn!(index = shared.index, error = %e, "Pipeline failed to start");
            return Attempt::Failed(Failure::start(&e));
        }
        Err(e) => {
            return Attempt::Failed(Failure {
                exit_code: 1,
                error: format!("pipeline start panicked: {}", e),
            });
        }
    };
    let pid = handle.pid();
    shared.update(|state| state.pid = pid);

    match confirm_first_frame(shared, &mut handle, intents).await {
        StartOutcome::Confirmed => {}
        StartOutcome::StopRequested => return stop_pipeline(shared, handle).await,
        StartOutcome::Exited(exit) => {
            let reaped = handle.stop(shared.policy.stop_grace).await;
            let err = PipelineStartError::DeviceUnavailable(format!(
                "pipeline exited before the first frame: {}",
                exit
            ));
            return Attempt::Failed(Failure {
                exit_code: failure_code(&exit, reaped),
                error: err.to_string(),
            });
        }
        StartOutcome::TimedOut => {
            handle.stop(shared.policy.stop_grace).await;
            return Attempt::Failed(Failure::start(&PipelineStartError::Timeout(
                shared.policy.startup_timeout,
            )));
        }
    }

    let frames = handle.frames_written();
    shared.transition(Lifecycle::Running, |state| {
        state.pid = pid;
        state.frames_written = frames;
    });

    let stable_at = tokio::time::Instant::now() + shared.policy.stability_threshold;
    let stability = tokio::time::sleep_until(stable_at);
    tokio::pin!(stability);
    let mut stable = false;
    let mut refresh = tokio::time::interval(timing::STATUS_REFRESH_INTERVAL);
    let frames_rx = handle.frames();

    let exit = {
        // One wait future for the whole Running period
        let waiting = handle.wait();
        tokio::pin!(waiting);
        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(Intent::RetryNow { .. }) => {}
                    Some(Intent::Stop) | None => break None,
                },
                exit = &mut waiting => break Some(exit),
                _ = &mut stability, if !stable => {
                    stable = true;
                    shared.update(|state| {
                        if state.restart_count > 0 {
                            info!(
                                index = shared.index,
                                restart_count = state.restart_count,
                                "Pipeline stable, resetting restart count"
                            );
                            state.restart_count = 0;
                        }
                    });
                }
                _ = refresh.tick() => {
                    let frames = *frames_rx.borrow();
                    shared.update(|state| state.frames_written = frames);
                }
            }
        }
    };

    let Some(exit) = exit else {
        return stop_pipeline(shared, handle).await;
    };

    error!(index = shared.index, exit = %exit, "Pipeline terminated unexpectedly");
    let frames = handle.frames_written();
    shared.update(|state| state.frames_written = frames);
    let reaped = handle.stop(shared.policy.stop_grace).await;
    Attempt::Failed(Failure {
        exit_code: failure_code(&exit, reaped),
        error: exit.to_string(),
    })
}

/// Wait for the first frame written, the startup timeout, or a stop intent
async fn confirm_first_frame(
    shared: &Shared,
    handle: &mut PipelineHandle,
    intents: &mut mpsc::UnboundedReceiver<Intent>,
) -> StartOutcome {
    let mut frames = handle.frames();
    let deadline = tokio::time::sleep(shared.policy.startup_timeout);
    tokio::pin!(deadline);
    let mut frames_open = true;

    loop {
        if *frames.borrow_and_update() > 0 {
            return StartOutcome::Confirmed;
        }
        tokio::select! {
            intent = intents.recv() => match intent {
                Some(Intent::RetryNow { .. }) => {}
                Some(Intent::Stop) | None => return StartOutcome::StopRequested,
            },
            exit = handle.wait() => return StartOutcome::Exited(exit),
            changed = frames.changed(), if frames_open => {
                if changed.is_err() {
                    frames_open = false;
                }
            }
            _ = &mut deadline => {
                warn!(
                    index = shared.index,
                    timeout_ms = shared.policy.startup_timeout.as_millis() as u64,
                    "No frame reached the device in time"
                );
                return StartOutcome::TimedOut;
            }
        }
    }
}

/// Starting/Running -> Stopping -> Stopped
async fn stop_pipeline(shared: &Shared, handle: PipelineHandle) -> Attempt {
    shared.transition(Lifecycle::Stopping, |_| {});
    let frames = handle.frames_written();
    let code = handle.stop(shared.policy.stop_grace).await;
    shared.transition(Lifecycle::Stopped, |state| {
        state.frames_written = frames;
        if let Some(code) = code {
            state.last_exit_code = code;
        }
    });
    Attempt::Stopped
}

/// Exit code to record, preferring the code collected while reaping
fn failure_code(exit: &PipelineExit, reaped: Option<i32>) -> i32 {
    match exit {
        PipelineExit::Failed(PipelineRuntimeError::UnexpectedExit { code: None, .. }) => {
            reaped.unwrap_or(1)
        }
        other => other.exit_code(),
    }
}
