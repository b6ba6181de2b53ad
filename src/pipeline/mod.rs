// SPDX-License-Identifier: GPL-3.0-only

//! Two-stage frame pipeline feeding a loopback device
//!
//! ```text
//! capture program ──stdout──▶ capture stage ──bounded buffer──▶ transform stage ──▶ /dev/videoN
//!                              (reads frames)   (N frames)       (flip/convert/write)
//! ```
//!
//! A full buffer blocks the capture stage, which stops reading the pipe,
//! which in turn blocks the capture program. Memory use is bounded by the
//! buffer capacity plus one frame in flight on each side.

mod stage;

pub use stage::{LoopAction, StageWorker};

use crate::backends::{CaptureBackend, CaptureSession, SinkFactory, StageControl};
use crate::config::{PipelineConfig, VirtualDeviceConfig};
use crate::constants::{STATS_LOG_INTERVAL_FRAMES, timing};
use crate::errors::{PipelineRuntimeError, PipelineStage, PipelineStartError};
use crate::lock::{self, FileLock};
use crate::media::FrameTransform;
use crate::storage::DeviceStore;
use std::fmt;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc as async_mpsc, watch};
use tracing::{debug, info, warn};

/// How a pipeline instance ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineExit {
    /// Terminated through [`PipelineHandle::stop`]
    Stopped,
    /// Any other termination
    Failed(PipelineRuntimeError),
}

impl PipelineExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineExit::Stopped => 0,
            PipelineExit::Failed(e) => e.exit_code(),
        }
    }
}

impl fmt::Display for PipelineExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineExit::Stopped => write!(f, "stopped"),
            PipelineExit::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// First thing a stage reports when it leaves its loop on its own
#[derive(Debug, Clone)]
enum StageEvent {
    /// Capture stream hit EOF or a read error
    CaptureEnded { error: Option<String> },
    /// Transform stage lost its producer
    TransformEnded,
    WriteFailed(String),
}

/// Starts pipeline instances against one state directory
#[derive(Clone)]
pub struct CapturePipeline {
    capture: Arc<dyn CaptureBackend>,
    sinks: Arc<dyn SinkFactory>,
    state_dir: PathBuf,
}

impl CapturePipeline {
    pub fn new(
        capture: Arc<dyn CaptureBackend>,
        sinks: Arc<dyn SinkFactory>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            capture,
            sinks,
            state_dir: state_dir.into(),
        }
    }

    /// Attach to the device and spawn both stages
    ///
    /// The bounded buffer holds `device.buffer_capacity_frames` frames.
    pub fn start(
        &self,
        config: &PipelineConfig,
        device: &VirtualDeviceConfig,
    ) -> Result<PipelineHandle, PipelineStartError> {
        let index = device.device_index;
        let store = DeviceStore::new(&self.state_dir, index);

        let attach = lock::try_lock_exclusive(&store.attach_lock_path())
            .map_err(|e| PipelineStartError::from_io("attach lock", &e))?
            .ok_or_else(|| {
                PipelineStartError::DeviceUnavailable(format!(
                    "video{} already has a pipeline attached",
                    index
                ))
            })?;

        let mut sink = self.sinks.open(index, config)?;
        let CaptureSession {
            mut frames,
            source_format,
            mut control,
        } = self.capture.open(config)?;

        let transform = FrameTransform::new(config, source_format);
        let frame_size = transform.input_size();
        let buffer_frames = device.buffer_capacity_frames.max(1) as usize;

        let (frame_tx, frame_rx) = mpsc::sync_channel::<Vec<u8>>(buffer_frames);
        let (event_tx, events) = async_mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = watch::channel(0u64);
        let stop_signal = Arc::new(AtomicBool::new(false));

        let capture_events = event_tx.clone();
        let capture_worker = StageWorker::spawn(
            &format!("capture-video{}", index),
            Arc::clone(&stop_signal),
            move || {
                let mut frame = vec![0u8; frame_size];
                if let Err(e) = frames.read_exact(&mut frame) {
                    let error = (e.kind() != ErrorKind::UnexpectedEof).then(|| e.to_string());
                    let _ = capture_events.send(StageEvent::CaptureEnded { error });
                    return LoopAction::Stop;
                }
                // Blocks while the buffer is full
                match frame_tx.send(frame) {
                    Ok(()) => LoopAction::Continue,
                    Err(_) => LoopAction::Stop,
                }
            },
        );
        let capture_worker = match capture_worker {
            Ok(worker) => worker,
            Err(e) => {
                abort_stage(control.as_mut());
                return Err(PipelineStartError::from_io("spawn capture stage", &e));
            }
        };

        let transform_stop = Arc::clone(&stop_signal);
        let mut written: u64 = 0;
        let mut window_start = Instant::now();
        let transform_worker = StageWorker::spawn(
            &format!("transform-video{}", index),
            Arc::clone(&stop_signal),
            move || match frame_rx.recv_timeout(timing::STAGE_POLL_INTERVAL) {
                Ok(frame) => {
                    let out = transform.apply(frame);
                    if let Err(e) = sink.write_frame(&out) {
                        if !transform_stop.load(Ordering::SeqCst) {
                            let _ = event_tx.send(StageEvent::WriteFailed(e.to_string()));
                        }
                        return LoopAction::Stop;
                    }
                    written += 1;
                    frames_tx.send_replace(written);

                    if written % STATS_LOG_INTERVAL_FRAMES == 0 {
                        let elapsed = window_start.elapsed().as_secs_f64();
                        info!(
                            index,
                            frames = written,
                            fps = %format!("{:.1}", STATS_LOG_INTERVAL_FRAMES as f64 / elapsed.max(f64::EPSILON)),
                            "Pipeline statistics"
                        );
                        window_start = Instant::now();
                    }
                    LoopAction::Continue
                }
                Err(RecvTimeoutError::Timeout) => LoopAction::Continue,
                Err(RecvTimeoutError::Disconnected) => {
                    let _ = event_tx.send(StageEvent::TransformEnded);
                    LoopAction::Stop
                }
            },
        );
        let transform_worker = match transform_worker {
            Ok(worker) => worker,
            Err(e) => {
                stop_signal.store(true, Ordering::SeqCst);
                abort_stage(control.as_mut());
                return Err(PipelineStartError::from_io("spawn transform stage", &e));
            }
        };

        info!(
            index,
            pid = ?control.pid(),
            config = %config,
            buffer_frames,
            "Pipeline started"
        );

        Ok(PipelineHandle {
            index,
            control,
            stop_signal,
            events,
            pending: None,
            frames: frames_rx,
            workers: vec![capture_worker, transform_worker],
            exit_code: None,
            reap_deadline: None,
            finished: false,
            _attach: attach,
        })
    }
}

/// Kill a stage that never made it into a handle
fn abort_stage(control: &mut dyn StageControl) {
    let _ = control.kill();
    let started = Instant::now();
    while started.elapsed() < timing::KILL_REAP_TIMEOUT {
        if matches!(control.try_wait(), Ok(Some(_)) | Err(_)) {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// A running pipeline instance
///
/// Holds the device attachment until dropped. Dropping without
/// [`stop`](Self::stop) kills the capture stage.
pub struct PipelineHandle {
    index: u32,
    control: Box<dyn StageControl>,
    stop_signal: Arc<AtomicBool>,
    events: async_mpsc::UnboundedReceiver<StageEvent>,
    pending: Option<StageEvent>,
    frames: watch::Receiver<u64>,
    workers: Vec<StageWorker>,
    /// Set once the capture stage has been reaped
    exit_code: Option<Option<i32>>,
    /// When a capture stage whose stream ended stops being waited for
    reap_deadline: Option<Instant>,
    finished: bool,
    _attach: FileLock,
}

impl PipelineHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Capture process id
    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    /// Watch of the number of frames written to the device
    pub fn frames(&self) -> watch::Receiver<u64> {
        self.frames.clone()
    }

    pub fn frames_written(&self) -> u64 {
        *self.frames.borrow()
    }

    /// Wait until a stage terminates and classify why
    ///
    /// Cancel safe, and returns the same classification when called again.
    /// A capture stream that ended is classified once its exit code is
    /// collected or `EXIT_REAP_WINDOW` after the stream ended, whichever
    /// comes first, no matter how often the call is cancelled.
    pub async fn wait(&mut self) -> PipelineExit {
        if self.pending.is_none() {
            let event = self.events.recv().await.unwrap_or(StageEvent::TransformEnded);
            if let StageEvent::CaptureEnded { error: Some(error) } = &event {
                warn!(index = self.index, error = %error, "Capture stream read failed");
            }
            self.pending = Some(event);
        }

        if self.stop_signal.load(Ordering::SeqCst) {
            return PipelineExit::Stopped;
        }

        match self.pending.clone() {
            Some(StageEvent::CaptureEnded { .. }) => {
                let deadline = *self
                    .reap_deadline
                    .get_or_insert_with(|| Instant::now() + timing::EXIT_REAP_WINDOW);
                let code = self.reap_until(deadline).await;
                PipelineExit::Failed(PipelineRuntimeError::UnexpectedExit {
                    stage: PipelineStage::Capture,
                    code,
                })
            }
            Some(StageEvent::WriteFailed(message)) => {
                PipelineExit::Failed(PipelineRuntimeError::WriteFailure(message))
            }
            Some(StageEvent::TransformEnded) | None => {
                PipelineExit::Failed(PipelineRuntimeError::UnexpectedExit {
                    stage: PipelineStage::Transform,
                    code: None,
                })
            }
        }
    }

    /// Poll for the capture stage's exit code until `deadline`
    async fn reap_until(&mut self, deadline: Instant) -> Option<i32> {
        if let Some(code) = self.exit_code {
            return code;
        }
        loop {
            match self.control.try_wait() {
                Ok(Some(code)) => {
                    self.exit_code = Some(code);
                    return code;
                }
                Ok(None) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!(index = self.index, error = %e, "Could not reap capture stage");
                    return None;
                }
            }
        }
    }

    /// Terminate both stages: SIGTERM, up to `grace` to exit, then SIGKILL
    ///
    /// Returns the capture stage's exit code when it could be collected.
    pub async fn stop(mut self, grace: Duration) -> Option<i32> {
        self.stop_signal.store(true, Ordering::SeqCst);

        if self.exit_code.is_some() {
            // The program is gone; only helpers it left behind remain
            debug!(index = self.index, "Clearing capture stage process group");
            let _ = self.control.terminate();
            let _ = self.control.kill();
        } else {
            debug!(index = self.index, pid = ?self.pid(), "Sending SIGTERM to capture stage");
            if let Err(e) = self.control.terminate() {
                warn!(index = self.index, error = %e, "Failed to signal capture stage");
            }
            self.reap_until(Instant::now() + grace).await;
        }

        if self.exit_code.is_none() {
            warn!(
                index = self.index,
                grace_ms = grace.as_millis() as u64,
                "Capture stage ignored SIGTERM, sending SIGKILL"
            );
            if let Err(e) = self.control.kill() {
                warn!(index = self.index, error = %e, "Failed to kill capture stage");
            }
            self.reap_until(Instant::now() + timing::KILL_REAP_TIMEOUT).await;
        }

        let mut workers = std::mem::take(&mut self.workers);
        let join_timeout = grace.max(timing::STAGE_POLL_INTERVAL * 2);
        let joined = tokio::task::spawn_blocking(move || {
            for worker in &mut workers {
                worker.join_within(join_timeout);
            }
            !workers.iter().any(StageWorker::is_detached)
        })
        .await
        .unwrap_or(false);

        self.finished = true;
        info!(
            index = self.index,
            exit_code = ?self.exit_code.flatten(),
            frames = self.frames_written(),
            clean = joined,
            "Pipeline stopped"
        );
        self.exit_code.flatten()
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.stop_signal.store(true, Ordering::SeqCst);
        if self.exit_code.is_none() {
            debug!(index = self.index, "Pipeline handle dropped while running, killing capture");
            abort_stage(self.control.as_mut());
        } else {
            let _ = self.control.kill();
        }
    }
}
