// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle for the pipeline stages
//!
//! Both stages are blocking loops (a pipe read and a device write), so each
//! runs on its own OS thread. The stop signal is shared by the two stages of
//! a pipeline and checked before every iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Action returned by a stage iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Run another iteration
    Continue,
    /// Leave the loop
    Stop,
}

/// One stage loop running on a named thread
pub struct StageWorker {
    thread_handle: Option<JoinHandle<()>>,
    name: String,
    detached: bool,
}

impl StageWorker {
    /// Spawn `loop_fn` until it returns [`LoopAction::Stop`] or `stop_signal` is set
    pub fn spawn<F>(name: &str, stop_signal: Arc<AtomicBool>, mut loop_fn: F) -> std::io::Result<Self>
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        let thread_name = name.to_string();

        let thread_handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!(name = %thread_name, "Stage thread started");

            loop {
                if stop_signal.load(Ordering::SeqCst) {
                    debug!(name = %thread_name, "Stop signal received");
                    break;
                }

                match loop_fn() {
                    LoopAction::Continue => {}
                    LoopAction::Stop => {
                        debug!(name = %thread_name, "Stage loop finished");
                        break;
                    }
                }
            }

            info!(name = %thread_name, "Stage thread exiting");
        })?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            name: name.to_string(),
            detached: false,
        })
    }

    /// True once the thread has returned; a detached thread never counts
    pub fn is_finished(&self) -> bool {
        match &self.thread_handle {
            Some(handle) => handle.is_finished(),
            None => !self.detached,
        }
    }

    /// Whether [`join_within`](Self::join_within) gave up on the thread
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Join the thread if it finishes within `timeout`
    ///
    /// A thread still blocked after the timeout is detached and `false` is
    /// returned.
    pub fn join_within(&mut self, timeout: Duration) -> bool {
        let started = Instant::now();
        while !self.is_finished() {
            if started.elapsed() >= timeout {
                warn!(name = %self.name, "Stage thread did not finish in time, detaching");
                self.thread_handle = None;
                self.detached = true;
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }

        if let Some(handle) = self.thread_handle.take()
            && let Err(e) = handle.join()
        {
            warn!(name = %self.name, "Stage thread panicked: {:?}", e);
        }
        true
    }
}
