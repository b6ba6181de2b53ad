// SPDX-License-Identifier: GPL-3.0-only

//! Capture stage backends
//!
//! A capture backend produces a byte stream of raw frames plus a control
//! handle for terminating whatever produces it. The default backend runs an
//! external capture program; tests use in-process fakes.

mod command;

pub use command::{ChildStage, CommandCapture};

use crate::config::PipelineConfig;
use crate::errors::PipelineStartError;
use crate::media::PixelFormat;
use std::io::Read;

/// Control over a running capture stage
pub trait StageControl: Send {
    /// OS process id, when the stage is a process
    fn pid(&self) -> Option<u32>;

    /// Ask the stage to terminate (SIGTERM)
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Terminate the stage forcefully (SIGKILL)
    fn kill(&mut self) -> std::io::Result<()>;

    /// Reap the stage if it exited; the inner value is its exit code
    fn try_wait(&mut self) -> std::io::Result<Option<Option<i32>>>;
}

/// A started capture stage
pub struct CaptureSession {
    /// Raw frames, back to back
    pub frames: Box<dyn Read + Send>,
    /// Format of the frames in `frames`
    pub source_format: PixelFormat,
    pub control: Box<dyn StageControl>,
}

/// Starts capture stages
pub trait CaptureBackend: Send + Sync {
    fn open(&self, config: &PipelineConfig) -> Result<CaptureSession, PipelineStartError>;
}
