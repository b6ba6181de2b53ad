// SPDX-License-Identifier: GPL-3.0-only

//! Backend abstractions for the two ends of the pipeline
//!
//! - [`capture`]: where raw frames come from
//! - [`loopback`]: the virtual device they are written to

pub mod capture;
pub mod loopback;

pub use capture::{CaptureBackend, CaptureSession, StageControl};
pub use loopback::{DeviceSink, LoopbackBackend, SinkFactory};
