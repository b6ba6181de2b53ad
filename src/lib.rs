// SPDX-License-Identifier: GPL-3.0-only

//! loopcam - a supervised virtual camera on top of v4l2loopback
//!
//! A capture program's raw frames are flipped, converted and written into a
//! loopback device node, so ordinary applications see a regular camera.
//!
//! # Architecture
//!
//! - [`provisioner`]: creates and removes the loopback device, boot registration
//! - [`pipeline`]: capture stage -> bounded buffer -> transform/write stage
//! - [`supervisor`]: Stopped/Starting/Running/FailedBackoff/Stopping state machine
//! - [`control`]: operator commands, control socket server and client
//! - [`daemon`]: the long-lived process hosting one device's supervisor
//! - [`backends`]: capture program and v4l2loopback implementations
//! - [`media`]: pixel formats and frame transforms
//! - [`config`] / [`storage`]: settings and persisted per-device records

pub mod backends;
pub mod config;
pub mod constants;
pub mod control;
pub mod daemon;
pub mod errors;
pub mod lock;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod provisioner;
pub mod storage;
pub mod supervisor;

// Re-export commonly used types
pub use config::{PipelineConfig, Settings, VirtualDeviceConfig};
pub use control::{ControlInterface, DeviceContext, StatusReport};
pub use errors::{AppError, AppResult, ControlError};
pub use supervisor::{Lifecycle, ServiceState, ServiceSupervisor};
