// SPDX-License-Identifier: GPL-3.0-only

//! Raw frame handling for the transform stage
//!
//! # Modules
//!
//! - [`formats`]: Pixel formats and YUV/RGB conversions
//! - [`transform`]: Flip + repackage applied to every captured frame

pub mod formats;
pub mod transform;

pub use formats::PixelFormat;
pub use transform::FrameTransform;
