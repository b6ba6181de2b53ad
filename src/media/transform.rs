// SPDX-License-Identifier: GPL-3.0-only

//! Per-frame transform applied between capture and device write
//!
//! The transform is a pure function of the frame and the pipeline
//! configuration: no frame is dropped, reordered or altered by history.

use super::formats::PixelFormat;
use super::formats::conversions::{flip_plane, from_yuv420, to_yuv420};
use crate::config::PipelineConfig;

/// Flip and repackage frames from the capture format to the device format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTransform {
    source: PixelFormat,
    target: PixelFormat,
    width: u32,
    height: u32,
    flip_horizontal: bool,
    flip_vertical: bool,
}

impl FrameTransform {
    /// Build the transform for frames captured in `source` format
    pub fn new(config: &PipelineConfig, source: PixelFormat) -> Self {
        Self {
            source,
            target: config.pixel_format,
            width: config.width,
            height: config.height,
            flip_horizontal: config.flip_horizontal,
            flip_vertical: config.flip_vertical,
        }
    }

    /// Bytes per captured frame
    pub fn input_size(&self) -> usize {
        self.source.frame_size(self.width, self.height)
    }

    /// Bytes per frame written to the device
    pub fn output_size(&self) -> usize {
        self.target.frame_size(self.width, self.height)
    }

    /// True when frames pass through untouched
    pub fn is_passthrough(&self) -> bool {
        self.source == self.target && !self.flip_horizontal && !self.flip_vertical
    }

    /// Transform one captured frame
    pub fn apply(&self, mut frame: Vec<u8>) -> Vec<u8> {
        debug_assert_eq!(frame.len(), self.input_size());

        if self.is_passthrough() {
            return frame;
        }

        if self.source == self.target {
            self.flip_in_place(&mut frame);
            return frame;
        }

        let mut hub = to_yuv420(self.source, &frame, self.width, self.height);
        hub.flip(self.flip_horizontal, self.flip_vertical);
        from_yuv420(&hub, self.target)
    }

    /// Mirror a frame without leaving its pixel format
    fn flip_in_place(&self, frame: &mut [u8]) {
        let (h, v) = (self.flip_horizontal, self.flip_vertical);
        let w = self.width as usize;
        let rows = self.height as usize;
        let luma = w * rows;

        match self.target {
            PixelFormat::I420 => {
                let (y, chroma) = frame.split_at_mut(luma);
                let (u, rest) = chroma.split_at_mut(luma / 4);
                flip_plane(y, w, rows, 1, h, v);
                flip_plane(u, w / 2, rows / 2, 1, h, v);
                flip_plane(&mut rest[..luma / 4], w / 2, rows / 2, 1, h, v);
            }
            PixelFormat::NV12 => {
                let (y, uv) = frame.split_at_mut(luma);
                flip_plane(y, w, rows, 1, h, v);
                flip_plane(uv, w / 2, rows / 2, 2, h, v);
            }
            PixelFormat::YUYV => {
                // Reverse macropixels, then swap the two lumas inside each one
                flip_plane(frame, w / 2, rows, 4, h, v);
                if h {
                    for macropixel in frame.chunks_exact_mut(4) {
                        macropixel.swap(0, 2);
                    }
                }
            }
            PixelFormat::RGB24 => flip_plane(frame, w, rows, 3, h, v),
        }
    }
}
