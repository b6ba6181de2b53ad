// SPDX-License-Identifier: GPL-3.0-only

//! Writer and capability query for `v4l2loopback` nodes

use super::{DeviceReport, DeviceSink, SinkFactory};
use crate::config::{LoopbackPaths, PipelineConfig};
use crate::constants::LOOPBACK_DRIVER;
use crate::errors::{ControlError, Missing, PipelineStartError};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use v4l::FourCC;
use v4l::capability::Flags;
use v4l::prelude::*;
use v4l::video::Output;

/// Frame writer for one loopback node
pub struct V4l2LoopbackSink {
    path: PathBuf,
    file: File,
    frames_written: u64,
}

impl V4l2LoopbackSink {
    /// Open the node for writing and announce the output format
    pub fn open(path: &Path, config: &PipelineConfig) -> Result<Self, PipelineStartError> {
        info!(
            path = %path.display(),
            format = %config,
            "Opening loopback device for output"
        );

        if !path.exists() {
            return Err(PipelineStartError::DeviceUnavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| PipelineStartError::from_io(&format!("open {}", path.display()), &e))?;

        set_output_format(path, config);

        Ok(Self {
            path: path.to_path_buf(),
            file,
            frames_written: 0,
        })
    }
}

/// Negotiate the output format; loopback nodes often accept writes without it
fn set_output_format(path: &Path, config: &PipelineConfig) {
    let device = match Device::with_path(path) {
        Ok(device) => device,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not open device for format negotiation");
            return;
        }
    };

    let mut format = v4l::Format::new(
        config.width,
        config.height,
        FourCC::new(&config.pixel_format.fourcc()),
    );
    format.stride = config.pixel_format.bytes_per_line(config.width);
    format.size = config.pixel_format.frame_size(config.width, config.height) as u32;

    match Output::set_format(&device, &format) {
        Ok(applied) => debug!(
            width = applied.width,
            height = applied.height,
            fourcc = %applied.fourcc,
            "Set loopback output format"
        ),
        Err(e) => warn!(error = %e, "Could not set V4L2 format (may still work)"),
    }
}

impl DeviceSink for V4l2LoopbackSink {
    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.file.write_all(frame)?;
        self.frames_written += 1;
        Ok(())
    }
}

impl Drop for V4l2LoopbackSink {
    fn drop(&mut self) {
        debug!(
            path = %self.path.display(),
            frames = self.frames_written,
            "Closing loopback device"
        );
    }
}

/// Opens `/dev/video<N>` under the configured device root
#[derive(Debug, Clone)]
pub struct LoopbackSinkFactory {
    paths: LoopbackPaths,
}

impl LoopbackSinkFactory {
    pub fn new(paths: LoopbackPaths) -> Self {
        Self { paths }
    }
}

impl SinkFactory for LoopbackSinkFactory {
    fn open(
        &self,
        index: u32,
        config: &PipelineConfig,
    ) -> Result<Box<dyn DeviceSink>, PipelineStartError> {
        let sink = V4l2LoopbackSink::open(&self.paths.device_node(index), config)?;
        Ok(Box::new(sink))
    }
}

/// Check that `path` exists and answers `VIDIOC_QUERYCAP`
pub fn inspect_node(path: &Path) -> Result<DeviceReport, ControlError> {
    if !path.exists() {
        return Err(ControlError::NotFound(Missing::DeviceNode(path.to_path_buf())));
    }

    let device = Device::with_path(path)
        .map_err(|e| ControlError::Capability(format!("open {}: {}", path.display(), e)))?;
    let caps = device
        .query_caps()
        .map_err(|e| ControlError::Capability(format!("VIDIOC_QUERYCAP {}: {}", path.display(), e)))?;

    let report = DeviceReport {
        path: path.to_path_buf(),
        is_loopback: caps.driver.contains(LOOPBACK_DRIVER),
        driver: caps.driver,
        card: caps.card,
        video_output: caps.capabilities.contains(Flags::VIDEO_OUTPUT),
        video_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
    };
    debug!(report = %report, "Queried device capabilities");
    Ok(report)
}
