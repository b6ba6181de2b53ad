// SPDX-License-Identifier: GPL-3.0-only

//! Raw pixel formats accepted from the capture stage and written to the
//! loopback device

pub mod conversions;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Raw pixel formats handled by the transform stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// I420 4:2:0 - Planar YUV (Y + U + V planes)
    I420,
    /// NV12 4:2:0 - Semi-planar YUV (Y plane + interleaved UV)
    NV12,
    /// YUYV 4:2:2 - Packed YUV (Y0 U Y1 V byte order)
    #[default]
    YUYV,
    /// RGB 24-bit - Packed RGB (3 bytes per pixel)
    RGB24,
}

impl PixelFormat {
    /// All variants, for help output and validation
    pub const ALL: [PixelFormat; 4] = [
        PixelFormat::I420,
        PixelFormat::NV12,
        PixelFormat::YUYV,
        PixelFormat::RGB24,
    ];

    /// V4L2 FourCC for this format
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::I420 => *b"YU12",
            PixelFormat::NV12 => *b"NV12",
            PixelFormat::YUYV => *b"YUYV",
            PixelFormat::RGB24 => *b"RGB3",
        }
    }

    /// Size in bytes of one frame
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::I420 | PixelFormat::NV12 => pixels * 3 / 2,
            PixelFormat::YUYV => pixels * 2,
            PixelFormat::RGB24 => pixels * 3,
        }
    }

    /// Bytes per line of the first plane
    pub fn bytes_per_line(&self, width: u32) -> u32 {
        match self {
            PixelFormat::I420 | PixelFormat::NV12 => width,
            PixelFormat::YUYV => width * 2,
            PixelFormat::RGB24 => width * 3,
        }
    }

    /// Name used in config files and on the command line
    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::I420 => "I420",
            PixelFormat::NV12 => "NV12",
            PixelFormat::YUYV => "YUYV",
            PixelFormat::RGB24 => "RGB24",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "I420" | "YU12" | "YUV420" => Ok(PixelFormat::I420),
            "NV12" => Ok(PixelFormat::NV12),
            "YUYV" | "YUY2" => Ok(PixelFormat::YUYV),
            "RGB24" | "RGB3" | "RGB" => Ok(PixelFormat::RGB24),
            other => Err(format!(
                "unknown pixel format '{}' (expected one of I420, NV12, YUYV, RGB24)",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        assert_eq!(PixelFormat::I420.frame_size(1280, 720), 1280 * 720 * 3 / 2);
        assert_eq!(PixelFormat::NV12.frame_size(1280, 720), 1280 * 720 * 3 / 2);
        assert_eq!(PixelFormat::YUYV.frame_size(1280, 720), 1280 * 720 * 2);
        assert_eq!(PixelFormat::RGB24.frame_size(1280, 720), 1280 * 720 * 3);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("yuv420".parse::<PixelFormat>(), Ok(PixelFormat::I420));
        assert_eq!("YUY2".parse::<PixelFormat>(), Ok(PixelFormat::YUYV));
        assert_eq!(" rgb3 ".parse::<PixelFormat>(), Ok(PixelFormat::RGB24));
        assert!("MJPG".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_serde_uses_plain_names() {
        let json = serde_json::to_string(&PixelFormat::NV12).unwrap();
        assert_eq!(json, "\"NV12\"");
    }
}
