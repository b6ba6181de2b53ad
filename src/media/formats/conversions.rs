// SPDX-License-Identifier: GPL-3.0-only

//! Pixel format conversion utilities
//!
//! Every conversion goes through planar YUV 4:2:0 ([`Yuv420`]). RGB uses
//! BT.601 limited-range integer coefficients.

use super::PixelFormat;

/// Planar YUV 4:2:0 frame used as the conversion hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Yuv420 {
    pub width: usize,
    pub height: usize,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl Yuv420 {
    fn chroma_width(&self) -> usize {
        self.width / 2
    }

    fn chroma_height(&self) -> usize {
        self.height / 2
    }

    /// Mirror all three planes
    pub fn flip(&mut self, horizontal: bool, vertical: bool) {
        let (cw, ch) = (self.chroma_width(), self.chroma_height());
        flip_plane(&mut self.y, self.width, self.height, 1, horizontal, vertical);
        flip_plane(&mut self.u, cw, ch, 1, horizontal, vertical);
        flip_plane(&mut self.v, cw, ch, 1, horizontal, vertical);
    }
}

/// Mirror a packed plane of `units_per_row` x `rows` units of `unit` bytes each
pub fn flip_plane(
    data: &mut [u8],
    units_per_row: usize,
    rows: usize,
    unit: usize,
    horizontal: bool,
    vertical: bool,
) {
    let row_bytes = units_per_row * unit;

    if horizontal {
        for row in data.chunks_exact_mut(row_bytes).take(rows) {
            for x in 0..units_per_row / 2 {
                let left = x * unit;
                let right = (units_per_row - 1 - x) * unit;
                for i in 0..unit {
                    row.swap(left + i, right + i);
                }
            }
        }
    }

    if vertical {
        for y in 0..rows / 2 {
            let (top, bottom) = data.split_at_mut((rows - 1 - y) * row_bytes);
            top[y * row_bytes..(y + 1) * row_bytes].swap_with_slice(&mut bottom[..row_bytes]);
        }
    }
}

/// Decode a raw frame into planar 4:2:0
pub fn to_yuv420(format: PixelFormat, data: &[u8], width: u32, height: u32) -> Yuv420 {
    let w = width as usize;
    let h = height as usize;
    let (cw, ch) = (w / 2, h / 2);
    let luma = w * h;
    let chroma = cw * ch;

    match format {
        PixelFormat::I420 => Yuv420 {
            width: w,
            height: h,
            y: data[..luma].to_vec(),
            u: data[luma..luma + chroma].to_vec(),
            v: data[luma + chroma..luma + 2 * chroma].to_vec(),
        },
        PixelFormat::NV12 => {
            let uv = &data[luma..luma + 2 * chroma];
            Yuv420 {
                width: w,
                height: h,
                y: data[..luma].to_vec(),
                u: uv.iter().step_by(2).copied().collect(),
                v: uv.iter().skip(1).step_by(2).copied().collect(),
            }
        }
        PixelFormat::YUYV => {
            let stride = w * 2;
            let mut y = Vec::with_capacity(luma);
            for row in data.chunks_exact(stride).take(h) {
                y.extend(row.iter().step_by(2));
            }
            // Average chroma of each row pair to drop to 4:2:0
            let mut u = Vec::with_capacity(chroma);
            let mut v = Vec::with_capacity(chroma);
            for cy in 0..ch {
                let top = &data[2 * cy * stride..(2 * cy + 1) * stride];
                let bottom = &data[(2 * cy + 1) * stride..(2 * cy + 2) * stride];
                for cx in 0..cw {
                    let i = cx * 4;
                    u.push(avg2(top[i + 1], bottom[i + 1]));
                    v.push(avg2(top[i + 3], bottom[i + 3]));
                }
            }
            Yuv420 {
                width: w,
                height: h,
                y,
                u,
                v,
            }
        }
        PixelFormat::RGB24 => rgb24_to_yuv420(data, w, h),
    }
}

/// Encode planar 4:2:0 into a raw frame
pub fn from_yuv420(frame: &Yuv420, format: PixelFormat) -> Vec<u8> {
    let (w, h) = (frame.width, frame.height);
    let cw = frame.chroma_width();

    match format {
        PixelFormat::I420 => {
            let mut out = Vec::with_capacity(format.frame_size(w as u32, h as u32));
            out.extend_from_slice(&frame.y);
            out.extend_from_slice(&frame.u);
            out.extend_from_slice(&frame.v);
            out
        }
        PixelFormat::NV12 => {
            let mut out = Vec::with_capacity(format.frame_size(w as u32, h as u32));
            out.extend_from_slice(&frame.y);
            for (u, v) in frame.u.iter().zip(&frame.v) {
                out.push(*u);
                out.push(*v);
            }
            out
        }
        PixelFormat::YUYV => {
            let mut out = vec![0u8; w * h * 2];
            for y in 0..h {
                let crow = (y / 2) * cw;
                for x in 0..cw {
                    let luma = y * w + x * 2;
                    let dst = y * w * 2 + x * 4;
                    out[dst] = frame.y[luma];
                    out[dst + 1] = frame.u[crow + x];
                    out[dst + 2] = frame.y[luma + 1];
                    out[dst + 3] = frame.v[crow + x];
                }
            }
            out
        }
        PixelFormat::RGB24 => {
            let mut out = Vec::with_capacity(w * h * 3);
            for y in 0..h {
                let crow = (y / 2) * cw;
                for x in 0..w {
                    let c = frame.y[y * w + x] as i32 - 16;
                    let d = frame.u[crow + x / 2] as i32 - 128;
                    let e = frame.v[crow + x / 2] as i32 - 128;
                    out.push(clamp_u8((298 * c + 409 * e + 128) >> 8));
                    out.push(clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8));
                    out.push(clamp_u8((298 * c + 516 * d + 128) >> 8));
                }
            }
            out
        }
    }
}

fn rgb24_to_yuv420(data: &[u8], w: usize, h: usize) -> Yuv420 {
    let (cw, ch) = (w / 2, h / 2);
    let mut y = Vec::with_capacity(w * h);
    for px in data.chunks_exact(3).take(w * h) {
        let (r, g, b) = (px[0] as i32, px[1] as i32, px[2] as i32);
        y.push(clamp_u8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16));
    }

    let mut u = Vec::with_capacity(cw * ch);
    let mut v = Vec::with_capacity(cw * ch);
    for cy in 0..ch {
        for cx in 0..cw {
            let (mut r, mut g, mut b) = (0i32, 0i32, 0i32);
            for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let i = ((2 * cy + dy) * w + 2 * cx + dx) * 3;
                r += data[i] as i32;
                g += data[i + 1] as i32;
                b += data[i + 2] as i32;
            }
            let (r, g, b) = (r / 4, g / 4, b / 4);
            u.push(clamp_u8(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128));
            v.push(clamp_u8(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128));
        }
    }

    Yuv420 {
        width: w,
        height: h,
        y,
        u,
        v,
    }
}

fn avg2(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16 + 1) / 2) as u8
}

fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
