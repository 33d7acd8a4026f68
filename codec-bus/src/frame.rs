use std::fmt::{Display, Formatter};

use bytes::Bytes;
use ffmpeg_next::format::Pixel;

use crate::error::{CodecError, Result};

/// One plane of a decoded image.
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    pub stride: usize,
}

/// A decoded video image as it travels from a decode session's output
/// surface into the compositor. This is the "texture" the compositor binds.
#[derive(Debug, Clone)]
pub struct Picture {
    pub width: u32,
    pub height: u32,
    pub format: Pixel,
    pub planes: Vec<Plane>,
    pub pts_us: i64,
}

/// Pixel rectangle inside a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

fn packed_bytes_per_pixel(format: Pixel) -> Option<usize> {
    match format {
        Pixel::GRAY8 => Some(1),
        Pixel::RGB24 | Pixel::BGR24 => Some(3),
        Pixel::RGBA | Pixel::BGRA | Pixel::ARGB | Pixel::ABGR => Some(4),
        _ => None,
    }
}

fn plane_height(format: Pixel, plane: usize, height: u32) -> usize {
    match (format, plane) {
        (Pixel::YUV420P, 1 | 2) | (Pixel::NV12, 1) => height.div_ceil(2) as usize,
        _ => height as usize,
    }
}

fn copy_rows(
    src: &Plane,
    row_start: usize,
    rows: usize,
    byte_start: usize,
    byte_len: usize,
) -> Plane {
    let mut out = Vec::with_capacity(rows * byte_len);
    for row in row_start..row_start + rows {
        let begin = row * src.stride + byte_start;
        out.extend_from_slice(&src.data[begin..begin + byte_len]);
    }
    Plane {
        data: Bytes::from(out),
        stride: byte_len,
    }
}

impl Picture {
    /// Single plane picture, mostly useful for packed formats.
    pub fn packed(width: u32, height: u32, format: Pixel, data: Bytes, pts_us: i64) -> Self {
        let stride = packed_bytes_per_pixel(format).unwrap_or(1) * width as usize;
        Self {
            width,
            height,
            format,
            planes: vec![Plane { data, stride }],
            pts_us,
        }
    }

    pub fn with_pts(mut self, pts_us: i64) -> Self {
        self.pts_us = pts_us;
        self
    }

    fn check_planes(&self) -> Result<()> {
        let expected = match self.format {
            Pixel::YUV420P => 3,
            Pixel::NV12 => 2,
            f if packed_bytes_per_pixel(f).is_some() => 1,
            other => {
                return Err(CodecError::InvalidArgument(format!(
                    "unsupported pixel format {:?}",
                    other
                )));
            }
        };
        if self.planes.len() < expected {
            return Err(CodecError::InvalidArgument(format!(
                "{:?} picture needs {} planes, got {}",
                self.format,
                expected,
                self.planes.len()
            )));
        }
        for (i, plane) in self.planes.iter().take(expected).enumerate() {
            let rows = plane_height(self.format, i, self.height);
            if plane.data.len() < plane.stride * rows {
                return Err(CodecError::InvalidArgument(format!(
                    "plane {} too short: {} < {}",
                    i,
                    plane.data.len(),
                    plane.stride * rows
                )));
            }
        }
        Ok(())
    }

    /// Copies the pixels of `rect` into a new picture. For chroma subsampled
    /// formats the origin is aligned down to even coordinates.
    pub fn crop(&self, rect: PixelRect) -> Result<Picture> {
        if rect.width == 0
            || rect.height == 0
            || rect.x + rect.width > self.width
            || rect.y + rect.height > self.height
        {
            return Err(CodecError::InvalidArgument(format!(
                "crop {}x{}+{}+{} outside {}x{}",
                rect.width, rect.height, rect.x, rect.y, self.width, self.height
            )));
        }
        self.check_planes()?;

        let planes = match self.format {
            Pixel::YUV420P | Pixel::NV12 => {
                let x = (rect.x & !1) as usize;
                let y = (rect.y & !1) as usize;
                let w = rect.width as usize;
                let h = rect.height as usize;
                let cw = w.div_ceil(2);
                let ch = h.div_ceil(2);
                let mut planes = vec![copy_rows(&self.planes[0], y, h, x, w)];
                if self.format == Pixel::YUV420P {
                    planes.push(copy_rows(&self.planes[1], y / 2, ch, x / 2, cw));
                    planes.push(copy_rows(&self.planes[2], y / 2, ch, x / 2, cw));
                } else {
                    planes.push(copy_rows(&self.planes[1], y / 2, ch, x, cw * 2));
                }
                planes
            }
            format => {
                let bpp = packed_bytes_per_pixel(format).unwrap_or(1);
                vec![copy_rows(
                    &self.planes[0],
                    rect.y as usize,
                    rect.height as usize,
                    rect.x as usize * bpp,
                    rect.width as usize * bpp,
                )]
            }
        };

        Ok(Picture {
            width: rect.width,
            height: rect.height,
            format: self.format,
            planes,
            pts_us: self.pts_us,
        })
    }

    /// Copies an ffmpeg video frame into a picture.
    pub fn from_video(frame: &ffmpeg_next::frame::Video, pts_us: i64) -> Self {
        let planes = (0..frame.planes())
            .map(|i| Plane {
                data: Bytes::copy_from_slice(frame.data(i)),
                stride: frame.stride(i),
            })
            .collect();
        Self {
            width: frame.width(),
            height: frame.height(),
            format: frame.format(),
            planes,
            pts_us,
        }
    }

    /// Copies the picture into a freshly allocated ffmpeg frame, row by row so
    /// that differing strides are honored.
    pub fn to_video(&self) -> Result<ffmpeg_next::frame::Video> {
        self.check_planes()?;
        let mut frame = ffmpeg_next::frame::Video::new(self.format, self.width, self.height);
        let count = frame.planes().min(self.planes.len());
        for i in 0..count {
            let rows = plane_height(self.format, i, self.height);
            let dst_stride = frame.stride(i);
            let src = &self.planes[i];
            let row_len = src.stride.min(dst_stride);
            let dst = frame.data_mut(i);
            for row in 0..rows {
                let s = row * src.stride;
                let d = row * dst_stride;
                dst[d..d + row_len].copy_from_slice(&src.data[s..s + row_len]);
            }
        }
        frame.set_pts(Some(self.pts_us));
        Ok(frame)
    }
}

impl Display for Picture {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Picture {}x{} {:?} planes: {}, pts_us: {}",
            self.width,
            self.height,
            self.format,
            self.planes.len(),
            self.pts_us
        )
    }
}
