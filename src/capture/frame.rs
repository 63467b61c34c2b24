use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Width of every supported stream mode
pub const FRAME_WIDTH: u32 = 640;
/// Height of every supported stream mode
pub const FRAME_HEIGHT: u32 = 480;
/// Byte size of a 16-bit depth frame
pub const DEPTH_BYTES: usize = 614_400;
/// Byte size of an RGB colour frame
pub const RGB_BYTES: usize = 921_600;

/// The two streams a device can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Depth,
    Color,
}

impl Stream {
    pub const ALL: [Stream; 2] = [Stream::Depth, Stream::Color];

    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Depth => "depth",
            Stream::Color => "color",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed set of pixel encodings; every mode is 640x480
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamFormat {
    /// Raw disparity, 11 significant bits in a little-endian u16
    #[serde(rename = "depth_11bit")]
    Depth11Bit,
    /// Raw disparity, 10 significant bits in a little-endian u16
    #[serde(rename = "depth_10bit")]
    Depth10Bit,
    /// Depth aligned to the colour camera, millimetres
    #[serde(rename = "depth_registered")]
    DepthRegistered,
    /// Depth in millimetres
    #[serde(rename = "depth_mm")]
    DepthMm,
    /// Demosaiced 8-bit RGB triples
    #[serde(rename = "rgb")]
    Rgb,
    /// Raw Bayer GRBG mosaic, one byte per pixel
    #[serde(rename = "bayer")]
    Bayer,
}

impl StreamFormat {
    pub fn stream(self) -> Stream {
        match self {
            StreamFormat::Depth11Bit
            | StreamFormat::Depth10Bit
            | StreamFormat::DepthRegistered
            | StreamFormat::DepthMm => Stream::Depth,
            StreamFormat::Rgb | StreamFormat::Bayer => Stream::Color,
        }
    }

    pub fn width(self) -> u32 {
        FRAME_WIDTH
    }

    pub fn height(self) -> u32 {
        FRAME_HEIGHT
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            StreamFormat::Rgb => 3,
            StreamFormat::Bayer => 1,
            _ => 2,
        }
    }

    /// Exact length a raw buffer of this format must have
    pub fn frame_bytes(self) -> usize {
        self.width() as usize * self.height() as usize * self.bytes_per_pixel()
    }
}

/// A decoded frame owned by whoever currently holds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    stream: Stream,
    format: StreamFormat,
    width: u32,
    height: u32,
    timestamp: u32,
    pixels: Bytes,
}

impl Frame {
    /// Callers must have checked `pixels.len() == format.frame_bytes()`
    pub(crate) fn from_parts(format: StreamFormat, timestamp: u32, pixels: Bytes) -> Self {
        debug_assert_eq!(pixels.len(), format.frame_bytes());
        Self {
            stream: format.stream(),
            format,
            width: format.width(),
            height: format.height(),
            timestamp,
            pixels,
        }
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Device-reported frame counter
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    pub fn into_pixels(self) -> Bytes {
        self.pixels
    }

    /// Depth samples in row-major order; empty for colour frames
    pub fn depth_samples(&self) -> impl Iterator<Item = u16> + '_ {
        let data: &[u8] = match self.stream {
            Stream::Depth => &self.pixels[..],
            Stream::Color => &[][..],
        };
        data.chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
    }

    /// RGB triples in row-major order; empty unless the format is `Rgb`
    pub fn rgb_pixels(&self) -> impl Iterator<Item = [u8; 3]> + '_ {
        let data: &[u8] = match self.format {
            StreamFormat::Rgb => &self.pixels[..],
            _ => &[][..],
        };
        data.chunks_exact(3).map(|px| [px[0], px[1], px[2]])
    }
}
