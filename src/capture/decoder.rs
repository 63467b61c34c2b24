use bytes::Bytes;

use super::frame::{Frame, StreamFormat};
use crate::error::{Error, Result};

/// Validate a raw driver buffer and copy it into an owned frame.
///
/// The driver only guarantees `data` for the duration of its callback, so the
/// pixels are always copied.
pub fn decode_frame(format: StreamFormat, data: &[u8], timestamp: u32) -> Result<Frame> {
    let expected = format.frame_bytes();
    if data.len() != expected {
        return Err(Error::Decode {
            stream: format.stream(),
            expected,
            actual: data.len(),
        });
    }

    Ok(Frame::from_parts(
        format,
        timestamp,
        Bytes::copy_from_slice(data),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Stream, DEPTH_BYTES};

    #[test]
    fn short_depth_buffer_is_rejected() {
        let err = decode_frame(StreamFormat::Depth11Bit, &[0u8; 100], 1).unwrap_err();
        match err {
            Error::Decode {
                stream,
                expected,
                actual,
            } => {
                assert_eq!(stream, Stream::Depth);
                assert_eq!(expected, DEPTH_BYTES);
                assert_eq!(actual, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn colour_buffer_sized_for_depth_is_rejected() {
        assert!(decode_frame(StreamFormat::Rgb, &vec![0u8; DEPTH_BYTES], 1).is_err());
    }

    #[test]
    fn valid_buffer_is_copied() {
        let raw = vec![3u8; StreamFormat::Rgb.frame_bytes()];
        let frame = decode_frame(StreamFormat::Rgb, &raw, 99).unwrap();
        assert_eq!(frame.stream(), Stream::Color);
        assert_eq!(frame.timestamp(), 99);
        assert_eq!((frame.width(), frame.height()), (640, 480));
        assert_eq!(frame.pixels().as_ref(), raw.as_slice());
        assert!(frame.rgb_pixels().all(|px| px == [3, 3, 3]));
    }
}
