//! Stream framing strategies

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{consts, Result, SurgeError};
use super::PackageStatus;

const LENGTH_HEADER: usize = 4;
const CRLF: &[u8] = b"\r\n";

/// How one envelope body is delimited in a byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Framing {
    /// `u32` total frame length (header included), then the body
    #[default]
    LengthPrefixed,
    /// Fixed size blocks: `u32` body length, body, zero padding up to `block`
    FixedLength { block: usize },
    /// Hex encoded body terminated by CRLF
    LineDelimited,
}

impl Framing {
    /// Find the next frame boundary in `buf`.
    /// Returns (frame_length, status)
    pub fn parse(&self, buf: &[u8]) -> (usize, PackageStatus) {
        match *self {
            Framing::LengthPrefixed => {
                if buf.len() < LENGTH_HEADER {
                    return (0, PackageStatus::Less);
                }
                let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                if len < LENGTH_HEADER || len > consts::MAX_PACKAGE_LENGTH as usize {
                    return (0, PackageStatus::Error);
                }
                if buf.len() < len {
                    return (0, PackageStatus::Less);
                }
                (len, PackageStatus::Full)
            }
            Framing::FixedLength { block } => {
                if block <= LENGTH_HEADER {
                    return (0, PackageStatus::Error);
                }
                if buf.len() < block {
                    return (0, PackageStatus::Less);
                }
                let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                if len > block - LENGTH_HEADER {
                    return (0, PackageStatus::Error);
                }
                (block, PackageStatus::Full)
            }
            Framing::LineDelimited => match buf.windows(CRLF.len()).position(|w| w == CRLF) {
                Some(pos) => (pos + CRLF.len(), PackageStatus::Full),
                None if buf.len() > 2 * consts::MAX_PACKAGE_LENGTH as usize => (0, PackageStatus::Error),
                None => (0, PackageStatus::Less),
            },
        }
    }

    /// Wrap an envelope body into one frame
    pub fn wrap(&self, body: &[u8]) -> Result<Bytes> {
        match *self {
            Framing::LengthPrefixed => {
                let total = body.len() + LENGTH_HEADER;
                if total > consts::MAX_PACKAGE_LENGTH as usize {
                    return Err(SurgeError::Codec(format!("frame too large: {} bytes", total)));
                }
                let mut buf = BytesMut::with_capacity(total);
                buf.put_u32(total as u32);
                buf.put_slice(body);
                Ok(buf.freeze())
            }
            Framing::FixedLength { block } => {
                if block <= LENGTH_HEADER || body.len() > block - LENGTH_HEADER {
                    return Err(SurgeError::Codec(format!(
                        "body of {} bytes does not fit a {} byte block",
                        body.len(),
                        block
                    )));
                }
                let mut buf = BytesMut::with_capacity(block);
                buf.put_u32(body.len() as u32);
                buf.put_slice(body);
                buf.resize(block, 0);
                Ok(buf.freeze())
            }
            Framing::LineDelimited => {
                let mut buf = BytesMut::with_capacity(body.len() * 2 + CRLF.len());
                buf.put_slice(hex::encode(body).as_bytes());
                buf.put_slice(CRLF);
                Ok(buf.freeze())
            }
        }
    }

    /// Extract the envelope body from exactly one frame
    pub fn unwrap_frame(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let (len, status) = self.parse(frame);
        match status {
            PackageStatus::Full if len == frame.len() => {}
            PackageStatus::Full => {
                return Err(SurgeError::Codec(format!(
                    "{} trailing bytes after frame",
                    frame.len() - len
                )))
            }
            PackageStatus::Less => return Err(SurgeError::Codec("frame truncated".into())),
            PackageStatus::Error => return Err(SurgeError::Codec("invalid frame header".into())),
        }

        match *self {
            Framing::LengthPrefixed => Ok(frame[LENGTH_HEADER..].to_vec()),
            Framing::FixedLength { .. } => {
                let body_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
                Ok(frame[LENGTH_HEADER..LENGTH_HEADER + body_len].to_vec())
            }
            Framing::LineDelimited => hex::decode(&frame[..frame.len() - CRLF.len()])
                .map_err(|e| SurgeError::Codec(format!("invalid hex line: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefixed_parse() {
        let framing = Framing::LengthPrefixed;
        assert_eq!(framing.parse(&[0, 0, 1]).1, PackageStatus::Less);
        assert_eq!(framing.parse(&[0, 0, 0, 8, 1, 2, 3, 4]), (8, PackageStatus::Full));
        assert_eq!(framing.parse(&[0, 0, 0, 10, 1, 2, 3, 4]).1, PackageStatus::Less);
        assert_eq!(framing.parse(&[0, 0, 0, 2]).1, PackageStatus::Error);
        assert_eq!(framing.parse(&[0xff, 0xff, 0xff, 0xff]).1, PackageStatus::Error);
    }

    #[test]
    fn test_fixed_length() {
        let framing = Framing::FixedLength { block: 16 };
        let frame = framing.wrap(b"hello").unwrap();
        assert_eq!(frame.len(), 16);
        assert_eq!(framing.parse(&frame[..10]).1, PackageStatus::Less);
        assert_eq!(framing.unwrap_frame(&frame).unwrap(), b"hello");

        // Body must fit inside the block
        assert!(matches!(framing.wrap(&[0u8; 13]), Err(SurgeError::Codec(_))));
        assert!(framing.wrap(&[0u8; 12]).is_ok());

        let mut bad = frame.to_vec();
        bad[3] = 200;
        assert_eq!(framing.parse(&bad).1, PackageStatus::Error);
    }

    #[test]
    fn test_line_delimited() {
        let framing = Framing::LineDelimited;
        let frame = framing.wrap(&[0x00, 0x0d, 0x0a, 0xff]).unwrap();
        assert_eq!(&frame[..], b"000d0aff\r\n");
        assert_eq!(framing.parse(b"000d").1, PackageStatus::Less);
        assert_eq!(framing.unwrap_frame(&frame).unwrap(), vec![0x00, 0x0d, 0x0a, 0xff]);
        assert!(matches!(framing.unwrap_frame(b"zz\r\n"), Err(SurgeError::Codec(_))));
    }

    #[test]
    fn test_stream_with_two_frames() {
        for framing in [Framing::LengthPrefixed, Framing::FixedLength { block: 32 }, Framing::LineDelimited] {
            let mut stream = framing.wrap(b"first").unwrap().to_vec();
            stream.extend_from_slice(&framing.wrap(b"second").unwrap());

            let (len, status) = framing.parse(&stream);
            assert_eq!(status, PackageStatus::Full);
            assert_eq!(framing.unwrap_frame(&stream[..len]).unwrap(), b"first");
            assert_eq!(framing.unwrap_frame(&stream[len..]).unwrap(), b"second");
            assert!(framing.unwrap_frame(&stream).is_err());
        }
    }
}
