//! Newline-delimited JSON framing
//!
//! One JSON object per line. Inbound bytes accumulate in a `FrameBuffer`
//! until a delimiter shows up; frames are handed out one at a time so the
//! dispatcher sees exactly one request per ready-read event.

use serde::Serialize;
use serde_json::Value;

use crate::error::CodecError;

/// Frame terminator
pub const FRAME_DELIMITER: u8 = b'\n';

/// Serialize one frame, delimiter included
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(FRAME_DELIMITER);
    Ok(bytes)
}

/// Decode one frame into a JSON object
///
/// Anything that is not an object is rejected here; the shape of the object
/// is checked later against the action table.
pub fn decode(frame: &[u8]) -> Result<Value, CodecError> {
    let value: Value = serde_json::from_slice(frame)?;
    if !value.is_object() {
        return Err(CodecError::NotAnObject);
    }
    Ok(value)
}

/// Inbound accumulation buffer for one connection
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame: usize,
}

impl FrameBuffer {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    /// Append raw bytes read from the socket
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Whether a complete frame is waiting
    pub fn has_frame(&self) -> bool {
        self.buf.contains(&FRAME_DELIMITER)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the next complete frame, without its delimiter
    ///
    /// Blank lines are skipped. Fails once a frame, or an unterminated tail,
    /// grows past the size limit.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        loop {
            let Some(pos) = self.buf.iter().position(|b| *b == FRAME_DELIMITER) else {
                if self.buf.len() > self.max_frame {
                    return Err(CodecError::FrameTooLong(self.buf.len()));
                }
                return Ok(None);
            };

            if pos > self.max_frame {
                return Err(CodecError::FrameTooLong(pos));
            }

            let mut frame: Vec<u8> = self.buf.drain(..=pos).collect();
            frame.pop();
            if frame.last() == Some(&b'\r') {
                frame.pop();
            }
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Response;

    #[test]
    fn test_encode_appends_delimiter() {
        let bytes = encode(&Response::ok()).unwrap();
        assert_eq!(bytes.last(), Some(&FRAME_DELIMITER));
        assert_eq!(&bytes[..bytes.len() - 1], br#"{"response":200}"#);
    }

    #[test]
    fn test_frames_come_out_one_at_a_time() {
        let mut buf = FrameBuffer::new(1024);
        buf.extend(b"{\"a\":1}\n{\"b\":2}\n{\"c\"");

        assert!(buf.has_frame());
        assert_eq!(buf.next_frame().unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(buf.next_frame().unwrap().unwrap(), b"{\"b\":2}");
        assert!(buf.next_frame().unwrap().is_none());
        assert!(!buf.has_frame());

        buf.extend(b":3}\r\n");
        assert_eq!(buf.next_frame().unwrap().unwrap(), b"{\"c\":3}");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut buf = FrameBuffer::new(1024);
        buf.extend(b"\n  \n{}\n");
        assert_eq!(buf.next_frame().unwrap().unwrap(), b"{}");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = FrameBuffer::new(8);
        buf.extend(b"0123456789");
        assert!(matches!(buf.next_frame(), Err(CodecError::FrameTooLong(10))));

        let mut buf = FrameBuffer::new(8);
        buf.extend(b"0123456789\n");
        assert!(matches!(buf.next_frame(), Err(CodecError::FrameTooLong(_))));
    }

    #[test]
    fn test_decode_requires_object() {
        assert!(decode(br#"{"action":"presence"}"#).is_ok());
        assert!(matches!(decode(b"[1,2]"), Err(CodecError::NotAnObject)));
        assert!(matches!(decode(b"not json"), Err(CodecError::Json(_))));
    }
}
