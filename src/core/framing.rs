//! Wire framing for socket traffic.
//!
//! MLLP messages are wrapped as `0x0B <payload> 0x1C 0x0D`; the listener uses the trailing
//! `0x1C 0x0D` to find the end of a message. Audit messages use a different, length-prefixed
//! framing (`"<byteLength> <payload>"`) decoded by [`LengthPrefixedCodec`].
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Start-of-block byte.
pub const MLLP_START: u8 = 0x0B;
/// End-of-block byte, always followed by [`MLLP_CR`].
pub const MLLP_END: u8 = 0x1C;
pub const MLLP_CR: u8 = 0x0D;

/// Largest audit message accepted by the codec.
pub const MAX_AUDIT_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FramingError {
    #[error("invalid length prefix: {0:?}")]
    InvalidLength(String),

    #[error("message of {0} bytes exceeds the {1} byte limit")]
    TooLarge(usize, usize),

    #[error("stream ended inside a message ({0} bytes pending)")]
    Truncated(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Position just past the first `0x1C 0x0D` terminator, if the buffer holds one.
pub fn mllp_frame_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2)
        .position(|w| w == [MLLP_END, MLLP_CR])
        .map(|pos| pos + 2)
}

/// Whether `payload` ends with the MLLP terminator.
pub fn is_mllp_terminated(payload: &[u8]) -> bool {
    payload.ends_with(&[MLLP_END, MLLP_CR])
}

/// Wrap `payload` in MLLP start and end bytes unless it is already terminated.
pub fn frame_mllp(payload: &[u8]) -> Bytes {
    if is_mllp_terminated(payload) {
        return Bytes::copy_from_slice(payload);
    }

    let mut framed = BytesMut::with_capacity(payload.len() + 3);
    if payload.first() != Some(&MLLP_START) {
        framed.extend_from_slice(&[MLLP_START]);
    }
    framed.extend_from_slice(payload);
    framed.extend_from_slice(&[MLLP_END, MLLP_CR]);
    framed.freeze()
}

/// Decoder for `"<byteLength> <payload>"` framed messages.
///
/// Whitespace between messages is skipped. The prefix is decimal ASCII; anything else is a
/// protocol error and ends the stream.
#[derive(Debug, Clone)]
pub struct LengthPrefixedCodec {
    max_length: usize,
    pending: Option<usize>,
}

impl LengthPrefixedCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_AUDIT_MESSAGE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            pending: None,
        }
    }

    fn decode_prefix(&mut self, src: &mut BytesMut) -> Result<Option<usize>, FramingError> {
        let skip = src
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        src.advance(skip);

        let Some(space) = src.iter().position(|b| *b == b' ') else {
            // 20 digits is more than any usize prefix can need
            if src.len() > 20 || src.iter().any(|b| !b.is_ascii_digit()) {
                return Err(FramingError::InvalidLength(
                    String::from_utf8_lossy(&src[..src.len().min(20)]).into_owned(),
                ));
            }
            return Ok(None);
        };

        let digits = &src[..space];
        let length = std::str::from_utf8(digits)
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| {
                FramingError::InvalidLength(String::from_utf8_lossy(digits).into_owned())
            })?;

        if length > self.max_length {
            return Err(FramingError::TooLarge(length, self.max_length));
        }

        src.advance(space + 1);
        Ok(Some(length))
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LengthPrefixedCodec {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.pending {
            Some(length) => length,
            None => match self.decode_prefix(src)? {
                Some(length) => {
                    self.pending = Some(length);
                    length
                }
                None => return Ok(None),
            },
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.pending = None;
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                let leftover = src.iter().filter(|b| !b.is_ascii_whitespace()).count();
                if self.pending.is_some() || leftover > 0 {
                    Err(FramingError::Truncated(src.len()))
                } else {
                    Ok(None)
                }
            }
        }
    }
}
