//! Firetower wire frame codec.
//!
//! A frame is laid out as:
//! - 10 bytes: the literal `FireHeader`
//! - 4 bytes: body length (big-endian, signed)
//! - N bytes: `kind SP id SP source SP topic LF content`
//!
//! Decoding is tolerant. Bytes that do not start a header are skipped one at a
//! time. A frame whose body cannot be split into its four fields, or whose
//! declared length exceeds the size limit, is skipped by its declared length
//! without looking inside it. A truncated frame is never consumed, so the
//! caller can retry once more bytes arrive.
//!
//! The encoder enforces the same size limit, so every frame it produces can be
//! decoded by a peer using that limit.
//!
//! [`encode`] and [`decode`] are pure functions over byte slices.
//! [`FireCodec`] wraps the same logic in tokio's `Decoder`/`Encoder` traits
//! for use with `FramedRead`, which carries the undecoded remainder between
//! reads.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::error::{ProtocolError, ProtocolResult};

use super::message::Message;

/// Frame header literal.
pub const HEADER: &[u8; HEADER_LEN] = b"FireHeader";

/// Length of [`HEADER`].
pub const HEADER_LEN: usize = 10;

/// Length of the body-length field.
pub const LENGTH_LEN: usize = 4;

/// Header plus length field.
pub const PREFIX_LEN: usize = HEADER_LEN + LENGTH_LEN;

/// Largest body accepted by default (16 MB). Longer frames are refused by the
/// encoder and skipped by the decoder.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const FIELD_SEPARATOR: u8 = b' ';
const LINE_END: u8 = b'\n';

/// Encode one frame.
///
/// `content` of `None` is rejected just like an empty `kind` or `topic`; an
/// empty slice is a valid, empty payload.
///
/// # Errors
///
/// Returns [`ProtocolError::EmptyField`] for a missing kind, topic or content,
/// [`ProtocolError::InvalidField`] if a header field contains a separator, and
/// [`ProtocolError::FrameTooLarge`] if the body exceeds
/// [`DEFAULT_MAX_FRAME_SIZE`].
pub fn encode(
    kind: &str,
    id: &str,
    source: &str,
    topic: &str,
    content: Option<&[u8]>,
) -> ProtocolResult<Bytes> {
    encode_with_limit(kind, id, source, topic, content, DEFAULT_MAX_FRAME_SIZE)
}

/// [`encode`] with an explicit maximum body size.
///
/// # Errors
///
/// See [`encode`]; `FrameTooLarge` applies to `max_frame_size`.
pub fn encode_with_limit(
    kind: &str,
    id: &str,
    source: &str,
    topic: &str,
    content: Option<&[u8]>,
    max_frame_size: usize,
) -> ProtocolResult<Bytes> {
    let mut dst = BytesMut::new();
    encode_into(kind, id, source, topic, content, max_frame_size, &mut dst)?;
    Ok(dst.freeze())
}

/// Encode a [`Message`] into a standalone frame.
///
/// # Errors
///
/// See [`encode`].
pub fn encode_message(message: &Message) -> ProtocolResult<Bytes> {
    encode(
        &message.kind,
        &message.id,
        &message.source,
        &message.topic,
        Some(&message.payload[..]),
    )
}

fn encode_into(
    kind: &str,
    id: &str,
    source: &str,
    topic: &str,
    content: Option<&[u8]>,
    max_frame_size: usize,
    dst: &mut BytesMut,
) -> ProtocolResult<()> {
    if kind.is_empty() {
        return Err(ProtocolError::EmptyField("kind"));
    }
    if topic.is_empty() {
        return Err(ProtocolError::EmptyField("topic"));
    }
    let content = content.ok_or(ProtocolError::EmptyField("content"))?;

    for (field, value) in [("kind", kind), ("id", id), ("source", source), ("topic", topic)] {
        if value.bytes().any(|b| b == FIELD_SEPARATOR || b == LINE_END || b == b'\r') {
            return Err(ProtocolError::InvalidField {
                field,
                value: value.to_string(),
            });
        }
    }

    let body_len = kind.len() + id.len() + source.len() + topic.len() + 4 + content.len();
    if body_len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge { size: body_len });
    }
    let declared = i32::try_from(body_len).map_err(|_| ProtocolError::FrameTooLarge { size: body_len })?;

    dst.reserve(PREFIX_LEN + body_len);
    dst.put_slice(HEADER);
    dst.put_i32(declared);
    dst.put_slice(kind.as_bytes());
    dst.put_u8(FIELD_SEPARATOR);
    dst.put_slice(id.as_bytes());
    dst.put_u8(FIELD_SEPARATOR);
    dst.put_slice(source.as_bytes());
    dst.put_u8(FIELD_SEPARATOR);
    dst.put_slice(topic.as_bytes());
    dst.put_u8(LINE_END);
    dst.put_slice(content);
    Ok(())
}

/// Decode every complete frame in `buffer` into `sink`.
///
/// Returns the unconsumed suffix of `buffer`: a partial frame (or fewer than
/// [`PREFIX_LEN`] trailing bytes) waiting for more input. The suffix is empty
/// when the whole buffer was consumed.
pub fn decode<'a>(buffer: &'a [u8], sink: &mut Vec<Message>) -> &'a [u8] {
    decode_with_limit(buffer, DEFAULT_MAX_FRAME_SIZE, sink)
}

/// [`decode`] with an explicit maximum body size.
pub fn decode_with_limit<'a>(
    buffer: &'a [u8],
    max_frame_size: usize,
    sink: &mut Vec<Message>,
) -> &'a [u8] {
    let mut i = 0;
    while i < buffer.len() {
        match scan(&buffer[i..], max_frame_size) {
            Scan::Incomplete { .. } => break,
            Scan::Garbage => i += 1,
            Scan::Corrupt { len } => i += len,
            Scan::Oversized { len } => {
                if buffer.len() - i < len {
                    break;
                }
                i += len;
            }
            Scan::Frame { len } => {
                let body = Bytes::copy_from_slice(&buffer[i + PREFIX_LEN..i + len]);
                if let Some(message) = parse_body(body) {
                    sink.push(message);
                }
                i += len;
            }
        }
    }
    &buffer[i..]
}

/// What sits at the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// A frame may start here but is not fully buffered.
    Incomplete { needed: usize },
    /// Not a header; drop one byte.
    Garbage,
    /// A header with an unusable length; drop `len` bytes.
    Corrupt { len: usize },
    /// A frame of `len` bytes, prefix included, above the size limit.
    Oversized { len: usize },
    /// A whole frame of `len` bytes, prefix included.
    Frame { len: usize },
}

fn scan(buf: &[u8], max_frame_size: usize) -> Scan {
    if buf.len() < PREFIX_LEN {
        return Scan::Incomplete {
            needed: PREFIX_LEN - buf.len(),
        };
    }
    if &buf[..HEADER_LEN] != HEADER {
        return Scan::Garbage;
    }

    let declared = i32::from_be_bytes([
        buf[HEADER_LEN],
        buf[HEADER_LEN + 1],
        buf[HEADER_LEN + 2],
        buf[HEADER_LEN + 3],
    ]);
    if declared < 0 {
        return Scan::Corrupt { len: PREFIX_LEN };
    }
    let body_len = declared as usize;
    let len = PREFIX_LEN + body_len;
    if body_len > max_frame_size {
        return Scan::Oversized { len };
    }
    if buf.len() < len {
        return Scan::Incomplete {
            needed: len - buf.len(),
        };
    }
    Scan::Frame { len }
}

/// Split a frame body into a message. `None` if the field line is unusable.
fn parse_body(body: Bytes) -> Option<Message> {
    let (line_end, content_start) = match body.iter().position(|&b| b == LINE_END) {
        Some(pos) => (pos, pos + 1),
        None => (body.len(), body.len()),
    };

    let line = &body[..line_end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let line = std::str::from_utf8(line).ok()?;

    let mut fields = line.splitn(4, ' ');
    let kind = fields.next()?;
    let id = fields.next()?;
    let source = fields.next()?;
    let topic = fields.next()?;

    Some(Message::new(
        kind,
        id,
        source,
        topic,
        body.slice(content_start..),
    ))
}

/// Codec for Firetower frames.
///
/// Counts the frames and garbage bytes it had to drop so the owner can report
/// them. An oversized frame is discarded as its bytes arrive, never buffered.
#[derive(Debug, Clone)]
pub struct FireCodec {
    max_frame_size: usize,
    corrupt_frames: u64,
    skipped_bytes: u64,
    /// Bytes of an oversized frame still to be thrown away.
    discarding: usize,
}

impl FireCodec {
    /// Create a new codec with default max frame size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new codec with custom max frame size.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            corrupt_frames: 0,
            skipped_bytes: 0,
            discarding: 0,
        }
    }

    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Frames dropped since the last call.
    pub fn take_corrupt_frames(&mut self) -> u64 {
        std::mem::take(&mut self.corrupt_frames)
    }

    /// Garbage bytes skipped since the last call.
    pub fn take_skipped_bytes(&mut self) -> u64 {
        std::mem::take(&mut self.skipped_bytes)
    }
}

impl Default for FireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FireCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.discarding > 0 {
                let n = self.discarding.min(src.len());
                src.advance(n);
                self.discarding -= n;
                if self.discarding > 0 {
                    return Ok(None);
                }
            }

            match scan(src, self.max_frame_size) {
                Scan::Incomplete { needed } => {
                    src.reserve(needed);
                    return Ok(None);
                }
                Scan::Garbage => {
                    src.advance(1);
                    self.skipped_bytes += 1;
                }
                Scan::Corrupt { len } => {
                    src.advance(len);
                    self.corrupt_frames += 1;
                    debug!("dropped frame with negative length");
                }
                Scan::Oversized { len } => {
                    self.corrupt_frames += 1;
                    self.discarding = len;
                    debug!(len, max = self.max_frame_size, "dropping oversized frame");
                }
                Scan::Frame { len } => {
                    let frame = src.split_to(len).freeze();
                    match parse_body(frame.slice(PREFIX_LEN..)) {
                        Some(message) => return Ok(Some(message)),
                        None => {
                            self.corrupt_frames += 1;
                            debug!(len, "dropped frame with malformed field line");
                        }
                    }
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None => {
                if !src.is_empty() {
                    debug!(remaining = src.len(), "discarding partial frame at end of stream");
                    src.clear();
                }
                self.discarding = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<Message> for FireCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_into(
            &item.kind,
            &item.id,
            &item.source,
            &item.topic,
            Some(&item.payload[..]),
            self.max_frame_size,
            dst,
        )
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}
