//! PDU framing and value decoding.
//!
//! Two entry points: [`from_slice`] decodes exactly one PDU from a complete
//! buffer and rejects trailing bytes; [`StreamDecoder`] accepts arbitrarily
//! fragmented input and yields at most one value per [`StreamDecoder::poll`]
//! call, so the caller regains control between PDUs even when a subscription
//! burst lands in a single read.

use bytes::Bytes;
use thiserror::Error;

use super::accum::{AccumError, Accumulator, IntWidth};
use super::{Object, Tag, Value};

pub(crate) const PDU_HEADER: [u8; 2] = [0x00, 0x01];

/// Bytes of unread input attached to integer decode failures.
const DIAGNOSTIC_WINDOW: usize = 32;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Buffer(#[from] AccumError),

    #[error("invalid pdu header: expected 00 01, got {got:02x?}")]
    InvalidHeader { got: [u8; 2] },

    #[error(
        "invalid bser int encoding: tag {tag:#04x} (buf len {buf_len}, \
         {read_avail} readable at offset {read_offset}, next bytes {window:02x?})"
    )]
    InvalidIntTag {
        tag: u8,
        buf_len: usize,
        read_avail: usize,
        read_offset: usize,
        window: Vec<u8>,
    },

    #[error("unexpected bser tag {tag:#04x}")]
    UnexpectedTag { tag: u8 },

    #[error("expected string tag for {what}, got {tag:#04x}")]
    ExpectedString { what: &'static str, tag: u8 },

    #[error("expected array of template keys, got tag {tag:#04x}")]
    ExpectedKeyArray { tag: u8 },

    #[error("invalid {what} length {got}")]
    InvalidLength { what: &'static str, got: i64 },

    #[error("input ended before a complete pdu")]
    Truncated,

    #[error("{trailing} trailing bytes after decoded value")]
    TrailingBytes { trailing: usize },
}

/// Decode one complete PDU. Fails if `input` holds less or more than exactly
/// one PDU.
pub fn from_slice(input: &[u8]) -> Result<Value, DecodeError> {
    let mut decoder = StreamDecoder::new();
    decoder.feed(input);
    let value = decoder.poll()?.ok_or(DecodeError::Truncated)?;
    let trailing = decoder.buffered();
    if trailing > 0 {
        return Err(DecodeError::TrailingBytes { trailing });
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PduState {
    /// Waiting for header bytes plus the pdu length integer.
    NeedPdu,
    /// Header consumed; waiting for `pdu_len` payload bytes.
    FillPdu { pdu_len: usize },
}

/// Incremental PDU decoder.
///
/// Feed socket bytes in with [`feed`](Self::feed), then call
/// [`poll`](Self::poll) until it returns `None`. Each successful poll
/// consumes exactly one PDU; decode failures poison the stream and the
/// connection should be dropped.
pub struct StreamDecoder {
    acc: Accumulator,
    state: PduState,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            acc: Accumulator::new(8192),
            state: PduState::NeedPdu,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.acc.append(bytes);
    }

    /// Unconsumed byte count, including any partially accumulated PDU.
    pub fn buffered(&self) -> usize {
        self.acc.read_avail()
    }

    /// Try to produce the next value. `Ok(None)` means more input is needed.
    pub fn poll(&mut self) -> Result<Option<Value>, DecodeError> {
        if let PduState::NeedPdu = self.state {
            match self.frame_pdu()? {
                Some(pdu_len) => self.state = PduState::FillPdu { pdu_len },
                None => return Ok(None),
            }
        }

        let PduState::FillPdu { pdu_len } = self.state else {
            return Ok(None);
        };
        if self.acc.read_avail() < pdu_len {
            return Ok(None);
        }

        let value = decode_value(&mut self.acc)?;
        self.state = PduState::NeedPdu;
        Ok(Some(value))
    }

    /// Consume the header and length field, returning the payload length, or
    /// None (with the read cursor restored) when the length integer is not
    /// yet complete.
    fn frame_pdu(&mut self) -> Result<Option<usize>, DecodeError> {
        if self.acc.read_avail() < PDU_HEADER.len() {
            return Ok(None);
        }
        let header = self.acc.read_bytes(PDU_HEADER.len())?;
        if header.as_ref() != PDU_HEADER {
            return Err(DecodeError::InvalidHeader {
                got: [header[0], header[1]],
            });
        }

        match decode_int_relaxed(&mut self.acc)? {
            Some(len) => {
                let pdu_len = usize::try_from(len)
                    .map_err(|_| DecodeError::InvalidLength { what: "pdu", got: len })?;
                self.acc.reserve(pdu_len);
                Ok(Some(pdu_len))
            }
            None => {
                // Put the header back so the next poll starts clean.
                self.acc.read_advance(-(PDU_HEADER.len() as isize))?;
                Ok(None)
            }
        }
    }
}

/// Relaxed integer decode: `Ok(None)` when the tag or its payload has not
/// fully arrived, consuming nothing in that case.
fn decode_int_relaxed(acc: &mut Accumulator) -> Result<Option<i64>, DecodeError> {
    if acc.read_avail() < 1 {
        return Ok(None);
    }
    let tag_byte = acc.peek_u8()?;
    let width = int_width_or_error(acc, tag_byte)?;
    if acc.read_avail() < 1 + width.bytes() {
        return Ok(None);
    }
    acc.read_advance(1)?;
    Ok(Some(acc.read_int(width)?))
}

/// Strict integer decode: short input is an error.
fn decode_int(acc: &mut Accumulator) -> Result<i64, DecodeError> {
    let tag_byte = acc.peek_u8()?;
    let width = int_width_or_error(acc, tag_byte)?;
    acc.read_advance(1)?;
    Ok(acc.read_int(width)?)
}

fn int_width_or_error(acc: &Accumulator, tag_byte: u8) -> Result<IntWidth, DecodeError> {
    Tag::from_byte(tag_byte)
        .and_then(Tag::int_width)
        .ok_or_else(|| DecodeError::InvalidIntTag {
            tag: tag_byte,
            buf_len: acc.capacity(),
            read_avail: acc.read_avail(),
            read_offset: acc.read_offset(),
            window: acc.diagnostic_window(DIAGNOSTIC_WINDOW),
        })
}

fn decode_length(acc: &mut Accumulator, what: &'static str) -> Result<usize, DecodeError> {
    let raw = decode_int(acc)?;
    usize::try_from(raw).map_err(|_| DecodeError::InvalidLength { what, got: raw })
}

fn decode_value(acc: &mut Accumulator) -> Result<Value, DecodeError> {
    let tag_byte = acc.peek_u8()?;
    let tag = Tag::from_byte(tag_byte).ok_or(DecodeError::UnexpectedTag { tag: tag_byte })?;
    match tag {
        Tag::Int8 | Tag::Int16 | Tag::Int32 | Tag::Int64 => Ok(Value::Integer(decode_int(acc)?)),
        Tag::Real => {
            acc.read_advance(1)?;
            Ok(Value::Real(acc.read_double()?))
        }
        Tag::True => {
            acc.read_advance(1)?;
            Ok(Value::Bool(true))
        }
        Tag::False => {
            acc.read_advance(1)?;
            Ok(Value::Bool(false))
        }
        Tag::Null => {
            acc.read_advance(1)?;
            Ok(Value::Null)
        }
        Tag::String => Ok(Value::String(decode_string(acc, "string")?)),
        Tag::Array => {
            acc.read_advance(1)?;
            Ok(Value::Array(decode_array_body(acc)?))
        }
        Tag::Object => {
            acc.read_advance(1)?;
            let count = decode_length(acc, "object")?;
            let mut obj = Object::with_capacity(count);
            for _ in 0..count {
                let key = decode_string(acc, "object key")?;
                let value = decode_value(acc)?;
                obj.insert(key, value);
            }
            Ok(Value::Object(obj))
        }
        Tag::Template => {
            acc.read_advance(1)?;
            decode_template_body(acc)
        }
        Tag::Skip => Err(DecodeError::UnexpectedTag { tag: tag_byte }),
    }
}

/// Decode a STRING value, tag included.
fn decode_string(acc: &mut Accumulator, what: &'static str) -> Result<Bytes, DecodeError> {
    let tag_byte = acc.peek_u8()?;
    if Tag::from_byte(tag_byte) != Some(Tag::String) {
        return Err(DecodeError::ExpectedString {
            what,
            tag: tag_byte,
        });
    }
    acc.read_advance(1)?;
    let len = decode_length(acc, "string")?;
    Ok(acc.read_bytes(len)?)
}

/// Decode an ARRAY body (the tag byte is already consumed).
fn decode_array_body(acc: &mut Accumulator) -> Result<Vec<Value>, DecodeError> {
    let count = decode_length(acc, "array")?;
    let mut items = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        items.push(decode_value(acc)?);
    }
    Ok(items)
}

/// Template: shared key list, then row x key slots where SKIP marks an
/// absent property. Decodes to an array of objects.
fn decode_template_body(acc: &mut Accumulator) -> Result<Value, DecodeError> {
    let keys_tag = acc.peek_u8()?;
    if Tag::from_byte(keys_tag) != Some(Tag::Array) {
        return Err(DecodeError::ExpectedKeyArray { tag: keys_tag });
    }
    acc.read_advance(1)?;
    let key_count = decode_length(acc, "template keys")?;
    let mut keys = Vec::with_capacity(key_count.min(4096));
    for _ in 0..key_count {
        keys.push(decode_string(acc, "template key")?);
    }

    let row_count = decode_length(acc, "template rows")?;
    let mut rows = Vec::with_capacity(row_count.min(4096));
    for _ in 0..row_count {
        let mut obj = Object::with_capacity(keys.len());
        for key in &keys {
            if Tag::from_byte(acc.peek_u8()?) == Some(Tag::Skip) {
                acc.read_advance(1)?;
                continue;
            }
            obj.insert(key.clone(), decode_value(acc)?);
        }
        rows.push(Value::Object(obj));
    }
    Ok(Value::Array(rows))
}
