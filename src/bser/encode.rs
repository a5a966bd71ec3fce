//! PDU encoding.
//!
//! Emits the header `00 01`, an INT32 length field (written as a placeholder
//! and back-patched once the payload size is known), then one value. The
//! length is always INT32 so the patch never has to move bytes.

use bytes::Bytes;
use thiserror::Error;

use super::accum::{Accumulator, IntWidth};
use super::decode::PDU_HEADER;
use super::{Tag, Value};

/// Header + INT32 length field; the length value is `write_offset - 7`.
const PDU_PREFIX_LEN: usize = 7;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cannot serialize type {kind}")]
    Unserializable { kind: &'static str },

    #[error("pdu payload of {bytes} bytes exceeds the int32 length field")]
    PduTooLarge { bytes: usize },

    #[error("{source} (while serializing object property with name '{key}')")]
    Property {
        key: String,
        #[source]
        source: Box<EncodeError>,
    },
}

/// Encode one value as a complete PDU.
pub fn encode(value: &Value) -> Result<Bytes, EncodeError> {
    let mut acc = Accumulator::new(256);
    acc.append(&PDU_HEADER);
    acc.write_u8(Tag::Int32 as u8);
    let len_slot = acc.write_offset();
    acc.write_int(0, IntWidth::W4);

    dump_value(&mut acc, value)?;

    let payload_len = acc.write_offset() - PDU_PREFIX_LEN;
    let patched = i32::try_from(payload_len)
        .map_err(|_| EncodeError::PduTooLarge { bytes: payload_len })?;
    acc.patch_int(len_slot, patched as i64, IntWidth::W4);
    Ok(Bytes::from(acc.into_written()))
}

fn dump_value(acc: &mut Accumulator, value: &Value) -> Result<(), EncodeError> {
    match value {
        Value::Null => acc.write_u8(Tag::Null as u8),
        Value::Bool(true) => acc.write_u8(Tag::True as u8),
        Value::Bool(false) => acc.write_u8(Tag::False as u8),
        Value::Integer(v) => dump_int(acc, *v),
        Value::Int64(v) => {
            // Full width regardless of magnitude: the caller asked for INT64.
            acc.write_u8(Tag::Int64 as u8);
            acc.write_int(v.get(), IntWidth::W8);
        }
        Value::Real(v) => dump_real(acc, *v),
        Value::String(bytes) => dump_string(acc, bytes),
        Value::Array(items) => {
            acc.write_u8(Tag::Array as u8);
            dump_int(acc, items.len() as i64);
            for item in items {
                dump_value(acc, item)?;
            }
        }
        Value::Object(obj) => {
            // Undefined-valued properties are erased: one pass counts the
            // survivors, a second emits exactly those pairs.
            let present = |entry: &(&bytes::Bytes, &Value)| !matches!(entry.1, Value::Undefined);
            let count = obj.iter().filter(present).count();
            acc.write_u8(Tag::Object as u8);
            dump_int(acc, count as i64);
            for (key, value) in obj.iter().filter(present) {
                dump_string(acc, key);
                dump_value(acc, value).map_err(|source| EncodeError::Property {
                    key: String::from_utf8_lossy(key).into_owned(),
                    source: Box::new(source),
                })?;
            }
        }
        Value::Undefined => {
            return Err(EncodeError::Unserializable {
                kind: value.kind(),
            });
        }
    }
    Ok(())
}

/// Smallest-width encoding whose range contains `|v|`. The absolute-value
/// check is deliberate: -128 rides as INT16 for parity with the reference
/// encoder, which keeps the width choice symmetric across zero.
fn dump_int(acc: &mut Accumulator, v: i64) {
    let magnitude = v.unsigned_abs();
    if magnitude <= i8::MAX as u64 {
        acc.write_u8(Tag::Int8 as u8);
        acc.write_int(v, IntWidth::W1);
    } else if magnitude <= i16::MAX as u64 {
        acc.write_u8(Tag::Int16 as u8);
        acc.write_int(v, IntWidth::W2);
    } else if magnitude <= i32::MAX as u64 {
        acc.write_u8(Tag::Int32 as u8);
        acc.write_int(v, IntWidth::W4);
    } else {
        acc.write_u8(Tag::Int64 as u8);
        acc.write_int(v, IntWidth::W8);
    }
}

/// Integral finite reals are narrowed to the integer encoding so `1` and
/// `1.0` produce identical bytes.
fn dump_real(acc: &mut Accumulator, v: f64) {
    const I64_RANGE: f64 = 9_223_372_036_854_775_808.0; // 2^63
    if v.is_finite() && v == v.trunc() && v >= -I64_RANGE && v < I64_RANGE {
        dump_int(acc, v as i64);
    } else {
        acc.write_u8(Tag::Real as u8);
        acc.write_double(v);
    }
}

fn dump_string(acc: &mut Accumulator, bytes: &[u8]) {
    acc.write_u8(Tag::String as u8);
    dump_int(acc, bytes.len() as i64);
    acc.append(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bser::{Int64, Object};

    #[test]
    fn canonical_bytes_for_one() {
        let encoded = encode(&Value::Integer(1)).unwrap();
        let mut expected = vec![0x00, 0x01, 0x05];
        expected.extend_from_slice(&2i32.to_ne_bytes());
        expected.extend_from_slice(&[0x03, 0x01]);
        assert_eq!(encoded.as_ref(), expected.as_slice());
    }

    #[test]
    fn canonical_bytes_for_one_point_one() {
        let encoded = encode(&Value::Real(1.1)).unwrap();
        let mut expected = vec![0x00, 0x01, 0x05];
        expected.extend_from_slice(&9i32.to_ne_bytes());
        expected.push(0x07);
        expected.extend_from_slice(&1.1f64.to_ne_bytes());
        assert_eq!(encoded.as_ref(), expected.as_slice());
    }

    #[test]
    fn integer_width_selection_uses_absolute_value() {
        let cases: &[(i64, u8)] = &[
            (127, Tag::Int8 as u8),
            (128, Tag::Int16 as u8),
            (-128, Tag::Int16 as u8),
            (32767, Tag::Int16 as u8),
            (32768, Tag::Int32 as u8),
            (2_147_483_647, Tag::Int32 as u8),
            (2_147_483_648, Tag::Int64 as u8),
            (i64::MIN, Tag::Int64 as u8),
        ];
        for (value, tag) in cases {
            let encoded = encode(&Value::Integer(*value)).unwrap();
            assert_eq!(encoded[7], *tag, "wrong width tag for {value}");
        }
    }

    #[test]
    fn integral_real_matches_integer_bytes() {
        assert_eq!(
            encode(&Value::Integer(1)).unwrap(),
            encode(&Value::Real(1.0)).unwrap()
        );
        // A fractional real keeps the REAL tag.
        assert_eq!(encode(&Value::Real(1.1)).unwrap()[7], Tag::Real as u8);
    }

    #[test]
    fn int64_carrier_pins_full_width() {
        let encoded = encode(&Value::Int64(Int64::new(1))).unwrap();
        assert_eq!(encoded[7], Tag::Int64 as u8);
        assert_eq!(encoded.len(), 7 + 1 + 8);
    }

    #[test]
    fn pdu_envelope_length_is_total_minus_seven() {
        let value = Value::Array(vec![Value::from("hello"), Value::Integer(42)]);
        let encoded = encode(&value).unwrap();
        assert_eq!(&encoded[..2], &[0x00, 0x01]);
        assert_eq!(encoded[2], 0x05);
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&encoded[3..7]);
        assert_eq!(i32::from_ne_bytes(raw) as usize, encoded.len() - 7);
    }

    #[test]
    fn undefined_object_properties_are_erased() {
        let mut obj = Object::new();
        obj.insert("x", Value::Undefined);
        let decoded = crate::bser::from_slice(&encode(&Value::Object(obj)).unwrap()).unwrap();
        assert_eq!(decoded, Value::Object(Object::new()));

        let mut mixed = Object::new();
        mixed.insert("keep", Value::Integer(1));
        mixed.insert("drop", Value::Undefined);
        let decoded = crate::bser::from_slice(&encode(&Value::Object(mixed)).unwrap()).unwrap();
        let obj = decoded.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj.get("keep"), Some(&Value::Integer(1)));
    }

    #[test]
    fn bare_undefined_is_unserializable() {
        let err = encode(&Value::Undefined).unwrap_err();
        assert_eq!(err.to_string(), "cannot serialize type undefined");
    }

    #[test]
    fn nested_failure_names_the_property() {
        let mut obj = Object::new();
        obj.insert("inner", Value::Array(vec![Value::Undefined]));
        let err = encode(&Value::Object(obj)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot serialize type undefined (while serializing object property with name 'inner')"
        );
    }

    #[test]
    fn string_length_counts_bytes_not_chars() {
        let encoded = encode(&Value::from("héllo")).unwrap();
        // Tag, then INT8 length of the utf-8 byte run.
        assert_eq!(encoded[7], Tag::String as u8);
        assert_eq!(encoded[8], Tag::Int8 as u8);
        assert_eq!(encoded[9], "héllo".len() as u8);
        assert_eq!(encoded[9], 6);
    }
}
