//! Register codec: raw holding-register words to typed, scaled values and back.
//!
//! Devices deliver 32-bit quantities high word first, while bytes inside a
//! word are assembled little-endian. Decoding therefore swaps the first two
//! words of every int32/float32 read before building the byte sequence.

use crate::tags::{DataType, ScaleAlgorithm, TagDescriptor, TagId};
use crate::value::DecodedValue;
use thiserror::Error;

const INT16_RAW_MAX: f64 = 65_535.0;
const INT32_RAW_MAX: f64 = 2_147_483_647.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("tag {tag_id}: {data_type} needs {needed} bytes, register data has {available}")]
    Insufficient {
        tag_id: TagId,
        data_type: DataType,
        needed: usize,
        available: usize,
    },
    #[error("tag {tag_id}: bit index {bit} outside 0..=15")]
    BitIndex { tag_id: TagId, bit: u8 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("tag {tag_id}: cannot write {value} to a {data_type} tag")]
    Incompatible {
        tag_id: TagId,
        data_type: DataType,
        value: DecodedValue,
    },
    #[error("tag {tag_id}: {value} does not fit a {data_type} register")]
    OutOfRange {
        tag_id: TagId,
        data_type: DataType,
        value: DecodedValue,
    },
    #[error("tag {tag_id}: {len} characters exceed the {capacity}-character tag")]
    TooLong {
        tag_id: TagId,
        len: usize,
        capacity: usize,
    },
    #[error("tag {tag_id}: bit index {bit} outside 0..=15")]
    BitIndex { tag_id: TagId, bit: u8 },
}

/// Register payload for one tag write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePayload {
    /// Set or clear one bit of a register, preserving the others.
    Bit { bit: u8, on: bool },
    /// Overwrite consecutive registers starting at the tag address.
    Words(Vec<u16>),
}

/// Decode raw words for `tag` without scaling.
pub fn decode(tag: &TagDescriptor, raw: &[u16]) -> Result<DecodedValue, DecodeError> {
    let len = usize::from(tag.effective_length()).min(raw.len());
    let mut words = raw[..len].to_vec();
    if tag.data_type.is_wide() && words.len() >= 2 {
        words.swap(0, 1);
    }
    let bytes = words_to_bytes(&words);

    let need = |needed: usize| -> Result<(), DecodeError> {
        if bytes.len() < needed {
            Err(DecodeError::Insufficient {
                tag_id: tag.id,
                data_type: tag.data_type,
                needed,
                available: bytes.len(),
            })
        } else {
            Ok(())
        }
    };

    match tag.data_type {
        DataType::Bit => {
            if tag.bit_index > 15 {
                return Err(DecodeError::BitIndex {
                    tag_id: tag.id,
                    bit: tag.bit_index,
                });
            }
            need(2)?;
            let word = u16::from_le_bytes([bytes[0], bytes[1]]);
            Ok(DecodedValue::Bool((word >> tag.bit_index) & 1 == 1))
        }
        DataType::Int16 => {
            need(2)?;
            Ok(DecodedValue::Int16(i16::from_le_bytes([bytes[0], bytes[1]])))
        }
        DataType::Int32 => {
            need(4)?;
            Ok(DecodedValue::Int32(i32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])))
        }
        DataType::Float32 => {
            need(4)?;
            Ok(DecodedValue::Float32(f32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])))
        }
        DataType::String => {
            let text: String = bytes
                .iter()
                .map(|b| if b.is_ascii() { char::from(*b) } else { '?' })
                .collect();
            Ok(DecodedValue::Str(text.trim_end_matches('\0').to_string()))
        }
    }
}

/// Apply the tag's scaling algorithm.
///
/// Only int16 and int32 values are linearly scaled; everything else passes
/// through untouched whatever the configured algorithm. Int16 registers are
/// scaled over their unsigned word range 0..=65535.
pub fn apply_scale(tag: &TagDescriptor, value: DecodedValue) -> DecodedValue {
    if tag.scale != ScaleAlgorithm::Linear {
        return value;
    }
    let (raw, raw_max) = match value {
        DecodedValue::Int16(v) => (f64::from(v as u16), INT16_RAW_MAX),
        DecodedValue::Int32(v) => (f64::from(v), INT32_RAW_MAX),
        other => return other,
    };
    DecodedValue::Float32(linear(raw, raw_max, tag.offset, tag.span) as f32)
}

fn linear(raw: f64, raw_max: f64, offset: f64, span: f64) -> f64 {
    let raw_min = 0.0;
    let eng_min = offset;
    let eng_max = offset + span;
    let raw_range = raw_max - raw_min;
    if raw_range.abs() < f64::EPSILON {
        return eng_min;
    }
    (raw - raw_min) * (eng_max - eng_min) / raw_range + eng_min
}

/// Inverse of [`linear`]; a zero span maps everything to raw zero.
fn unscale(value: f64, raw_max: f64, offset: f64, span: f64) -> f64 {
    if span.abs() < f64::EPSILON {
        return 0.0;
    }
    (value - offset) * raw_max / span
}

pub fn decode_scaled(tag: &TagDescriptor, raw: &[u16]) -> Result<DecodedValue, DecodeError> {
    decode(tag, raw).map(|v| apply_scale(tag, v))
}

/// Convert a client value into the register payload for `tag`.
///
/// Values that do not fit the register after un-scaling and rounding are
/// rejected, never clamped. Strings longer than the tag are rejected too.
pub fn encode(tag: &TagDescriptor, value: &DecodedValue) -> Result<WritePayload, EncodeError> {
    let incompatible = || EncodeError::Incompatible {
        tag_id: tag.id,
        data_type: tag.data_type,
        value: value.clone(),
    };
    let out_of_range = || EncodeError::OutOfRange {
        tag_id: tag.id,
        data_type: tag.data_type,
        value: value.clone(),
    };
    let fit = |v: f64, min: f64, max: f64| {
        let r = v.round();
        if (min..=max).contains(&r) {
            Ok(r)
        } else {
            Err(out_of_range())
        }
    };
    let linear_scaled = tag.scale == ScaleAlgorithm::Linear;

    match tag.data_type {
        DataType::Bit => {
            if tag.bit_index > 15 {
                return Err(EncodeError::BitIndex {
                    tag_id: tag.id,
                    bit: tag.bit_index,
                });
            }
            Ok(WritePayload::Bit {
                bit: tag.bit_index,
                on: value.is_truthy(),
            })
        }
        DataType::Int16 => {
            let v = value.as_f64().ok_or_else(incompatible)?;
            let word = if linear_scaled {
                let raw = unscale(v, INT16_RAW_MAX, tag.offset, tag.span);
                fit(raw, 0.0, INT16_RAW_MAX)? as u16
            } else {
                fit(v, f64::from(i16::MIN), f64::from(i16::MAX))? as i16 as u16
            };
            Ok(WritePayload::Words(vec![word]))
        }
        DataType::Int32 => {
            let v = value.as_f64().ok_or_else(incompatible)?;
            let v = if linear_scaled {
                unscale(v, INT32_RAW_MAX, tag.offset, tag.span)
            } else {
                v
            };
            let raw = fit(v, f64::from(i32::MIN), f64::from(i32::MAX))? as i32;
            Ok(WritePayload::Words(split_high_first(raw as u32).to_vec()))
        }
        DataType::Float32 => {
            let v = value.as_f64().ok_or_else(incompatible)?;
            let f = v as f32;
            if !f.is_finite() {
                return Err(out_of_range());
            }
            Ok(WritePayload::Words(split_high_first(f.to_bits()).to_vec()))
        }
        DataType::String => {
            let text = match value {
                DecodedValue::Str(s) => s.clone(),
                other => other.to_string(),
            };
            if !text.is_ascii() {
                return Err(incompatible());
            }
            let capacity = usize::from(tag.effective_length()) * 2;
            if text.len() > capacity {
                return Err(EncodeError::TooLong {
                    tag_id: tag.id,
                    len: text.len(),
                    capacity,
                });
            }
            let mut bytes = text.into_bytes();
            bytes.resize(capacity, 0);
            Ok(WritePayload::Words(bytes_to_words(&bytes)))
        }
    }
}

/// Set or clear `bit` in `word`.
pub fn set_bit(word: u16, bit: u8, on: bool) -> u16 {
    let mask = 1u16 << (bit & 0x0F);
    if on {
        word | mask
    } else {
        word & !mask
    }
}

/// Split a 32-bit pattern into two registers in device (high-first) order.
pub fn split_high_first(bits: u32) -> [u16; 2] {
    [(bits >> 16) as u16, bits as u16]
}

fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|c| u16::from_le_bytes([c[0], *c.get(1).unwrap_or(&0)]))
        .collect()
}
