//! Wire framing for the object codec.
//!
//! Every element is `header || payload`. The header is one preheader byte
//! packing the bit widths of the identifier and length fields plus the 2-bit
//! payload type, followed by those two fields MSB-first, left-aligned in a
//! big-endian 64-bit word and truncated to whole bytes:
//!
//! ```text
//! (id_size:3)(length_size:3)(type:2) (id:id_size)(length:length_size)
//! ```
//!
//! The stored widths are multiples of 4 bits with `0` meaning 32; when their
//! sum is not a whole number of bytes both sides widen each field by 2 bits,
//! so the adjustment never has to be transmitted.

use std::cmp;

use super::Error;

pub const TYPE_TUPLE: u8 = 0;
pub const TYPE_BYTES: u8 = 1;
pub const TYPE_INTEGER: u8 = 2;

/// Decoded preheader byte: field widths in bits and the payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreHeader {
    pub id_size: u32,
    pub length_size: u32,
    pub kind: u8,
}

/// Fully decoded element header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u64,
    pub kind: u8,
    pub length: u64,
}

/// One framed unit of the stream with its payload decoded.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Element {
    pub(crate) id: u64,
    pub(crate) payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    Integer(i64),
    Bytes(Vec<u8>),
    /// A composite body: identifiers of the referenced elements.
    Refs(Vec<u64>),
}

impl Payload {
    fn kind(&self) -> u8 {
        match self {
            Payload::Refs(..) => TYPE_TUPLE,
            Payload::Bytes(..) => TYPE_BYTES,
            Payload::Integer(..) => TYPE_INTEGER,
        }
    }
}

/// Decodes the first header byte.
pub fn unpack_preheader(byte: u8) -> PreHeader {
    let kind = byte & 0b11;
    let mut length_size = u32::from(byte & 0b0001_1100);
    if length_size == 0 {
        length_size = 32;
    }
    let mut id_size = u32::from(byte & 0b1110_0000) >> 3;
    if id_size == 0 {
        id_size = 32;
    }
    // The stored widths drop their 2-bit part; it is implied by the sum not
    // landing on a byte boundary.
    if (id_size + length_size) % 8 != 0 {
        id_size += 2;
        length_size += 2;
    }
    PreHeader {
        id_size,
        length_size,
        kind,
    }
}

fn bit_len(value: u64) -> u32 {
    u64::BITS - value.leading_zeros()
}

/// Picks transmittable field widths for `id` and `length`: at least 4 bits,
/// even, and either both a multiple of 4 or both offset by the implied 2-bit
/// widening (the sum is always a whole number of bytes).
fn packed_sizes(id: u64, length: u64) -> (u32, u32) {
    let mut id_size = cmp::max(bit_len(id), 4);
    let mut length_size = cmp::max(bit_len(length), 4);

    if id_size & 1 != 0 {
        id_size += 1;
    }
    if length_size & 1 != 0 {
        length_size += 1;
    }

    if id_size & 3 != 0 {
        if length_size & 3 == 0 {
            id_size += 2;
        }
    } else if length_size & 3 != 0 {
        length_size += 2;
    }

    if (id_size + length_size) & 7 != 0 {
        id_size += 2;
        length_size += 2;
    }

    (id_size, length_size)
}

/// Encodes an element header.
pub fn marshal_header(id: u64, kind: u8, length: u64) -> Vec<u8> {
    assert!(kind <= 3, "wire type out of range");
    assert!(id < 1 << 32, "identifier exceeds 32 bits");
    assert!(length < 1 << 32, "length exceeds 32 bits");

    let (id_size, length_size) = packed_sizes(id, length);
    let mut word = 0u64;
    word |= id << (64 - id_size);
    word |= length << (64 - id_size - length_size);

    let ext = ((id_size + length_size) / 8) as usize;
    let mut out = Vec::with_capacity(1 + ext);
    out.push((((id_size << 3) & 0xE0) as u8) | ((length_size & 0x1C) as u8) | kind);
    out.extend_from_slice(&word.to_be_bytes()[..ext]);
    out
}

fn length_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Decodes a header from the front of `data`, returning it together with
/// the number of bytes it occupied.
pub fn parse_header(data: &[u8]) -> Result<(Header, usize), Error> {
    let first = *data.first().ok_or(Error::TruncatedHeader)?;
    let pre = unpack_preheader(first);
    let total = pre.id_size + pre.length_size;
    if total > 64 {
        return Err(Error::OversizedHeader);
    }
    let ext = (total / 8) as usize;
    if data.len() < 1 + ext {
        return Err(Error::TruncatedHeader);
    }

    let mut word = [0u8; 8];
    word[..ext].copy_from_slice(&data[1..1 + ext]);
    let word = u64::from_be_bytes(word);

    let id = word >> (64 - pre.id_size);
    let length = (word >> (64 - total)) & length_mask(pre.length_size);
    Ok((
        Header {
            id,
            kind: pre.kind,
            length,
        },
        1 + ext,
    ))
}

/// Minimal little-endian sign-magnitude encoding with the sign in the least
/// significant bit; zero encodes as no bytes at all.
pub fn int_to_bytes(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    // Widen through u128: the shifted magnitude of `i64::MIN` needs 65 bits.
    let mut u = (u128::from(n.unsigned_abs()) << 1) | u128::from(n < 0);
    let mut out = Vec::new();
    while u != 0 {
        out.push(u as u8);
        u >>= 8;
    }
    out
}

/// Inverse of [`int_to_bytes`].
pub fn bytes_to_int(data: &[u8]) -> Result<i64, Error> {
    if data.len() > 9 {
        return Err(Error::IntegerOutOfRange);
    }
    let mut u = 0u128;
    for (pos, &byte) in data.iter().enumerate() {
        u |= u128::from(byte) << (8 * pos);
    }
    let magnitude = u >> 1;
    if u & 1 != 0 {
        if magnitude > u128::from(i64::MIN.unsigned_abs()) {
            return Err(Error::IntegerOutOfRange);
        }
        Ok((magnitude as i64).wrapping_neg())
    } else {
        if magnitude > i64::MAX as u128 {
            return Err(Error::IntegerOutOfRange);
        }
        Ok(magnitude as i64)
    }
}

fn marshal_payload(payload: &Payload) -> Vec<u8> {
    match payload {
        Payload::Bytes(data) => data.clone(),
        Payload::Integer(n) => int_to_bytes(*n),
        Payload::Refs(ids) => {
            if ids.is_empty() {
                return Vec::new();
            }
            let largest = ids.iter().copied().max().unwrap_or(0);
            let mut out = Vec::with_capacity(1 + ids.len() * 4);
            if largest < 1 << 8 {
                out.push(0);
                out.extend(ids.iter().map(|&id| id as u8));
            } else if largest < 1 << 16 {
                out.push(1);
                for &id in ids {
                    out.extend_from_slice(&(id as u16).to_be_bytes());
                }
            } else {
                assert!(largest < 1 << 32, "identifier exceeds 32 bits");
                out.push(2);
                for &id in ids {
                    out.extend_from_slice(&(id as u32).to_be_bytes());
                }
            }
            out
        }
    }
}

/// Appends the framed encoding of `element` to `out`.
pub(crate) fn marshal(out: &mut Vec<u8>, element: &Element) {
    let data = marshal_payload(&element.payload);
    out.extend_from_slice(&marshal_header(
        element.id,
        element.payload.kind(),
        data.len() as u64,
    ));
    out.extend_from_slice(&data);
}

fn unmarshal_refs(data: &[u8]) -> Result<Vec<u64>, Error> {
    let Some((&selector, body)) = data.split_first() else {
        return Ok(Vec::new());
    };
    match selector {
        0 => Ok(body.iter().map(|&id| u64::from(id)).collect()),
        1 => {
            if body.len() % 2 != 0 {
                return Err(Error::MalformedRefs);
            }
            Ok(body
                .chunks_exact(2)
                .map(|pair| u64::from(u16::from_be_bytes([pair[0], pair[1]])))
                .collect())
        }
        2 => {
            if body.len() % 4 != 0 {
                return Err(Error::MalformedRefs);
            }
            Ok(body
                .chunks_exact(4)
                .map(|quad| u64::from(u32::from_be_bytes([quad[0], quad[1], quad[2], quad[3]])))
                .collect())
        }
        _ => Err(Error::MalformedRefs),
    }
}

/// Decodes `data` as a sequence of elements.
pub(crate) fn unmarshal(data: &[u8]) -> Unmarshal<'_> {
    Unmarshal { data, pos: 0 }
}

pub(crate) struct Unmarshal<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Iterator for Unmarshal<'_> {
    type Item = Result<Element, Error>;

    fn next(&mut self) -> Option<Result<Element, Error>> {
        if self.pos == self.data.len() {
            return None;
        }
        let result = self.parse_one();
        if result.is_err() {
            // Fuse after a framing error, resynchronisation is impossible.
            self.pos = self.data.len();
        }
        Some(result)
    }
}

impl Unmarshal<'_> {
    fn parse_one(&mut self) -> Result<Element, Error> {
        let (header, consumed) = parse_header(&self.data[self.pos..])?;
        let start = self.pos + consumed;
        let end = start + header.length as usize;
        if end > self.data.len() {
            return Err(Error::TruncatedPayload);
        }
        let body = &self.data[start..end];

        let payload = match header.kind {
            TYPE_BYTES => Payload::Bytes(body.to_vec()),
            TYPE_INTEGER => Payload::Integer(bytes_to_int(body)?),
            TYPE_TUPLE => Payload::Refs(unmarshal_refs(body)?),
            kind => return Err(Error::UnknownType(kind)),
        };
        self.pos = end;
        Ok(Element {
            id: header.id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_preheader_byte_means_full_width() {
        assert_eq!(
            unpack_preheader(0),
            PreHeader {
                id_size: 32,
                length_size: 32,
                kind: 0
            }
        );
    }

    #[test]
    fn header_round_trips_edge_values() {
        for &(id, kind, length) in &[
            (0, 0, 0),
            (0, 3, 0),
            (1, 1, 1),
            (255, 2, 256),
            (4095, 0, 7),
            (65536, 1, 65535),
            (u64::from(u32::MAX), 2, u64::from(u32::MAX)),
        ] {
            let encoded = marshal_header(id, kind, length);
            let (header, consumed) = parse_header(&encoded).unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(
                header,
                Header { id, kind, length },
                "({}, {}, {})",
                id,
                kind,
                length
            );
        }
    }

    #[test]
    fn truncated_header_is_rejected() {
        let encoded = marshal_header(300, 1, 70000);
        assert!(matches!(
            parse_header(&encoded[..2]),
            Err(Error::TruncatedHeader)
        ));
        assert!(matches!(parse_header(&[]), Err(Error::TruncatedHeader)));
    }

    #[test]
    fn integers_round_trip() {
        for n in [0, 1, -1, 2, 127, 128, -128, 300, -300, i64::MAX, i64::MIN] {
            assert_eq!(bytes_to_int(&int_to_bytes(n)).unwrap(), n, "{}", n);
        }
        assert!(int_to_bytes(0).is_empty());
    }

    #[test]
    fn oversized_integer_is_rejected() {
        let mut encoded = int_to_bytes(i64::MAX);
        encoded.push(0xFF);
        encoded.push(0xFF);
        assert!(matches!(
            bytes_to_int(&encoded),
            Err(Error::IntegerOutOfRange)
        ));
    }

    #[test]
    fn refs_choose_the_narrowest_width() {
        for (ids, selector) in [
            (vec![0, 1, 255], 0u8),
            (vec![0, 256], 1),
            (vec![0, 65536], 2),
        ] {
            let data = marshal_payload(&Payload::Refs(ids.clone()));
            assert_eq!(data[0], selector);
            assert_eq!(unmarshal_refs(&data).unwrap(), ids);
        }
        assert!(marshal_payload(&Payload::Refs(Vec::new())).is_empty());
        assert_eq!(unmarshal_refs(&[]).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn misaligned_refs_are_rejected() {
        assert!(matches!(
            unmarshal_refs(&[1, 0, 1, 0]),
            Err(Error::MalformedRefs)
        ));
        assert!(matches!(
            unmarshal_refs(&[2, 0, 0, 1]),
            Err(Error::MalformedRefs)
        ));
    }

    #[test]
    fn elements_survive_a_marshal_cycle() {
        let elements = [
            Element {
                id: 0,
                payload: Payload::Refs(vec![1, 2, 3]),
            },
            Element {
                id: 1,
                payload: Payload::Bytes(b"tuple".to_vec()),
            },
            Element {
                id: 2,
                payload: Payload::Integer(-42),
            },
            Element {
                id: 3,
                payload: Payload::Integer(0),
            },
        ];
        let mut encoded = Vec::new();
        for element in &elements {
            marshal(&mut encoded, element);
        }
        let decoded: Result<Vec<_>, _> = unmarshal(&encoded).collect();
        assert_eq!(decoded.unwrap(), elements);
    }

    #[test]
    fn trailing_garbage_is_a_truncated_payload() {
        let mut encoded = Vec::new();
        marshal(
            &mut encoded,
            &Element {
                id: 7,
                payload: Payload::Bytes(b"data".to_vec()),
            },
        );
        encoded.truncate(encoded.len() - 1);
        let last: Result<Vec<_>, _> = unmarshal(&encoded).collect();
        assert!(matches!(last, Err(Error::TruncatedPayload)));
    }
}
