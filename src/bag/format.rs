//! On-disk Bag record formats (spec §4.2, §6).
//!
//! - **v1** — `u32 key, u32 counter`. Original, 32-bit-counter layout.
//! - **v2** — `u32 key, u64 counter`. Wider counters, compression
//!   forbidden (kept for reading old files written before compression
//!   support existed for this format).
//! - **v3** — same layout as v2, compression allowed.
//! - **v4** — variable width: a header entry (id 6) declares
//!   `key_length`/`counter_length` in bytes (1, 2, 4, or 16 for keys; 4 or
//!   8 for counters), and records are packed at that width. This is the
//!   only format that can hold 16-byte (IPv6-mapped) keys.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::error::BagError;
use crate::stream::header::HeaderEntryCodec;
use crate::stream::{Endian, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
}

impl FormatVersion {
    pub fn from_u8(v: u8) -> Result<Self, BagError> {
        match v {
            1 => Ok(FormatVersion::V1),
            2 => Ok(FormatVersion::V2),
            3 => Ok(FormatVersion::V3),
            4 => Ok(FormatVersion::V4),
            _ => Err(BagError::Header),
        }
    }

    pub fn allows_compression(self) -> bool {
        !matches!(self, FormatVersion::V2)
    }

    pub fn key_width(self) -> Option<usize> {
        match self {
            FormatVersion::V1 | FormatVersion::V2 | FormatVersion::V3 => Some(4),
            FormatVersion::V4 => None, // carried by ShapeEntry
        }
    }

    pub fn counter_width(self) -> usize {
        match self {
            FormatVersion::V1 => 4,
            FormatVersion::V2 | FormatVersion::V3 => 8,
            FormatVersion::V4 => 8, // default; overridden by ShapeEntry for v4
        }
    }
}

/// Choose the default write format for a key width: v3 when the key fits
/// in 4 octets (spec.md: "Writer chooses v3 when key_octets <= 4,
/// otherwise v4"), v4 otherwise — the only format able to carry a 16-byte
/// key.
pub fn select_format(key_octets: u8) -> FormatVersion {
    if key_octets <= 4 {
        FormatVersion::V3
    } else {
        FormatVersion::V4
    }
}

/// Semantic tag for a Bag's key or counter column (spec glossary: "Field
/// type"), recorded in the file header for display purposes only — the
/// engine treats every key as an unsigned integer or 16-byte blob and every
/// counter as a `u64` regardless of what's tagged here. `Custom` carries
/// any code this build doesn't have a name for, so round-tripping a file
/// written by a newer or differently-configured writer never loses data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    SIPv4,
    DIPv4,
    SIPv6,
    DIPv6,
    SPort,
    DPort,
    Protocol,
    Packets,
    Bytes,
    Flags,
    StartTime,
    EndTime,
    Sensor,
    Flowtype,
    Custom(u16),
}

impl FieldType {
    fn to_u16(self) -> u16 {
        match self {
            FieldType::SIPv4 => 1,
            FieldType::DIPv4 => 2,
            FieldType::SIPv6 => 3,
            FieldType::DIPv6 => 4,
            FieldType::SPort => 5,
            FieldType::DPort => 6,
            FieldType::Protocol => 7,
            FieldType::Packets => 8,
            FieldType::Bytes => 9,
            FieldType::Flags => 10,
            FieldType::StartTime => 11,
            FieldType::EndTime => 12,
            FieldType::Sensor => 13,
            FieldType::Flowtype => 14,
            FieldType::Custom(code) => code,
        }
    }

    fn from_u16(code: u16) -> Self {
        match code {
            1 => FieldType::SIPv4,
            2 => FieldType::DIPv4,
            3 => FieldType::SIPv6,
            4 => FieldType::DIPv6,
            5 => FieldType::SPort,
            6 => FieldType::DPort,
            7 => FieldType::Protocol,
            8 => FieldType::Packets,
            9 => FieldType::Bytes,
            10 => FieldType::Flags,
            11 => FieldType::StartTime,
            12 => FieldType::EndTime,
            13 => FieldType::Sensor,
            14 => FieldType::Flowtype,
            other => FieldType::Custom(other),
        }
    }
}

impl Default for FieldType {
    fn default() -> Self {
        FieldType::Custom(0)
    }
}

/// Header entry id 6: declares the exact key/counter widths, plus their
/// field-type tags, for a v4 file.
pub struct ShapeEntry {
    pub key_type: FieldType,
    pub key_length: u16,
    pub counter_type: FieldType,
    pub counter_length: u16,
}

impl HeaderEntryCodec for ShapeEntry {
    const ENTRY_ID: u32 = 6;

    fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.key_type.to_u16().to_be_bytes());
        out.extend_from_slice(&self.key_length.to_be_bytes());
        out.extend_from_slice(&self.counter_type.to_u16().to_be_bytes());
        out.extend_from_slice(&self.counter_length.to_be_bytes());
        out
    }

    fn unpack(payload: &[u8]) -> Result<Self, StreamError> {
        if payload.len() < 8 {
            return Err(StreamError::ShortRead { expected: 8, got: payload.len() });
        }
        Ok(ShapeEntry {
            key_type: FieldType::from_u16(u16::from_be_bytes([payload[0], payload[1]])),
            key_length: u16::from_be_bytes([payload[2], payload[3]]),
            counter_type: FieldType::from_u16(u16::from_be_bytes([payload[4], payload[5]])),
            counter_length: u16::from_be_bytes([payload[6], payload[7]]),
        })
    }
}

fn write_key(out: &mut Vec<u8>, order: Endian, key: u128, width: usize) {
    match width {
        4 => write_u32(out, order, key as u32),
        16 => out.extend_from_slice(&key.to_be_bytes()),
        other => {
            // 1- or 2-byte narrow keys: low `width` bytes, big-endian.
            let bytes = (key as u32).to_be_bytes();
            out.extend_from_slice(&bytes[4 - other..]);
        }
    }
}

fn read_key(buf: &[u8], order: Endian, width: usize) -> u128 {
    match width {
        4 => read_u32(order, buf) as u128,
        16 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(&buf[..16]);
            u128::from_be_bytes(b)
        }
        other => {
            let mut v = 0u32;
            for &b in &buf[..other] {
                v = (v << 8) | b as u32;
            }
            v as u128
        }
    }
}

fn write_counter(out: &mut Vec<u8>, order: Endian, counter: u64, width: usize) {
    if width == 4 {
        write_u32(out, order, counter as u32);
    } else {
        let mut buf = [0u8; 8];
        match order {
            Endian::Big => BigEndian::write_u64(&mut buf, counter),
            Endian::Little => LittleEndian::write_u64(&mut buf, counter),
        }
        out.extend_from_slice(&buf);
    }
}

fn read_counter(buf: &[u8], order: Endian, width: usize) -> u64 {
    if width == 4 {
        read_u32(order, buf) as u64
    } else {
        match order {
            Endian::Big => BigEndian::read_u64(buf),
            Endian::Little => LittleEndian::read_u64(buf),
        }
    }
}

fn write_u32(out: &mut Vec<u8>, order: Endian, v: u32) {
    let mut buf = [0u8; 4];
    match order {
        Endian::Big => BigEndian::write_u32(&mut buf, v),
        Endian::Little => LittleEndian::write_u32(&mut buf, v),
    }
    out.extend_from_slice(&buf);
}

fn read_u32(order: Endian, buf: &[u8]) -> u32 {
    match order {
        Endian::Big => BigEndian::read_u32(buf),
        Endian::Little => LittleEndian::read_u32(buf),
    }
}

pub fn encode(
    items: &[(u128, u64)],
    order: Endian,
    key_width: usize,
    counter_width: usize,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(items.len() * (key_width + counter_width));
    for &(key, counter) in items {
        write_key(&mut out, order, key, key_width);
        write_counter(&mut out, order, counter, counter_width);
    }
    out
}

pub fn decode(
    bytes: &[u8],
    order: Endian,
    key_width: usize,
    counter_width: usize,
) -> Result<Vec<(u128, u64)>, BagError> {
    let record_len = key_width + counter_width;
    if record_len == 0 || bytes.len() % record_len != 0 {
        return Err(BagError::Header);
    }
    let mut out = Vec::with_capacity(bytes.len() / record_len);
    for chunk in bytes.chunks_exact(record_len) {
        let key = read_key(&chunk[..key_width], order, key_width);
        let counter = read_counter(&chunk[key_width..], order, counter_width);
        out.push((key, counter));
    }
    Ok(out)
}

/// Walk a decompressed body one `(key, counter)` record at a time,
/// invoking `visit` as each record decodes rather than collecting the
/// whole body into a `Vec` first — the streaming-aggregation entry point
/// spec.md's `process_stream` describes.
pub fn walk<F: FnMut(u128, u64)>(
    bytes: &[u8],
    order: Endian,
    key_width: usize,
    counter_width: usize,
    mut visit: F,
) -> Result<(), BagError> {
    let record_len = key_width + counter_width;
    if record_len == 0 || bytes.len() % record_len != 0 {
        return Err(BagError::Header);
    }
    for chunk in bytes.chunks_exact(record_len) {
        let key = read_key(&chunk[..key_width], order, key_width);
        let counter = read_counter(&chunk[key_width..], order, counter_width);
        visit(key, counter);
    }
    Ok(())
}
