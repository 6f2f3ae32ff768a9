//! The common framed-file header (spec §3, §6).
//!
//! ```text
//! offset  size  field
//! 0       4     magic number          (fixed constant, big-endian)
//! 4       1     is_big_endian         (0 or 1)
//! 5       1     compression_method    (0=none, 1=zlib, 2=lzo1x, 3=snappy)
//! 6       1     file_format           (IPSET=0x1D, BAG=0x21, FLOW, TEXT...)
//! 7       1     record_version
//! 8       4     record_length
//! 12      var   sequence of header entries: u32 id, u32 length, payload
//! ...     4     terminator entry: id=0, length=8
//! ```
//!
//! The fixed 12-byte prefix is swapped per `is_big_endian` on read; header
//! entry payloads are opaque to this module and are never swapped here —
//! the entry type that defines a payload's layout owns its byte order, the
//! same way spec §3 keeps codec identity authoritative and never
//! renegotiated at the framing layer.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::error::StreamError;

pub const MAGIC: u32 = 0x5349_4C4B; // "SILK"
pub const FIXED_PREFIX_LEN: usize = 12;
pub const TERMINATOR_ID: u32 = 0;
pub const TERMINATOR_LEN: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    fn flag(self) -> u8 {
        match self {
            Endian::Big => 1,
            Endian::Little => 0,
        }
    }

    fn from_flag(flag: u8) -> Self {
        if flag != 0 {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn write_u32(self, out: &mut Vec<u8>, v: u32) {
        let mut buf = [0u8; 4];
        match self {
            Endian::Big => BigEndian::write_u32(&mut buf, v),
            Endian::Little => LittleEndian::write_u32(&mut buf, v),
        }
        out.extend_from_slice(&buf);
    }

    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Big => BigEndian::read_u32(buf),
            Endian::Little => LittleEndian::read_u32(buf),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    None,
    Zlib,
    Lzo1x,
    Snappy,
}

impl CompressionMethod {
    pub fn to_byte(self) -> u8 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Zlib => 1,
            CompressionMethod::Lzo1x => 2,
            CompressionMethod::Snappy => 3,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self, StreamError> {
        match b {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Zlib),
            2 => Ok(CompressionMethod::Lzo1x),
            3 => Ok(CompressionMethod::Snappy),
            other => Err(StreamError::CompressInvalid(other)),
        }
    }

    /// Whether this build was compiled with support for the method.
    pub fn is_available(self) -> bool {
        match self {
            CompressionMethod::None => true,
            CompressionMethod::Zlib => cfg!(feature = "zlib"),
            CompressionMethod::Lzo1x => cfg!(feature = "lzo1x"),
            CompressionMethod::Snappy => cfg!(feature = "snappy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Flow,
    IpSet,
    Bag,
    Text,
}

impl FileFormat {
    pub fn to_byte(self) -> u8 {
        match self {
            FileFormat::Flow => 0x00,
            FileFormat::IpSet => 0x1D,
            FileFormat::Bag => 0x21,
            FileFormat::Text => 0xFF,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self, StreamError> {
        match b {
            0x00 => Ok(FileFormat::Flow),
            0x1D => Ok(FileFormat::IpSet),
            0x21 => Ok(FileFormat::Bag),
            0xFF => Ok(FileFormat::Text),
            other => Err(StreamError::UnsupportedFormat(other)),
        }
    }
}

/// A typed capability for one header-entry id: pack to bytes, unpack from
/// bytes. Generalizes the original's function-pointer entry registration
/// (spec §9 REDESIGN FLAGS) into a small trait, the same shape as the
/// stream's `Codec` trait.
pub trait HeaderEntryCodec: Sized {
    const ENTRY_ID: u32;
    fn pack(&self) -> Vec<u8>;
    fn unpack(payload: &[u8]) -> Result<Self, StreamError>;
}

/// One raw `(id, payload)` header entry as it appears on disk, before a
/// specific [`HeaderEntryCodec`] interprets the payload. An id with no
/// registered interpreter is preserved verbatim and skipped by readers.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub id: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FileHeader {
    pub byte_order: Endian,
    pub compression: CompressionMethod,
    pub file_format: FileFormat,
    pub record_version: u8,
    pub record_length: u32,
    pub entries: Vec<RawEntry>,
}

impl FileHeader {
    pub fn new(file_format: FileFormat, record_version: u8, record_length: u32) -> Self {
        Self {
            byte_order: Endian::native(),
            compression: CompressionMethod::None,
            file_format,
            record_version,
            record_length,
            entries: Vec::new(),
        }
    }

    pub fn set_entry<T: HeaderEntryCodec>(&mut self, value: &T) {
        self.entries.retain(|e| e.id != T::ENTRY_ID);
        self.entries.push(RawEntry {
            id: T::ENTRY_ID,
            payload: value.pack(),
        });
    }

    pub fn get_entry<T: HeaderEntryCodec>(&self) -> Option<Result<T, StreamError>> {
        self.entries
            .iter()
            .find(|e| e.id == T::ENTRY_ID)
            .map(|e| T::unpack(&e.payload))
    }

    /// Serialize the full header: 4-byte magic (always big-endian), the
    /// 8-byte fixed prefix in `byte_order`, the entry table, and the id=0
    /// terminator.
    pub fn write_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_PREFIX_LEN + 16);
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.push(self.byte_order.flag());
        out.push(self.compression.to_byte());
        out.push(self.file_format.to_byte());
        out.push(self.record_version);
        self.byte_order.write_u32(&mut out, self.record_length);

        for entry in &self.entries {
            let length = 8 + entry.payload.len() as u32;
            self.byte_order.write_u32(&mut out, entry.id);
            self.byte_order.write_u32(&mut out, length);
            out.extend_from_slice(&entry.payload);
        }
        self.byte_order.write_u32(&mut out, TERMINATOR_ID);
        self.byte_order.write_u32(&mut out, TERMINATOR_LEN);
        out
    }

    /// Parse a header from `buf`, returning the header and the number of
    /// bytes consumed (so the caller can seek past it, e.g. append mode).
    pub fn read_bytes(buf: &[u8]) -> Result<(Self, usize), StreamError> {
        if buf.len() < FIXED_PREFIX_LEN {
            return Err(StreamError::ShortRead {
                expected: FIXED_PREFIX_LEN,
                got: buf.len(),
            });
        }
        let magic = BigEndian::read_u32(&buf[0..4]);
        if magic != MAGIC {
            return Err(StreamError::BadMagic);
        }
        let byte_order = Endian::from_flag(buf[4]);
        let compression = CompressionMethod::from_byte(buf[5])?;
        let file_format = FileFormat::from_byte(buf[6])?;
        let record_version = buf[7];
        let record_length = byte_order.read_u32(&buf[8..12]);

        let mut pos = FIXED_PREFIX_LEN;
        let mut entries = Vec::new();
        loop {
            if pos + 8 > buf.len() {
                return Err(StreamError::ShortRead {
                    expected: pos + 8,
                    got: buf.len(),
                });
            }
            let id = byte_order.read_u32(&buf[pos..pos + 4]);
            let length = byte_order.read_u32(&buf[pos + 4..pos + 8]) as usize;
            if id == TERMINATOR_ID {
                pos += 8;
                break;
            }
            if length < 8 || pos + length > buf.len() {
                return Err(StreamError::ShortRead {
                    expected: pos + length,
                    got: buf.len(),
                });
            }
            let payload = buf[pos + 8..pos + length].to_vec();
            entries.push(RawEntry { id, payload });
            pos += length;
        }

        Ok((
            Self {
                byte_order,
                compression,
                file_format,
                record_version,
                record_length,
                entries,
            },
            pos,
        ))
    }
}
