//! Stream error taxonomy (spec §7).
//!
//! Every variant carries a stable numeric code. Codes below 64 are fatal
//! to the whole stream; codes at or above 64 are fatal only to the record
//! currently being read or written — the caller may skip the record and
//! keep going. The discriminant *is* the classification (via
//! [`StreamError::code`]/[`StreamError::is_fatal_to_stream`]) so the two
//! can never drift apart, unlike a separately-maintained severity flag.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    // ── System-call failures (fatal) ────────────────────────────────────
    #[error("open failed: {0}")]
    Open(#[source] io::Error),
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("seek failed: {0}")]
    Lseek(#[source] io::Error),
    #[error("advisory lock failed: {0}")]
    Lock(#[source] io::Error),
    #[error("ftruncate failed: {0}")]
    Ftruncate(#[source] io::Error),

    // ── State failures (fatal) ──────────────────────────────────────────
    #[error("stream has no path or descriptor bound")]
    NotBound,
    #[error("stream is not open")]
    NotOpen,
    #[error("stream is already open")]
    AlreadyOpen,
    #[error("stream is closed")]
    Closed,
    #[error("header already frozen by a prior record read/write")]
    PrevData,

    // ── Format failures (fatal) ──────────────────────────────────────────
    #[error("bad magic number")]
    BadMagic,
    #[error("unsupported file format {0}")]
    UnsupportedFormat(u8),
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown compression method {0}")]
    CompressInvalid(u8),
    #[error("compression method {0} not compiled into this build")]
    CompressUnavailable(u8),
    #[error("record version forbids compression")]
    CompressionForbiddenByVersion,

    // ── I/O failures (fatal) ─────────────────────────────────────────────
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("unexpected end of file")]
    Eof,
    #[error("zlib stream error: {0}")]
    Zlib(String),
    #[error("binary data refused on a terminal")]
    IsTerminal,
    #[error("refusing to overwrite existing file")]
    FileExists,
    #[error("append not supported for this I/O mode")]
    UnsupportedIoMode,

    // ── Record-level failures (non-fatal to the stream) ─────────────────
    #[error("start-time underflow")]
    StimeUnderflow,
    #[error("start-time overflow")]
    StimeOverflow,
    #[error("elapsed-time overflow")]
    ElapsedOverflow,
    #[error("packet count is zero")]
    PacketsZero,
    #[error("packet count overflow")]
    PacketsOverflow,
    #[error("byte count overflow")]
    BytesOverflow,
    #[error("bytes-per-packet overflow")]
    BppOverflow,
    #[error("SNMP interface overflow")]
    SnmpOverflow,
    #[error("sensor id overflow")]
    SensoridOverflow,
    #[error("protocol mismatch")]
    ProtoMismatch,
    #[error("IPv6 not supported by this record")]
    UnsupportIpv6,
    #[error("line exceeds buffer capacity")]
    LongLine,
}

impl StreamError {
    /// Stable numeric code. Values `0..64` are fatal-on-stream; `64..` are
    /// fatal-on-current-record-only.
    pub fn code(&self) -> u16 {
        use StreamError::*;
        match self {
            Open(_) => 1,
            Read(_) => 2,
            Write(_) => 3,
            Lseek(_) => 4,
            Lock(_) => 5,
            Ftruncate(_) => 6,
            NotBound => 10,
            NotOpen => 11,
            AlreadyOpen => 12,
            Closed => 13,
            PrevData => 14,
            BadMagic => 20,
            UnsupportedFormat(_) => 21,
            UnsupportedVersion(_) => 22,
            CompressInvalid(_) => 23,
            CompressUnavailable(_) => 24,
            CompressionForbiddenByVersion => 25,
            ShortRead { .. } => 30,
            Eof => 31,
            Zlib(_) => 32,
            IsTerminal => 33,
            FileExists => 34,
            UnsupportedIoMode => 35,
            StimeUnderflow => 64,
            StimeOverflow => 65,
            ElapsedOverflow => 66,
            PacketsZero => 67,
            PacketsOverflow => 68,
            BytesOverflow => 69,
            BppOverflow => 70,
            SnmpOverflow => 71,
            SensoridOverflow => 72,
            ProtoMismatch => 73,
            UnsupportIpv6 => 74,
            LongLine => 75,
        }
    }

    #[inline]
    pub fn is_fatal_to_stream(&self) -> bool {
        self.code() < 64
    }
}

/// Formats the last error through a caller-supplied sink, generalizing the
/// original's process-wide `skAppPrintErr` (spec §9 REDESIGN FLAGS): the
/// library never owns where diagnostics go, the embedding application does.
pub fn print_last_err<F: FnMut(&str)>(err: &StreamError, mut sink: F) {
    sink(&format!("stream error [{}]: {err}", err.code()));
}
