//! IPset error taxonomy (spec §4.1, §7).

use thiserror::Error;

use crate::stream::StreamError;

#[derive(Error, Debug)]
pub enum IpSetError {
    #[error("allocation failed")]
    Allocation,
    #[error("bad input: {0}")]
    BadInput(&'static str),
    #[error(transparent)]
    FileIo(#[from] StreamError),
    #[error("file does not contain an IPset")]
    FileType,
    #[error("malformed IPset file header")]
    FileHeader,
    #[error("set is empty")]
    Empty,
    #[error("open failed")]
    Open,
    #[error("set contains IPv6 addresses and IPv6 support was not requested")]
    Ipv6,
    #[error("file format version {0} is newer than this build supports")]
    FileVersion(u8),
    #[error("prefix {prefix} is out of range for a {width}-bit address")]
    Prefix { prefix: u32, width: u32 },
    #[error("address not found in set")]
    NotFound,
    #[error("operation requires a clean (non-dirty) set; call clean() first")]
    RequireClean,
    #[error("set data is internally inconsistent")]
    Corrupt,
    #[error("one set is not a subset of the other")]
    Subset,
    #[error("multiple leaves found at the same depth during a walk")]
    Multileaf,
    #[error("set's address family changed underneath an active iterator")]
    Modified,
}
