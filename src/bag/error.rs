//! Bag error taxonomy (spec §4.2, §7).

use thiserror::Error;

use crate::stream::StreamError;

#[derive(Error, Debug)]
pub enum BagError {
    #[error("allocation failed")]
    Memory,
    #[error("key not found")]
    KeyNotFound,
    #[error("bad input: {0}")]
    Input(&'static str),
    #[error("counter operation out of bounds")]
    OpBounds,
    #[error(transparent)]
    Output(#[from] StreamError),
    #[error("read error")]
    Read,
    #[error("malformed bag file header")]
    Header,
    #[error("key width does not match the bag's current key range")]
    KeyRange,
    #[error("bag's key/counter shape changed underneath an active iterator")]
    Modified,
}
