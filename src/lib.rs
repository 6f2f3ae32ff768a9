//! # silk-core — the flow-record storage engines shared by the SiLK tools
//!
//! This crate carries the three tightly coupled data engines that dominate
//! `libsilk`'s complexity:
//!
//! - [`stream`] — the framed, optionally compressed, byte-order-negotiating
//!   binary stream codec every persisted format rides on.
//! - [`ipset`] — a radix trie over IPv4/IPv6 CIDR blocks, with set algebra,
//!   CIDR-minimal normalization, and a four-version persisted format.
//! - [`bag`] — a key → `u64` counter map (dense radix tree for narrow keys,
//!   red-black tree for 16-byte keys), with overflow-checked arithmetic and
//!   auto-widening.
//!
//! Everything here is synchronous, single-threaded, and allocation-fallible
//! (spec §5): no component spawns threads, takes internal locks, or retries
//! across an `await` point. Flow-record field accessors, CLI option parsing,
//! the plugin loader, and `silk.conf` site configuration are all out of
//! scope — this crate is the storage engine the rest of SiLK links against,
//! not the rest of SiLK.

pub mod bag;
pub mod ip;
pub mod ipset;
pub mod pool;
pub mod stream;

pub use bag::{Bag, BagError};
pub use ip::Family;
pub use ipset::{IpSet, IpSetError, V6Policy};
pub use stream::{ContentType, FileHeader, Mode, Stream, StreamError};
