//! Public Bag API: a key → `u64` counter map, backed by whichever of
//! [`radix::NarrowBag`] or [`rbtree::RbTree`] fits the current key width
//! (spec §4.2).

pub mod error;
pub mod format;
pub mod iter;
pub mod radix;
pub mod rbtree;

use std::io::SeekFrom;

pub use error::BagError;
pub use format::FieldType;
use format::FormatVersion;
use iter::BagIterator;
use radix::NarrowBag;
use rbtree::RbTree;

use crate::ip::v4_to_mapped;
use crate::stream::header::{CompressionMethod, FileFormat};
use crate::stream::{compress, Endian, FileHeader, Stream};

enum Storage {
    Narrow(NarrowBag),
    Wide(RbTree),
}

/// Override hook for [`Bag::add_bag`]: given `(key, existing, incoming)`,
/// return the counter to store instead of failing with
/// [`BagError::OpBounds`] on overflow.
pub type BoundsCallback<'a> = dyn FnMut(u128, u64, u64) -> u64 + 'a;

pub struct Bag {
    storage: Storage,
    auto_widen: bool,
    shape_stamp: u64,
    key_type: FieldType,
    counter_type: FieldType,
}

const WIDEN_STEPS: [u8; 4] = [1, 2, 4, 16];

fn fits_in_octets(key: u128, octets: u8) -> bool {
    if octets == 16 {
        return true;
    }
    let width_bits = octets as u32 * 8;
    key >> width_bits == 0
}

impl Bag {
    /// Create a bag whose keys start at `key_octets` (1, 2, 4, or 16)
    /// bytes wide, tagged with the given field types. The tags are pure
    /// on-disk metadata (spec glossary: "Field type") — they never affect
    /// `get`/`set`/`add`/`subtract` semantics.
    pub fn create(key_type: FieldType, counter_type: FieldType, key_octets: u8) -> Self {
        let storage = if key_octets == 16 {
            Storage::Wide(RbTree::new())
        } else {
            Storage::Narrow(NarrowBag::new(key_octets))
        };
        Self {
            storage,
            auto_widen: true,
            shape_stamp: 0,
            key_type,
            counter_type,
        }
    }

    /// Create a bag with untagged (`Custom(0)`) field types. Shorthand for
    /// callers that only care about the key width, not its on-disk label.
    pub fn create_untyped(key_octets: u8) -> Self {
        Self::create(FieldType::default(), FieldType::default(), key_octets)
    }

    pub fn field_types(&self) -> (FieldType, FieldType) {
        (self.key_type, self.counter_type)
    }

    pub fn set_field_types(&mut self, key_type: FieldType, counter_type: FieldType) {
        self.key_type = key_type;
        self.counter_type = counter_type;
    }

    pub fn key_octets(&self) -> u8 {
        match &self.storage {
            Storage::Narrow(n) => n.key_octets(),
            Storage::Wide(_) => 16,
        }
    }

    pub fn shape_stamp(&self) -> u64 {
        self.shape_stamp
    }

    pub fn auto_widen_enable(&mut self) {
        self.auto_widen = true;
    }

    pub fn auto_widen_disable(&mut self) {
        self.auto_widen = false;
    }

    pub fn count_keys(&self) -> usize {
        match &self.storage {
            Storage::Narrow(n) => n.len(),
            Storage::Wide(w) => w.len(),
        }
    }

    pub fn clear(&mut self) {
        let octets = self.key_octets();
        self.storage = if octets == 16 {
            Storage::Wide(RbTree::new())
        } else {
            Storage::Narrow(NarrowBag::new(octets))
        };
        self.shape_stamp += 1;
    }

    /// Ensure `key` fits the bag's current representation, widening
    /// 1→2→4→16 bytes as needed when `auto_widen` is enabled.
    fn ensure_fits(&mut self, key: u128) -> Result<(), BagError> {
        loop {
            let octets = self.key_octets();
            if fits_in_octets(key, octets) {
                return Ok(());
            }
            if !self.auto_widen {
                return Err(BagError::KeyRange);
            }
            self.widen_once()?;
        }
    }

    fn widen_once(&mut self) -> Result<(), BagError> {
        let current = self.key_octets();
        let next = WIDEN_STEPS
            .iter()
            .copied()
            .find(|&o| o > current)
            .ok_or(BagError::KeyRange)?;
        let items: Vec<(u128, u64)> = match &self.storage {
            Storage::Narrow(n) => n.iter_sorted().into_iter().map(|(k, v)| (k as u128, v)).collect(),
            Storage::Wide(w) => w.iter_sorted(),
        };
        self.storage = if next == 16 {
            let mut wide = RbTree::new();
            for (k, v) in items {
                let promoted = if self.key_octets() < 16 { v4_to_mapped(k as u32) } else { k };
                wide.set(promoted, v);
            }
            Storage::Wide(wide)
        } else {
            let mut narrow = NarrowBag::new(next);
            for (k, v) in items {
                narrow.set(k as u32, v);
            }
            Storage::Narrow(narrow)
        };
        self.shape_stamp += 1;
        Ok(())
    }

    pub fn get(&self, key: u128) -> u64 {
        match &self.storage {
            Storage::Narrow(n) => {
                if key > u32::MAX as u128 {
                    0
                } else {
                    n.get(key as u32).unwrap_or(0)
                }
            }
            Storage::Wide(w) => w.get(key).unwrap_or(0),
        }
    }

    /// Set `key`'s counter. A `value` of zero deletes the entry instead of
    /// storing a zero-valued leaf (spec §4.2 Data Model: a zero counter is
    /// equivalent to absence) — this path never widens the bag, since
    /// there is nothing to fit.
    pub fn set(&mut self, key: u128, value: u64) -> Result<(), BagError> {
        if value == 0 {
            self.remove(key);
            return Ok(());
        }
        self.ensure_fits(key)?;
        match &mut self.storage {
            Storage::Narrow(n) => n.set(key as u32, value),
            Storage::Wide(w) => w.set(key, value),
        }
        Ok(())
    }

    pub fn remove(&mut self, key: u128) -> bool {
        match &mut self.storage {
            Storage::Narrow(n) => {
                if key > u32::MAX as u128 {
                    false
                } else {
                    n.remove(key as u32)
                }
            }
            Storage::Wide(w) => w.remove(key),
        }
    }

    /// Add `delta` to `key`'s counter, returning the new value.
    /// [`BagError::OpBounds`] on overflow; the counter is left unchanged.
    pub fn add(&mut self, key: u128, delta: u64) -> Result<u64, BagError> {
        self.ensure_fits(key)?;
        let current = self.get(key);
        let new_value = current.checked_add(delta).ok_or(BagError::OpBounds)?;
        self.set(key, new_value)?;
        Ok(new_value)
    }

    /// Subtract `delta` from `key`'s counter. [`BagError::OpBounds`] on
    /// underflow; the counter is left unchanged.
    pub fn subtract(&mut self, key: u128, delta: u64) -> Result<u64, BagError> {
        let current = self.get(key);
        let new_value = current.checked_sub(delta).ok_or(BagError::OpBounds)?;
        self.set(key, new_value)?;
        Ok(new_value)
    }

    fn snapshot(&self) -> Vec<(u128, u64)> {
        match &self.storage {
            Storage::Narrow(n) => n.iter_sorted().into_iter().map(|(k, v)| (k as u128, v)).collect(),
            Storage::Wide(w) => w.iter_sorted(),
        }
    }

    pub fn iterator_create_sorted(&self) -> BagIterator {
        BagIterator::new(self.snapshot(), self.shape_stamp)
    }

    /// See [`BagIterator`]'s doc comment: both backing stores already
    /// walk in sorted order, so this returns the same sequence.
    pub fn iterator_create_unsorted(&self) -> BagIterator {
        self.iterator_create_sorted()
    }

    /// Rebuild the bag with a different starting key width, re-inserting
    /// every existing entry. Used to shrink a bag back down after a
    /// temporary widen, or to force a specific on-disk shape before
    /// writing.
    pub fn modify(&mut self, new_key_octets: u8) -> Result<(), BagError> {
        self.modify_typed(self.key_type, self.counter_type, new_key_octets)
    }

    /// Like [`Bag::modify`], also retagging the field types (spec §4.2:
    /// `modify(new_key_type, new_counter_type, new_key_octets,
    /// new_counter_octets)`; the counter is always 64 bits internally, so
    /// there is no separate counter-width knob here).
    pub fn modify_typed(
        &mut self,
        new_key_type: FieldType,
        new_counter_type: FieldType,
        new_key_octets: u8,
    ) -> Result<(), BagError> {
        let items = self.snapshot();
        let mut rebuilt = Bag::create(new_key_type, new_counter_type, new_key_octets);
        rebuilt.auto_widen = self.auto_widen;
        for (k, v) in items {
            rebuilt.set(k, v)?;
        }
        *self = rebuilt;
        self.shape_stamp += 1;
        Ok(())
    }

    /// Merge `other`'s counters into `self`, summing per key. On overflow,
    /// `bounds_cb` (if given) supplies a replacement value; otherwise the
    /// whole merge fails with [`BagError::OpBounds`] and `self` is left
    /// unmodified.
    pub fn add_bag(&mut self, other: &Bag, mut bounds_cb: Option<&mut BoundsCallback>) -> Result<(), BagError> {
        let mut merged = self.snapshot();
        let mut by_key: std::collections::BTreeMap<u128, u64> = merged.drain(..).collect();
        for (key, delta) in other.snapshot() {
            let existing = by_key.get(&key).copied().unwrap_or(0);
            let combined = match existing.checked_add(delta) {
                Some(v) => v,
                None => match bounds_cb.as_mut() {
                    Some(cb) => cb(key, existing, delta),
                    None => return Err(BagError::OpBounds),
                },
            };
            by_key.insert(key, combined);
        }
        for (key, value) in by_key {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Read the header and fully decompressed body bytes shared by
    /// [`Bag::read`] and [`Bag::process_stream`], plus the
    /// `(key_width, counter_width, key_type, counter_type)` needed to
    /// decode records out of it.
    fn read_body(
        stream: &mut Stream,
    ) -> Result<(Endian, usize, usize, FieldType, FieldType, Vec<u8>), BagError> {
        let header = stream.read_header()?;
        if header.file_format != FileFormat::Bag {
            return Err(BagError::Header);
        }
        let version = FormatVersion::from_u8(header.record_version)?;
        let order = header.byte_order;
        let compression = header.compression;
        if !version.allows_compression() && compression != CompressionMethod::None {
            return Err(BagError::Output(crate::stream::StreamError::CompressionForbiddenByVersion));
        }
        let shape: Option<Result<format::ShapeEntry, crate::stream::StreamError>> =
            header.get_entry::<format::ShapeEntry>();

        let codec = compress::codec_for(compression)?;
        let mut body = Vec::new();
        let mut len_buf = [0u8; 4];
        loop {
            match stream.read_bytes(&mut len_buf) {
                Ok(()) => {
                    let len = u32::from_be_bytes(len_buf) as usize;
                    let mut raw = vec![0u8; len];
                    stream.read_bytes(&mut raw)?;
                    let mut decompressed = codec.decompress(&raw, len * 4)?;
                    body.append(&mut decompressed);
                }
                Err(e) if matches!(e, crate::stream::StreamError::Eof) => break,
                Err(e) => return Err(BagError::Output(e)),
            }
        }

        let (key_width, counter_width, key_type, counter_type) = match version {
            FormatVersion::V4 => match shape {
                Some(Ok(s)) => (s.key_length as usize, s.counter_length as usize, s.key_type, s.counter_type),
                _ => return Err(BagError::Header),
            },
            v => (v.key_width().unwrap(), v.counter_width(), FieldType::default(), FieldType::default()),
        };

        Ok((order, key_width, counter_width, key_type, counter_type, body))
    }

    pub fn read(stream: &mut Stream) -> Result<Self, BagError> {
        let (order, key_width, counter_width, key_type, counter_type, body) = Self::read_body(stream)?;

        let items = format::decode(&body, order, key_width, counter_width)?;
        let key_octets = match key_width {
            1 | 2 | 4 | 16 => key_width as u8,
            _ => return Err(BagError::Header),
        };
        let mut bag = Bag::create(key_type, counter_type, key_octets);
        for (k, v) in items {
            bag.set(k, v)?;
        }
        Ok(bag)
    }

    /// Write the bag as a single framed, compressed block. `version`
    /// defaults to [`format::select_format`] (spec.md: "Writer chooses v3
    /// when key_octets <= 4, otherwise v4") when `None`; an explicit
    /// override is validated against the bag's current key width, since
    /// v1/v2/v3 are fixed at a 4-byte key and silently writing a narrower
    /// or wider key under one of them would round-trip as corruption.
    pub fn write(
        &self,
        stream: &mut Stream,
        compression: CompressionMethod,
        version: Option<FormatVersion>,
    ) -> Result<(), BagError> {
        let version = version.unwrap_or_else(|| format::select_format(self.key_octets()));
        if let Some(fixed_width) = version.key_width() {
            if fixed_width != self.key_octets() as usize {
                return Err(BagError::KeyRange);
            }
        }
        if !version.allows_compression() && compression != CompressionMethod::None {
            return Err(BagError::Output(crate::stream::StreamError::CompressionForbiddenByVersion));
        }
        let key_width = self.key_octets() as usize;
        let counter_width = version.counter_width();
        let record_len = (key_width + counter_width) as u32;

        let mut header = FileHeader::new(FileFormat::Bag, version as u8, record_len);
        header.compression = compression;
        if matches!(version, FormatVersion::V4) {
            header.set_entry(&format::ShapeEntry {
                key_type: self.key_type,
                key_length: key_width as u16,
                counter_type: self.counter_type,
                counter_length: counter_width as u16,
            });
        }
        stream.write_header(header)?;

        let order = Endian::native();
        let items = self.snapshot();
        let body = format::encode(&items, order, key_width, counter_width);

        let codec = compress::codec_for(compression)?;
        for chunk in body.chunks(compress::BLOCK_SIZE) {
            let compressed = codec.compress(chunk)?;
            stream.write_bytes(&(compressed.len() as u32).to_be_bytes())?;
            stream.write_bytes(&compressed)?;
        }
        Ok(())
    }

    /// Stream-process every `(key, counter)` record of a file without
    /// building a [`Bag`] first: the body is decoded and `visit` invoked
    /// record-by-record as each one is reached.
    pub fn process_stream<F: FnMut(u128, u64)>(stream: &mut Stream, visit: F) -> Result<(), BagError> {
        let (order, key_width, counter_width, _key_type, _counter_type, body) = Self::read_body(stream)?;
        format::walk(&body, order, key_width, counter_width, visit)
    }

    pub fn seek_to_start(stream: &mut Stream) -> Result<(), BagError> {
        stream.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{ContentType, Mode};

    #[test]
    fn add_and_subtract() {
        let mut bag = Bag::create_untyped(4);
        assert_eq!(bag.add(10, 5).unwrap(), 5);
        assert_eq!(bag.add(10, 3).unwrap(), 8);
        assert_eq!(bag.subtract(10, 2).unwrap(), 6);
        assert!(matches!(bag.subtract(10, 100), Err(BagError::OpBounds)));
    }

    #[test]
    fn auto_widen_on_oversized_key() {
        let mut bag = Bag::create_untyped(1);
        bag.set(200, 1).unwrap();
        assert_eq!(bag.key_octets(), 1);
        bag.set(70_000, 2).unwrap(); // doesn't fit in 1 octet
        assert!(bag.key_octets() >= 2);
        assert_eq!(bag.get(200), 1);
        assert_eq!(bag.get(70_000), 2);
    }

    #[test]
    fn no_autowiden_returns_key_range() {
        let mut bag = Bag::create_untyped(1);
        bag.auto_widen_disable();
        assert!(matches!(bag.set(70_000, 1), Err(BagError::KeyRange)));
    }

    #[test]
    fn write_read_roundtrip_v3() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bag");

        let mut bag = Bag::create_untyped(4);
        bag.set(1, 10).unwrap();
        bag.set(2, 20).unwrap();

        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        w.open().unwrap();
        bag.write(&mut w, CompressionMethod::None, Some(FormatVersion::V3)).unwrap();
        w.close().unwrap();

        let mut r = Stream::create(Mode::Read, ContentType::Binary);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        let back = Bag::read(&mut r).unwrap();
        assert_eq!(back.get(1), 10);
        assert_eq!(back.get(2), 20);
    }

    #[test]
    fn write_read_roundtrip_v4_wide_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bag");

        let mut bag = Bag::create(FieldType::SIPv6, FieldType::Packets, 16);
        bag.set(0x2001_0db8_0000_0000_0000_0000_0000_0001, 99).unwrap();

        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        w.open().unwrap();
        bag.write(&mut w, CompressionMethod::None, Some(FormatVersion::V4)).unwrap();
        w.close().unwrap();

        let mut r = Stream::create(Mode::Read, ContentType::Binary);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        let back = Bag::read(&mut r).unwrap();
        assert_eq!(back.get(0x2001_0db8_0000_0000_0000_0000_0000_0001), 99);
        assert_eq!(back.field_types(), (FieldType::SIPv6, FieldType::Packets));
    }

    #[test]
    fn write_default_selects_v3_for_narrow_keys_and_v4_for_wide() {
        let dir = tempfile::tempdir().unwrap();

        let narrow_path = dir.path().join("narrow.bag");
        let mut narrow = Bag::create_untyped(4);
        narrow.set(1, 10).unwrap();
        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&narrow_path).unwrap();
        w.open().unwrap();
        narrow.write(&mut w, CompressionMethod::None, None).unwrap();
        w.close().unwrap();
        let mut r = Stream::create(Mode::Read, ContentType::Binary);
        r.bind_path(&narrow_path).unwrap();
        r.open().unwrap();
        assert_eq!(r.read_header().unwrap().record_version, FormatVersion::V3 as u8);

        let wide_path = dir.path().join("wide.bag");
        let mut wide = Bag::create_untyped(16);
        wide.set(1, 10).unwrap();
        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&wide_path).unwrap();
        w.open().unwrap();
        wide.write(&mut w, CompressionMethod::None, None).unwrap();
        w.close().unwrap();
        let mut r = Stream::create(Mode::Read, ContentType::Binary);
        r.bind_path(&wide_path).unwrap();
        r.open().unwrap();
        assert_eq!(r.read_header().unwrap().record_version, FormatVersion::V4 as u8);
    }

    #[test]
    fn write_rejects_version_whose_fixed_key_width_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bag");
        let mut bag = Bag::create_untyped(2);
        bag.set(1, 10).unwrap();

        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        w.open().unwrap();
        let err = bag
            .write(&mut w, CompressionMethod::None, Some(FormatVersion::V1))
            .unwrap_err();
        assert!(matches!(err, BagError::KeyRange));
    }

    #[test]
    fn process_stream_visits_records_without_building_a_bag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bag");

        let mut bag = Bag::create_untyped(4);
        bag.set(1, 10).unwrap();
        bag.set(2, 20).unwrap();
        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        w.open().unwrap();
        bag.write(&mut w, CompressionMethod::None, None).unwrap();
        w.close().unwrap();

        let mut r = Stream::create(Mode::Read, ContentType::Binary);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        let mut seen = Vec::new();
        Bag::process_stream(&mut r, |k, v| seen.push((k, v))).unwrap();
        assert_eq!(seen, vec![(1, 10), (2, 20)]);
    }

    #[test]
    fn read_rejects_compression_forbidden_by_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bag");

        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        w.open().unwrap();
        let mut header = FileHeader::new(FileFormat::Bag, FormatVersion::V2 as u8, 12);
        header.compression = CompressionMethod::Zlib;
        w.write_header(header).unwrap();
        w.close().unwrap();

        let mut r = Stream::create(Mode::Read, ContentType::Binary);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        let err = Bag::read(&mut r).unwrap_err();
        assert!(matches!(
            err,
            BagError::Output(crate::stream::StreamError::CompressionForbiddenByVersion)
        ));
    }

    #[test]
    fn add_bag_merges_counters() {
        let mut a = Bag::create_untyped(4);
        a.set(1, 10).unwrap();
        let mut b = Bag::create_untyped(4);
        b.set(1, 5).unwrap();
        b.set(2, 7).unwrap();
        a.add_bag(&b, None).unwrap();
        assert_eq!(a.get(1), 15);
        assert_eq!(a.get(2), 7);
    }
}
