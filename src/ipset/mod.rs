//! Public IPset API: an address-set container over arbitrary CIDR blocks,
//! backed by the [`trie`] module and persisted through [`format`] records
//! inside a [`crate::stream::Stream`] (spec §4.1).

pub mod error;
pub mod format;
pub mod iter;
pub mod trie;
pub mod wildcard;

use std::io::SeekFrom;

pub use error::IpSetError;
use format::FormatVersion;
use iter::IpSetIterator;
use trie::Trie;
pub use wildcard::Wildcard;

use crate::ip::Family;
use crate::stream::header::{CompressionMethod, FileFormat, HeaderEntryCodec};
use crate::stream::{compress, FileHeader, Stream, StreamError};

/// Header entry recording which address family a v4/v5-format body holds,
/// since both formats share one on-disk record layout regardless of
/// family and the fixed header alone can't distinguish them.
struct FamilyEntry(Family);

impl HeaderEntryCodec for FamilyEntry {
    const ENTRY_ID: u32 = 1;

    fn pack(&self) -> Vec<u8> {
        vec![match self.0 {
            Family::V4 => 4,
            Family::V6 => 6,
        }]
    }

    fn unpack(payload: &[u8]) -> Result<Self, StreamError> {
        match payload.first() {
            Some(4) => Ok(FamilyEntry(Family::V4)),
            Some(6) => Ok(FamilyEntry(Family::V6)),
            _ => Err(StreamError::ShortRead { expected: 1, got: payload.len() }),
        }
    }
}

/// Controls how a set's v6 blocks are surfaced when the caller walks it
/// expecting an IPv4 view, or vice versa (spec §4.1 Data Model).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V6Policy {
    /// Iterate native addresses of both families as stored.
    Mix,
    /// Force every address through the v6 representation, promoting v4.
    Force,
    /// Demote v6-mapped (`::ffff:0:0/96`) addresses back to v4, dropping
    /// everything else.
    AsV4,
    /// Silently skip v6 addresses that cannot be demoted to v4.
    Ignore,
    /// Only consider addresses already native to the requested family.
    Only,
}

pub struct IpSet {
    trie: Trie,
    auto_convert: bool,
}

impl IpSet {
    pub fn create(family: Family) -> Self {
        Self {
            trie: Trie::new(family),
            auto_convert: true,
        }
    }

    pub fn family(&self) -> Family {
        self.trie.family()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.trie.is_dirty()
    }

    pub fn auto_convert_enable(&mut self) {
        self.auto_convert = true;
    }

    pub fn auto_convert_disable(&mut self) {
        self.auto_convert = false;
    }

    pub fn auto_convert_is_enabled(&self) -> bool {
        self.auto_convert
    }

    pub fn clear(&mut self) {
        self.trie = Trie::new(self.trie.family());
    }

    pub fn copy(&self) -> Self {
        Self {
            trie: self.trie.clone(),
            auto_convert: self.auto_convert,
        }
    }

    /// Insert `base/prefix`. If the set is v4 and `prefix`/`base` describe
    /// a v6-mapped address, or vice versa, the block is converted first
    /// when `auto_convert` is enabled; otherwise [`IpSetError::Ipv6`].
    ///
    /// A `prefix` of `0` is a single-address shorthand, not the whole
    /// address space: it is treated as `width` (32 for v4, 128 for v6).
    /// Callers who genuinely mean "every address" should use
    /// [`IpSet::insert_range`] with the family's full span instead.
    pub fn insert(&mut self, family: Family, base: u128, prefix: u32) -> Result<(), IpSetError> {
        let width = family.width_bits();
        if prefix > width {
            return Err(IpSetError::Prefix { prefix, width });
        }
        let prefix = if prefix == 0 { width } else { prefix };
        if family == self.trie.family() {
            self.trie.insert(base, prefix);
            return Ok(());
        }
        self.insert_cross_family(family, base, prefix)
    }

    fn insert_cross_family(&mut self, family: Family, base: u128, prefix: u32) -> Result<(), IpSetError> {
        if !self.auto_convert {
            return Err(IpSetError::Ipv6);
        }
        match (self.trie.family(), family) {
            (Family::V4, Family::V6) => {
                // widen this set to v6 in place, then insert natively
                let widened = self.trie.to_v6_mapped();
                self.trie = widened;
                self.trie.insert(base, prefix);
                Ok(())
            }
            (Family::V6, Family::V4) => {
                let mapped = crate::ip::v4_to_mapped(base as u32);
                self.trie.insert(mapped, prefix + 96);
                Ok(())
            }
            _ => unreachable!("same-family case handled by caller"),
        }
    }

    /// Remove `base/prefix`. As with [`IpSet::insert`], `prefix == 0` means
    /// a single address, not the whole address space.
    pub fn remove(&mut self, family: Family, base: u128, prefix: u32) -> Result<(), IpSetError> {
        let width = family.width_bits();
        if prefix > width {
            return Err(IpSetError::Prefix { prefix, width });
        }
        if family != self.trie.family() {
            return Err(IpSetError::Ipv6);
        }
        let prefix = if prefix == 0 { width } else { prefix };
        self.trie.remove(base, prefix);
        Ok(())
    }

    pub fn contains(&self, family: Family, addr: u128) -> bool {
        if family != self.trie.family() {
            return false;
        }
        self.trie.contains(addr)
    }

    pub fn clean(&mut self) {
        self.trie.clean();
    }

    /// All maximal blocks, ascending. Requires a clean set.
    pub fn blocks(&self) -> Result<Vec<(u128, u32)>, IpSetError> {
        if self.trie.is_dirty() {
            return Err(IpSetError::RequireClean);
        }
        Ok(self.trie.blocks())
    }

    pub fn count_exact(&self) -> Option<u128> {
        self.trie.count_exact()
    }

    pub fn count_approx(&self) -> f64 {
        self.trie.count_approx()
    }

    pub fn union(&mut self, other: &IpSet) -> Result<(), IpSetError> {
        let other_trie = self.coerce(other)?;
        self.trie.union_with(&other_trie);
        Ok(())
    }

    pub fn intersect(&mut self, other: &IpSet) -> Result<(), IpSetError> {
        let other_trie = self.coerce(other)?;
        self.trie.intersect_with(&other_trie);
        Ok(())
    }

    pub fn subtract(&mut self, other: &IpSet) -> Result<(), IpSetError> {
        let other_trie = self.coerce(other)?;
        self.trie.subtract_with(&other_trie);
        Ok(())
    }

    pub fn intersects(&self, other: &IpSet) -> Result<bool, IpSetError> {
        let other_trie = self.coerce(other)?;
        Ok(self.trie.intersects(&other_trie))
    }

    /// Produce `other`'s trie in `self`'s family, converting (or refusing
    /// to convert, per `auto_convert`) as needed.
    fn coerce(&self, other: &IpSet) -> Result<Trie, IpSetError> {
        if other.trie.family() == self.trie.family() {
            return Ok(other.trie.clone());
        }
        if !self.auto_convert {
            return Err(IpSetError::Ipv6);
        }
        match (other.trie.family(), self.trie.family()) {
            (Family::V4, Family::V6) => Ok(other.trie.to_v6_mapped()),
            (Family::V6, Family::V4) => other.trie.to_v4().ok_or(IpSetError::Ipv6),
            _ => unreachable!(),
        }
    }

    pub fn mask(&mut self, prefix: u32) {
        self.trie.mask(prefix);
    }

    pub fn mask_and_fill(&mut self, prefix: u32) {
        self.trie.mask_and_fill(prefix);
    }

    /// Insert every address in `[low, high]` (inclusive), decomposed into
    /// the minimal covering set of CIDR blocks.
    pub fn insert_range(&mut self, family: Family, low: u128, high: u128) -> Result<(), IpSetError> {
        if family != self.trie.family() {
            return self.insert_cross_family_range(family, low, high);
        }
        self.trie.insert_range(low, high);
        Ok(())
    }

    fn insert_cross_family_range(&mut self, family: Family, low: u128, high: u128) -> Result<(), IpSetError> {
        if !self.auto_convert {
            return Err(IpSetError::Ipv6);
        }
        match (self.trie.family(), family) {
            (Family::V4, Family::V6) => {
                self.trie = self.trie.to_v6_mapped();
                self.trie.insert_range(low, high);
                Ok(())
            }
            (Family::V6, Family::V4) => {
                let lo = crate::ip::v4_to_mapped(low as u32);
                let hi = crate::ip::v4_to_mapped(high as u32);
                self.trie.insert_range(lo, hi);
                Ok(())
            }
            _ => unreachable!("same-family case handled by caller"),
        }
    }

    /// Insert every address the wildcard pattern describes as a host
    /// route. Caller-bounded: a pattern with wide-open groups expands to
    /// an enormous number of inserts (spec §4.1).
    pub fn insert_wildcard(&mut self, wild: &Wildcard) -> Result<(), IpSetError> {
        let family = wild.family();
        let mut err = None;
        wild.for_each_address(|addr| {
            if err.is_some() {
                return;
            }
            if let Err(e) = self.insert(family, addr, family.width_bits()) {
                err = Some(e);
            }
        });
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn remove_wildcard(&mut self, wild: &Wildcard) -> Result<(), IpSetError> {
        let family = wild.family();
        if family != self.trie.family() {
            return Err(IpSetError::Ipv6);
        }
        wild.for_each_address(|addr| self.trie.remove(addr, family.width_bits()));
        Ok(())
    }

    /// Whether any address the wildcard describes is a member. Short
    /// circuits on the first hit rather than expanding the whole pattern.
    pub fn intersects_wildcard(&self, wild: &Wildcard) -> bool {
        if wild.family() != self.trie.family() {
            return false;
        }
        let mut found = false;
        wild.for_each_address(|addr| {
            if !found && self.trie.contains(addr) {
                found = true;
            }
        });
        found
    }

    /// Convert between address families. v4→v6 always succeeds (every v4
    /// address maps into `::ffff:0:0/96`); v6→v4 fails with
    /// [`IpSetError::Ipv6`] unless every stored block already lies in that
    /// range.
    pub fn convert(&mut self, target: Family) -> Result<(), IpSetError> {
        if target == self.trie.family() {
            return Ok(());
        }
        match (self.trie.family(), target) {
            (Family::V4, Family::V6) => {
                self.trie = self.trie.to_v6_mapped();
                Ok(())
            }
            (Family::V6, Family::V4) => {
                self.trie = self.trie.to_v4().ok_or(IpSetError::Ipv6)?;
                Ok(())
            }
            _ => unreachable!(),
        }
    }

    /// Unique address count, clamped to `u64::MAX` when the true count
    /// overflows (only possible for a near-full IPv6 set); `count_approx`
    /// gives the double-precision shadow in that case (spec §4.1).
    pub fn count(&self) -> (u64, Option<f64>) {
        match self.trie.count_exact() {
            Some(n) if n <= u128::from(u64::MAX) => (n as u64, None),
            _ => (u64::MAX, Some(self.trie.count_approx())),
        }
    }

    /// Visit every maximal CIDR block (or, with `cidr_blocks = false`,
    /// every individual address — caller-bounded) projected through
    /// `policy`. Requires a clean set.
    pub fn walk<F: FnMut(Family, u128, u32)>(
        &self,
        cidr_blocks: bool,
        policy: V6Policy,
        mut cb: F,
    ) -> Result<(), IpSetError> {
        if self.trie.is_dirty() {
            return Err(IpSetError::RequireClean);
        }
        let projected = iter::project(self.trie.family(), self.trie.blocks(), policy);
        for block in projected {
            if cidr_blocks {
                cb(block.family, block.base, block.prefix);
            } else {
                let width = block.family.width_bits();
                let count = if width - block.prefix >= 128 {
                    u128::MAX
                } else {
                    1u128 << (width - block.prefix)
                };
                for i in 0..count {
                    cb(block.family, block.base | i, width);
                }
            }
        }
        Ok(())
    }

    /// Bind an ascending-order block iterator, projected through `policy`.
    /// Requires a clean set.
    pub fn iterator_bind(&self, policy: V6Policy) -> Result<IpSetIterator, IpSetError> {
        if self.trie.is_dirty() {
            return Err(IpSetError::RequireClean);
        }
        let projected = iter::project(self.trie.family(), self.trie.blocks(), policy);
        Ok(IpSetIterator::new(projected, self.trie.family()))
    }

    /// Read the header and fully decompressed body bytes shared by
    /// [`IpSet::read`] and [`IpSet::process_stream`], plus the decoded
    /// `(version, byte order, family)` needed to dispatch into the right
    /// body decoder.
    fn read_body(stream: &mut Stream) -> Result<(FormatVersion, crate::stream::Endian, Family, Vec<u8>), IpSetError> {
        let header = stream.read_header()?;
        if header.file_format != FileFormat::IpSet {
            return Err(IpSetError::FileType);
        }
        let version = FormatVersion::from_u8(header.record_version)?;
        let order = header.byte_order;
        let compression = header.compression;
        if !version.allows_compression() && compression != CompressionMethod::None {
            return Err(IpSetError::FileIo(StreamError::CompressionForbiddenByVersion));
        }
        let family_entry: Option<Result<FamilyEntry, StreamError>> = header.get_entry::<FamilyEntry>();

        let codec = compress::codec_for(compression).map_err(IpSetError::FileIo)?;
        let mut body = Vec::new();
        let mut block_buf = [0u8; 4];
        loop {
            match stream.read_bytes(&mut block_buf) {
                Ok(()) => {
                    let len = u32::from_be_bytes(block_buf) as usize;
                    let mut raw = vec![0u8; len];
                    stream.read_bytes(&mut raw)?;
                    let mut decompressed = codec.decompress(&raw, len * 4)?;
                    body.append(&mut decompressed);
                }
                Err(e) if matches!(e, crate::stream::StreamError::Eof) => break,
                Err(e) => return Err(IpSetError::FileIo(e)),
            }
        }

        let family = match version {
            FormatVersion::V2 | FormatVersion::V3 => Family::V4,
            FormatVersion::V4 | FormatVersion::V5 => match family_entry {
                Some(r) => r?.0,
                None => Family::V6,
            },
        };

        Ok((version, order, family, body))
    }

    /// Read a complete IPset from an already-open, header-read [`Stream`].
    pub fn read(stream: &mut Stream) -> Result<Self, IpSetError> {
        let (version, order, family, body) = Self::read_body(stream)?;

        let trie = match version {
            FormatVersion::V2 => format::decode_v2(&body, order)?,
            FormatVersion::V3 => format::decode_node_array(&body, order, Family::V4)?,
            FormatVersion::V4 => format::decode_node_array(&body, order, family)?,
            FormatVersion::V5 => format::decode_block_seq(&body, order, family)?,
        };

        Ok(Self {
            trie,
            auto_convert: true,
        })
    }

    /// Write the set as a single framed, compressed block, choosing the
    /// record format per family (legacy v2 only when explicitly requested
    /// via `want_v2`).
    pub fn write(
        &mut self,
        stream: &mut Stream,
        compression: CompressionMethod,
        want_v2: bool,
    ) -> Result<(), IpSetError> {
        self.trie.clean();
        let version = format::select_format(self.trie.family(), want_v2);
        if !version.allows_compression() && compression != CompressionMethod::None {
            return Err(IpSetError::FileIo(
                crate::stream::StreamError::CompressionForbiddenByVersion,
            ));
        }

        let mut header = FileHeader::new(FileFormat::IpSet, version as u8, version.record_length());
        header.compression = compression;
        if matches!(version, FormatVersion::V4 | FormatVersion::V5) {
            header.set_entry(&FamilyEntry(self.trie.family()));
        }
        stream.write_header(header)?;

        let order = crate::stream::Endian::native();
        let body = match version {
            FormatVersion::V2 => format::encode_v2(&self.trie, order)?,
            FormatVersion::V3 | FormatVersion::V4 => format::encode_node_array(&self.trie, order),
            FormatVersion::V5 => format::encode_block_seq(&self.trie, order),
        };

        let codec = compress::codec_for(compression).map_err(IpSetError::FileIo)?;
        for chunk in body.chunks(compress::BLOCK_SIZE) {
            let compressed = codec.compress(chunk)?;
            stream.write_bytes(&(compressed.len() as u32).to_be_bytes())?;
            stream.write_bytes(&compressed)?;
        }
        Ok(())
    }

    /// Stream-process every block of a file without holding the whole set
    /// in memory at once: the body is decoded and `visit` invoked for each
    /// maximal CIDR block as its record is reached, never collecting the
    /// blocks into a [`Trie`].
    pub fn process_stream<F: FnMut(u128, u32)>(
        stream: &mut Stream,
        visit: F,
    ) -> Result<(), IpSetError> {
        let (version, order, family, body) = Self::read_body(stream)?;
        match version {
            FormatVersion::V2 => format::walk_v2(&body, order, visit)?,
            FormatVersion::V3 => format::walk_node_array(&body, order, Family::V4, visit)?,
            FormatVersion::V4 => format::walk_node_array(&body, order, family, visit)?,
            FormatVersion::V5 => format::walk_block_seq(&body, order, family, visit)?,
        }
        Ok(())
    }

    pub fn seek_to_start(stream: &mut Stream) -> Result<(), IpSetError> {
        stream.seek(SeekFrom::Start(0)).map_err(IpSetError::FileIo)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::Family;
    use crate::stream::{ContentType, Mode};

    #[test]
    fn v4_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set.ips");

        let mut set = IpSet::create(Family::V4);
        set.insert(Family::V4, 0x0A00_0000, 8).unwrap();
        set.insert(Family::V4, 0xC0A8_0000, 16).unwrap();

        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        w.open().unwrap();
        set.write(&mut w, CompressionMethod::None, false).unwrap();
        w.close().unwrap();

        let mut r = Stream::create(Mode::Read, ContentType::Binary);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        let read_back = IpSet::read(&mut r).unwrap();
        assert!(read_back.contains(Family::V4, 0x0A01_0203));
        assert!(read_back.contains(Family::V4, 0xC0A8_0101));
        assert!(!read_back.contains(Family::V4, 0xD000_0000));
    }

    #[test]
    fn insert_wrong_family_without_autoconvert_errors() {
        let mut set = IpSet::create(Family::V4);
        set.auto_convert_disable();
        let err = set.insert(Family::V6, 1, 128).unwrap_err();
        assert!(matches!(err, IpSetError::Ipv6));
    }

    #[test]
    fn blocks_requires_clean() {
        let mut set = IpSet::create(Family::V4);
        set.insert(Family::V4, 0x0A00_0000, 8).unwrap();
        assert!(matches!(set.blocks(), Err(IpSetError::RequireClean)));
        set.clean();
        assert!(set.blocks().is_ok());
    }

    #[test]
    fn insert_range_decomposes_and_counts() {
        let mut set = IpSet::create(Family::V4);
        set.insert_range(Family::V4, 0x0A00_0000, 0x0A00_0003).unwrap();
        set.clean();
        assert_eq!(set.count(), (4, None));
    }

    #[test]
    fn wildcard_insert_and_intersect() {
        let mut set = IpSet::create(Family::V4);
        let w = Wildcard::v4([vec![10], vec![0, 1], vec![0], vec![1, 2, 3]]);
        set.insert_wildcard(&w).unwrap();
        assert!(set.contains(Family::V4, 0x0A01_0002));
        assert!(!set.contains(Family::V4, 0x0A02_0001));
        assert!(set.intersects_wildcard(&w));

        set.remove_wildcard(&w).unwrap();
        assert!(!set.contains(Family::V4, 0x0A01_0002));
    }

    #[test]
    fn convert_v4_to_v6_and_back() {
        let mut set = IpSet::create(Family::V4);
        set.insert(Family::V4, 0x0A00_0000, 24).unwrap();
        set.convert(Family::V6).unwrap();
        assert_eq!(set.family(), Family::V6);
        set.convert(Family::V4).unwrap();
        assert_eq!(set.family(), Family::V4);
        assert!(set.contains(Family::V4, 0x0A00_0001));
    }

    #[test]
    fn convert_v6_to_v4_fails_outside_mapped_range() {
        let mut set = IpSet::create(Family::V6);
        set.insert(Family::V6, 1u128 << 64, 64).unwrap();
        assert!(matches!(set.convert(Family::V4), Err(IpSetError::Ipv6)));
    }

    #[test]
    fn walk_visits_blocks_in_order() {
        let mut set = IpSet::create(Family::V4);
        set.insert(Family::V4, 0x0A00_0000, 24).unwrap();
        set.insert(Family::V4, 0x0B00_0000, 24).unwrap();
        set.clean();
        let mut seen = Vec::new();
        set.walk(true, V6Policy::Mix, |_family, base, prefix| seen.push((base, prefix)))
            .unwrap();
        assert_eq!(seen, vec![(0x0A00_0000, 24), (0x0B00_0000, 24)]);
    }

    #[test]
    fn process_stream_visits_blocks_from_a_v3_node_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set.ips");

        let mut set = IpSet::create(Family::V4);
        set.insert(Family::V4, 0x0A00_0000, 24).unwrap();
        set.insert(Family::V4, 0x0B00_0000, 24).unwrap();

        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        w.open().unwrap();
        set.write(&mut w, CompressionMethod::None, false).unwrap();
        w.close().unwrap();

        let mut r = Stream::create(Mode::Read, ContentType::Binary);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        let mut seen = Vec::new();
        IpSet::process_stream(&mut r, |base, prefix| seen.push((base, prefix))).unwrap();
        assert_eq!(seen, vec![(0x0A00_0000, 24), (0x0B00_0000, 24)]);
    }

    #[test]
    fn process_stream_visits_blocks_from_a_v5_block_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set.ips");

        let mut set = IpSet::create(Family::V6);
        set.insert(Family::V6, 0x2001_0db8 << 96, 32).unwrap();

        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        w.open().unwrap();
        set.write(&mut w, CompressionMethod::None, false).unwrap();
        w.close().unwrap();

        let mut r = Stream::create(Mode::Read, ContentType::Binary);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        let mut seen = Vec::new();
        IpSet::process_stream(&mut r, |base, prefix| seen.push((base, prefix))).unwrap();
        assert_eq!(seen, vec![(0x2001_0db8 << 96, 32)]);
    }

    #[test]
    fn read_rejects_compression_forbidden_by_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set.ips");

        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        w.open().unwrap();
        let mut header = FileHeader::new(FileFormat::IpSet, FormatVersion::V2 as u8, FormatVersion::V2.record_length());
        header.compression = CompressionMethod::Zlib;
        w.write_header(header).unwrap();
        w.close().unwrap();

        let mut r = Stream::create(Mode::Read, ContentType::Binary);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        let err = IpSet::read(&mut r).unwrap_err();
        assert!(matches!(
            err,
            IpSetError::FileIo(StreamError::CompressionForbiddenByVersion)
        ));
    }

    #[test]
    fn iterator_reports_modified_after_family_widen() {
        let mut set = IpSet::create(Family::V4);
        set.insert(Family::V4, 0x0A00_0000, 24).unwrap();
        set.clean();
        let mut it = set.iterator_bind(V6Policy::Mix).unwrap();
        assert!(it.next(&set).unwrap().is_some());

        set.insert(Family::V6, 0x2001_0db8 << 96, 32).unwrap();
        assert!(matches!(it.next(&set), Err(IpSetError::Modified)));
    }
}
