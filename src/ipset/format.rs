//! On-disk IPset record formats (spec §4.1, §6).
//!
//! Four format versions share one file header (spec §3) but differ in how
//! the trie's blocks are laid out as records:
//!
//! - **v2** — legacy: a bare sequence of `(u32 base, u32 prefix)` pairs,
//!   IPv4 only, compression forbidden (kept only for reading old files;
//!   never chosen as a write default).
//! - **v3** — a pointer-free radix node array, IPv4 only.
//! - **v4** — the same node array, generalized to IPv6-width addresses.
//! - **v5** — a CIDR-ordered sequence of `(u8 base[16], u32 prefix)`
//!   blocks; the natural layout for a sparse, mostly-disjoint-block IPv6
//!   set where a node array would waste space on deep near-empty spines.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::error::IpSetError;
use crate::ip::Family;
use crate::stream::Endian;

use super::trie::Trie;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V2 = 2,
    V3 = 3,
    V4 = 4,
    V5 = 5,
}

impl FormatVersion {
    pub fn from_u8(v: u8) -> Result<Self, IpSetError> {
        match v {
            2 => Ok(FormatVersion::V2),
            3 => Ok(FormatVersion::V3),
            4 => Ok(FormatVersion::V4),
            5 => Ok(FormatVersion::V5),
            other => Err(IpSetError::FileVersion(other)),
        }
    }

    pub fn record_length(self) -> u32 {
        match self {
            FormatVersion::V2 => 8,
            FormatVersion::V3 | FormatVersion::V4 => 12,
            FormatVersion::V5 => 20,
        }
    }

    pub fn allows_compression(self) -> bool {
        !matches!(self, FormatVersion::V2)
    }

    pub fn supports_family(self, family: Family) -> bool {
        match self {
            FormatVersion::V2 | FormatVersion::V3 => family == Family::V4,
            FormatVersion::V4 | FormatVersion::V5 => true,
        }
    }
}

/// Choose the default write format for a family, honoring an explicit
/// request to emit the legacy v2 layout.
pub fn select_format(family: Family, want_v2: bool) -> FormatVersion {
    if want_v2 && family == Family::V4 {
        return FormatVersion::V2;
    }
    match family {
        Family::V4 => FormatVersion::V3,
        Family::V6 => FormatVersion::V5,
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

// ── v2 / v5: block sequences ────────────────────────────────────────────

pub fn encode_v2(trie: &Trie, order: Endian) -> Result<Vec<u8>, IpSetError> {
    if trie.family() != Family::V4 {
        return Err(IpSetError::Ipv6);
    }
    let mut out = Vec::new();
    for (base, prefix) in trie.blocks() {
        write_u32(&mut out, order, base as u32);
        write_u32(&mut out, order, prefix);
    }
    Ok(out)
}

/// Walk a v2 body record-by-record, invoking `visit` as each block decodes
/// rather than collecting them into a [`Trie`] first (spec.md's
/// `process_stream` contract: "visits each block without materializing
/// the full set in memory").
pub fn walk_v2<F: FnMut(u128, u32)>(bytes: &[u8], order: Endian, mut visit: F) -> Result<(), IpSetError> {
    if bytes.len() % 8 != 0 {
        return Err(IpSetError::FileHeader);
    }
    for chunk in bytes.chunks_exact(8) {
        let base = read_u32(order, &chunk[0..4]) as u128;
        let prefix = read_u32(order, &chunk[4..8]);
        if prefix > 32 {
            return Err(IpSetError::Prefix { prefix, width: 32 });
        }
        visit(base, prefix);
    }
    Ok(())
}

pub fn decode_v2(bytes: &[u8], order: Endian) -> Result<Trie, IpSetError> {
    if bytes.len() % 8 != 0 {
        return Err(IpSetError::FileHeader);
    }
    let mut trie = Trie::new(Family::V4);
    for chunk in bytes.chunks_exact(8) {
        let base = read_u32(order, &chunk[0..4]) as u128;
        let prefix = read_u32(order, &chunk[4..8]);
        if prefix > 32 {
            return Err(IpSetError::Prefix { prefix, width: 32 });
        }
        trie.insert(base, prefix);
    }
    Ok(trie)
}

pub fn encode_block_seq(trie: &Trie, order: Endian) -> Vec<u8> {
    let mut out = Vec::new();
    for (base, prefix) in trie.blocks() {
        out.extend_from_slice(&base.to_be_bytes());
        write_u32(&mut out, order, prefix);
    }
    out
}

/// Walk a v5 (block-sequence) body record-by-record without building a
/// [`Trie`].
pub fn walk_block_seq<F: FnMut(u128, u32)>(
    bytes: &[u8],
    order: Endian,
    family: Family,
    mut visit: F,
) -> Result<(), IpSetError> {
    if bytes.len() % 20 != 0 {
        return Err(IpSetError::FileHeader);
    }
    let width = family.width_bits();
    for chunk in bytes.chunks_exact(20) {
        let mut base_bytes = [0u8; 16];
        base_bytes.copy_from_slice(&chunk[0..16]);
        let base = u128::from_be_bytes(base_bytes);
        let prefix = read_u32(order, &chunk[16..20]);
        if prefix > width {
            return Err(IpSetError::Prefix { prefix, width });
        }
        visit(base, prefix);
    }
    Ok(())
}

pub fn decode_block_seq(bytes: &[u8], order: Endian, family: Family) -> Result<Trie, IpSetError> {
    if bytes.len() % 20 != 0 {
        return Err(IpSetError::FileHeader);
    }
    let width = family.width_bits();
    let mut trie = Trie::new(family);
    for chunk in bytes.chunks_exact(20) {
        let mut base_bytes = [0u8; 16];
        base_bytes.copy_from_slice(&chunk[0..16]);
        let base = u128::from_be_bytes(base_bytes);
        let prefix = read_u32(order, &chunk[16..20]);
        if prefix > width {
            return Err(IpSetError::Prefix { prefix, width });
        }
        trie.insert(base, prefix);
    }
    Ok(trie)
}

// ── v3 / v4: pointer-free node array ────────────────────────────────────
//
// Each record is `(left: u32, right: u32)`. A child value of `EMPTY`
// means no node; `LEAF` means the branch is fully present; any other
// value is the index of another record in this same array. The root is
// always record 0.

const EMPTY: u32 = u32::MAX;
const LEAF: u32 = u32::MAX - 1;

pub fn encode_node_array(trie: &Trie, order: Endian) -> Vec<u8> {
    // Re-walk the trie's own block list through a scratch copy so the
    // array is built from a clean, minimal tree regardless of the
    // caller's pending insert/remove history.
    let mut scratch = trie.clone();
    scratch.clean();

    let mut records: Vec<(u32, u32)> = Vec::new();
    encode_node(&scratch, &mut records);

    let mut out = Vec::with_capacity(records.len() * 8);
    for (left, right) in records {
        write_u32(&mut out, order, left);
        write_u32(&mut out, order, right);
    }
    out
}

/// A subtree's relationship to the set's minimal block list.
enum SubtreeState {
    Empty,
    Full,
    Partial,
}

/// Classify the subtree covering `[base, base + 2^(width-depth))` against
/// a pre-sorted, minimal block list (`blocks` must come from a cleaned
/// trie, as produced by [`Trie::clean`]).
fn subtree_state(blocks: &[(u128, u32)], family: Family, base: u128, depth: u32, width: u32) -> SubtreeState {
    let covered_by_ancestor = blocks
        .iter()
        .any(|&(b, p)| p <= depth && b == crate::ip::mask_to_prefix(family, base, p));
    if covered_by_ancestor {
        return SubtreeState::Full;
    }
    let span_bits = width - depth;
    let size = if span_bits >= 128 { u128::MAX } else { 1u128 << span_bits };
    let hi = base.checked_add(size.wrapping_sub(1)).unwrap_or(u128::MAX);
    let any_inside = blocks.iter().any(|&(b, _)| b >= base && b <= hi);
    if any_inside {
        SubtreeState::Partial
    } else {
        SubtreeState::Empty
    }
}

/// Recursively serialize starting at the trie's logical root, returning
/// the child encoding for whatever sits at `(base, depth)`. An entirely
/// empty or fully-present set needs no recursion at all.
fn encode_node(trie: &Trie, records: &mut Vec<(u32, u32)>) {
    fn walk(
        blocks: &[(u128, u32)],
        family: Family,
        base: u128,
        depth: u32,
        width: u32,
        records: &mut Vec<(u32, u32)>,
    ) -> u32 {
        let state = subtree_state(blocks, family, base, depth, width);
        match state {
            SubtreeState::Full => return LEAF,
            SubtreeState::Empty => return EMPTY,
            SubtreeState::Partial => {}
        }
        let shift = width - 1 - depth;
        let left_base = base;
        let right_base = base | (1u128 << shift);
        let left = walk(blocks, family, left_base, depth + 1, width, records);
        let right = walk(blocks, family, right_base, depth + 1, width, records);
        let idx = records.len() as u32;
        records.push((left, right));
        idx
    }

    if trie.is_empty() {
        return;
    }
    let width = trie.family().width_bits();
    let blocks = trie.blocks();
    match subtree_state(&blocks, trie.family(), 0, 0, width) {
        SubtreeState::Full => {
            records.push((LEAF, LEAF));
        }
        _ => {
            walk(&blocks, trie.family(), 0, 0, width, records);
        }
    }
}

/// Walk a v3/v4 node array, invoking `visit` for each maximal block as its
/// leaf record is reached, without ever allocating a [`Trie`] (no arena,
/// no pool) to hold the decoded shape.
pub fn walk_node_array<F: FnMut(u128, u32)>(
    bytes: &[u8],
    order: Endian,
    family: Family,
    mut visit: F,
) -> Result<(), IpSetError> {
    if bytes.len() % 8 != 0 {
        return Err(IpSetError::FileHeader);
    }
    let records: Vec<(u32, u32)> = bytes
        .chunks_exact(8)
        .map(|c| (read_u32(order, &c[0..4]), read_u32(order, &c[4..8])))
        .collect();
    if records.is_empty() {
        return Ok(());
    }
    let width = family.width_bits();

    if records.len() == 1 && records[0] == (LEAF, LEAF) {
        visit(0, 0);
        return Ok(());
    }

    fn walk<F: FnMut(u128, u32)>(
        records: &[(u32, u32)],
        idx: usize,
        base: u128,
        depth: u32,
        width: u32,
        visit: &mut F,
    ) -> Result<(), IpSetError> {
        let (left, right) = *records.get(idx).ok_or(IpSetError::Corrupt)?;
        let shift = width - 1 - depth;
        let left_base = base;
        let right_base = base | (1u128 << shift);
        match left {
            EMPTY => {}
            LEAF => visit(left_base, depth + 1),
            other => walk(records, other as usize, left_base, depth + 1, width, visit)?,
        }
        match right {
            EMPTY => {}
            LEAF => visit(right_base, depth + 1),
            other => walk(records, other as usize, right_base, depth + 1, width, visit)?,
        }
        Ok(())
    }

    walk(&records, records.len() - 1, 0, 0, width, &mut visit)
}

pub fn decode_node_array(bytes: &[u8], order: Endian, family: Family) -> Result<Trie, IpSetError> {
    if bytes.len() % 8 != 0 {
        return Err(IpSetError::FileHeader);
    }
    let records: Vec<(u32, u32)> = bytes
        .chunks_exact(8)
        .map(|c| (read_u32(order, &c[0..4]), read_u32(order, &c[4..8])))
        .collect();
    if records.is_empty() {
        return Ok(Trie::new(family));
    }

    let mut trie = Trie::new(family);
    let width = family.width_bits();

    fn visit(
        records: &[(u32, u32)],
        idx: usize,
        base: u128,
        depth: u32,
        width: u32,
        trie: &mut Trie,
    ) -> Result<(), IpSetError> {
        let (left, right) = *records.get(idx).ok_or(IpSetError::Corrupt)?;
        let shift = width - 1 - depth;
        let left_base = base;
        let right_base = base | (1u128 << shift);
        match left {
            EMPTY => {}
            LEAF => trie.insert(left_base, depth + 1),
            other => visit(records, other as usize, left_base, depth + 1, width, trie)?,
        }
        match right {
            EMPTY => {}
            LEAF => trie.insert(right_base, depth + 1),
            other => visit(records, other as usize, right_base, depth + 1, width, trie)?,
        }
        Ok(())
    }

    if records.len() == 1 && records[0] == (LEAF, LEAF) {
        trie.insert(0, 0);
        return Ok(trie);
    }

    visit(&records, records.len() - 1, 0, 0, width, &mut trie)?;
    Ok(trie)
}
