//! Arena-backed radix (patricia) trie for CIDR block storage (spec §4.1,
//! §9 REDESIGN FLAGS).
//!
//! A node is either `Internal` (two children, one per next address bit) or
//! `Leaf` (every address below this point is a member). A leaf carries no
//! prefix-length field: the block it represents is implied entirely by its
//! depth during a traversal from the root, so there is nothing to keep in
//! sync when a block is split or merged. `NONE` means "no member address
//! reaches here" — there is no explicit "absent" node.

use crate::ip::{self, Family};
use crate::pool::{Pool, PoolIndex, NONE, TRIE_CHUNK};

#[derive(Clone)]
enum Node {
    Internal { left: PoolIndex, right: PoolIndex },
    Leaf,
}

#[derive(Clone)]
pub struct Trie {
    family: Family,
    pool: Pool<Node>,
    root: PoolIndex,
    dirty: bool,
}

impl Trie {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            pool: Pool::new(TRIE_CHUNK),
            root: NONE,
            dirty: false,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_empty(&self) -> bool {
        self.root == NONE
    }

    fn width(&self) -> u32 {
        self.family.width_bits()
    }

    fn is_leaf(&self, idx: PoolIndex) -> bool {
        idx != NONE && matches!(self.pool.get(idx), Node::Leaf)
    }

    fn free_subtree(&mut self, idx: PoolIndex) {
        if idx == NONE {
            return;
        }
        let children = match self.pool.get(idx) {
            Node::Internal { left, right } => Some((*left, *right)),
            Node::Leaf => None,
        };
        if let Some((l, r)) = children {
            self.free_subtree(l);
            self.free_subtree(r);
        }
        self.pool.free(idx);
    }

    /// Insert the CIDR block `base/prefix`. `base` need not be pre-masked.
    pub fn insert(&mut self, base: u128, prefix: u32) {
        self.dirty = true;
        let base = ip::mask_to_prefix(self.family, base, prefix);
        self.root = self.insert_rec(self.root, base, 0, prefix);
    }

    fn insert_rec(&mut self, node: PoolIndex, base: u128, depth: u32, prefix: u32) -> PoolIndex {
        if node != NONE && self.is_leaf(node) {
            return node; // already fully covered by an ancestor block
        }
        if depth == prefix {
            self.free_subtree(node);
            return self.pool.alloc(Node::Leaf).expect("pool exhausted");
        }
        let (left, right) = match node {
            NONE => (NONE, NONE),
            idx => match self.pool.get(idx) {
                Node::Internal { left, right } => (*left, *right),
                Node::Leaf => unreachable!(),
            },
        };
        let bit = ip::bit_at(self.family, base, depth);
        let (new_left, new_right) = if bit == 0 {
            (self.insert_rec(left, base, depth + 1, prefix), right)
        } else {
            (left, self.insert_rec(right, base, depth + 1, prefix))
        };
        match node {
            NONE => self
                .pool
                .alloc(Node::Internal {
                    left: new_left,
                    right: new_right,
                })
                .expect("pool exhausted"),
            idx => {
                *self.pool.get_mut(idx) = Node::Internal {
                    left: new_left,
                    right: new_right,
                };
                idx
            }
        }
    }

    /// Insert every address in `[low, high]`, decomposed into the minimal
    /// set of CIDR blocks.
    pub fn insert_range(&mut self, low: u128, high: u128) {
        if low > high {
            return;
        }
        let width = self.width();
        let full_max = full_max(width);
        if low == 0 && high == full_max {
            self.insert(0, 0);
            return;
        }
        let mut cur = low;
        loop {
            let tz = if cur == 0 { width } else { cur.trailing_zeros().min(width) };
            let mut prefix = width - tz;
            loop {
                let bits = width - prefix;
                if bits == width {
                    prefix += 1;
                    continue;
                }
                let block_len = 1u128 << bits;
                let end = match cur.checked_add(block_len) {
                    Some(e) => e - 1,
                    None => {
                        prefix += 1;
                        continue;
                    }
                };
                if end <= high {
                    break;
                }
                prefix += 1;
            }
            let block_len = 1u128 << (width - prefix);
            self.insert(cur, prefix);
            match cur.checked_add(block_len) {
                Some(next) if next <= high => cur = next,
                _ => break,
            }
        }
    }

    /// Remove the CIDR block `base/prefix`, splitting any leaf that only
    /// partially overlaps it into the minimal surrounding blocks.
    pub fn remove(&mut self, base: u128, prefix: u32) {
        self.dirty = true;
        let base = ip::mask_to_prefix(self.family, base, prefix);
        self.root = self.remove_rec(self.root, base, 0, prefix);
    }

    fn remove_rec(&mut self, node: PoolIndex, base: u128, depth: u32, prefix: u32) -> PoolIndex {
        if node == NONE {
            return NONE;
        }
        if depth == prefix {
            self.free_subtree(node);
            return NONE;
        }
        if self.is_leaf(node) {
            // Split: this leaf is full from `depth` down. Give both
            // branches a placeholder full leaf, then keep splitting the
            // branch that matches `base` until we reach the target depth.
            let bit = ip::bit_at(self.family, base, depth);
            let matching_placeholder = self.pool.alloc(Node::Leaf).expect("pool exhausted");
            let other_placeholder = self.pool.alloc(Node::Leaf).expect("pool exhausted");
            let new_matching = self.remove_rec(matching_placeholder, base, depth + 1, prefix);
            let (left, right) = if bit == 0 {
                (new_matching, other_placeholder)
            } else {
                (other_placeholder, new_matching)
            };
            *self.pool.get_mut(node) = Node::Internal { left, right };
            return node;
        }
        let (left, right) = match self.pool.get(node) {
            Node::Internal { left, right } => (*left, *right),
            Node::Leaf => unreachable!(),
        };
        let bit = ip::bit_at(self.family, base, depth);
        let (new_left, new_right) = if bit == 0 {
            (self.remove_rec(left, base, depth + 1, prefix), right)
        } else {
            (left, self.remove_rec(right, base, depth + 1, prefix))
        };
        if new_left == NONE && new_right == NONE {
            self.pool.free(node);
            return NONE;
        }
        *self.pool.get_mut(node) = Node::Internal {
            left: new_left,
            right: new_right,
        };
        node
    }

    pub fn contains(&self, addr: u128) -> bool {
        let mut idx = self.root;
        let mut depth = 0;
        let width = self.width();
        while idx != NONE && depth < width {
            match self.pool.get(idx) {
                Node::Leaf => return true,
                Node::Internal { left, right } => {
                    let bit = ip::bit_at(self.family, addr, depth);
                    idx = if bit == 0 { *left } else { *right };
                    depth += 1;
                }
            }
        }
        idx != NONE
    }

    fn clone_subtree(&mut self, other: &Trie, idx: PoolIndex) -> PoolIndex {
        if idx == NONE {
            return NONE;
        }
        match other.pool.get(idx) {
            Node::Leaf => self.pool.alloc(Node::Leaf).expect("pool exhausted"),
            Node::Internal { left, right } => {
                let nl = self.clone_subtree(other, *left);
                let nr = self.clone_subtree(other, *right);
                self.pool
                    .alloc(Node::Internal { left: nl, right: nr })
                    .expect("pool exhausted")
            }
        }
    }

    pub fn union_with(&mut self, other: &Trie) {
        self.dirty = true;
        self.root = self.union_rec(self.root, other, other.root);
    }

    fn union_rec(&mut self, a: PoolIndex, other: &Trie, b: PoolIndex) -> PoolIndex {
        if a == NONE {
            return self.clone_subtree(other, b);
        }
        if b == NONE {
            return a;
        }
        if self.is_leaf(a) {
            return a;
        }
        if other.is_leaf(b) {
            self.free_subtree(a);
            return self.clone_subtree(other, b);
        }
        let (al, ar) = match self.pool.get(a) {
            Node::Internal { left, right } => (*left, *right),
            Node::Leaf => unreachable!(),
        };
        let (bl, br) = match other.pool.get(b) {
            Node::Internal { left, right } => (*left, *right),
            Node::Leaf => unreachable!(),
        };
        let nl = self.union_rec(al, other, bl);
        let nr = self.union_rec(ar, other, br);
        *self.pool.get_mut(a) = Node::Internal { left: nl, right: nr };
        a
    }

    pub fn intersect_with(&mut self, other: &Trie) {
        self.dirty = true;
        self.root = self.intersect_rec(self.root, other, other.root);
    }

    fn intersect_rec(&mut self, a: PoolIndex, other: &Trie, b: PoolIndex) -> PoolIndex {
        if a == NONE {
            return NONE;
        }
        if b == NONE {
            self.free_subtree(a);
            return NONE;
        }
        if self.is_leaf(a) {
            if other.is_leaf(b) {
                return a;
            }
            self.free_subtree(a);
            return self.clone_subtree(other, b);
        }
        if other.is_leaf(b) {
            return a;
        }
        let (al, ar) = match self.pool.get(a) {
            Node::Internal { left, right } => (*left, *right),
            Node::Leaf => unreachable!(),
        };
        let (bl, br) = match other.pool.get(b) {
            Node::Internal { left, right } => (*left, *right),
            Node::Leaf => unreachable!(),
        };
        let nl = self.intersect_rec(al, other, bl);
        let nr = self.intersect_rec(ar, other, br);
        if nl == NONE && nr == NONE {
            self.pool.free(a);
            return NONE;
        }
        *self.pool.get_mut(a) = Node::Internal { left: nl, right: nr };
        a
    }

    pub fn subtract_with(&mut self, other: &Trie) {
        self.dirty = true;
        self.root = self.subtract_rec(self.root, other, other.root);
    }

    fn subtract_rec(&mut self, a: PoolIndex, other: &Trie, b: PoolIndex) -> PoolIndex {
        if a == NONE {
            return NONE;
        }
        if b == NONE {
            return a;
        }
        if other.is_leaf(b) {
            self.free_subtree(a);
            return NONE;
        }
        if self.is_leaf(a) {
            let (bl, br) = match other.pool.get(b) {
                Node::Internal { left, right } => (*left, *right),
                Node::Leaf => unreachable!(),
            };
            let al = self.pool.alloc(Node::Leaf).expect("pool exhausted");
            let ar = self.pool.alloc(Node::Leaf).expect("pool exhausted");
            self.pool.free(a);
            let nl = self.subtract_rec(al, other, bl);
            let nr = self.subtract_rec(ar, other, br);
            if nl == NONE && nr == NONE {
                return NONE;
            }
            return self
                .pool
                .alloc(Node::Internal { left: nl, right: nr })
                .expect("pool exhausted");
        }
        let (al, ar) = match self.pool.get(a) {
            Node::Internal { left, right } => (*left, *right),
            Node::Leaf => unreachable!(),
        };
        let (bl, br) = match other.pool.get(b) {
            Node::Internal { left, right } => (*left, *right),
            Node::Leaf => unreachable!(),
        };
        let nl = self.subtract_rec(al, other, bl);
        let nr = self.subtract_rec(ar, other, br);
        if nl == NONE && nr == NONE {
            self.pool.free(a);
            return NONE;
        }
        *self.pool.get_mut(a) = Node::Internal { left: nl, right: nr };
        a
    }

    pub fn intersects(&self, other: &Trie) -> bool {
        self.intersects_rec(self.root, other, other.root)
    }

    fn intersects_rec(&self, a: PoolIndex, other: &Trie, b: PoolIndex) -> bool {
        if a == NONE || b == NONE {
            return false;
        }
        if self.is_leaf(a) || other.is_leaf(b) {
            return true;
        }
        let (al, ar) = match self.pool.get(a) {
            Node::Internal { left, right } => (*left, *right),
            Node::Leaf => unreachable!(),
        };
        let (bl, br) = match other.pool.get(b) {
            Node::Internal { left, right } => (*left, *right),
            Node::Leaf => unreachable!(),
        };
        self.intersects_rec(al, other, bl) || self.intersects_rec(ar, other, br)
    }

    /// Merge adjacent sibling leaves bottom-up into their parent leaf,
    /// producing the minimal block decomposition. The only pass required
    /// for correctness: insert/remove already keep "no ancestor leaf
    /// shadows a present descendant" true at all times.
    pub fn clean(&mut self) {
        if self.root != NONE {
            self.root = self.merge_rec(self.root);
        }
        self.dirty = false;
    }

    fn merge_rec(&mut self, idx: PoolIndex) -> PoolIndex {
        let (l, r) = match self.pool.get(idx) {
            Node::Leaf => return idx,
            Node::Internal { left, right } => (*left, *right),
        };
        let new_l = if l != NONE { self.merge_rec(l) } else { NONE };
        let new_r = if r != NONE { self.merge_rec(r) } else { NONE };
        if self.is_leaf(new_l) && self.is_leaf(new_r) {
            self.pool.free(new_l);
            self.pool.free(new_r);
            self.pool.free(idx);
            return self.pool.alloc(Node::Leaf).expect("pool exhausted");
        }
        *self.pool.get_mut(idx) = Node::Internal { left: new_l, right: new_r };
        idx
    }

    /// All maximal stored blocks, in ascending address order. Callers
    /// should `clean()` first to guarantee minimality.
    pub fn blocks(&self) -> Vec<(u128, u32)> {
        let mut out = Vec::new();
        self.walk_blocks(self.root, 0, 0, &mut out);
        out
    }

    fn walk_blocks(&self, idx: PoolIndex, base: u128, depth: u32, out: &mut Vec<(u128, u32)>) {
        if idx == NONE {
            return;
        }
        match self.pool.get(idx) {
            Node::Leaf => out.push((base, depth)),
            Node::Internal { left, right } => {
                self.walk_blocks(*left, base, depth + 1, out);
                let shift = self.width() - 1 - depth;
                let right_base = base | (1u128 << shift);
                self.walk_blocks(*right, right_base, depth + 1, out);
            }
        }
    }

    /// Exact address count, or `None` on overflow (only the full address
    /// space, `width` addresses wide, exceeds `u128::MAX`).
    pub fn count_exact(&self) -> Option<u128> {
        self.count_exact_rec(self.root, 0)
    }

    fn count_exact_rec(&self, idx: PoolIndex, depth: u32) -> Option<u128> {
        if idx == NONE {
            return Some(0);
        }
        match self.pool.get(idx) {
            Node::Leaf => {
                let shift = self.width() - depth;
                if shift >= 128 {
                    None
                } else {
                    Some(1u128 << shift)
                }
            }
            Node::Internal { left, right } => {
                let l = self.count_exact_rec(*left, depth + 1)?;
                let r = self.count_exact_rec(*right, depth + 1)?;
                l.checked_add(r)
            }
        }
    }

    /// Approximate address count as `f64`, used when [`Trie::count_exact`]
    /// overflows (a fully-populated /0 IPv6 set).
    pub fn count_approx(&self) -> f64 {
        self.count_approx_rec(self.root, 0)
    }

    fn count_approx_rec(&self, idx: PoolIndex, depth: u32) -> f64 {
        if idx == NONE {
            return 0.0;
        }
        match self.pool.get(idx) {
            Node::Leaf => 2f64.powi((self.width() - depth) as i32),
            Node::Internal { left, right } => {
                self.count_approx_rec(*left, depth + 1) + self.count_approx_rec(*right, depth + 1)
            }
        }
    }

    /// Group every stored address into its enclosing `mask_prefix` network
    /// and keep only one representative host address per network; blocks
    /// bigger than `mask_prefix` are expanded into their contained
    /// networks first.
    pub fn mask(&mut self, mask_prefix: u32) {
        self.clean();
        let width = self.width();
        let blocks = self.blocks();
        let mut result = Trie::new(self.family);
        for (base, prefix) in blocks {
            if prefix >= mask_prefix {
                let net = ip::mask_to_prefix(self.family, base, mask_prefix);
                result.insert(net, width);
            } else {
                let step_bits = mask_prefix - prefix;
                let block_bits = width - mask_prefix;
                let count = 1u128 << step_bits;
                for i in 0..count {
                    let net = base | (i << block_bits);
                    result.insert(net, width);
                }
            }
        }
        *self = result;
    }

    /// Like [`Trie::mask`], but fills each enclosing network fully rather
    /// than keeping a single representative address; blocks already
    /// bigger than `mask_prefix` are carried over untouched.
    pub fn mask_and_fill(&mut self, mask_prefix: u32) {
        self.clean();
        let blocks = self.blocks();
        let mut result = Trie::new(self.family);
        for (base, prefix) in blocks {
            if prefix >= mask_prefix {
                let net = ip::mask_to_prefix(self.family, base, mask_prefix);
                result.insert(net, mask_prefix);
            } else {
                result.insert(base, prefix);
            }
        }
        *self = result;
    }

    /// Promote every block of a v4 trie into its `::ffff:0:0/96` v6
    /// representation.
    pub fn to_v6_mapped(&self) -> Trie {
        debug_assert_eq!(self.family, Family::V4);
        let mut out = Trie::new(Family::V6);
        for (base, prefix) in self.blocks() {
            let mapped = ip::v4_to_mapped(base as u32);
            out.insert(mapped, prefix + 96);
        }
        out
    }

    /// Demote a v6 trie to v4, failing if any stored block lies outside
    /// the `::ffff:0:0/96` range.
    pub fn to_v4(&self) -> Option<Trie> {
        debug_assert_eq!(self.family, Family::V6);
        let mut out = Trie::new(Family::V4);
        for (base, prefix) in self.blocks() {
            if prefix < 96 {
                return None;
            }
            let v4base = ip::mapped_to_v4(base)?;
            out.insert(v4base, prefix - 96);
        }
        Some(out)
    }
}

fn full_max(width: u32) -> u128 {
    if width >= 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    }
}
