//! Red-black tree for wide (16-byte / `u128`) bag keys, spec §4.2.
//!
//! IPv6-mapped bag keys spread far too widely for a dense byte-stride
//! radix tree to pay for itself — most internal nodes would hold a single
//! live child. A balanced comparison tree trades that sparseness for
//! guaranteed `O(log n)` operations instead. Nodes are arena-indexed
//! through the same [`Pool`] substrate the radix tree and the IPset trie
//! use, keeping a parent pointer per node so deletion's fixup walk can
//! climb back toward the root without re-descending from scratch.

use crate::pool::{Pool, PoolIndex, NONE, RBTREE_CHUNK};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

struct Node {
    key: u128,
    value: u64,
    color: Color,
    parent: PoolIndex,
    left: PoolIndex,
    right: PoolIndex,
}

pub struct RbTree {
    pool: Pool<Node>,
    root: PoolIndex,
    count: usize,
}

impl RbTree {
    pub fn new() -> Self {
        Self {
            pool: Pool::new(RBTREE_CHUNK),
            root: NONE,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn color(&self, idx: PoolIndex) -> Color {
        if idx == NONE {
            Color::Black
        } else {
            self.pool.get(idx).color
        }
    }

    pub fn get(&self, key: u128) -> Option<u64> {
        let mut idx = self.root;
        while idx != NONE {
            let node = self.pool.get(idx);
            idx = match key.cmp(&node.key) {
                std::cmp::Ordering::Less => node.left,
                std::cmp::Ordering::Greater => node.right,
                std::cmp::Ordering::Equal => return Some(node.value),
            };
        }
        None
    }

    fn left_rotate(&mut self, x: PoolIndex) {
        let y = self.pool.get(x).right;
        let y_left = self.pool.get(y).left;
        self.pool.get_mut(x).right = y_left;
        if y_left != NONE {
            self.pool.get_mut(y_left).parent = x;
        }
        let x_parent = self.pool.get(x).parent;
        self.pool.get_mut(y).parent = x_parent;
        if x_parent == NONE {
            self.root = y;
        } else if self.pool.get(x_parent).left == x {
            self.pool.get_mut(x_parent).left = y;
        } else {
            self.pool.get_mut(x_parent).right = y;
        }
        self.pool.get_mut(y).left = x;
        self.pool.get_mut(x).parent = y;
    }

    fn right_rotate(&mut self, x: PoolIndex) {
        let y = self.pool.get(x).left;
        let y_right = self.pool.get(y).right;
        self.pool.get_mut(x).left = y_right;
        if y_right != NONE {
            self.pool.get_mut(y_right).parent = x;
        }
        let x_parent = self.pool.get(x).parent;
        self.pool.get_mut(y).parent = x_parent;
        if x_parent == NONE {
            self.root = y;
        } else if self.pool.get(x_parent).right == x {
            self.pool.get_mut(x_parent).right = y;
        } else {
            self.pool.get_mut(x_parent).left = y;
        }
        self.pool.get_mut(y).right = x;
        self.pool.get_mut(x).parent = y;
    }

    pub fn set(&mut self, key: u128, value: u64) {
        let mut parent = NONE;
        let mut cur = self.root;
        while cur != NONE {
            parent = cur;
            let node = self.pool.get(cur);
            match key.cmp(&node.key) {
                std::cmp::Ordering::Less => cur = node.left,
                std::cmp::Ordering::Greater => cur = node.right,
                std::cmp::Ordering::Equal => {
                    self.pool.get_mut(cur).value = value;
                    return;
                }
            }
        }

        let new_node = self
            .pool
            .alloc(Node {
                key,
                value,
                color: Color::Red,
                parent,
                left: NONE,
                right: NONE,
            })
            .expect("pool exhausted");
        self.count += 1;

        if parent == NONE {
            self.root = new_node;
        } else if key < self.pool.get(parent).key {
            self.pool.get_mut(parent).left = new_node;
        } else {
            self.pool.get_mut(parent).right = new_node;
        }
        self.insert_fixup(new_node);
    }

    fn insert_fixup(&mut self, mut z: PoolIndex) {
        while self.color(self.pool.get(z).parent) == Color::Red {
            let parent = self.pool.get(z).parent;
            let grandparent = self.pool.get(parent).parent;
            if parent == self.pool.get(grandparent).left {
                let uncle = self.pool.get(grandparent).right;
                if self.color(uncle) == Color::Red {
                    self.pool.get_mut(parent).color = Color::Black;
                    self.pool.get_mut(uncle).color = Color::Black;
                    self.pool.get_mut(grandparent).color = Color::Red;
                    z = grandparent;
                } else {
                    if z == self.pool.get(parent).right {
                        z = parent;
                        self.left_rotate(z);
                    }
                    let parent = self.pool.get(z).parent;
                    let grandparent = self.pool.get(parent).parent;
                    self.pool.get_mut(parent).color = Color::Black;
                    self.pool.get_mut(grandparent).color = Color::Red;
                    self.right_rotate(grandparent);
                }
            } else {
                let uncle = self.pool.get(grandparent).left;
                if self.color(uncle) == Color::Red {
                    self.pool.get_mut(parent).color = Color::Black;
                    self.pool.get_mut(uncle).color = Color::Black;
                    self.pool.get_mut(grandparent).color = Color::Red;
                    z = grandparent;
                } else {
                    if z == self.pool.get(parent).left {
                        z = parent;
                        self.right_rotate(z);
                    }
                    let parent = self.pool.get(z).parent;
                    let grandparent = self.pool.get(parent).parent;
                    self.pool.get_mut(parent).color = Color::Black;
                    self.pool.get_mut(grandparent).color = Color::Red;
                    self.left_rotate(grandparent);
                }
            }
            if self.root == z {
                break;
            }
        }
        self.pool.get_mut(self.root).color = Color::Black;
    }

    fn minimum(&self, mut idx: PoolIndex) -> PoolIndex {
        while self.pool.get(idx).left != NONE {
            idx = self.pool.get(idx).left;
        }
        idx
    }

    fn transplant(&mut self, u: PoolIndex, v: PoolIndex) {
        let u_parent = self.pool.get(u).parent;
        if u_parent == NONE {
            self.root = v;
        } else if self.pool.get(u_parent).left == u {
            self.pool.get_mut(u_parent).left = v;
        } else {
            self.pool.get_mut(u_parent).right = v;
        }
        if v != NONE {
            self.pool.get_mut(v).parent = u_parent;
        }
    }

    pub fn remove(&mut self, key: u128) -> bool {
        let mut z = self.root;
        while z != NONE {
            let node = self.pool.get(z);
            z = match key.cmp(&node.key) {
                std::cmp::Ordering::Less => node.left,
                std::cmp::Ordering::Greater => node.right,
                std::cmp::Ordering::Equal => break,
            };
        }
        if z == NONE {
            return false;
        }

        let mut y = z;
        let mut y_original_color = self.color(y);
        let x;
        let x_parent;

        if self.pool.get(z).left == NONE {
            x = self.pool.get(z).right;
            x_parent = self.pool.get(z).parent;
            self.transplant(z, x);
        } else if self.pool.get(z).right == NONE {
            x = self.pool.get(z).left;
            x_parent = self.pool.get(z).parent;
            self.transplant(z, x);
        } else {
            y = self.minimum(self.pool.get(z).right);
            y_original_color = self.color(y);
            x = self.pool.get(y).right;
            if self.pool.get(y).parent == z {
                x_parent = y;
                if x != NONE {
                    self.pool.get_mut(x).parent = y;
                }
            } else {
                x_parent = self.pool.get(y).parent;
                self.transplant(y, x);
                let z_right = self.pool.get(z).right;
                self.pool.get_mut(y).right = z_right;
                self.pool.get_mut(self.pool.get(y).right).parent = y;
            }
            self.transplant(z, y);
            let z_left = self.pool.get(z).left;
            self.pool.get_mut(y).left = z_left;
            self.pool.get_mut(z_left).parent = y;
            self.pool.get_mut(y).color = self.pool.get(z).color;
        }

        self.pool.free(z);
        self.count -= 1;

        if y_original_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }
        true
    }

    fn delete_fixup(&mut self, mut x: PoolIndex, mut x_parent: PoolIndex) {
        while x != self.root && self.color(x) == Color::Black {
            if x_parent == NONE {
                break;
            }
            if x == self.pool.get(x_parent).left {
                let mut w = self.pool.get(x_parent).right;
                if self.color(w) == Color::Red {
                    self.pool.get_mut(w).color = Color::Black;
                    self.pool.get_mut(x_parent).color = Color::Red;
                    self.left_rotate(x_parent);
                    w = self.pool.get(x_parent).right;
                }
                let w_left = self.pool.get(w).left;
                let w_right = self.pool.get(w).right;
                if self.color(w_left) == Color::Black && self.color(w_right) == Color::Black {
                    self.pool.get_mut(w).color = Color::Red;
                    x = x_parent;
                    x_parent = self.pool.get(x).parent;
                } else {
                    if self.color(w_right) == Color::Black {
                        self.pool.get_mut(w_left).color = Color::Black;
                        self.pool.get_mut(w).color = Color::Red;
                        self.right_rotate(w);
                        w = self.pool.get(x_parent).right;
                    }
                    self.pool.get_mut(w).color = self.color(x_parent);
                    self.pool.get_mut(x_parent).color = Color::Black;
                    let w_right = self.pool.get(w).right;
                    self.pool.get_mut(w_right).color = Color::Black;
                    self.left_rotate(x_parent);
                    x = self.root;
                    x_parent = NONE;
                }
            } else {
                let mut w = self.pool.get(x_parent).left;
                if self.color(w) == Color::Red {
                    self.pool.get_mut(w).color = Color::Black;
                    self.pool.get_mut(x_parent).color = Color::Red;
                    self.right_rotate(x_parent);
                    w = self.pool.get(x_parent).left;
                }
                let w_left = self.pool.get(w).left;
                let w_right = self.pool.get(w).right;
                if self.color(w_right) == Color::Black && self.color(w_left) == Color::Black {
                    self.pool.get_mut(w).color = Color::Red;
                    x = x_parent;
                    x_parent = self.pool.get(x).parent;
                } else {
                    if self.color(w_left) == Color::Black {
                        self.pool.get_mut(w_right).color = Color::Black;
                        self.pool.get_mut(w).color = Color::Red;
                        self.left_rotate(w);
                        w = self.pool.get(x_parent).left;
                    }
                    self.pool.get_mut(w).color = self.color(x_parent);
                    self.pool.get_mut(x_parent).color = Color::Black;
                    let w_left = self.pool.get(w).left;
                    self.pool.get_mut(w_left).color = Color::Black;
                    self.right_rotate(x_parent);
                    x = self.root;
                    x_parent = NONE;
                }
            }
        }
        if x != NONE {
            self.pool.get_mut(x).color = Color::Black;
        }
    }

    pub fn iter_sorted(&self) -> Vec<(u128, u64)> {
        let mut out = Vec::with_capacity(self.count);
        self.in_order(self.root, &mut out);
        out
    }

    fn in_order(&self, idx: PoolIndex, out: &mut Vec<(u128, u64)>) {
        if idx == NONE {
            return;
        }
        let node = self.pool.get(idx);
        self.in_order(node.left, out);
        out.push((node.key, node.value));
        self.in_order(node.right, out);
    }
}

impl Default for RbTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    #[test]
    fn set_get_update() {
        let mut t = RbTree::new();
        t.set(5, 50);
        t.set(3, 30);
        t.set(8, 80);
        assert_eq!(t.get(5), Some(50));
        t.set(5, 500);
        assert_eq!(t.get(5), Some(500));
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn sorted_iteration() {
        let mut t = RbTree::new();
        for k in [50u128, 10, 70, 30, 90, 20] {
            t.set(k, k as u64);
        }
        let keys: Vec<u128> = t.iter_sorted().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![10, 20, 30, 50, 70, 90]);
    }

    #[test]
    fn remove_shrinks_tree_and_keeps_order() {
        let mut t = RbTree::new();
        for k in 0u128..50 {
            t.set(k, k as u64);
        }
        for k in (0u128..50).step_by(2) {
            assert!(t.remove(k));
        }
        assert_eq!(t.len(), 25);
        let keys: Vec<u128> = t.iter_sorted().into_iter().map(|(k, _)| k).collect();
        let expected: Vec<u128> = (0u128..50).filter(|k| k % 2 == 1).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn random_insert_remove_stays_sorted() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut keys: Vec<u128> = (0u128..500).collect();
        keys.shuffle(&mut rng);

        let mut t = RbTree::new();
        for &k in &keys {
            t.set(k, k as u64);
        }
        let mut to_remove = keys.clone();
        to_remove.shuffle(&mut rng);
        for &k in to_remove.iter().take(250) {
            assert!(t.remove(k));
        }
        assert_eq!(t.len(), 250);
        let sorted_keys: Vec<u128> = t.iter_sorted().into_iter().map(|(k, _)| k).collect();
        let mut expected: Vec<u128> = sorted_keys.clone();
        expected.sort_unstable();
        assert_eq!(sorted_keys, expected);
    }
}
