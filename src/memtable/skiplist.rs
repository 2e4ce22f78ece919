//! Probabilistic skip list backing the memtable.
//!
//! Nodes are stored in an arena and linked by index, which keeps the
//! structure entirely safe: deletion never unlinks a node, it only sets a
//! tombstone flag, so indices stay valid for the life of the list. A re-put
//! of a deleted key clears the flag in place.
//!
//! The level of a new node is the number of trailing one-bits in a fresh
//! 31-bit random draw, clamped to `[1, 32]`: the standard geometric
//! distribution with p = 1/2, giving O(log n) expected search and insert.

use crate::codec::Record;
use crate::memtable::MemStore;

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MAX_LEVELS: usize = 32;

const HEAD: usize = 0;

struct Node {
    key: Vec<u8>,
    value: Vec<u8>,
    deleted: bool,
    /// Forward links, one per level this node participates in.
    next: Vec<Option<usize>>,
}

pub struct SkipList {
    arena: Vec<Node>,
    /// Highest level currently in use.
    levels: usize,
    /// Approximate stored bytes: sum of key and value lengths.
    size: u32,
    rng: SmallRng,
}

impl SkipList {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_seed(seed)
    }

    pub fn with_seed(seed: u64) -> Self {
        let head = Node {
            key: Vec::new(),
            value: Vec::new(),
            deleted: false,
            next: vec![None; MAX_LEVELS],
        };
        Self {
            arena: vec![head],
            levels: 1,
            size: 0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Index of the node holding `key`, tombstoned or not.
    fn find(&self, key: &[u8]) -> Option<usize> {
        let mut current = HEAD;
        for level in (0..self.levels).rev() {
            while let Some(next) = self.arena[current].next[level] {
                match self.arena[next].key.as_slice().cmp(key) {
                    Ordering::Less => current = next,
                    Ordering::Equal => return Some(next),
                    Ordering::Greater => break,
                }
            }
        }
        None
    }

    fn random_level(&mut self) -> usize {
        let draw = self.rng.next_u32() >> 1;
        (draw.trailing_ones() as usize).clamp(1, MAX_LEVELS)
    }

    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>, deleted: bool) {
        let level = self.random_level();
        if level > self.levels {
            self.levels = level;
        }

        let mut preds = [HEAD; MAX_LEVELS];
        let mut current = HEAD;
        for l in (0..self.levels).rev() {
            while let Some(next) = self.arena[current].next[l] {
                if self.arena[next].key.as_slice() < key.as_slice() {
                    current = next;
                } else {
                    break;
                }
            }
            preds[l] = current;
        }

        self.size += (key.len() + value.len()) as u32;

        let idx = self.arena.len();
        let mut next = vec![None; level];
        for (l, slot) in next.iter_mut().enumerate() {
            *slot = self.arena[preds[l]].next[l];
        }
        self.arena.push(Node {
            key,
            value,
            deleted,
            next,
        });
        for l in 0..level {
            self.arena[preds[l]].next[l] = Some(idx);
        }
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore for SkipList {
    type Iter<'a> = Iter<'a>
    where
        Self: 'a;

    fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.find(key).map(|idx| {
            let node = &self.arena[idx];
            if node.deleted {
                None
            } else {
                Some(node.value.as_slice())
            }
        })
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        match self.find(key.as_slice()) {
            Some(idx) => {
                let node = &mut self.arena[idx];
                self.size -= node.value.len() as u32;
                self.size += value.len() as u32;
                node.value = value;
                node.deleted = false;
            }
            None => self.insert(key, value, false),
        }
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        match self.find(key) {
            Some(idx) => {
                let node = &mut self.arena[idx];
                let was_live = !node.deleted;
                self.size -= node.value.len() as u32;
                node.value = Vec::new();
                node.deleted = true;
                was_live
            }
            None => {
                self.insert(key.to_vec(), Vec::new(), true);
                false
            }
        }
    }

    fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: HEAD,
        }
    }

    fn size(&self) -> u32 {
        self.size
    }
}

/// In-order walk of the bottom level, one record per key, tombstones
/// included. Borrows the list, so mutation waits until iteration is done.
pub struct Iter<'a> {
    list: &'a SkipList,
    cursor: usize,
}

impl Iterator for Iter<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let next = self.list.arena[self.cursor].next[0]?;
        self.cursor = next;
        let node = &self.list.arena[next];
        if node.deleted {
            Some(Record::tombstone(node.key.clone()))
        } else {
            Some(Record::update(node.key.clone(), node.value.clone()))
        }
    }
}
