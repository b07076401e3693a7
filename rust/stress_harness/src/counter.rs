// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use crate::shm::SharedMapping;
use crate::Result;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// Bogo-op counters shared by one stressor's worker family.
///
/// Each worker owns one slot. Increments are a relaxed load followed by a
/// relaxed store, not a locked read-modify-write: a slot has a single writer
/// at any time, and readers summing the block may see slightly stale values.
/// Counts only ever go up for the lifetime of the block.
#[derive(Debug)]
pub struct CounterBlock {
    map: SharedMapping,
    nr_slots: usize,
}

impl CounterBlock {
    /// Map a zeroed block of `nr_slots` counters. A failure here means the
    /// stressor should be skipped for lack of resources.
    pub fn create(nr_slots: usize) -> Result<Self> {
        let nr_slots = nr_slots.max(1);
        let map = SharedMapping::new(nr_slots * std::mem::size_of::<AtomicU64>())?;
        Ok(Self { map, nr_slots })
    }

    fn counters(&self) -> &[AtomicU64] {
        unsafe { std::slice::from_raw_parts(self.map.as_ptr() as *const AtomicU64, self.nr_slots) }
    }

    pub fn slots(&self) -> usize {
        self.nr_slots
    }

    #[inline]
    pub fn inc(&self, slot: usize) {
        self.add(slot, 1);
    }

    #[inline]
    pub fn add(&self, slot: usize, n: u64) {
        let c = &self.counters()[slot];
        c.store(c.load(Relaxed).wrapping_add(n), Relaxed);
    }

    pub fn get(&self, slot: usize) -> u64 {
        self.counters()[slot].load(Relaxed)
    }

    /// Sum of every slot. Racy by nature, so the result may already be
    /// behind by the time it is returned.
    pub fn aggregate(&self) -> u64 {
        self.counters()
            .iter()
            .fold(0u64, |acc, c| acc.wrapping_add(c.load(Relaxed)))
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.counters().iter().map(|c| c.load(Relaxed)).collect()
    }
}
