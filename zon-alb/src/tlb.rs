//! Transmit load balancing: every destination hash is pinned to one link
//! until the next rebalance, and new hashes go to the link with the largest
//! gap between its speed and its recorded load.

use crate::link::{LinkId, Slave};
use anyhow::anyhow;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use zon_alb_common::NULL_INDEX;

#[derive(Clone, Copy, Debug)]
struct TlbBucket {
    tx_link: Option<LinkId>,
    /// Bytes sent since the last rebalance
    tx_bytes: u64,
    /// Load estimate carried over from the previous period
    load_history: u64,
    next: u32,
    prev: u32,
}

impl TlbBucket {
    fn new() -> Self {
        Self {
            tx_link: None,
            tx_bytes: 0,
            load_history: 1,
            next: NULL_INDEX,
            prev: NULL_INDEX,
        }
    }

    fn detach(&mut self, save_load: bool, interval: u64) {
        if save_load {
            self.load_history = 1 + self.tx_bytes / interval;
            self.tx_bytes = 0;
        }
        self.tx_link = None;
        self.next = NULL_INDEX;
        self.prev = NULL_INDEX;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbLinkInfo {
    /// First bucket of the link's chain
    pub head: u32,
    /// Sum of the load estimates of the buckets assigned since the last clear
    pub load: u64,
}

impl Default for TlbLinkInfo {
    fn default() -> Self {
        Self {
            head: NULL_INDEX,
            load: 0,
        }
    }
}

/// Read-only copy of an assigned bucket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbEntry {
    pub index: u32,
    pub link: LinkId,
    pub tx_bytes: u64,
    pub load_history: u64,
}

struct TlbInner {
    buckets: Vec<TlbBucket>,
    links: BTreeMap<LinkId, TlbLinkInfo>,
}

impl TlbInner {
    fn clear_link(&mut self, link: LinkId, save_load: bool, interval: u64) {
        let mut index = self.links.get(&link).map_or(NULL_INDEX, |info| info.head);
        while index != NULL_INDEX {
            let bucket = &mut self.buckets[index as usize];
            let next = bucket.next;
            bucket.detach(save_load, interval);
            index = next;
        }
        // A removed link stays removed
        if let Some(info) = self.links.get_mut(&link) {
            *info = TlbLinkInfo::default();
        }
    }
}

pub struct TlbTable {
    inner: Mutex<TlbInner>,
    mask: u32,
    /// Seconds, converts accumulated bytes into a load estimate
    rebalance_interval: u64,
}

impl TlbTable {
    pub fn new(size: usize, rebalance_interval: u32) -> Result<Self, anyhow::Error> {
        if size == 0 || !size.is_power_of_two() {
            return Err(anyhow!("tlb table size {} is not a power of two", size));
        }
        if rebalance_interval == 0 {
            return Err(anyhow!("tlb rebalance interval can't be 0"));
        }

        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(size)
            .map_err(|e| anyhow!("out of memory for {} tlb buckets, {}", size, e))?;
        buckets.resize(size, TlbBucket::new());

        log::debug!("[tlb] table initialized with {} buckets", size);

        Ok(Self {
            inner: Mutex::new(TlbInner {
                buckets,
                links: BTreeMap::new(),
            }),
            mask: (size - 1) as u32,
            rebalance_interval: rebalance_interval as u64,
        })
    }

    fn lock(&self) -> MutexGuard<'_, TlbInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn size(&self) -> usize {
        self.mask as usize + 1
    }

    pub fn init_link(&self, link: LinkId) {
        self.lock().links.insert(link, TlbLinkInfo::default());
    }

    /// Unassigns all buckets of the link and drops its bookkeeping.
    pub fn remove_link(&self, link: LinkId) {
        let mut inner = self.lock();
        inner.clear_link(link, false, self.rebalance_interval);
        inner.links.remove(&link);
    }

    /// Returns the link for the hash bucket, assigning the least loaded link
    /// to a free bucket. `None` means no link can transmit.
    pub fn choose_channel(&self, links: &[Arc<Slave>], hash_index: u32, len: u32) -> Option<LinkId> {
        let index = (hash_index & self.mask) as usize;
        let mut guard = self.lock();
        let inner = &mut *guard;

        let assigned = match inner.buckets[index].tx_link {
            Some(link) => Some(link),
            None => {
                let link = least_loaded(links, &inner.links)?;
                let load_history = inner.buckets[index].load_history;
                let info = inner.links.entry(link).or_default();
                let next = info.head;
                info.head = index as u32;
                info.load += load_history;

                let bucket = &mut inner.buckets[index];
                bucket.tx_link = Some(link);
                bucket.next = next;
                bucket.prev = NULL_INDEX;
                if next != NULL_INDEX {
                    inner.buckets[next as usize].prev = index as u32;
                }

                log::trace!("[tlb] bucket {} assigned to link {}", index, link);
                Some(link)
            }
        };

        inner.buckets[index].tx_bytes += len as u64;
        assigned
    }

    /// Empties the link's chain. With `preserve_load` the bytes counted so
    /// far become the load estimate of the bucket's next assignment.
    pub fn clear_link(&self, link: LinkId, preserve_load: bool) {
        self.lock()
            .clear_link(link, preserve_load, self.rebalance_interval);
    }

    /// Periodic pass: frees every bucket so the next frames are spread again.
    /// The active link starts the new period with the unbalanced load.
    pub fn rebalance(&self, links: &[Arc<Slave>], active: Option<LinkId>, unbalanced_load: u64) {
        let mut inner = self.lock();
        for link in links {
            inner.clear_link(link.id(), true, self.rebalance_interval);
            if Some(link.id()) == active {
                if let Some(info) = inner.links.get_mut(&link.id()) {
                    info.load = unbalanced_load / self.rebalance_interval;
                }
            }
        }
        log::debug!("[tlb] rebalanced {} links", links.len());
    }

    pub fn link_info(&self, link: LinkId) -> Option<TlbLinkInfo> {
        self.lock().links.get(&link).copied()
    }

    /// Bucket indexes in chain order, head first.
    pub fn chain(&self, link: LinkId) -> Vec<u32> {
        let inner = self.lock();
        let mut chain = vec![];
        let mut index = inner.links.get(&link).map_or(NULL_INDEX, |info| info.head);
        while index != NULL_INDEX && chain.len() < inner.buckets.len() {
            chain.push(index);
            index = inner.buckets[index as usize].next;
        }
        chain
    }

    pub fn entry(&self, hash_index: u32) -> (Option<LinkId>, u64, u64) {
        let inner = self.lock();
        let bucket = &inner.buckets[(hash_index & self.mask) as usize];
        (bucket.tx_link, bucket.tx_bytes, bucket.load_history)
    }

    pub fn entries(&self) -> Vec<TlbEntry> {
        let inner = self.lock();
        inner
            .buckets
            .iter()
            .enumerate()
            .filter_map(|(index, b)| {
                b.tx_link.map(|link| TlbEntry {
                    index: index as u32,
                    link,
                    tx_bytes: b.tx_bytes,
                    load_history: b.load_history,
                })
            })
            .collect()
    }
}

/// Signed room left on the link, in bits.
fn compute_gap(speed: u32, load: u64) -> i64 {
    ((speed as i64) << 20) - ((load as i64) << 3)
}

fn least_loaded(links: &[Arc<Slave>], info: &BTreeMap<LinkId, TlbLinkInfo>) -> Option<LinkId> {
    let mut least_loaded = None;
    let mut max_gap = i64::MIN;

    for link in links.iter().filter(|l| l.can_tx()) {
        let load = info.get(&link.id()).map_or(0, |i| i.load);
        let gap = compute_gap(link.speed(), load);
        if least_loaded.is_none() || max_gap < gap {
            least_loaded = Some(link.id());
            max_gap = gap;
        }
    }

    least_loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimLink;
    use std::collections::BTreeSet;
    use zon_alb_common::{LinkFlags, TLB_HASH_TABLE_SIZE};

    fn links(speeds: &[u32]) -> Vec<Arc<Slave>> {
        speeds
            .iter()
            .enumerate()
            .map(|(i, &speed)| {
                let mac = [0x02, 0, 0, 0, 0, i as u8 + 1];
                Arc::new(Slave::new(
                    i as LinkId + 1,
                    &format!("eth{}", i),
                    speed,
                    mac,
                    Arc::new(SimLink::new(&format!("eth{}", i))),
                ))
            })
            .collect()
    }

    fn table(links: &[Arc<Slave>]) -> TlbTable {
        let tlb = TlbTable::new(TLB_HASH_TABLE_SIZE, 10).unwrap();
        for l in links {
            tlb.init_link(l.id());
        }
        tlb
    }

    /// Buckets reachable from each chain are exactly those assigned to it.
    fn assert_chains_consistent(tlb: &TlbTable, links: &[Arc<Slave>]) {
        let entries = tlb.entries();
        for l in links {
            let chain = tlb.chain(l.id()).into_iter().collect::<BTreeSet<_>>();
            let assigned = entries
                .iter()
                .filter(|e| e.link == l.id())
                .map(|e| e.index)
                .collect::<BTreeSet<_>>();
            assert_eq!(chain, assigned, "link {}", l.id());
        }
    }

    #[test]
    fn new_rejects_bad_sizes() {
        assert!(TlbTable::new(0, 10).is_err());
        assert!(TlbTable::new(100, 10).is_err());
        assert!(TlbTable::new(16, 0).is_err());
    }

    #[test]
    fn allocation_failure_is_reported() {
        let err = TlbTable::new(1 << 62, 10).err().unwrap();
        assert!(err.to_string().starts_with("out of memory"));
    }

    #[test]
    fn gap_selection_prefers_fast_links() {
        let links = links(&[1000, 1000, 100]);
        let tlb = table(&links);

        let picked = (0..3)
            .map(|h| tlb.choose_channel(&links, h, 64).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(&picked[0..2], &[1, 2]);
        assert!(!picked.contains(&3));
        assert_chains_consistent(&tlb, &links);
    }

    #[test]
    fn repeated_choice_is_stable_and_additive() {
        let links = links(&[1000, 1000]);
        let tlb = table(&links);

        let first = tlb.choose_channel(&links, 42, 100);
        let second = tlb.choose_channel(&links, 42, 250);
        assert_eq!(first, second);
        assert_eq!(tlb.entry(42).1, 350);
        assert_eq!(tlb.chain(first.unwrap()), vec![42]);
    }

    #[test]
    fn preserve_load_converts_bytes_to_estimate() {
        let links = links(&[1000]);
        let tlb = TlbTable::new(TLB_HASH_TABLE_SIZE, 1_000_000).unwrap();
        tlb.init_link(1);

        assert_eq!(tlb.choose_channel(&links, 7, 1_000_000), Some(1));
        tlb.clear_link(1, true);
        assert!(tlb.chain(1).is_empty());
        assert_eq!(tlb.entry(7), (None, 0, 2));
        assert_eq!(tlb.link_info(1).unwrap().load, 0);

        assert_eq!(tlb.choose_channel(&links, 7, 10), Some(1));
        assert_eq!(tlb.entry(7).2, 2);
        assert_eq!(tlb.link_info(1).unwrap().load, 2);
    }

    #[test]
    fn clear_without_preserve_keeps_estimate() {
        let links = links(&[1000]);
        let tlb = table(&links);
        tlb.choose_channel(&links, 3, 5000);
        tlb.clear_link(1, false);
        assert_eq!(tlb.entry(3), (None, 5000, 1));
    }

    #[test]
    fn equal_links_are_visited_before_repeating() {
        let links = links(&[1000, 1000, 1000, 1000]);
        let tlb = table(&links);

        let picked = (0..4)
            .map(|h| tlb.choose_channel(&links, h, 0).unwrap())
            .collect::<BTreeSet<_>>();
        assert_eq!(picked.len(), 4);
    }

    #[test]
    fn chains_stay_consistent_across_clears() {
        let links = links(&[1000, 100, 10]);
        let tlb = table(&links);

        for h in 0..64 {
            tlb.choose_channel(&links, h * 3, 1500);
        }
        assert_chains_consistent(&tlb, &links);

        tlb.clear_link(2, true);
        assert_chains_consistent(&tlb, &links);
        assert!(tlb.chain(2).is_empty());

        for h in 0..64 {
            tlb.choose_channel(&links, h * 5, 60);
        }
        assert_chains_consistent(&tlb, &links);

        tlb.remove_link(1);
        assert!(tlb.link_info(1).is_none());
        assert!(tlb.entries().iter().all(|e| e.link != 1));
        assert_chains_consistent(&tlb, &links[1..]);
    }

    #[test]
    fn clear_after_remove_keeps_link_gone() {
        let links = links(&[1000, 100]);
        let tlb = table(&links);
        for h in 0..16 {
            tlb.choose_channel(&links, h, 100);
        }

        tlb.remove_link(1);
        tlb.clear_link(1, false);
        assert!(tlb.link_info(1).is_none());
        assert!(tlb.chain(1).is_empty());

        tlb.clear_link(2, false);
        assert_eq!(tlb.link_info(2), Some(TlbLinkInfo::default()));
    }

    #[test]
    fn down_links_are_skipped() {
        let links = links(&[1000, 100]);
        let tlb = table(&links);
        links[0].set_flag(LinkFlags::UP, false);
        assert_eq!(tlb.choose_channel(&links, 1, 64), Some(2));
        links[1].set_flag(LinkFlags::ACTIVE, false);
        assert_eq!(tlb.choose_channel(&links, 2, 64), None);
        assert_eq!(tlb.entry(2), (None, 0, 1));
    }

    #[test]
    fn rebalance_seeds_active_link_with_unbalanced_load() {
        let links = links(&[1000, 1000]);
        let tlb = table(&links);
        for h in 0..8 {
            tlb.choose_channel(&links, h, 100);
        }
        tlb.rebalance(&links, Some(2), 1000);
        assert!(tlb.entries().is_empty());
        assert_eq!(tlb.link_info(1).unwrap().load, 0);
        assert_eq!(tlb.link_info(2).unwrap().load, 100);
        assert_eq!(tlb.entry(0).2, 11);
    }
}
