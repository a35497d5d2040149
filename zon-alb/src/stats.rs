use crate::info::InfoTable;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod stat {
    pub const TX_FRAMES: usize = 0;
    pub const TX_BALANCED: usize = 1;
    pub const TX_UNBALANCED: usize = 2;
    pub const TX_DROPPED: usize = 3;
    pub const TX_ERRORS: usize = 4;
    pub const LP_SENT: usize = 5;
    pub const LP_ERRORS: usize = 6;
    pub const ARP_UPDATES_SENT: usize = 7;
    pub const ARP_UPDATE_ERRORS: usize = 8;
    pub const TLB_REBALANCES: usize = 9;
    pub const RLB_REBALANCES: usize = 10;
    pub const RLB_PURGED: usize = 11;
    pub const MAX: usize = 12;
}

static STATS_NAMES: [&str; stat::MAX] = [
    "tx_frames",
    "tx_balanced",
    "tx_unbalanced",
    "tx_dropped",
    "tx_errors",
    "lp_sent",
    "lp_errors",
    "arp_updates_sent",
    "arp_update_errors",
    "tlb_rebalances",
    "rlb_rebalances",
    "rlb_purged",
];

pub struct Stats {
    name: String,
    counters: [AtomicU64; stat::MAX],
}

impl Stats {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn inc(&self, stat_idx: usize) {
        self.add(stat_idx, 1);
    }

    pub fn add(&self, stat_idx: usize, value: u64) {
        if let Some(counter) = self.counters.get(stat_idx) {
            counter.fetch_add(value, Ordering::Relaxed);
        }
    }

    pub fn get(&self, stat_idx: usize) -> u64 {
        self.counters
            .get(stat_idx)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn as_str(stat_idx: usize) -> &'static str {
        STATS_NAMES.get(stat_idx).copied().unwrap_or("unknown")
    }

    fn table(&self) -> InfoTable {
        let mut sinfo = InfoTable::new(vec![format!("{} stat", self.name).as_str(), "count"]);
        for idx in 0..stat::MAX {
            sinfo.push_row(vec![
                Self::as_str(idx).to_string(),
                self.get(idx).to_string(),
            ]);
        }
        sinfo
    }

    pub fn print_all(&self) {
        self.table().print("");
    }
}
