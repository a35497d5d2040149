//! Adaptive load balancing engine: transmit balancing over the TLB table,
//! receive balancing through ARP over the RLB table, the link lifecycle and
//! the periodic driver.
//!
//! Lock order is link list, then active link, then one of the tables or the
//! monitor state. Frames are always sent after the table locks are released.

use crate::{
    frame::{self, ArpPacket, EthFrame, FrameKind},
    helpers::{is_broadcast_mac, mac_to_str},
    link::{self, ArpObserver, HwAddrError, LinkId, Slave, TransmitLink},
    rlb::{ClientNotice, RlbTable, RlbTimers},
    stats::{stat, Stats},
    tlb::TlbTable,
};
use anyhow::{anyhow, Context};
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};
use zon_alb_common::{
    ipx, simple_hash, LinkFlags, MacAddr, ALB_LP_INTERVAL, ALB_TIMER_TICKS_PER_SEC, IPPROTO_IGMP,
    MAC_V6_ALLMCAST, RLB_ARP_BURST_SIZE, RLB_HASH_TABLE_SIZE, RLB_PROMISC_TIMEOUT, RLB_UPDATE_DELAY,
    RLB_UPDATE_RETRY, TLB_HASH_TABLE_SIZE, TLB_REBALANCE_INTERVAL,
};

/// Periodic driver settings. Intervals are in seconds unless noted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlbTimers {
    pub ticks_per_sec: u32,
    pub tlb_rebalance_interval: u32,
    pub lp_interval: u32,
    pub rlb_update_delay: u32,
    /// ARP replies per client update
    pub rlb_arp_burst: u32,
    /// Extra update passes after a link was cleared
    pub rlb_update_retry: u32,
    pub rlb_promisc_timeout: u32,
}

impl Default for AlbTimers {
    fn default() -> Self {
        Self {
            ticks_per_sec: ALB_TIMER_TICKS_PER_SEC,
            tlb_rebalance_interval: TLB_REBALANCE_INTERVAL,
            lp_interval: ALB_LP_INTERVAL,
            rlb_update_delay: RLB_UPDATE_DELAY,
            rlb_arp_burst: RLB_ARP_BURST_SIZE,
            rlb_update_retry: RLB_UPDATE_RETRY,
            rlb_promisc_timeout: RLB_PROMISC_TIMEOUT,
        }
    }
}

impl AlbTimers {
    pub fn lp_ticks(&self) -> u32 {
        self.lp_interval.saturating_mul(self.ticks_per_sec).max(1)
    }

    pub fn rebalance_ticks(&self) -> u32 {
        self.tlb_rebalance_interval
            .saturating_mul(self.ticks_per_sec)
            .max(1)
    }

    pub fn update_delay_ticks(&self) -> u32 {
        self.rlb_update_delay.saturating_mul(self.ticks_per_sec)
    }

    pub fn promisc_ticks(&self) -> u32 {
        self.rlb_promisc_timeout
            .saturating_mul(self.ticks_per_sec)
            .max(1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XmitResult {
    Sent(LinkId),
    Dropped,
}

#[derive(Default)]
struct MonitorState {
    lp_counter: u32,
    tx_rebalance_counter: u32,
    promisc_counter: u32,
    /// The active link was put in promiscuous mode to learn a disabled MAC
    primary_is_promisc: bool,
}

pub struct Alb {
    name: String,
    bond_mac: MacAddr,
    timers: AlbTimers,
    links: RwLock<Vec<Arc<Slave>>>,
    active: RwLock<Option<Arc<Slave>>>,
    vlans: RwLock<Vec<u16>>,
    tlb: TlbTable,
    rlb: Option<RlbTable>,
    mon: Mutex<MonitorState>,
    /// Bytes sent through the active link without balancing
    unbalanced_load: AtomicU64,
    rlb_rebalance: AtomicBool,
    next_id: AtomicU32,
    stats: Stats,
}

impl Alb {
    /// Allocates both tables. Any failure leaves the bond without balancing.
    pub fn new(
        name: &str,
        bond_mac: MacAddr,
        timers: AlbTimers,
        rlb_enabled: bool,
    ) -> Result<Self, anyhow::Error> {
        if timers.ticks_per_sec == 0 {
            return Err(anyhow!("ticks per second can't be 0"));
        }

        let tlb = TlbTable::new(TLB_HASH_TABLE_SIZE, timers.tlb_rebalance_interval)
            .context("Failed to enable transmit balancing")?;
        let rlb = if rlb_enabled {
            let rlb_timers = RlbTimers {
                update_delay: timers.update_delay_ticks(),
                update_retry: timers.rlb_update_retry,
            };
            Some(
                RlbTable::new(RLB_HASH_TABLE_SIZE, rlb_timers)
                    .context("Failed to enable receive balancing")?,
            )
        } else {
            None
        };

        log::info!(
            "[alb] {} ready, mac {}, mode {}",
            name,
            mac_to_str(&bond_mac),
            if rlb_enabled { "alb" } else { "tlb" }
        );

        Ok(Self {
            name: name.to_string(),
            bond_mac,
            timers,
            links: RwLock::new(vec![]),
            active: RwLock::new(None),
            vlans: RwLock::new(vec![]),
            tlb,
            rlb,
            mon: Mutex::new(MonitorState::default()),
            unbalanced_load: AtomicU64::new(0),
            rlb_rebalance: AtomicBool::new(false),
            next_id: AtomicU32::new(1),
            stats: Stats::new(name),
        })
    }

    fn links(&self) -> RwLockReadGuard<'_, Vec<Arc<Slave>>> {
        self.links.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn links_mut(&self) -> RwLockWriteGuard<'_, Vec<Arc<Slave>>> {
        self.links.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn mon(&self) -> MutexGuard<'_, MonitorState> {
        self.mon.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bond_mac(&self) -> MacAddr {
        self.bond_mac
    }

    pub fn timers(&self) -> &AlbTimers {
        &self.timers
    }

    pub fn rlb_enabled(&self) -> bool {
        self.rlb.is_some()
    }

    pub fn tlb(&self) -> &TlbTable {
        &self.tlb
    }

    pub fn rlb(&self) -> Option<&RlbTable> {
        self.rlb.as_ref()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn link_list(&self) -> Vec<Arc<Slave>> {
        self.links().clone()
    }

    pub fn find_link(&self, id: LinkId) -> Option<Arc<Slave>> {
        link::find(&self.links(), id).cloned()
    }

    pub fn link_by_name(&self, name: &str) -> Option<Arc<Slave>> {
        self.links().iter().find(|l| l.name() == name).cloned()
    }

    pub fn active(&self) -> Option<Arc<Slave>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn active_id(&self) -> Option<LinkId> {
        self.active().map(|l| l.id())
    }

    pub fn vlans(&self) -> Vec<u16> {
        self.vlans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn unbalanced_load(&self) -> u64 {
        self.unbalanced_load.load(Ordering::Relaxed)
    }

    pub fn primary_is_promisc(&self) -> bool {
        self.mon().primary_is_promisc
    }

    /// Adds a link to the bond. The first link becomes the active one.
    pub fn attach(
        &self,
        name: &str,
        speed: u32,
        perm_hw_addr: MacAddr,
        dev: Arc<dyn TransmitLink>,
    ) -> Result<LinkId, anyhow::Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slave = Arc::new(Slave::new(id, name, speed, perm_hw_addr, dev));

        {
            let mut links = self.links_mut();
            if links.iter().any(|l| l.name() == name) {
                return Err(anyhow!("Link {} is already attached", name));
            }

            // Every link needs its own address, give a free one on collision
            let mut mac = perm_hw_addr;
            if !links.is_empty() && (mac == self.bond_mac || links.iter().any(|l| l.hw_addr() == mac)) {
                mac = self
                    .free_hw_addr(&links)
                    .ok_or_else(|| anyhow!("No free mac address for link {}", name))?;
                log::warn!(
                    "[link] {} mac {} in use, using {}",
                    name,
                    mac_to_str(&perm_hw_addr),
                    mac_to_str(&mac)
                );
            }

            match slave.set_hw_addr(&mac) {
                Ok(()) => {}
                Err(HwAddrError::NotSupported) => {
                    log::warn!("[link] {} can't change its mac, keeping {}", name, mac_to_str(&mac));
                    slave.assume_hw_addr(&mac);
                }
                Err(HwAddrError::Failed(e)) => {
                    return Err(e.context(format!("Failed to set the mac of link {}", name)));
                }
            }

            self.tlb.init_link(id);
            links.push(slave.clone());
        }

        // Rebalance as soon as possible
        self.mon().tx_rebalance_counter = self.timers.rebalance_ticks();
        if self.rlb.is_some() {
            self.rlb_rebalance.store(true, Ordering::Release);
        }

        log::info!("[link] attached {}", slave);

        if self.active().is_none() {
            self.handle_active_change(Some(slave));
        }
        Ok(id)
    }

    fn free_hw_addr(&self, links: &[Arc<Slave>]) -> Option<MacAddr> {
        links
            .iter()
            .map(|l| l.perm_hw_addr())
            .find(|mac| *mac != self.bond_mac && !links.iter().any(|l| l.hw_addr() == *mac))
    }

    /// Removes a link. Its flows and clients move to the remaining links.
    pub fn detach(&self, id: LinkId) -> Result<(), anyhow::Error> {
        let slave = self
            .find_link(id)
            .ok_or_else(|| anyhow!("No link with id {}", id))?;

        slave.set_flag(LinkFlags::UP | LinkFlags::ACTIVE, false);
        let was_active = self.active_id() == Some(id);
        if was_active {
            self.handle_active_change(None);
        }

        {
            let links = self.links();
            if links.len() > 1 {
                self.change_hw_addr_on_detach(&links, &slave);
            }
            self.tlb.remove_link(id);
            if let Some(rlb) = &self.rlb {
                rlb.reset_rx_link();
                self.rlb_clear_link(rlb, &links, &slave);
            }
        }

        self.links_mut().retain(|l| l.id() != id);

        let perm = slave.perm_hw_addr();
        if slave.hw_addr() != perm {
            if let Err(e) = slave.set_hw_addr(&perm) {
                log::warn!("[link] {} keeps {}, {}", slave.name(), mac_to_str(&slave.hw_addr()), e);
            }
        }

        log::info!("[link] detached {}", slave);

        if was_active {
            self.select_active();
        }
        Ok(())
    }

    /// The address leaving with the link must stay in the bond, so a link
    /// holding the leaving link's permanent address swaps with it.
    fn change_hw_addr_on_detach(&self, links: &[Arc<Slave>], slave: &Arc<Slave>) {
        let perm = slave.perm_hw_addr();
        if perm == slave.hw_addr() || perm == self.bond_mac {
            return;
        }
        let Some(found) = links
            .iter()
            .find(|l| l.id() != slave.id() && l.hw_addr() == perm)
        else {
            return;
        };
        self.swap_hw_addr(slave, found);
        self.fasten_mac_swap(slave, found);
    }

    /// Carrier change of a link.
    pub fn link_change(&self, id: LinkId, up: bool) -> Result<(), anyhow::Error> {
        let slave = self
            .find_link(id)
            .ok_or_else(|| anyhow!("No link with id {}", id))?;

        if up {
            slave.set_flag(LinkFlags::UP | LinkFlags::ACTIVE, true);
            self.mon().tx_rebalance_counter = self.timers.rebalance_ticks();
            if self.rlb.is_some() {
                self.rlb_rebalance.store(true, Ordering::Release);
            }
            log::info!("[link] {} is up", slave);
            if self.active().is_none() {
                self.handle_active_change(Some(slave));
            }
            return Ok(());
        }

        slave.set_flag(LinkFlags::UP, false);
        log::info!("[link] {} is down", slave);
        {
            let links = self.links();
            self.tlb.clear_link(id, false);
            if let Some(rlb) = &self.rlb {
                self.rlb_clear_link(rlb, &links, &slave);
            }
        }

        if self.active_id() == Some(id) {
            self.select_active();
        }
        Ok(())
    }

    fn rlb_clear_link(&self, rlb: &RlbTable, links: &[Arc<Slave>], slave: &Slave) {
        rlb.clear_link(links, slave.id());
        if self.active_id() != Some(slave.id()) {
            self.teach_disabled_mac_on_primary(&slave.hw_addr());
        }
    }

    /// Makes `id` the link that owns the bond address.
    pub fn set_active(&self, id: LinkId) -> Result<(), anyhow::Error> {
        let slave = self
            .find_link(id)
            .ok_or_else(|| anyhow!("No link with id {}", id))?;
        if !slave.can_tx() {
            return Err(anyhow!("Link {} can't transmit", slave));
        }
        self.handle_active_change(Some(slave));
        Ok(())
    }

    fn select_active(&self) {
        let candidate = self.links().iter().find(|l| l.can_tx()).cloned();
        if candidate.is_none() {
            log::warn!("[alb] {} has no link to transmit", self.name);
        }
        self.handle_active_change(candidate);
    }

    fn handle_active_change(&self, new: Option<Arc<Slave>>) {
        let old = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            if active.as_ref().map(|l| l.id()) == new.as_ref().map(|l| l.id()) {
                return;
            }
            std::mem::replace(&mut *active, new.clone())
        };

        {
            let mut mon = self.mon();
            if mon.primary_is_promisc {
                if let Some(old) = &old {
                    if let Err(e) = old.set_promiscuous(false) {
                        log::warn!("[alb] can't leave promiscuous mode on {}, {}", old.name(), e);
                    }
                }
                mon.primary_is_promisc = false;
                mon.promisc_counter = 0;
            }
        }

        let Some(new) = new else {
            return;
        };

        let links = self.link_list();
        let swap = old.or_else(|| {
            links
                .iter()
                .find(|l| l.id() != new.id() && l.hw_addr() == self.bond_mac)
                .cloned()
        });

        if let Some(swap) = &swap {
            self.tlb.clear_link(swap.id(), true);
        }
        self.tlb.clear_link(new.id(), true);

        if self.rlb.is_none() {
            // Only the source address of the frames matters for transmit balancing
            new.assume_hw_addr(&self.bond_mac);
            if let Some(swap) = &swap {
                swap.assume_hw_addr(&swap.perm_hw_addr());
            }
            log::info!("[alb] active link is {}", new);
            return;
        }

        match &swap {
            Some(swap) if swap.id() != new.id() => {
                self.swap_hw_addr(swap, &new);
                self.fasten_mac_swap(swap, &new);
            }
            _ => {
                program_hw_addr(&new, &self.bond_mac);
                self.send_learning_packets(&new, &self.bond_mac, false);
                if let Some(rlb) = &self.rlb {
                    rlb.req_update_link_clients(new.id());
                }
            }
        }

        log::info!("[alb] active link is {}", new);
    }

    fn swap_hw_addr(&self, first: &Slave, second: &Slave) {
        let first_mac = first.hw_addr();
        let second_mac = second.hw_addr();
        program_hw_addr(first, &second_mac);
        program_hw_addr(second, &first_mac);
        log::debug!(
            "[link] swapped mac of {} and {}",
            first.name(),
            second.name()
        );
    }

    /// Tells the switch and the clients about a MAC swap.
    fn fasten_mac_swap(&self, first: &Slave, second: &Slave) {
        let states_differ = first.can_tx() != second.can_tx();
        let mut disabled = None;

        for slave in [first, second] {
            if slave.can_tx() {
                self.send_learning_packets(slave, &slave.hw_addr(), false);
                if let Some(rlb) = &self.rlb {
                    rlb.req_update_link_clients(slave.id());
                }
            } else {
                disabled = Some(slave);
            }
        }

        // A disabled link got an address that is still in use
        if states_differ {
            if let Some(disabled) = disabled {
                self.teach_disabled_mac_on_primary(&disabled.hw_addr());
            }
        }
    }

    /// Lets the active link receive for `mac` until the promiscuous grant
    /// expires, and moves the switch forwarding entry of `mac` to it.
    fn teach_disabled_mac_on_primary(&self, mac: &MacAddr) {
        let Some(active) = self.active() else {
            return;
        };

        {
            let mut mon = self.mon();
            if !mon.primary_is_promisc {
                match active.set_promiscuous(true) {
                    Ok(()) => mon.primary_is_promisc = true,
                    Err(e) => {
                        log::warn!("[alb] can't set promiscuous mode on {}, {}", active.name(), e);
                        mon.primary_is_promisc = false;
                    }
                }
            }
            mon.promisc_counter = 0;
        }

        self.send_learning_packets(&active, mac, true);
    }

    /// Learning packets carrying `mac`, one untagged and one per bond VLAN.
    /// With `strict_match` the tagged ones go out only for the bond address.
    fn send_learning_packets(&self, slave: &Slave, mac: &MacAddr, strict_match: bool) {
        let mut tags = vec![None];
        if !strict_match || *mac == self.bond_mac {
            tags.extend(self.vlans().into_iter().map(Some));
        }

        for vlan_id in tags {
            let lp = frame::learning_packet(mac, vlan_id);
            match slave.send(&lp) {
                Ok(()) => self.stats.inc(stat::LP_SENT),
                Err(e) => {
                    self.stats.inc(stat::LP_ERRORS);
                    log::warn!("[lp] failed to send on {}, {}", slave.name(), e);
                }
            }
        }
    }

    fn send_client_notices(&self, links: &[Arc<Slave>], notices: &[ClientNotice]) {
        for notice in notices {
            let Some(slave) = link::find(links, notice.link) else {
                log::debug!("[arp] no link {} for client {}", notice.link, notice.client_ip);
                continue;
            };
            let update = frame::arp_update(
                &notice.client_mac,
                notice.client_ip,
                &slave.hw_addr(),
                notice.bond_ip,
                notice.vlan_id,
            );
            for _ in 0..self.timers.rlb_arp_burst {
                match slave.send(&update) {
                    Ok(()) => self.stats.inc(stat::ARP_UPDATES_SENT),
                    Err(e) => {
                        self.stats.inc(stat::ARP_UPDATE_ERRORS);
                        log::warn!(
                            "[arp] failed to update {} on {}, {}",
                            notice.client_ip,
                            slave.name(),
                            e
                        );
                    }
                }
            }
            log::debug!(
                "[arp] told {} ({}) that {} is at {}",
                notice.client_ip,
                mac_to_str(&notice.client_mac),
                notice.bond_ip,
                mac_to_str(&slave.hw_addr())
            );
        }
    }

    pub fn add_vlan(&self, vlan_id: u16) -> Result<(), anyhow::Error> {
        if vlan_id == 0 || vlan_id > 4094 {
            return Err(anyhow!("Invalid vlan id {}", vlan_id));
        }
        let mut vlans = self.vlans.write().unwrap_or_else(PoisonError::into_inner);
        if !vlans.contains(&vlan_id) {
            vlans.push(vlan_id);
            log::info!("[alb] {} added vlan {}", self.name, vlan_id);
        }
        Ok(())
    }

    pub fn remove_vlan(&self, vlan_id: u16) {
        self.vlans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|v| *v != vlan_id);
        if let Some(rlb) = &self.rlb {
            let deleted = rlb.clear_vlan(vlan_id);
            log::info!("[rlb] vlan {} removed with {} clients", vlan_id, deleted);
        }
    }

    fn is_local_mac(&self, links: &[Arc<Slave>], mac: &MacAddr) -> bool {
        *mac == self.bond_mac || links.iter().any(|l| l.hw_addr() == *mac)
    }

    /// Sends one frame of the bond. The frame may be rewritten: source MAC
    /// of the selected link and, for ARP, the sender hardware address.
    pub fn xmit(&self, data: &mut [u8]) -> XmitResult {
        self.stats.inc(stat::TX_FRAMES);
        let len = data.len() as u32;

        let links = self.links();
        let active = self.active();
        let mut tx_link = None;
        let mut notice = None;

        let eth = match frame::parse(data) {
            Ok(eth) => Some(eth),
            Err(e) => {
                log::trace!("[alb] unbalanced frame, {}", e);
                None
            }
        };

        let hash = match &eth {
            Some(eth) => match &eth.kind {
                FrameKind::Ipv4 { dst, protocol, .. } => {
                    if is_broadcast_mac(&eth.dst) || *dst == Ipv4Addr::BROADCAST || *protocol == IPPROTO_IGMP {
                        None
                    } else {
                        Some(simple_hash(&dst.octets()))
                    }
                }
                FrameKind::Ipv6 { src, dst } => {
                    if is_broadcast_mac(&eth.dst)
                        || eth.dst == MAC_V6_ALLMCAST
                        || src.is_unspecified()
                        || dst.is_multicast()
                    {
                        None
                    } else {
                        Some(simple_hash(&dst.octets()))
                    }
                }
                FrameKind::Ipx { checksum, packet_type } => {
                    if *checksum == ipx::NO_CHECKSUM && *packet_type == ipx::TYPE_NCP {
                        Some(simple_hash(&eth.dst))
                    } else {
                        None
                    }
                }
                FrameKind::Arp(arp) => {
                    if let Some(rlb) = &self.rlb {
                        let (link, moved) = self.rlb_arp_xmit(rlb, &links, active.as_ref(), data, eth, arp);
                        tx_link = link;
                        notice = moved;
                    }
                    None
                }
                FrameKind::Other(_) => None,
            },
            None => None,
        };

        if let Some(hash) = hash {
            tx_link = self
                .tlb
                .choose_channel(&links, hash as u32, len)
                .and_then(|id| link::find(&links, id).cloned());
        }

        if let Some(notice) = notice {
            self.send_client_notices(&links, &[notice]);
        }

        match (&tx_link, hash) {
            (Some(_), Some(_)) => self.stats.inc(stat::TX_BALANCED),
            _ => self.stats.inc(stat::TX_UNBALANCED),
        }

        if tx_link.is_none() {
            tx_link = active.clone();
            if tx_link.is_some() {
                self.unbalanced_load.fetch_add(len as u64, Ordering::Relaxed);
            }
        }

        let Some(tx_link) = tx_link else {
            self.stats.inc(stat::TX_DROPPED);
            return XmitResult::Dropped;
        };

        if !tx_link.can_tx() {
            self.tlb.clear_link(tx_link.id(), false);
            self.stats.inc(stat::TX_DROPPED);
            log::debug!("[alb] dropped frame for {}", tx_link.name());
            return XmitResult::Dropped;
        }

        if active.as_ref().map(|a| a.id()) != Some(tx_link.id()) {
            frame::set_eth_source(data, &tx_link.hw_addr());
        }

        match tx_link.send(data) {
            Ok(()) => XmitResult::Sent(tx_link.id()),
            Err(e) => {
                self.stats.inc(stat::TX_ERRORS);
                log::warn!("[alb] failed to send on {}, {}", tx_link.name(), e);
                XmitResult::Dropped
            }
        }
    }

    /// ARP sent by the bond. Replies go out on the receive link chosen for
    /// the client, with that link's MAC as sender. Requests leave a
    /// placeholder for the client and go out on the active link.
    fn rlb_arp_xmit(
        &self,
        rlb: &RlbTable,
        links: &[Arc<Slave>],
        active: Option<&Arc<Slave>>,
        data: &mut [u8],
        eth: &EthFrame,
        arp: &ArpPacket,
    ) -> (Option<Arc<Slave>>, Option<ClientNotice>) {
        // Leave bridged or forwarded ARP alone
        if !self.is_local_mac(links, &arp.sender_mac) {
            return (None, None);
        }

        let active_id = active.map(|a| a.id());
        if arp.is_reply() {
            let (link, notice) = rlb.choose_channel(links, active_id, arp, eth.vlan_id);
            let tx_link = link.and_then(|id| link::find(links, id).cloned());
            if let Some(tx_link) = &tx_link {
                frame::set_arp_sender_mac(data, eth.l3_offset, &tx_link.hw_addr());
                log::debug!("[arp] reply to {} on {}", arp.target_ip, tx_link.name());
            }
            (tx_link, notice)
        } else if arp.is_request() {
            let (_, notice) = rlb.choose_channel(links, active_id, arp, eth.vlan_id);
            // The request collapses the subnet on the active link, the
            // clients are corrected once the delay is over
            rlb.delay_updates();
            rlb.req_update_subnet_clients(links, arp.sender_ip, &self.bond_mac);
            log::debug!("[arp] request for {}", arp.target_ip);
            (None, notice)
        } else {
            (None, None)
        }
    }

    /// ARP received on any link of the bond.
    pub fn arp_recv(&self, link: LinkId, data: &[u8]) {
        let Some(rlb) = &self.rlb else {
            return;
        };
        let arp = match frame::parse(data) {
            Ok(EthFrame {
                kind: FrameKind::Arp(arp),
                ..
            }) => arp,
            Ok(_) => return,
            Err(e) => {
                log::trace!("[arp] ignored frame on link {}, {}", link, e);
                return;
            }
        };

        let purged = rlb.purge_source_ip(arp.sender_ip, &arp.sender_mac);
        if purged > 0 {
            self.stats.add(stat::RLB_PURGED, purged as u64);
            log::info!(
                "[rlb] {} is now at {}, purged {} clients",
                arp.sender_ip,
                mac_to_str(&arp.sender_mac),
                purged
            );
        }

        if arp.is_reply() && rlb.update_entry_from_arp(&arp) {
            log::debug!("[arp] learnt {} on link {}", arp.sender_ip, link);
        }
    }

    /// One tick of the periodic driver.
    pub fn monitor_tick(&self) {
        let links = self.link_list();
        let (send_lp, rebalance, promisc_expired) = {
            let mut mon = self.mon();
            if links.is_empty() {
                mon.lp_counter = 0;
                mon.tx_rebalance_counter = 0;
                return;
            }

            mon.lp_counter += 1;
            mon.tx_rebalance_counter += 1;

            let send_lp = mon.lp_counter >= self.timers.lp_ticks();
            if send_lp {
                mon.lp_counter = 0;
            }
            let rebalance = mon.tx_rebalance_counter >= self.timers.rebalance_ticks();
            if rebalance {
                mon.tx_rebalance_counter = 0;
            }

            let mut promisc_expired = false;
            if self.rlb.is_some() && mon.primary_is_promisc {
                mon.promisc_counter += 1;
                if mon.promisc_counter >= self.timers.promisc_ticks() {
                    mon.primary_is_promisc = false;
                    mon.promisc_counter = 0;
                    promisc_expired = true;
                }
            }
            (send_lp, rebalance, promisc_expired)
        };

        let active = self.active();
        let active_id = active.as_ref().map(|a| a.id());

        if send_lp {
            for slave in &links {
                // The active link also refreshes the VLAN entries in TLB mode
                let strict_match = Some(slave.id()) != active_id || self.rlb.is_some();
                self.send_learning_packets(slave, &slave.hw_addr(), strict_match);
            }
        }

        if rebalance {
            let unbalanced = self.unbalanced_load.swap(0, Ordering::Relaxed);
            self.tlb.rebalance(&links, active_id, unbalanced);
            self.stats.inc(stat::TLB_REBALANCES);
        }

        let Some(rlb) = &self.rlb else {
            return;
        };

        if promisc_expired {
            if let Some(active) = &active {
                if let Err(e) = active.set_promiscuous(false) {
                    log::warn!("[alb] can't leave promiscuous mode on {}, {}", active.name(), e);
                }
                log::debug!("[alb] promiscuous grant of {} expired", active.name());
            }
        }

        if self.rlb_rebalance.swap(false, Ordering::AcqRel) {
            rlb.rebalance(&links);
            self.stats.inc(stat::RLB_REBALANCES);
            log::debug!("[rlb] rebalanced clients over {} links", links.len());
        }

        let notices = rlb.tick();
        self.send_client_notices(&links, &notices);
    }
}

impl ArpObserver for Alb {
    fn on_arp(&self, link: LinkId, frame: &[u8]) {
        self.arp_recv(link, frame);
    }
}

/// Sets the address of a link. A device that can't change it keeps the
/// recorded address so the bookkeeping stays consistent.
fn program_hw_addr(slave: &Slave, mac: &MacAddr) {
    match slave.set_hw_addr(mac) {
        Ok(()) => {}
        Err(HwAddrError::NotSupported) => {
            log::warn!(
                "[link] {} can't change its mac, {} used for balancing only",
                slave.name(),
                mac_to_str(mac)
            );
            slave.assume_hw_addr(mac);
        }
        Err(e) => log::error!("[link] {}: {}", slave.name(), e),
    }
}
