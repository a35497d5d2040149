//! Receive load balancing. Peers are taught, through unicast ARP replies,
//! different link MACs for the bond address so the switch spreads the
//! inbound traffic across the links.
//!
//! Every client bucket is indexed by the hash of the client address. Besides
//! the bucket array the table keeps two index based lists:
//! * the used list, linking every assigned bucket
//! * the source chains, linking the buckets that share the hash of the
//!   bond-side address (`ip_src`); the chain heads are kept in `src_first`

use crate::{
    frame::ArpPacket,
    helpers::{is_broadcast_mac, is_unicast_mac, mac_to_str},
    link::{self, LinkId, Slave},
};
use anyhow::anyhow;
use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use zon_alb_common::{simple_hash, MacAddr, MAC_BCAST, MAC_ZERO, NULL_INDEX};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RlbClient {
    pub link: Option<LinkId>,
    /// Bond-side address
    pub ip_src: Ipv4Addr,
    /// Client address
    pub ip_dst: Ipv4Addr,
    pub mac_src: MacAddr,
    /// Client MAC, broadcast while still unknown
    pub mac_dst: MacAddr,
    pub vlan_id: Option<u16>,
    /// The client must be told about its link
    pub ntt: bool,
    pub assigned: bool,
    used_next: u32,
    used_prev: u32,
    src_next: u32,
    src_prev: u32,
}

impl Default for RlbClient {
    fn default() -> Self {
        Self {
            link: None,
            ip_src: Ipv4Addr::UNSPECIFIED,
            ip_dst: Ipv4Addr::UNSPECIFIED,
            mac_src: MAC_ZERO,
            mac_dst: MAC_ZERO,
            vlan_id: None,
            ntt: false,
            assigned: false,
            used_next: NULL_INDEX,
            used_prev: NULL_INDEX,
            src_next: NULL_INDEX,
            src_prev: NULL_INDEX,
        }
    }
}

/// Data for one ARP update burst, taken out of the table so the frames can
/// be sent without holding the lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientNotice {
    pub link: LinkId,
    pub bond_ip: Ipv4Addr,
    pub client_ip: Ipv4Addr,
    pub client_mac: MacAddr,
    pub vlan_id: Option<u16>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RlbTimers {
    /// Ticks to hold back client updates after an ARP request went out
    pub update_delay: u32,
    /// Extra update passes after a link was cleared
    pub update_retry: u32,
}

struct RlbInner {
    clients: Vec<RlbClient>,
    src_first: Vec<u32>,
    used_head: u32,
    /// Round-robin position of the receive link selector
    rx_link: Option<LinkId>,
    /// Some client has `ntt` set
    rx_ntt: bool,
    update_delay: u32,
    update_retry: u32,
    mask: u32,
}

impl RlbInner {
    fn hash(&self, ip: Ipv4Addr) -> u32 {
        simple_hash(&ip.octets()) as u32 & self.mask
    }

    fn used_indexes(&self) -> Vec<u32> {
        let mut indexes = vec![];
        let mut index = self.used_head;
        while index != NULL_INDEX && indexes.len() < self.clients.len() {
            indexes.push(index);
            index = self.clients[index as usize].used_next;
        }
        indexes
    }

    fn used_link(&mut self, index: u32) {
        let head = self.used_head;
        let client = &mut self.clients[index as usize];
        client.used_next = head;
        client.used_prev = NULL_INDEX;
        if head != NULL_INDEX {
            self.clients[head as usize].used_prev = index;
        }
        self.used_head = index;
    }

    fn used_unlink(&mut self, index: u32) {
        let client = &self.clients[index as usize];
        let (next, prev) = (client.used_next, client.used_prev);

        if index == self.used_head {
            self.used_head = next;
        }
        if prev != NULL_INDEX {
            self.clients[prev as usize].used_next = next;
        }
        if next != NULL_INDEX {
            self.clients[next as usize].used_prev = prev;
        }
    }

    /// Pushes bucket `index` on the chain of the source hash `src_hash`.
    fn src_link(&mut self, src_hash: u32, index: u32) {
        let next = self.src_first[src_hash as usize];
        let client = &mut self.clients[index as usize];
        client.src_prev = src_hash;
        client.src_next = next;
        if next != NULL_INDEX {
            self.clients[next as usize].src_prev = index;
        }
        self.src_first[src_hash as usize] = index;
    }

    fn src_unlink(&mut self, index: u32) {
        let client = &mut self.clients[index as usize];
        let (next, prev) = (client.src_next, client.src_prev);
        client.src_next = NULL_INDEX;
        client.src_prev = NULL_INDEX;

        if next != NULL_INDEX {
            self.clients[next as usize].src_prev = prev;
        }
        if prev == NULL_INDEX {
            return;
        }
        // The first entry of a chain points back to the chain head slot
        if self.src_first[prev as usize] == index {
            self.src_first[prev as usize] = next;
        } else {
            self.clients[prev as usize].src_next = next;
        }
    }

    fn delete_entry(&mut self, index: u32) {
        self.used_unlink(index);
        self.src_unlink(index);
        self.clients[index as usize] = RlbClient::default();
    }

    fn notice(&self, index: u32) -> Option<ClientNotice> {
        let client = &self.clients[index as usize];
        let link = client.link?;
        if !is_unicast_mac(&client.mac_dst) {
            return None;
        }
        Some(ClientNotice {
            link,
            bond_ip: client.ip_src,
            client_ip: client.ip_dst,
            client_mac: client.mac_dst,
            vlan_id: client.vlan_id,
        })
    }

    /// Starting after the current position, takes the fastest link that can
    /// transmit. A strictly faster link up to and including the current
    /// position wins over the ones after it.
    fn next_rx_link(&mut self, links: &[Arc<Slave>]) -> Option<LinkId> {
        let mut before: Option<&Arc<Slave>> = None;
        let mut after: Option<&Arc<Slave>> = None;
        let mut found = false;

        for link in links.iter().filter(|l| l.can_tx()) {
            if !found {
                if before.map_or(true, |b| b.speed() < link.speed()) {
                    before = Some(link);
                }
            } else if after.map_or(true, |a| a.speed() < link.speed()) {
                after = Some(link);
            }
            if self.rx_link == Some(link.id()) {
                found = true;
            }
        }

        let chosen = match (after, before) {
            (Some(a), Some(b)) if a.speed() < b.speed() => Some(b),
            (None, b) => b,
            (a, _) => a,
        };

        if let Some(link) = chosen {
            self.rx_link = Some(link.id());
        }
        chosen.map(|l| l.id())
    }

    fn update_clients(&mut self, update_delay: u32) -> Vec<ClientNotice> {
        let mut notices = vec![];
        for index in self.used_indexes() {
            if !self.clients[index as usize].ntt {
                continue;
            }
            if self.clients[index as usize].link.is_none() {
                log::debug!("[rlb] client {} pending without a link", index);
                continue;
            }
            if let Some(notice) = self.notice(index) {
                notices.push(notice);
            }
            if self.update_retry == 0 {
                self.clients[index as usize].ntt = false;
            }
        }
        self.update_delay = update_delay;
        notices
    }
}

pub struct RlbTable {
    inner: Mutex<RlbInner>,
    timers: RlbTimers,
}

impl RlbTable {
    pub fn new(size: usize, timers: RlbTimers) -> Result<Self, anyhow::Error> {
        if size == 0 || !size.is_power_of_two() || size > 256 {
            return Err(anyhow!("rlb table size {} must be a power of two up to 256", size));
        }

        let mut clients = Vec::new();
        clients
            .try_reserve_exact(size)
            .map_err(|e| anyhow!("out of memory for {} rlb buckets, {}", size, e))?;
        clients.resize(size, RlbClient::default());

        let mut src_first = Vec::new();
        src_first
            .try_reserve_exact(size)
            .map_err(|e| anyhow!("out of memory for {} rlb chain heads, {}", size, e))?;
        src_first.resize(size, NULL_INDEX);

        log::debug!("[rlb] table initialized with {} buckets", size);

        Ok(Self {
            inner: Mutex::new(RlbInner {
                clients,
                src_first,
                used_head: NULL_INDEX,
                rx_link: None,
                rx_ntt: false,
                update_delay: 0,
                update_retry: 0,
                mask: (size - 1) as u32,
            }),
            timers,
        })
    }

    fn lock(&self) -> MutexGuard<'_, RlbInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Picks the receive link for a locally originated ARP. The bucket is
    /// the hash of the ARP target, the client. When the bucket belongs to a
    /// different client, that client is moved to the active link and the
    /// returned notice must be sent to it.
    pub fn choose_channel(
        &self,
        links: &[Arc<Slave>],
        active: Option<LinkId>,
        arp: &ArpPacket,
        vlan_id: Option<u16>,
    ) -> (Option<LinkId>, Option<ClientNotice>) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let index = inner.hash(arp.target_ip);
        let mut notice = None;

        let client = &mut inner.clients[index as usize];
        if client.assigned {
            if client.ip_src == arp.sender_ip && client.ip_dst == arp.target_ip {
                if is_unicast_mac(&arp.target_mac) {
                    client.mac_dst = arp.target_mac;
                }
                client.mac_src = arp.sender_mac;
                if let Some(link) = client.link {
                    return (Some(link), None);
                }
            } else if let Some(active) = active {
                if client.link != Some(active) {
                    client.link = Some(active);
                    notice = inner.notice(index);
                    log::debug!(
                        "[rlb] client {} moved to the active link for {}",
                        inner.clients[index as usize].ip_dst,
                        arp.target_ip
                    );
                }
            }
        }

        let Some(link) = inner.next_rx_link(links) else {
            return (None, notice);
        };

        let client = &inner.clients[index as usize];
        if !(client.assigned && client.ip_src == arp.sender_ip) {
            let src_hash = inner.hash(arp.sender_ip);
            inner.src_unlink(index);
            inner.src_link(src_hash, index);
        }

        let client = &mut inner.clients[index as usize];
        client.ip_src = arp.sender_ip;
        client.ip_dst = arp.target_ip;
        // Unknown until the client answers
        client.mac_dst = if is_unicast_mac(&arp.target_mac) {
            arp.target_mac
        } else {
            MAC_BCAST
        };
        client.mac_src = arp.sender_mac;
        client.link = Some(link);
        client.vlan_id = vlan_id;
        client.ntt = !is_broadcast_mac(&client.mac_dst);
        let was_assigned = client.assigned;
        client.assigned = true;
        if client.ntt {
            inner.rx_ntt = true;
        }
        if !was_assigned {
            inner.used_link(index);
        }

        log::debug!(
            "[rlb] client {} ({}) on link {}",
            arp.target_ip,
            mac_to_str(&inner.clients[index as usize].mac_dst),
            link
        );

        (Some(link), notice)
    }

    /// Holds back the client updates, so an ARP request that was just
    /// broadcast can't undo them.
    pub fn delay_updates(&self) {
        self.lock().update_delay = self.timers.update_delay;
    }

    /// The broadcast request from `src_ip` collapsed every peer of the subnet
    /// on the active link. Clients using `src_ip` that sit on another link
    /// must be told again.
    pub fn req_update_subnet_clients(&self, links: &[Arc<Slave>], src_ip: Ipv4Addr, bond_mac: &MacAddr) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        for index in inner.used_indexes() {
            let client = &mut inner.clients[index as usize];
            let Some(link_id) = client.link else {
                log::error!("[rlb] found a client with no channel in the client table");
                continue;
            };
            let on_bond_mac = link::find(links, link_id).map_or(false, |l| l.hw_addr() == *bond_mac);
            if client.ip_src == src_ip && !on_bond_mac && !is_broadcast_mac(&client.mac_dst) {
                client.ntt = true;
                inner.rx_ntt = true;
            }
        }
    }

    /// Marks every client of the link for update, after its MAC changed.
    pub fn req_update_link_clients(&self, link: LinkId) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut ntt = false;
        for index in inner.used_indexes() {
            let client = &mut inner.clients[index as usize];
            if client.link == Some(link) {
                client.ntt = true;
                ntt = true;
            }
        }
        if ntt {
            inner.rx_ntt = true;
        }
    }

    /// Deletes the entries using `ip_src` that were learnt with a different
    /// MAC: some other host owns the address now. Returns the deleted count.
    pub fn purge_source_ip(&self, ip_src: Ipv4Addr, mac_src: &MacAddr) -> usize {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let src_hash = inner.hash(ip_src);
        let mut purged = 0;

        let mut index = inner.src_first[src_hash as usize];
        while index != NULL_INDEX {
            let client = &inner.clients[index as usize];
            let next = client.src_next;
            if client.ip_src == ip_src && client.mac_src != *mac_src {
                log::debug!(
                    "[rlb] purge client {} of {} learnt from {}",
                    client.ip_dst,
                    ip_src,
                    mac_to_str(&client.mac_src)
                );
                inner.delete_entry(index);
                purged += 1;
            }
            index = next;
        }
        purged
    }

    /// Records the real MAC of a client from its ARP reply.
    pub fn update_entry_from_arp(&self, arp: &ArpPacket) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let index = inner.hash(arp.sender_ip);
        let client = &mut inner.clients[index as usize];

        if client.assigned
            && client.ip_src == arp.target_ip
            && client.ip_dst == arp.sender_ip
            && client.mac_dst != arp.sender_mac
        {
            client.mac_dst = arp.sender_mac;
            client.ntt = true;
            inner.rx_ntt = true;
            log::debug!(
                "[rlb] client {} is at {}",
                arp.sender_ip,
                mac_to_str(&arp.sender_mac)
            );
            return true;
        }
        false
    }

    /// Moves the clients of a link that can't be used anymore. The link must
    /// already be excluded from selection.
    pub fn clear_link(&self, links: &[Arc<Slave>], link: LinkId) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut moved = 0;

        for index in inner.used_indexes() {
            if inner.clients[index as usize].link != Some(link) {
                continue;
            }
            let assigned = inner.next_rx_link(links);
            let client = &mut inner.clients[index as usize];
            client.link = assigned;
            moved += 1;
            if assigned.is_some() && !is_broadcast_mac(&client.mac_dst) {
                client.ntt = true;
                inner.rx_ntt = true;
                // Retry, clients may miss a single update under load
                inner.update_retry = self.timers.update_retry;
            }
        }

        if moved > 0 {
            log::info!("[rlb] moved {} clients away from link {}", moved, link);
        }
    }

    /// Spreads all clients again, after the set of links changed.
    pub fn rebalance(&self, links: &[Arc<Slave>]) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut ntt = false;

        for index in inner.used_indexes() {
            let Some(assigned) = inner.next_rx_link(links) else {
                continue;
            };
            let client = &mut inner.clients[index as usize];
            if client.link != Some(assigned) {
                client.link = Some(assigned);
                // Broadcast means the client mac is not known yet
                if !is_broadcast_mac(&client.mac_dst) {
                    client.ntt = true;
                    ntt = true;
                }
            }
        }

        // Set only after the whole pass
        if ntt {
            inner.rx_ntt = true;
        }
    }

    /// Drops the clients learnt on a VLAN that was removed from the bond.
    pub fn clear_vlan(&self, vlan_id: u16) -> usize {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut deleted = 0;
        for index in inner.used_indexes() {
            if inner.clients[index as usize].vlan_id == Some(vlan_id) {
                inner.delete_entry(index);
                deleted += 1;
            }
        }
        deleted
    }

    /// Periodic step: returns the clients to notify in this tick, honoring
    /// the update delay and the retry budget.
    pub fn tick(&self) -> Vec<ClientNotice> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if !inner.rx_ntt {
            return vec![];
        }
        if inner.update_delay > 0 {
            inner.update_delay -= 1;
            return vec![];
        }

        let notices = inner.update_clients(self.timers.update_delay);
        if inner.update_retry > 0 {
            inner.update_retry -= 1;
        } else {
            inner.rx_ntt = false;
        }
        notices
    }

    pub fn reset_rx_link(&self) {
        self.lock().rx_link = None;
    }

    pub fn rx_ntt(&self) -> bool {
        self.lock().rx_ntt
    }

    pub fn index_of(&self, ip: Ipv4Addr) -> u32 {
        self.lock().hash(ip)
    }

    pub fn client(&self, index: u32) -> Option<RlbClient> {
        self.lock().clients.get(index as usize).copied()
    }

    /// Assigned clients in used list order.
    pub fn clients(&self) -> Vec<(u32, RlbClient)> {
        let inner = self.lock();
        inner
            .used_indexes()
            .into_iter()
            .map(|index| (index, inner.clients[index as usize]))
            .collect()
    }

    /// Bucket indexes chained under the hash of `ip_src`.
    pub fn src_chain(&self, ip_src: Ipv4Addr) -> Vec<u32> {
        let inner = self.lock();
        let mut chain = vec![];
        let mut index = inner.src_first[inner.hash(ip_src) as usize];
        while index != NULL_INDEX && chain.len() < inner.clients.len() {
            chain.push(index);
            index = inner.clients[index as usize].src_next;
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimLink;
    use std::collections::BTreeSet;
    use zon_alb_common::{arp, LinkFlags, RLB_HASH_TABLE_SIZE};

    const BOND_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const BOND_MAC: MacAddr = [0x02, 0, 0, 0, 0, 0x10];

    fn links(speeds: &[u32]) -> Vec<Arc<Slave>> {
        speeds
            .iter()
            .enumerate()
            .map(|(i, &speed)| {
                Arc::new(Slave::new(
                    i as LinkId + 1,
                    &format!("eth{}", i),
                    speed,
                    [0x02, 0, 0, 0, 0, i as u8 + 1],
                    Arc::new(SimLink::new(&format!("eth{}", i))),
                ))
            })
            .collect()
    }

    fn table(update_delay: u32, update_retry: u32) -> RlbTable {
        RlbTable::new(
            RLB_HASH_TABLE_SIZE,
            RlbTimers {
                update_delay,
                update_retry,
            },
        )
        .unwrap()
    }

    fn request(sender_ip: Ipv4Addr, sender_mac: MacAddr, target_ip: Ipv4Addr) -> ArpPacket {
        ArpPacket {
            oper: arp::OP_REQUEST,
            sender_mac,
            sender_ip,
            target_mac: MAC_ZERO,
            target_ip,
        }
    }

    fn reply(sender_ip: Ipv4Addr, sender_mac: MacAddr, target_ip: Ipv4Addr, target_mac: MacAddr) -> ArpPacket {
        ArpPacket {
            oper: arp::OP_REPLY,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    fn client_mac(n: u8) -> MacAddr {
        [0x0a, 0xbb, 0xcc, 0xdd, 0xee, n]
    }

    /// Used list, assigned flag and source chains agree with each other.
    fn assert_invariants(rlb: &RlbTable) {
        let inner = rlb.lock();
        let used = inner.used_indexes().into_iter().collect::<BTreeSet<_>>();
        for (index, client) in inner.clients.iter().enumerate() {
            if used.contains(&(index as u32)) {
                assert!(client.assigned, "bucket {} in used list", index);
            } else {
                assert_eq!(*client, RlbClient::default(), "bucket {} not in used list", index);
            }
        }
        for &index in &used {
            let client = &inner.clients[index as usize];
            let mut chain = vec![];
            let mut i = inner.src_first[inner.hash(client.ip_src) as usize];
            while i != NULL_INDEX {
                chain.push(i);
                i = inner.clients[i as usize].src_next;
            }
            assert!(chain.contains(&index), "bucket {} missing from its source chain", index);
        }
    }

    #[test]
    fn new_rejects_bad_sizes() {
        let timers = RlbTimers {
            update_delay: 0,
            update_retry: 0,
        };
        assert!(RlbTable::new(0, timers).is_err());
        assert!(RlbTable::new(48, timers).is_err());
        assert!(RlbTable::new(512, timers).is_err());
        assert!(RlbTable::new(16, timers).is_ok());
    }

    #[test]
    fn request_creates_placeholder_then_reply_learns_mac() {
        let links = links(&[1000, 1000]);
        let rlb = table(20, 0);
        let client_ip = Ipv4Addr::new(10, 0, 0, 5);

        let (link, notice) = rlb.choose_channel(&links, Some(1), &request(BOND_IP, BOND_MAC, client_ip), None);
        assert!(link.is_some());
        assert!(notice.is_none());
        rlb.delay_updates();

        let index = rlb.index_of(client_ip);
        let client = rlb.client(index).unwrap();
        assert!(client.assigned);
        assert!(!client.ntt);
        assert_eq!(client.mac_dst, MAC_BCAST);
        assert_eq!(client.link, link);
        assert!(!rlb.rx_ntt());

        let real_mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        assert!(rlb.update_entry_from_arp(&reply(client_ip, real_mac, BOND_IP, BOND_MAC)));
        let client = rlb.client(index).unwrap();
        assert_eq!(client.mac_dst, real_mac);
        assert!(client.ntt);
        assert!(rlb.rx_ntt());

        // same reply again changes nothing
        assert!(!rlb.update_entry_from_arp(&reply(client_ip, real_mac, BOND_IP, BOND_MAC)));

        // held back by the delay, then one burst
        for _ in 0..20 {
            assert!(rlb.tick().is_empty());
        }
        let notices = rlb.tick();
        assert_eq!(
            notices,
            vec![ClientNotice {
                link: link.unwrap(),
                bond_ip: BOND_IP,
                client_ip,
                client_mac: real_mac,
                vlan_id: None,
            }]
        );
        assert!(!rlb.client(index).unwrap().ntt);
        assert!(!rlb.rx_ntt());
        assert_invariants(&rlb);
    }

    #[test]
    fn reply_from_known_client_keeps_link() {
        let links = links(&[1000, 1000, 1000]);
        let rlb = table(0, 0);
        let client_ip = Ipv4Addr::new(10, 0, 0, 7);
        let arp = reply(BOND_IP, BOND_MAC, client_ip, client_mac(7));

        let (first, _) = rlb.choose_channel(&links, Some(1), &arp, None);
        let (second, _) = rlb.choose_channel(&links, Some(1), &arp, None);
        assert_eq!(first, second);
        assert_eq!(rlb.clients().len(), 1);
        assert!(rlb.client(rlb.index_of(client_ip)).unwrap().ntt);
    }

    #[test]
    fn colliding_client_is_moved_to_active_link() {
        let links = links(&[1000, 1000, 1000]);
        let rlb = table(0, 0);
        // 10.0.0.5 and 10.0.1.4 hash to the same bucket
        let first_ip = Ipv4Addr::new(10, 0, 0, 5);
        let second_ip = Ipv4Addr::new(10, 0, 1, 4);
        assert_eq!(rlb.index_of(first_ip), rlb.index_of(second_ip));

        rlb.choose_channel(&links, Some(1), &reply(BOND_IP, BOND_MAC, first_ip, client_mac(5)), None);
        rlb.choose_channel(&links, Some(1), &reply(BOND_IP, BOND_MAC, first_ip, client_mac(5)), None);
        // round robin left the first client away from the active link
        let index = rlb.index_of(first_ip);
        rlb.lock().clients[index as usize].link = Some(2);

        let (link, notice) =
            rlb.choose_channel(&links, Some(1), &reply(BOND_IP, BOND_MAC, second_ip, client_mac(9)), None);
        assert_eq!(
            notice,
            Some(ClientNotice {
                link: 1,
                bond_ip: BOND_IP,
                client_ip: first_ip,
                client_mac: client_mac(5),
                vlan_id: None,
            })
        );
        let client = rlb.client(index).unwrap();
        assert_eq!(client.ip_dst, second_ip);
        assert_eq!(client.link, link);
        assert_eq!(rlb.clients().len(), 1);
        assert_invariants(&rlb);
    }

    #[test]
    fn rx_selector_rotates_and_prefers_speed() {
        let equal = links(&[1000, 1000, 1000]);
        let rlb = table(0, 0);
        let picked = (1..=6)
            .map(|i| {
                let arp = request(BOND_IP, BOND_MAC, Ipv4Addr::new(10, 0, 0, i * 16));
                rlb.choose_channel(&equal, None, &arp, None).0.unwrap()
            })
            .collect::<Vec<_>>();
        assert_eq!(picked, vec![1, 2, 3, 1, 2, 3]);

        let mixed = links(&[100, 1000, 10]);
        let rlb = table(0, 0);
        let picked = (1..=3)
            .map(|i| {
                let arp = request(BOND_IP, BOND_MAC, Ipv4Addr::new(10, 0, 0, i * 16));
                rlb.choose_channel(&mixed, None, &arp, None).0.unwrap()
            })
            .collect::<Vec<_>>();
        assert_eq!(picked, vec![2, 2, 2]);
    }

    #[test]
    fn clear_link_moves_clients_and_skips_placeholders() {
        let links = links(&[1000, 1000, 1000]);
        let rlb = table(0, 0);
        links[0].set_flag(LinkFlags::UP, false);
        links[2].set_flag(LinkFlags::UP, false);

        for i in 1..=3 {
            let ip = Ipv4Addr::new(10, 0, 0, 16 * i);
            rlb.choose_channel(&links, Some(2), &reply(BOND_IP, BOND_MAC, ip, client_mac(i)), None);
        }
        for i in 4..=5 {
            let ip = Ipv4Addr::new(10, 0, 0, 16 * i);
            rlb.choose_channel(&links, Some(2), &request(BOND_IP, BOND_MAC, ip), None);
        }
        assert!(rlb.clients().iter().all(|(_, c)| c.link == Some(2)));
        assert_eq!(rlb.tick().len(), 3);
        assert!(rlb.clients().iter().all(|(_, c)| !c.ntt));

        links[0].set_flag(LinkFlags::UP, true);
        links[2].set_flag(LinkFlags::UP, true);
        links[1].set_flag(LinkFlags::UP, false);
        rlb.clear_link(&links, 2);

        let clients = rlb.clients();
        assert_eq!(clients.len(), 5);
        for (_, client) in &clients {
            assert!(matches!(client.link, Some(1) | Some(3)));
            assert_eq!(client.ntt, client.mac_dst != MAC_BCAST);
        }
        assert_eq!(clients.iter().filter(|(_, c)| c.ntt).count(), 3);
        assert!(rlb.rx_ntt());
        assert_invariants(&rlb);
    }

    #[test]
    fn clear_link_retries_updates() {
        let links = links(&[1000, 1000]);
        let rlb = table(0, 2);
        let ip = Ipv4Addr::new(10, 0, 0, 20);
        rlb.choose_channel(&links, Some(1), &reply(BOND_IP, BOND_MAC, ip, client_mac(1)), None);
        let link = rlb.client(rlb.index_of(ip)).unwrap().link.unwrap();
        assert_eq!(rlb.tick().len(), 1);

        links[(link - 1) as usize].set_flag(LinkFlags::UP, false);
        rlb.clear_link(&links, link);

        // retry budget of 2 gives three passes
        assert_eq!(rlb.tick().len(), 1);
        assert_eq!(rlb.tick().len(), 1);
        assert_eq!(rlb.tick().len(), 1);
        assert!(rlb.tick().is_empty());
        assert!(!rlb.rx_ntt());
    }

    #[test]
    fn clear_link_without_alternative_unassigns() {
        let links = links(&[1000]);
        let rlb = table(0, 0);
        let ip = Ipv4Addr::new(10, 0, 0, 30);
        rlb.choose_channel(&links, Some(1), &reply(BOND_IP, BOND_MAC, ip, client_mac(1)), None);
        rlb.tick();
        links[0].set_flag(LinkFlags::UP, false);
        rlb.clear_link(&links, 1);
        let client = rlb.client(rlb.index_of(ip)).unwrap();
        assert!(client.assigned);
        assert_eq!(client.link, None);
        assert!(!client.ntt);
    }

    #[test]
    fn purge_removes_only_mismatching_macs() {
        let links = links(&[1000, 1000]);
        let rlb = table(0, 0);
        let host_ip = Ipv4Addr::new(192, 168, 1, 10);
        let m1 = [0x02, 0, 0, 0, 0, 0xa1];
        let m2 = [0x02, 0, 0, 0, 0, 0xa2];

        for i in 1..=3 {
            let client = Ipv4Addr::new(192, 168, 1, 100 + i);
            rlb.choose_channel(&links, Some(1), &reply(host_ip, m1, client, client_mac(i)), None);
        }
        let other = Ipv4Addr::new(192, 168, 1, 200);
        rlb.choose_channel(&links, Some(1), &reply(BOND_IP, BOND_MAC, other, client_mac(9)), None);
        assert_eq!(rlb.src_chain(host_ip).len(), 3);
        assert_invariants(&rlb);

        assert_eq!(rlb.purge_source_ip(host_ip, &m1), 0);
        assert_eq!(rlb.clients().len(), 4);

        assert_eq!(rlb.purge_source_ip(host_ip, &m2), 3);
        assert!(rlb.src_chain(host_ip).is_empty());
        let clients = rlb.clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].1.ip_dst, other);
        assert!(clients.iter().all(|(_, c)| c.mac_src != m1));
        assert_invariants(&rlb);
    }

    #[test]
    fn source_chains_follow_ip_src_changes() {
        let links = links(&[1000]);
        let rlb = table(0, 0);
        let client = Ipv4Addr::new(10, 0, 0, 40);
        let other_src = Ipv4Addr::new(10, 0, 0, 2);

        rlb.choose_channel(&links, Some(1), &reply(BOND_IP, BOND_MAC, client, client_mac(1)), None);
        assert_eq!(rlb.src_chain(BOND_IP), vec![rlb.index_of(client)]);

        rlb.choose_channel(&links, Some(1), &reply(other_src, BOND_MAC, client, client_mac(1)), None);
        assert!(rlb.src_chain(BOND_IP).is_empty());
        assert_eq!(rlb.src_chain(other_src), vec![rlb.index_of(client)]);
        assert_invariants(&rlb);
    }

    #[test]
    fn rebalance_reassigns_known_clients() {
        let links = links(&[1000, 1000]);
        let rlb = table(0, 0);
        links[1].set_flag(LinkFlags::UP, false);
        for i in 1..=4 {
            let ip = Ipv4Addr::new(10, 0, 0, 16 * i);
            rlb.choose_channel(&links, Some(1), &reply(BOND_IP, BOND_MAC, ip, client_mac(i)), None);
        }
        rlb.tick();
        assert!(!rlb.rx_ntt());

        links[1].set_flag(LinkFlags::UP, true);
        rlb.rebalance(&links);
        let clients = rlb.clients();
        let on_second = clients.iter().filter(|(_, c)| c.link == Some(2)).count();
        assert_eq!(on_second, 2);
        assert!(clients.iter().all(|(_, c)| c.ntt == (c.link == Some(2))));
        assert!(rlb.rx_ntt());
    }

    #[test]
    fn rebalance_moves_unknown_clients_without_updates() {
        let links = links(&[1000, 1000]);
        let rlb = table(0, 0);
        links[1].set_flag(LinkFlags::UP, false);
        for i in 1..=4 {
            let ip = Ipv4Addr::new(10, 0, 0, 16 * i);
            rlb.choose_channel(&links, Some(1), &request(BOND_IP, BOND_MAC, ip), None);
        }
        rlb.tick();
        assert!(rlb.clients().iter().all(|(_, c)| c.mac_dst == MAC_BCAST));

        links[1].set_flag(LinkFlags::UP, true);
        rlb.rebalance(&links);
        let clients = rlb.clients();
        assert_eq!(clients.iter().filter(|(_, c)| c.link == Some(2)).count(), 2);
        assert!(clients.iter().all(|(_, c)| !c.ntt));
        assert!(!rlb.rx_ntt());
        assert_invariants(&rlb);
    }

    #[test]
    fn subnet_and_link_update_requests() {
        let links = links(&[1000, 1000]);
        let rlb = table(0, 0);
        links[0].assume_hw_addr(&BOND_MAC);
        for i in 1..=4 {
            let ip = Ipv4Addr::new(10, 0, 0, 16 * i);
            rlb.choose_channel(&links, Some(1), &reply(BOND_IP, BOND_MAC, ip, client_mac(i)), None);
        }
        rlb.tick();

        rlb.req_update_subnet_clients(&links, BOND_IP, &BOND_MAC);
        let clients = rlb.clients();
        assert!(clients.iter().all(|(_, c)| c.ntt == (c.link == Some(2))));
        rlb.tick();

        rlb.req_update_link_clients(1);
        let clients = rlb.clients();
        assert!(clients.iter().all(|(_, c)| c.ntt == (c.link == Some(1))));
    }

    #[test]
    fn clear_vlan_deletes_tagged_clients() {
        let links = links(&[1000]);
        let rlb = table(0, 0);
        rlb.choose_channel(&links, Some(1), &reply(BOND_IP, BOND_MAC, Ipv4Addr::new(10, 0, 0, 16), client_mac(1)), Some(5));
        rlb.choose_channel(&links, Some(1), &reply(BOND_IP, BOND_MAC, Ipv4Addr::new(10, 0, 0, 32), client_mac(2)), None);
        assert_eq!(rlb.clear_vlan(5), 1);
        assert_eq!(rlb.clients().len(), 1);
        assert_invariants(&rlb);
    }

    #[test]
    fn pending_client_without_link_stays_pending() {
        let links = links(&[1000]);
        let rlb = table(0, 0);
        let ip = Ipv4Addr::new(10, 0, 0, 48);
        rlb.choose_channel(&links, Some(1), &reply(BOND_IP, BOND_MAC, ip, client_mac(1)), None);
        let index = rlb.index_of(ip);
        rlb.lock().clients[index as usize].link = None;
        assert!(rlb.tick().is_empty());
        assert!(rlb.client(index).unwrap().ntt);
    }
}
