#![no_std]

use bitflags;

/// Bucket count of the transmit (TLB) hash table. Must cover every value of
/// [`simple_hash`].
pub const TLB_HASH_TABLE_SIZE: usize = 256;
/// Bucket count of the receive (RLB) client table.
pub const RLB_HASH_TABLE_SIZE: usize = 256;
/// Terminates every index based chain in both tables.
pub const NULL_INDEX: u32 = u32::MAX;

pub const ALB_TIMER_TICKS_PER_SEC: u32 = 10;
/// Seconds between two transmit rebalance passes.
pub const TLB_REBALANCE_INTERVAL: u32 = 10;
/// Seconds between two rounds of learning packets.
pub const ALB_LP_INTERVAL: u32 = 1;
/// Seconds the client updates are held back after an ARP request went out.
pub const RLB_UPDATE_DELAY: u32 = 2;
pub const RLB_ARP_BURST_SIZE: u32 = 2;
/// Extra update passes after a link was disabled or released.
pub const RLB_UPDATE_RETRY: u32 = 3;
/// Seconds the active link stays promiscuous after learning a disabled MAC.
pub const RLB_PROMISC_TIMEOUT: u32 = 10;

pub const ETH_ALEN: usize = 6;
pub const ETH_HLEN: usize = 14;
pub const ETH_ZLEN: usize = 60;
pub const VLAN_HLEN: usize = 4;

pub type MacAddr = [u8; ETH_ALEN];

pub const MAC_BCAST: MacAddr = [0xff; ETH_ALEN];
pub const MAC_ZERO: MacAddr = [0; ETH_ALEN];
/// IPv6 all-nodes multicast, the IPv6 stand-in for broadcast
pub const MAC_V6_ALLMCAST: MacAddr = [0x33, 0x33, 0x00, 0x00, 0x00, 0x01];

pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const VLAN: u16 = 0x8100;
    pub const IPX: u16 = 0x8137;
    pub const IPV6: u16 = 0x86DD;
    /// Used by the learning packets, ignored by every receiver
    pub const LOOPBACK: u16 = 0x9000;
}

pub mod arp {
    pub const HTYPE_ETHER: u16 = 1;
    pub const OP_REQUEST: u16 = 1;
    pub const OP_REPLY: u16 = 2;
    /// Ethernet/IPv4 ARP payload length
    pub const PKT_LEN: usize = 28;
}

pub mod ipx {
    pub const NO_CHECKSUM: u16 = 0xFFFF;
    /// NetWare Core Protocol, the only IPX type worth balancing
    pub const TYPE_NCP: u8 = 0x11;
    pub const HDR_LEN: usize = 30;
}

pub const IPPROTO_IGMP: u8 = 2;

bitflags::bitflags! {
/// Link state as seen by the balancer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkFlags: u32 {
    /// Carrier is up
    const UP = 1;
    /// The bond allows the link to transmit
    const ACTIVE = 2;
}
}

impl LinkFlags {
    /// Only links that are both up and active take part in any selection.
    pub fn can_tx(&self) -> bool {
        self.contains(LinkFlags::UP | LinkFlags::ACTIVE)
    }
}

/// XOR-folds the input into one byte. The result indexes both hash tables.
pub fn simple_hash(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0_u8, |hash, b| hash ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_hash_folds_bytes() {
        assert_eq!(simple_hash(&[]), 0);
        assert_eq!(simple_hash(&[10, 0, 0, 5]), 10 ^ 5);
        assert_eq!(simple_hash(&[0xff, 0xff]), 0);
    }

    #[test]
    fn can_tx_needs_up_and_active() {
        assert!(!LinkFlags::UP.can_tx());
        assert!(!LinkFlags::ACTIVE.can_tx());
        assert!((LinkFlags::UP | LinkFlags::ACTIVE).can_tx());
    }
}
