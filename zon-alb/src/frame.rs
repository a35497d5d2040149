//! Ethernet frame classification for the balancer and the builders for the
//! frames the balancer sends on its own (learning packets and ARP updates).

use pnet::{
    packet::{
        arp::{ArpHardwareTypes, ArpOperation, ArpPacket as ArpHeader, MutableArpPacket},
        ethernet::{EtherType, EtherTypes, EthernetPacket, MutableEthernetPacket},
        ip::IpNextHeaderProtocol,
        ipv4::{Ipv4Flags, Ipv4Packet, MutableIpv4Packet},
        ipv6::Ipv6Packet,
        vlan::{MutableVlanPacket, VlanPacket},
        MutablePacket, Packet,
    },
    util::MacAddr as HwAddr,
};
use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};
use zon_alb_common::{arp, ethertype, ipx, MacAddr, ETH_ALEN, ETH_HLEN, ETH_ZLEN, VLAN_HLEN};

const IPV4_HLEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Truncated(&'static str),
    Invalid(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated(what) => write!(f, "truncated {}", what),
            Self::Invalid(what) => write!(f, "invalid {}", what),
        }
    }
}

impl std::error::Error for ParseError {}

/// Ethernet/IPv4 ARP payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    /// Operation, 1 for request and 2 for reply
    pub oper: u16,
    /// Sender hw address
    pub sender_mac: MacAddr,
    /// Sender protocol address
    pub sender_ip: Ipv4Addr,
    /// Target hw address
    pub target_mac: MacAddr,
    /// Target protocol address
    pub target_ip: Ipv4Addr,
}

fn hw_addr(mac: &MacAddr) -> HwAddr {
    HwAddr::new(mac[0], mac[1], mac[2], mac[3], mac[4], mac[5])
}

fn mac_addr(hw: HwAddr) -> MacAddr {
    [hw.0, hw.1, hw.2, hw.3, hw.4, hw.5]
}

impl ArpPacket {
    pub fn is_request(&self) -> bool {
        self.oper == arp::OP_REQUEST
    }

    pub fn is_reply(&self) -> bool {
        self.oper == arp::OP_REPLY
    }

    fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let hdr = ArpHeader::new(data).ok_or(ParseError::Truncated("arp header"))?;
        if hdr.get_hardware_type() != ArpHardwareTypes::Ethernet
            || hdr.get_protocol_type() != EtherTypes::Ipv4
            || hdr.get_hw_addr_len() as usize != ETH_ALEN
            || hdr.get_proto_addr_len() != 4
        {
            return Err(ParseError::Invalid("arp hardware or protocol type"));
        }
        Ok(Self {
            oper: hdr.get_operation().0,
            sender_mac: mac_addr(hdr.get_sender_hw_addr()),
            sender_ip: hdr.get_sender_proto_addr(),
            target_mac: mac_addr(hdr.get_target_hw_addr()),
            target_ip: hdr.get_target_proto_addr(),
        })
    }

    fn write(&self, buf: &mut [u8]) {
        let Some(mut hdr) = MutableArpPacket::new(buf) else {
            return;
        };
        hdr.set_hardware_type(ArpHardwareTypes::Ethernet);
        hdr.set_protocol_type(EtherTypes::Ipv4);
        hdr.set_hw_addr_len(ETH_ALEN as u8);
        hdr.set_proto_addr_len(4);
        hdr.set_operation(ArpOperation(self.oper));
        hdr.set_sender_hw_addr(hw_addr(&self.sender_mac));
        hdr.set_sender_proto_addr(self.sender_ip);
        hdr.set_target_hw_addr(hw_addr(&self.target_mac));
        hdr.set_target_proto_addr(self.target_ip);
    }
}

/// Protocol view the balancer cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
    },
    Ipv6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
    },
    Ipx {
        checksum: u16,
        packet_type: u8,
    },
    Arp(ArpPacket),
    Other(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthFrame {
    pub dst: MacAddr,
    pub src: MacAddr,
    /// 802.1Q VLAN id, if the frame carries a tag
    pub vlan_id: Option<u16>,
    /// Offset of the network header
    pub l3_offset: usize,
    pub kind: FrameKind,
}

/// Parses the Ethernet header, an optional 802.1Q tag and the network header
/// fields used for balancing.
pub fn parse(data: &[u8]) -> Result<EthFrame, ParseError> {
    let eth = EthernetPacket::new(data).ok_or(ParseError::Truncated("ethernet header"))?;

    let (proto, vlan_id, l3_offset) = match eth.get_ethertype() {
        EtherTypes::Vlan => {
            let tag = VlanPacket::new(eth.payload()).ok_or(ParseError::Truncated("vlan tag"))?;
            (
                tag.get_ethertype(),
                Some(tag.get_vlan_identifier()),
                ETH_HLEN + VLAN_HLEN,
            )
        }
        proto => (proto, None, ETH_HLEN),
    };

    let payload = &data[l3_offset..];
    let kind = match proto.0 {
        ethertype::IPV4 => {
            let hdr = Ipv4Packet::new(payload).ok_or(ParseError::Truncated("ipv4 header"))?;
            if hdr.get_version() != 4 || hdr.get_header_length() < 5 {
                return Err(ParseError::Invalid("ipv4 version or ihl"));
            }
            FrameKind::Ipv4 {
                protocol: hdr.get_next_level_protocol().0,
                src: hdr.get_source(),
                dst: hdr.get_destination(),
            }
        }
        ethertype::IPV6 => {
            let hdr = Ipv6Packet::new(payload).ok_or(ParseError::Truncated("ipv6 header"))?;
            if hdr.get_version() != 6 {
                return Err(ParseError::Invalid("ipv6 version"));
            }
            FrameKind::Ipv6 {
                src: hdr.get_source(),
                dst: hdr.get_destination(),
            }
        }
        ethertype::IPX => parse_ipx(payload)?,
        ethertype::ARP => FrameKind::Arp(ArpPacket::parse(payload)?),
        other => FrameKind::Other(other),
    };

    Ok(EthFrame {
        dst: mac_addr(eth.get_destination()),
        src: mac_addr(eth.get_source()),
        vlan_id,
        l3_offset,
        kind,
    })
}

/// IPX header fields, big endian checksum first and the packet type at byte 5.
fn parse_ipx(payload: &[u8]) -> Result<FrameKind, ParseError> {
    let hdr = payload
        .get(0..ipx::HDR_LEN)
        .ok_or(ParseError::Truncated("ipx header"))?;
    Ok(FrameKind::Ipx {
        checksum: u16::from_be_bytes([hdr[0], hdr[1]]),
        packet_type: hdr[5],
    })
}

pub fn set_eth_source(frame: &mut [u8], mac: &MacAddr) {
    if let Some(mut eth) = MutableEthernetPacket::new(frame) {
        eth.set_source(hw_addr(mac));
    }
}

/// Rewrites the ARP sender hardware address of a frame already parsed by [`parse`].
pub fn set_arp_sender_mac(frame: &mut [u8], l3_offset: usize, mac: &MacAddr) {
    if let Some(mut hdr) = frame.get_mut(l3_offset..).and_then(MutableArpPacket::new) {
        hdr.set_sender_hw_addr(hw_addr(mac));
    }
}

/// Zeroed frame with the Ethernet header and the optional tag filled in, padded
/// to the minimum frame size. Returns the frame and the network header offset.
fn eth_frame(
    dst: &MacAddr,
    src: &MacAddr,
    vlan_id: Option<u16>,
    proto: u16,
    l3_len: usize,
) -> (Vec<u8>, usize) {
    let tag_len = vlan_id.map_or(0, |_| VLAN_HLEN);
    let l3_offset = ETH_HLEN + tag_len;
    let mut buf = vec![0u8; (l3_offset + l3_len).max(ETH_ZLEN + tag_len)];

    if let Some(mut eth) = MutableEthernetPacket::new(&mut buf) {
        eth.set_destination(hw_addr(dst));
        eth.set_source(hw_addr(src));
        match vlan_id {
            Some(vid) => {
                eth.set_ethertype(EtherTypes::Vlan);
                if let Some(mut tag) = MutableVlanPacket::new(eth.payload_mut()) {
                    tag.set_vlan_identifier(vid & 0x0FFF);
                    tag.set_ethertype(EtherType(proto));
                }
            }
            None => eth.set_ethertype(EtherType(proto)),
        }
    }
    (buf, l3_offset)
}

/// Frame that only refreshes the switch forwarding entry for `mac`.
pub fn learning_packet(mac: &MacAddr, vlan_id: Option<u16>) -> Vec<u8> {
    eth_frame(mac, mac, vlan_id, ethertype::LOOPBACK, 0).0
}

pub fn arp_frame(eth_dst: &MacAddr, eth_src: &MacAddr, vlan_id: Option<u16>, pkt: &ArpPacket) -> Vec<u8> {
    let (mut buf, l3_offset) = eth_frame(eth_dst, eth_src, vlan_id, ethertype::ARP, arp::PKT_LEN);
    pkt.write(&mut buf[l3_offset..]);
    buf
}

/// Unicast ARP reply telling `client_ip`/`client_mac` that `bond_ip` lives at `link_mac`.
pub fn arp_update(
    client_mac: &MacAddr,
    client_ip: Ipv4Addr,
    link_mac: &MacAddr,
    bond_ip: Ipv4Addr,
    vlan_id: Option<u16>,
) -> Vec<u8> {
    let pkt = ArpPacket {
        oper: arp::OP_REPLY,
        sender_mac: *link_mac,
        sender_ip: bond_ip,
        target_mac: *client_mac,
        target_ip: client_ip,
    };
    arp_frame(client_mac, link_mac, vlan_id, &pkt)
}

/// Minimal IPv4 frame with a zeroed payload of `payload_len` bytes.
pub fn ipv4_frame(
    eth_dst: &MacAddr,
    eth_src: &MacAddr,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    payload_len: usize,
) -> Vec<u8> {
    let payload_len = payload_len.min(u16::MAX as usize - IPV4_HLEN);
    let (mut buf, l3_offset) = eth_frame(eth_dst, eth_src, None, ethertype::IPV4, IPV4_HLEN + payload_len);
    if let Some(mut ip) = MutableIpv4Packet::new(&mut buf[l3_offset..]) {
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length((IPV4_HLEN + payload_len) as u16);
        ip.set_flags(Ipv4Flags::DontFragment);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocol(protocol));
        ip.set_source(src);
        ip.set_destination(dst);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use zon_alb_common::MAC_BCAST;

    const A: MacAddr = [0x02, 0, 0, 0, 0, 0xa];
    const B: MacAddr = [0x02, 0, 0, 0, 0, 0xb];

    #[test]
    fn parse_ipv4() {
        let frame = ipv4_frame(
            &B,
            &A,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            17,
            100,
        );
        let eth = parse(&frame).unwrap();
        assert_eq!(eth.dst, B);
        assert_eq!(eth.src, A);
        assert_eq!(eth.vlan_id, None);
        assert_eq!(
            eth.kind,
            FrameKind::Ipv4 {
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 0, 0, 2),
                protocol: 17
            }
        );
    }

    #[test]
    fn parse_tagged_arp() {
        let pkt = ArpPacket {
            oper: arp::OP_REQUEST,
            sender_mac: A,
            sender_ip: Ipv4Addr::new(192, 168, 1, 1),
            target_mac: [0; 6],
            target_ip: Ipv4Addr::new(192, 168, 1, 10),
        };
        let frame = arp_frame(&MAC_BCAST, &A, Some(42), &pkt);
        assert_eq!(frame.len(), ETH_ZLEN + VLAN_HLEN);
        let eth = parse(&frame).unwrap();
        assert_eq!(eth.vlan_id, Some(42));
        assert_eq!(eth.l3_offset, ETH_HLEN + VLAN_HLEN);
        assert_eq!(eth.kind, FrameKind::Arp(pkt));
    }

    #[test]
    fn rewrite_arp_sender() {
        let pkt = ArpPacket {
            oper: arp::OP_REPLY,
            sender_mac: A,
            sender_ip: Ipv4Addr::new(10, 0, 0, 1),
            target_mac: B,
            target_ip: Ipv4Addr::new(10, 0, 0, 5),
        };
        let mut frame = arp_frame(&B, &A, None, &pkt);
        let eth = parse(&frame).unwrap();
        let new_mac = [0x02, 0, 0, 0, 0, 0xc];
        set_arp_sender_mac(&mut frame, eth.l3_offset, &new_mac);
        set_eth_source(&mut frame, &new_mac);
        let eth = parse(&frame).unwrap();
        assert_eq!(eth.src, new_mac);
        match eth.kind {
            FrameKind::Arp(arp) => {
                assert_eq!(arp.sender_mac, new_mac);
                assert_eq!(arp.target_mac, B);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn learning_packet_layout() {
        let lp = learning_packet(&A, None);
        assert_eq!(lp.len(), ETH_ZLEN);
        assert_eq!(&lp[0..6], &A);
        assert_eq!(&lp[6..12], &A);
        assert_eq!(
            EthernetPacket::new(&lp).unwrap().get_ethertype(),
            EtherType(ethertype::LOOPBACK)
        );

        let lp = learning_packet(&A, Some(7));
        assert_eq!(lp.len(), ETH_ZLEN + VLAN_HLEN);
        let eth = parse(&lp).unwrap();
        assert_eq!(eth.vlan_id, Some(7));
        assert_eq!(eth.kind, FrameKind::Other(ethertype::LOOPBACK));
    }

    #[test]
    fn arp_update_targets_client() {
        let frame = arp_update(
            &B,
            Ipv4Addr::new(10, 0, 0, 5),
            &A,
            Ipv4Addr::new(10, 0, 0, 1),
            None,
        );
        let eth = parse(&frame).unwrap();
        assert_eq!(eth.dst, B);
        assert_eq!(eth.src, A);
        let FrameKind::Arp(pkt) = eth.kind else {
            panic!("not an arp frame");
        };
        assert!(pkt.is_reply());
        assert_eq!(pkt.sender_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(pkt.target_ip, Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn priority_bits_are_not_part_of_vlan_id() {
        let mut lp = learning_packet(&A, Some(0x123));
        // PCP 5, DEI set
        lp[ETH_HLEN] |= 0xB0;
        let eth = parse(&lp).unwrap();
        assert_eq!(eth.vlan_id, Some(0x123));
        assert_eq!(eth.kind, FrameKind::Other(ethertype::LOOPBACK));
    }

    #[test]
    fn parse_ipv6_and_ipx() {
        let (mut frame, off) = eth_frame(&B, &A, None, ethertype::IPV6, 40);
        frame[off] = 0x60;
        frame[off + 8 + 15] = 1;
        frame[off + 24 + 15] = 2;
        let eth = parse(&frame).unwrap();
        assert_eq!(
            eth.kind,
            FrameKind::Ipv6 {
                src: Ipv6Addr::from(1u128),
                dst: Ipv6Addr::from(2u128)
            }
        );

        let (mut frame, off) = eth_frame(&B, &A, Some(3), ethertype::IPX, ipx::HDR_LEN);
        frame[off..off + 2].copy_from_slice(&ipx::NO_CHECKSUM.to_be_bytes());
        frame[off + 5] = ipx::TYPE_NCP;
        let eth = parse(&frame).unwrap();
        assert_eq!(eth.l3_offset, ETH_HLEN + VLAN_HLEN);
        assert_eq!(
            eth.kind,
            FrameKind::Ipx {
                checksum: ipx::NO_CHECKSUM,
                packet_type: ipx::TYPE_NCP
            }
        );
    }

    #[test]
    fn truncated_and_invalid_frames() {
        assert_eq!(
            parse(&[0u8; 10]),
            Err(ParseError::Truncated("ethernet header"))
        );
        let mut frame = ipv4_frame(&B, &A, Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 6, 0);
        frame[ETH_HLEN] = 0x65;
        assert_eq!(parse(&frame), Err(ParseError::Invalid("ipv4 version or ihl")));
        let mut frame = vec![0u8; ETH_HLEN + 10];
        frame[12..14].copy_from_slice(&ethertype::ARP.to_be_bytes());
        assert_eq!(parse(&frame), Err(ParseError::Truncated("arp header")));
    }
}
