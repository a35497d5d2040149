//! Links backed by AF_PACKET sockets on real interfaces.

use crate::{
    helpers::{errno, ifindex, parse_mac, str_errno, str_error},
    link::{HwAddrError, TransmitLink},
};
use anyhow::{anyhow, Context};
use std::{fs, mem, time::Duration};
use zon_alb_common::{ethertype, MacAddr};

const ARPHRD_ETHER: u16 = 1;
const PACKET_OUTGOING: libc::c_uchar = 4;

#[repr(C)]
struct PacketMreq {
    mr_ifindex: libc::c_int,
    mr_type: libc::c_ushort,
    mr_alen: libc::c_ushort,
    mr_address: [libc::c_uchar; 8],
}

/// `struct ifreq` with the hw address member of the union
#[repr(C)]
struct IfReqHwAddr {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_hwaddr: libc::sockaddr,
    _pad: [u8; 8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SocketKind {
    /// Transmit only, nothing is queued for receive
    Send,
    /// Receives ARP frames
    Arp,
}

impl SocketKind {
    /// Protocol the socket is opened and bound with, host order
    fn protocol(self) -> u16 {
        match self {
            Self::Send => 0,
            Self::Arp => ethertype::ARP,
        }
    }
}

pub struct PacketLink {
    fd: libc::c_int,
    ifname: String,
    ifindex: u32,
}

impl PacketLink {
    /// Socket used to send the frames of the bond.
    pub fn open(ifname: &str) -> Result<Self, anyhow::Error> {
        Self::open_kind(ifname, SocketKind::Send)
    }

    /// Socket that only receives ARP. Receive calls time out so the caller
    /// can check for shutdown.
    pub fn open_arp(ifname: &str, timeout: Duration) -> Result<Self, anyhow::Error> {
        let link = Self::open_kind(ifname, SocketKind::Arp)?;
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::setsockopt(
                link.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const _ as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(anyhow!("Can't set receive timeout on {}, {}", ifname, str_errno()));
        }
        Ok(link)
    }

    fn open_kind(ifname: &str, kind: SocketKind) -> Result<Self, anyhow::Error> {
        let ifindex = ifindex(ifname)?;
        let proto = kind.protocol();
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                proto.to_be() as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(anyhow!("Can't open packet socket for {}, {}", ifname, str_errno()));
        }
        // Closes the socket if bind fails
        let link = Self {
            fd,
            ifname: ifname.to_string(),
            ifindex,
        };

        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = proto.to_be();
        addr.sll_ifindex = ifindex as libc::c_int;
        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(anyhow!("Can't bind packet socket to {}, {}", ifname, str_errno()));
        }

        log::debug!("[pkt] {:?} socket {} bound to {}#{}", kind, fd, ifname, ifindex);
        Ok(link)
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// Returns `None` when the receive timeout expired or the frame was sent
    /// by this host.
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<usize>, anyhow::Error> {
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        let ret = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if ret >= 0 {
            if addr.sll_pkttype == PACKET_OUTGOING {
                return Ok(None);
            }
            return Ok(Some(ret as usize));
        }
        match errno() {
            libc::EAGAIN | libc::EINTR => Ok(None),
            err => Err(anyhow!("Receive failed on {}, {}", self.ifname, str_error(err))),
        }
    }

    fn promisc_membership(&self, option: libc::c_int) -> Result<(), anyhow::Error> {
        let mreq = PacketMreq {
            mr_ifindex: self.ifindex as libc::c_int,
            mr_type: libc::PACKET_MR_PROMISC as libc::c_ushort,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_PACKET,
                option,
                &mreq as *const _ as *const libc::c_void,
                mem::size_of::<PacketMreq>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(anyhow!("Can't change promiscuous mode on {}, {}", self.ifname, str_errno()));
        }
        Ok(())
    }
}

impl TransmitLink for PacketLink {
    fn send(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        let ret = unsafe { libc::send(self.fd, frame.as_ptr() as *const libc::c_void, frame.len(), 0) };
        if ret < 0 {
            return Err(anyhow!("Send failed on {}, {}", self.ifname, str_errno()));
        }
        Ok(())
    }

    fn set_hw_addr(&self, mac: &MacAddr) -> Result<(), HwAddrError> {
        let mut req: IfReqHwAddr = unsafe { mem::zeroed() };
        for (dst, src) in req.ifr_name.iter_mut().zip(self.ifname.bytes().take(libc::IF_NAMESIZE - 1)) {
            *dst = src as libc::c_char;
        }
        req.ifr_hwaddr.sa_family = ARPHRD_ETHER;
        for (dst, src) in req.ifr_hwaddr.sa_data.iter_mut().zip(mac.iter()) {
            *dst = *src as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(self.fd, libc::SIOCSIFHWADDR, &mut req as *mut IfReqHwAddr) };
        if ret == 0 {
            return Ok(());
        }
        match errno() {
            libc::EOPNOTSUPP | libc::EINVAL => Err(HwAddrError::NotSupported),
            err => Err(HwAddrError::Failed(anyhow!("{}: {}", self.ifname, str_error(err)))),
        }
    }

    /// The membership is dropped with the socket, so a crash can't leave the
    /// device promiscuous.
    fn set_promiscuous(&self, on: bool) -> Result<(), anyhow::Error> {
        if on {
            self.promisc_membership(libc::PACKET_ADD_MEMBERSHIP)
        } else {
            self.promisc_membership(libc::PACKET_DROP_MEMBERSHIP)
        }
    }
}

impl Drop for PacketLink {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn sysfs_attr(ifname: &str, attr: &str) -> Result<String, anyhow::Error> {
    let path = format!("/sys/class/net/{}/{}", ifname, attr);
    let value = fs::read_to_string(&path).context(format!("Can't read {}", path))?;
    Ok(value.trim().to_string())
}

/// Speed in Mbps, `None` when the driver doesn't know it.
pub fn link_speed(ifname: &str) -> Option<u32> {
    sysfs_attr(ifname, "speed")
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|s| *s > 0)
        .map(|s| s.min(u32::MAX as i64) as u32)
}

pub fn link_mac(ifname: &str) -> Result<MacAddr, anyhow::Error> {
    let mac = sysfs_attr(ifname, "address")?;
    parse_mac(&mac).context(format!("{} has no ethernet address", ifname))
}

pub fn link_is_up(ifname: &str) -> bool {
    sysfs_attr(ifname, "carrier").map_or(false, |c| c == "1")
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_SUCH_LINK: &str = "zalb-none0";

    #[test]
    fn missing_interface() {
        assert!(PacketLink::open(NO_SUCH_LINK).is_err());
        assert!(PacketLink::open_arp(NO_SUCH_LINK, Duration::from_millis(100)).is_err());
        assert_eq!(link_speed(NO_SUCH_LINK), None);
        assert!(link_mac(NO_SUCH_LINK).is_err());
        assert!(!link_is_up(NO_SUCH_LINK));
    }

    #[test]
    fn send_socket_binds_no_protocol() {
        assert_eq!(SocketKind::Send.protocol(), 0);
        assert_eq!(SocketKind::Arp.protocol(), ethertype::ARP);
    }

    #[test]
    fn ifreq_layout() {
        assert_eq!(mem::size_of::<IfReqHwAddr>(), 40);
        assert_eq!(mem::size_of::<PacketMreq>(), 16);
    }
}
