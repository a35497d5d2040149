use crate::helpers::mac_to_str;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use zon_alb_common::{LinkFlags, MacAddr};

/// Identifies a link for as long as it is attached to the bond.
pub type LinkId = u32;

#[derive(Debug)]
pub enum HwAddrError {
    /// The device can't change its hardware address
    NotSupported,
    Failed(anyhow::Error),
}

impl fmt::Display for HwAddrError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotSupported => write!(f, "changing the hw address is not supported"),
            Self::Failed(e) => write!(f, "can't set hw address, {}", e),
        }
    }
}

impl std::error::Error for HwAddrError {}

/// Lower layer of a link. The balancer hands frames over and never retries
/// a failed send.
pub trait TransmitLink: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<(), anyhow::Error>;

    fn set_hw_addr(&self, _mac: &MacAddr) -> Result<(), HwAddrError> {
        Err(HwAddrError::NotSupported)
    }

    fn set_promiscuous(&self, _on: bool) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Receive hook for ARP frames seen on any link of the bond.
pub trait ArpObserver {
    fn on_arp(&self, link: LinkId, frame: &[u8]);
}

/// One physical path of the bond.
pub struct Slave {
    id: LinkId,
    name: String,
    perm_hw_addr: MacAddr,
    hw_addr: Mutex<MacAddr>,
    /// Mbps
    speed: AtomicU32,
    flags: AtomicU32,
    dev: Arc<dyn TransmitLink>,
}

impl Slave {
    pub(crate) fn new(
        id: LinkId,
        name: &str,
        speed: u32,
        perm_hw_addr: MacAddr,
        dev: Arc<dyn TransmitLink>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            perm_hw_addr,
            hw_addr: Mutex::new(perm_hw_addr),
            speed: AtomicU32::new(speed),
            flags: AtomicU32::new((LinkFlags::UP | LinkFlags::ACTIVE).bits()),
            dev,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn speed(&self) -> u32 {
        self.speed.load(Ordering::Relaxed)
    }

    pub fn set_speed(&self, speed: u32) {
        self.speed.store(speed, Ordering::Relaxed);
    }

    pub fn flags(&self) -> LinkFlags {
        LinkFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flag(&self, flag: LinkFlags, on: bool) {
        if on {
            self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }

    pub fn can_tx(&self) -> bool {
        self.flags().can_tx()
    }

    pub fn hw_addr(&self) -> MacAddr {
        *self.hw_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn perm_hw_addr(&self) -> MacAddr {
        self.perm_hw_addr
    }

    /// Programs the device first and records the address only on success.
    pub fn set_hw_addr(&self, mac: &MacAddr) -> Result<(), HwAddrError> {
        self.dev.set_hw_addr(mac)?;
        *self.hw_addr.lock().unwrap_or_else(PoisonError::into_inner) = *mac;
        Ok(())
    }

    /// Records an address without touching the device.
    pub(crate) fn assume_hw_addr(&self, mac: &MacAddr) {
        *self.hw_addr.lock().unwrap_or_else(PoisonError::into_inner) = *mac;
    }

    pub fn send(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        self.dev.send(frame)
    }

    pub fn set_promiscuous(&self, on: bool) -> Result<(), anyhow::Error> {
        self.dev.set_promiscuous(on)
    }
}

impl fmt::Display for Slave {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}#{} ({} Mbps, {})",
            self.name,
            self.id,
            self.speed(),
            mac_to_str(&self.hw_addr())
        )
    }
}

pub(crate) fn find(links: &[Arc<Slave>], id: LinkId) -> Option<&Arc<Slave>> {
    links.iter().find(|l| l.id == id)
}
