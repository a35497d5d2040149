//! In-memory links and a traffic simulation over them.

use crate::{
    alb::{Alb, XmitResult},
    config::{resolve_bond_mac, AlbConfig},
    frame::{self, ArpPacket},
    helpers::mac_to_str,
    info::{self, InfoTable},
    link::{HwAddrError, LinkId, TransmitLink},
    monitor,
};
use anyhow::anyhow;
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::time::{self, Instant, MissedTickBehavior};
use zon_alb_common::{arp, MacAddr, MAC_BCAST};

const DEFAULT_SPEED: u32 = 1000;
const TRAFFIC_PERIOD: Duration = Duration::from_millis(100);
const SIM_BOND_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Link that records whatever the bond hands over.
pub struct SimLink {
    name: String,
    frames: Mutex<Vec<Vec<u8>>>,
    tx_frames: AtomicU64,
    tx_bytes: AtomicU64,
    failing: AtomicBool,
    promisc: AtomicBool,
    hw_addr_support: bool,
    hw_addr: Mutex<Option<MacAddr>>,
}

impl SimLink {
    pub fn new(name: &str) -> Self {
        Self::with_support(name, true)
    }

    /// Device that refuses to change its hw address.
    pub fn without_hw_addr(name: &str) -> Self {
        Self::with_support(name, false)
    }

    fn with_support(name: &str, hw_addr_support: bool) -> Self {
        Self {
            name: name.to_string(),
            frames: Mutex::new(vec![]),
            tx_frames: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            promisc: AtomicBool::new(false),
            hw_addr_support,
            hw_addr: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes every following send fail.
    pub fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::Relaxed);
    }

    pub fn is_promiscuous(&self) -> bool {
        self.promisc.load(Ordering::Relaxed)
    }

    pub fn take_frames(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Last address programmed on the device, if any.
    pub fn hw_addr(&self) -> Option<MacAddr> {
        *self.hw_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tx_frames(&self) -> u64 {
        self.tx_frames.load(Ordering::Relaxed)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }
}

impl TransmitLink for SimLink {
    fn send(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(anyhow!("{} is failing", self.name));
        }
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.to_vec());
        Ok(())
    }

    fn set_hw_addr(&self, mac: &MacAddr) -> Result<(), HwAddrError> {
        if !self.hw_addr_support {
            return Err(HwAddrError::NotSupported);
        }
        *self.hw_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(*mac);
        Ok(())
    }

    fn set_promiscuous(&self, on: bool) -> Result<(), anyhow::Error> {
        self.promisc.store(on, Ordering::Relaxed);
        Ok(())
    }
}

pub struct SimOptions {
    /// Number of IPv4 peers generating traffic
    pub flows: u32,
    pub seconds: u32,
    /// Links that start with the carrier down
    pub down: Vec<String>,
    /// Carrier loss events, link name and second
    pub link_down: Vec<(String, u32)>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            flows: 32,
            seconds: 3,
            down: vec![],
            link_down: vec![],
        }
    }
}

fn sim_mac(i: usize) -> MacAddr {
    [0x02, 0, 0, 0, 1, i as u8]
}

fn peer_mac(i: u32) -> MacAddr {
    let b = i.to_be_bytes();
    [0x0a, 0, b[0], b[1], b[2], b[3]]
}

fn peer_ip(bond_ip: Ipv4Addr, i: u32) -> Ipv4Addr {
    let base = u32::from(bond_ip) & 0xffff_0000;
    Ipv4Addr::from(base | (0x100 + i))
}

/// Builds the bond described by the config over simulated links.
pub fn build_bond(
    cfg: &AlbConfig,
    opts: &SimOptions,
) -> Result<(Arc<Alb>, Vec<Arc<SimLink>>), anyhow::Error> {
    if cfg.links.is_empty() {
        return Err(anyhow!("No links to simulate, use --link"));
    }
    let mut macs = vec![];
    for (i, link) in cfg.links.iter().enumerate() {
        macs.push(link.mac()?.unwrap_or_else(|| sim_mac(i + 1)));
    }
    let bond_mac = resolve_bond_mac(cfg, macs.first())?;
    let alb = Arc::new(Alb::new(&cfg.name, bond_mac, cfg.timers(), cfg.rlb_enabled)?);
    for vid in &cfg.vlans {
        alb.add_vlan(*vid)?;
    }

    let mut devs = vec![];
    let mut primary = None;
    for (link, mac) in cfg.links.iter().zip(macs) {
        let dev = Arc::new(SimLink::new(&link.name));
        let id = alb.attach(
            &link.name,
            link.speed.unwrap_or(DEFAULT_SPEED),
            mac,
            dev.clone(),
        )?;
        if link.primary {
            primary = Some(id);
        }
        devs.push(dev);
    }

    for name in &opts.down {
        let slave = alb
            .link_by_name(name)
            .ok_or_else(|| anyhow!("No link named {}", name))?;
        alb.link_change(slave.id(), false)?;
    }
    if let Some(id) = primary {
        alb.set_active(id)?;
    }

    Ok((alb, devs))
}

/// The bond resolves a peer: request out, reply in on the link it left
/// through, then the bond answers the peer's own request.
fn resolve_peer(alb: &Alb, bond_ip: Ipv4Addr, ip: Ipv4Addr, mac: MacAddr) -> Option<LinkId> {
    let bond_mac = alb.bond_mac();
    let request = ArpPacket {
        oper: arp::OP_REQUEST,
        sender_mac: bond_mac,
        sender_ip: bond_ip,
        target_mac: MAC_BCAST,
        target_ip: ip,
    };
    let mut data = frame::arp_frame(&MAC_BCAST, &bond_mac, None, &request);
    let XmitResult::Sent(link) = alb.xmit(&mut data) else {
        return None;
    };

    let reply = ArpPacket {
        oper: arp::OP_REPLY,
        sender_mac: mac,
        sender_ip: ip,
        target_mac: bond_mac,
        target_ip: bond_ip,
    };
    alb.arp_recv(link, &frame::arp_frame(&bond_mac, &mac, None, &reply));

    let answer = ArpPacket {
        oper: arp::OP_REPLY,
        sender_mac: bond_mac,
        sender_ip: bond_ip,
        target_mac: mac,
        target_ip: ip,
    };
    let mut data = frame::arp_frame(&mac, &bond_mac, None, &answer);
    match alb.xmit(&mut data) {
        XmitResult::Sent(link) => Some(link),
        XmitResult::Dropped => None,
    }
}

fn send_flows(alb: &Alb, bond_ip: Ipv4Addr, flows: u32, round: u32) {
    let bond_mac = alb.bond_mac();
    for i in 0..flows {
        // uneven flows so the rebalance has something to move
        let payload = 64 + ((i * 97 + round * 13) % 1400) as usize;
        let mut data = frame::ipv4_frame(&peer_mac(i), &bond_mac, bond_ip, peer_ip(bond_ip, i), 17, payload);
        alb.xmit(&mut data);
    }
}

pub fn print_link_counts(alb: &Alb, devs: &[Arc<SimLink>]) {
    let mut table = InfoTable::new(vec!["link", "hw_addr", "tx_frames", "tx_bytes", "promisc"]);
    for dev in devs {
        let mac = alb
            .link_by_name(dev.name())
            .map_or(String::from("detached"), |l| mac_to_str(&l.hw_addr()));
        table.push_row(vec![
            dev.name().to_string(),
            mac,
            dev.tx_frames().to_string(),
            dev.tx_bytes().to_string(),
            dev.is_promiscuous().to_string(),
        ]);
    }
    table.print("simulated links");
}

pub async fn run(cfg: &AlbConfig, opts: SimOptions) -> Result<(), anyhow::Error> {
    let (alb, devs) = build_bond(cfg, &opts)?;
    let bond_ip = cfg.bond_ip.unwrap_or(SIM_BOND_IP);

    for (name, _) in &opts.link_down {
        if alb.link_by_name(name).is_none() {
            return Err(anyhow!("No link named {}", name));
        }
    }

    log::info!(
        "[sim] {} flows for {}s over {}",
        opts.flows,
        opts.seconds,
        cfg.description()
    );

    let mon = monitor::spawn(alb.clone());

    if alb.rlb_enabled() {
        for i in 0..opts.flows {
            match resolve_peer(&alb, bond_ip, peer_ip(bond_ip, i), peer_mac(i)) {
                Some(link) => log::debug!("[sim] peer {} answered on link {}", peer_ip(bond_ip, i), link),
                None => log::warn!("[sim] no link to reach {}", peer_ip(bond_ip, i)),
            }
        }
    }

    let start = Instant::now();
    let end = start + Duration::from_secs(opts.seconds as u64);
    let mut events = opts.link_down.clone();
    events.sort_by_key(|(_, at)| *at);
    let mut events = events.into_iter().peekable();

    let mut traffic = time::interval(TRAFFIC_PERIOD);
    traffic.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut round = 0;
    while Instant::now() < end {
        traffic.tick().await;
        let elapsed = start.elapsed().as_secs() as u32;
        while let Some((name, _)) = events.next_if(|(_, at)| *at <= elapsed) {
            if let Some(slave) = alb.link_by_name(&name) {
                log::info!("[sim] carrier lost on {} at {}s", name, elapsed);
                alb.link_change(slave.id(), false)?;
            }
        }
        send_flows(&alb, bond_ip, opts.flows, round);
        round += 1;
    }

    mon.abort();

    info::print_links(&alb);
    info::print_tlb(&alb);
    info::print_rlb(&alb);
    alb.stats().print_all();
    print_link_counts(&alb, &devs);

    Ok(())
}
