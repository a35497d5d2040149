mod alb;
mod config;
mod frame;
mod helpers;
mod info;
mod link;
mod monitor;
mod options;
mod packet;
mod rlb;
mod sim;
mod stats;
mod tlb;

use crate::{
    alb::Alb,
    config::{resolve_bond_mac, AlbConfig, ConfigFile},
    frame::{ArpPacket, EthFrame, FrameKind},
    link::{ArpObserver, LinkId},
    options::LinkOptFlags,
    packet::PacketLink,
    sim::SimOptions,
};
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::{
    net::Ipv4Addr,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{signal, task::JoinHandle, time};
use zon_alb_common::{arp, LinkFlags, MacAddr};

const DEFAULT_CONFIG: &str = "zon-alb.toml";
const DEFAULT_SPEED: u32 = 1000;
const ARP_RECV_TIMEOUT: Duration = Duration::from_millis(200);
const CARRIER_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[clap(version, about = "Adaptive load balancing over a group of ethernet links")]
struct Opt {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Shows the config, updated with the command line links
    Config {
        /// Config file to start from
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,

        /// Writes the updated config to this file
        #[clap(long)]
        save: Option<String>,

        /// Link to add or update, as name:opt,opt. Options are
        /// speed=<mbps>, mac=<address> and primary.
        #[clap(short, long)]
        link: Vec<String>,

        /// Transmit balancing only
        #[clap(long)]
        no_rlb: bool,
    },
    /// Runs the balancer over in-memory links and prints the resulting tables
    Simulate {
        /// Optional config file
        #[clap(short, long)]
        config: Option<String>,

        /// Simulated link as name:opt,opt. The down option starts the link
        /// without carrier.
        #[clap(short, long)]
        link: Vec<String>,

        /// Number of peers sending traffic
        #[clap(long, default_value_t = 32)]
        flows: u32,

        /// Duration of the simulation
        #[clap(long, default_value_t = 3)]
        seconds: u32,

        /// Carrier loss as name@second
        #[clap(long)]
        link_down: Vec<String>,

        #[clap(long)]
        no_rlb: bool,
    },
    /// Balances over real interfaces until Ctrl-C
    Run {
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,

        #[clap(short, long)]
        link: Vec<String>,
    },
}

/// Loads the file if present and applies the command line links on top.
fn load_config(path: Option<&str>, links: &[String], no_rlb: bool) -> Result<(AlbConfig, Vec<String>), anyhow::Error> {
    let mut cfg = match path {
        Some(path) if Path::new(path).exists() => ConfigFile::new(&path).load()?,
        Some(path) => {
            info!("[cfg] no config at {}, using defaults", path);
            AlbConfig::default()
        }
        None => AlbConfig::default(),
    };

    let mut down = vec![];
    for arg in links {
        let (name, opts) = options::parse_link_arg(arg)?;
        if opts.flags.contains(LinkOptFlags::PRIMARY) {
            cfg.links.iter_mut().for_each(|l| l.primary = false);
        }
        if opts.flags.contains(LinkOptFlags::DOWN) {
            down.push(name.clone());
        }
        opts.apply(cfg.link_mut(&name));
        info!("[cfg] link {}: {}", name, opts);
    }
    if no_rlb {
        cfg.rlb_enabled = false;
    }

    cfg.validate()?;
    Ok((cfg, down))
}

/// ARP reply of the bond when someone asks for its address.
fn bond_arp_reply(bond_mac: &MacAddr, bond_ip: Ipv4Addr, data: &[u8]) -> Option<Vec<u8>> {
    let Ok(EthFrame {
        kind: FrameKind::Arp(request),
        vlan_id,
        ..
    }) = frame::parse(data)
    else {
        return None;
    };
    if !request.is_request() || request.target_ip != bond_ip || request.sender_ip == bond_ip {
        return None;
    }

    let reply = ArpPacket {
        oper: arp::OP_REPLY,
        sender_mac: *bond_mac,
        sender_ip: bond_ip,
        target_mac: request.sender_mac,
        target_ip: request.sender_ip,
    };
    Some(frame::arp_frame(&request.sender_mac, bond_mac, vlan_id, &reply))
}

/// Feeds the ARP seen on one link to the bond. Runs on a blocking thread.
fn snoop_arp(alb: Arc<Alb>, id: LinkId, sock: PacketLink, bond_ip: Option<Ipv4Addr>, stop: Arc<AtomicBool>) {
    let mut buf = vec![0u8; 2048];
    while !stop.load(Ordering::Relaxed) {
        let len = match sock.recv(&mut buf) {
            Ok(Some(len)) => len,
            Ok(None) => continue,
            Err(e) => {
                warn!("[arp] {}", e);
                std::thread::sleep(ARP_RECV_TIMEOUT);
                continue;
            }
        };
        let data = &buf[..len];
        alb.on_arp(id, data);

        if let Some(mut reply) = bond_ip.and_then(|ip| bond_arp_reply(&alb.bond_mac(), ip, data)) {
            alb.xmit(&mut reply);
        }
    }
    log::debug!("[arp] stopped snooping on {}", sock.ifname());
}

/// Reports carrier and speed changes of the real devices.
fn watch_carrier(alb: Arc<Alb>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(CARRIER_POLL);
        loop {
            interval.tick().await;
            for slave in alb.link_list() {
                let up = packet::link_is_up(slave.name());
                if up != slave.flags().contains(LinkFlags::UP) {
                    info!("[link] carrier {} on {}", if up { "up" } else { "down" }, slave.name());
                    if let Err(e) = alb.link_change(slave.id(), up) {
                        warn!("[link] {}", e);
                    }
                }
                if let Some(speed) = packet::link_speed(slave.name()) {
                    if speed != slave.speed() {
                        slave.set_speed(speed);
                    }
                }
            }
        }
    })
}

async fn run(cfg: AlbConfig) -> Result<(), anyhow::Error> {
    if cfg.links.is_empty() {
        return Err(anyhow!("No links in config, use --link"));
    }

    let mut devs = vec![];
    for link in &cfg.links {
        let mac = match link.mac()? {
            Some(mac) => mac,
            None => packet::link_mac(&link.name)?,
        };
        let speed = link
            .speed
            .or_else(|| packet::link_speed(&link.name))
            .unwrap_or_else(|| {
                warn!("[link] unknown speed for {}, using {}", link.name, DEFAULT_SPEED);
                DEFAULT_SPEED
            });
        let sock = PacketLink::open(&link.name).context(format!("Can't open link {}", link.name))?;
        devs.push((link, mac, speed, Arc::new(sock)));
    }

    let bond_mac = resolve_bond_mac(&cfg, devs.first().map(|(_, mac, _, _)| mac))?;
    let alb = Arc::new(Alb::new(&cfg.name, bond_mac, cfg.timers(), cfg.rlb_enabled)?);
    for vid in &cfg.vlans {
        alb.add_vlan(*vid)?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut snoopers = vec![];
    let mut primary = None;
    for (link, mac, speed, sock) in devs {
        let id = alb.attach(&link.name, speed, mac, sock)?;
        if link.primary {
            primary = Some(id);
        }
        if !packet::link_is_up(&link.name) {
            alb.link_change(id, false)?;
        }
        if cfg.rlb_enabled || cfg.bond_ip.is_some() {
            let arp_sock = PacketLink::open_arp(&link.name, ARP_RECV_TIMEOUT)?;
            let (alb, stop, bond_ip) = (alb.clone(), stop.clone(), cfg.bond_ip);
            snoopers.push(tokio::task::spawn_blocking(move || {
                snoop_arp(alb, id, arp_sock, bond_ip, stop)
            }));
        }
    }
    if let Some(id) = primary {
        alb.set_active(id)?;
    }

    let mon = monitor::spawn(alb.clone());
    let carrier = watch_carrier(alb.clone());
    info::print_links(&alb);

    info!("Waiting for Ctrl-C...");
    signal::ctrl_c().await?;
    info!("Exiting...");

    mon.abort();
    carrier.abort();
    stop.store(true, Ordering::Relaxed);
    for snooper in snoopers {
        if let Err(e) = snooper.await {
            warn!("[arp] snooper failed, {}", e);
        }
    }

    // Give every device its own address back
    for slave in alb.link_list() {
        alb.detach(slave.id())?;
    }
    alb.stats().print_all();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();

    env_logger::init();

    match opt.command {
        Command::Config {
            config,
            save,
            link,
            no_rlb,
        } => {
            let (cfg, _) = load_config(Some(&config), &link, no_rlb)?;
            print!("{}", toml::to_string(&cfg)?);
            if let Some(path) = save {
                ConfigFile::new(&path).save(&cfg)?;
            }
        }
        Command::Simulate {
            config,
            link,
            flows,
            seconds,
            link_down,
            no_rlb,
        } => {
            let (cfg, down) = load_config(config.as_deref(), &link, no_rlb)?;
            let link_down = link_down
                .iter()
                .map(|arg| options::parse_link_event(arg))
                .collect::<Result<Vec<_>, _>>()?;
            let opts = SimOptions {
                flows,
                seconds,
                down,
                link_down,
            };
            sim::run(&cfg, opts).await?;
        }
        Command::Run { config, link } => {
            let (cfg, _) = load_config(Some(&config), &link, false)?;
            run(cfg).await?;
        }
    }

    Ok(())
}
