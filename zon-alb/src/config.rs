use crate::{alb::AlbTimers, helpers::parse_unicast_mac};
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::{
    fs::OpenOptions,
    io::{Read, Write},
    net::Ipv4Addr,
    path::Path,
};
use zon_alb_common::{
    MacAddr, ALB_LP_INTERVAL, ALB_TIMER_TICKS_PER_SEC, RLB_ARP_BURST_SIZE, RLB_PROMISC_TIMEOUT,
    RLB_UPDATE_DELAY, RLB_UPDATE_RETRY, TLB_REBALANCE_INTERVAL,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub name: String,
    /// Mbps, read from the device when missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u32>,
    /// Permanent address, read from the device when missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default)]
    pub primary: bool,
}

impl LinkConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            speed: None,
            mac: None,
            primary: false,
        }
    }

    pub fn mac(&self) -> Result<Option<MacAddr>, anyhow::Error> {
        self.mac
            .as_ref()
            .map(parse_unicast_mac)
            .transpose()
            .context(format!("Invalid mac for link {}", self.name))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AlbConfig {
    pub name: String,
    /// Disabled means transmit balancing only
    pub rlb_enabled: bool,
    /// The first link's address when missing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bond_mac: Option<String>,
    /// Address the bond answers ARP requests for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bond_ip: Option<Ipv4Addr>,
    pub ticks_per_sec: u32,
    pub tlb_rebalance_interval: u32,
    pub lp_interval: u32,
    pub rlb_update_delay: u32,
    pub rlb_arp_burst: u32,
    pub rlb_update_retry: u32,
    pub rlb_promisc_timeout: u32,
    pub vlans: Vec<u16>,
    pub links: Vec<LinkConfig>,
}

impl Default for AlbConfig {
    fn default() -> Self {
        Self {
            name: String::from("bond0"),
            rlb_enabled: true,
            bond_mac: None,
            bond_ip: None,
            ticks_per_sec: ALB_TIMER_TICKS_PER_SEC,
            tlb_rebalance_interval: TLB_REBALANCE_INTERVAL,
            lp_interval: ALB_LP_INTERVAL,
            rlb_update_delay: RLB_UPDATE_DELAY,
            rlb_arp_burst: RLB_ARP_BURST_SIZE,
            rlb_update_retry: RLB_UPDATE_RETRY,
            rlb_promisc_timeout: RLB_PROMISC_TIMEOUT,
            vlans: vec![],
            links: vec![],
        }
    }
}

impl AlbConfig {
    pub fn timers(&self) -> AlbTimers {
        AlbTimers {
            ticks_per_sec: self.ticks_per_sec,
            tlb_rebalance_interval: self.tlb_rebalance_interval,
            lp_interval: self.lp_interval,
            rlb_update_delay: self.rlb_update_delay,
            rlb_arp_burst: self.rlb_arp_burst,
            rlb_update_retry: self.rlb_update_retry,
            rlb_promisc_timeout: self.rlb_promisc_timeout,
        }
    }

    pub fn bond_mac(&self) -> Result<Option<MacAddr>, anyhow::Error> {
        self.bond_mac
            .as_ref()
            .map(parse_unicast_mac)
            .transpose()
            .context("Invalid bond mac")
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.ticks_per_sec == 0 {
            return Err(anyhow!("ticks_per_sec can't be 0"));
        }
        if self.tlb_rebalance_interval == 0 {
            return Err(anyhow!("tlb_rebalance_interval can't be 0"));
        }
        if self.lp_interval == 0 {
            return Err(anyhow!("lp_interval can't be 0"));
        }
        self.bond_mac()?;

        for vid in &self.vlans {
            if *vid == 0 || *vid > 4094 {
                return Err(anyhow!("Invalid vlan id {}", vid));
            }
        }

        let mut names = vec![];
        for link in &self.links {
            if link.name.is_empty() {
                return Err(anyhow!("Link with no name"));
            }
            if names.contains(&link.name.as_str()) {
                return Err(anyhow!("Link {} is listed twice", link.name));
            }
            names.push(link.name.as_str());
            link.mac()?;
        }
        if self.links.iter().filter(|l| l.primary).count() > 1 {
            return Err(anyhow!("Only one link can be primary"));
        }

        Ok(())
    }

    pub fn link_mut(&mut self, name: &str) -> &mut LinkConfig {
        let index = match self.links.iter().position(|l| l.name == name) {
            Some(index) => index,
            None => {
                self.links.push(LinkConfig::new(name));
                self.links.len() - 1
            }
        };
        &mut self.links[index]
    }

    pub fn description(&self) -> String {
        let mode = if self.rlb_enabled { "alb" } else { "tlb" };
        format!(
            "{} in {} mode with {} links and {} vlans, {} ticks/s",
            self.name,
            mode,
            self.links.len(),
            self.vlans.len(),
            self.ticks_per_sec
        )
    }
}

pub struct ConfigFile {
    path: String,
}

impl ConfigFile {
    pub fn new<S: AsRef<str>>(filename: &S) -> Self {
        Self {
            path: String::from(filename.as_ref()),
        }
    }

    pub fn load(&self) -> Result<AlbConfig, anyhow::Error> {
        if !Path::new(&self.path).try_exists()? {
            return Err(anyhow!("Config file does not exits, {}", self.path));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .context(format!("Can't read config file: {}", self.path))?;
        let mut contents = String::new();
        let size = file.read_to_string(&mut contents)?;

        log::info!("[cfg] read {} bytes from: {}", size, self.path);

        let cfg: AlbConfig = toml::from_str(&contents)
            .context(format!("Can't parse config file: {}", self.path))?;
        cfg.validate()?;

        log::info!("[cfg] found in config: {}", cfg.description());
        Ok(cfg)
    }

    pub fn save(&self, cfg: &AlbConfig) -> Result<(), anyhow::Error> {
        if Path::new(&self.path).try_exists()? {
            log::info!("[cfg] config file will be overridden, {}", self.path);
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .context(format!("Can't write to config file: {}", self.path))?;

        log::info!("[cfg] saving config: {}", cfg.description());

        let contents = toml::to_string(cfg)?;

        file.write_all(contents.as_bytes())?;

        log::info!(
            "[cfg] wrote {} bytes to config file: {}",
            contents.len(),
            self.path
        );

        Ok(())
    }
}

/// Address of the bond: the configured one or the first link's.
pub fn resolve_bond_mac(cfg: &AlbConfig, first_link: Option<&MacAddr>) -> Result<MacAddr, anyhow::Error> {
    match (cfg.bond_mac()?, first_link) {
        (Some(mac), _) => Ok(mac),
        (None, Some(mac)) => Ok(*mac),
        (None, None) => Err(anyhow!("No mac for {}, set bond_mac or add a link", cfg.name)),
    }
}
