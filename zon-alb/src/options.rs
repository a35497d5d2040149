use crate::{config::LinkConfig, helpers};
use anyhow::anyhow;
use bitflags::bitflags;
use std::{collections::BTreeMap, fmt};

pub const SPEED: &str = "speed";
pub const MAC: &str = "mac";
pub const PRIMARY: &str = "primary";
pub const DOWN: &str = "down";

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct LinkOptFlags: u32 {
        const PRIMARY = 1;
        /// Start with the carrier down, simulation only
        const DOWN = 2;
    }
}

#[derive(Clone, Default)]
pub struct Options {
    pub props: BTreeMap<String, String>,
    pub flags: LinkOptFlags,
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for opt in self.to_options() {
            write!(f, "{} ", opt)?
        }
        Ok(())
    }
}

impl Options {
    pub fn to_options(&self) -> Vec<String> {
        let mut opt = vec![];
        for flag in self.flags {
            let name = match flag {
                LinkOptFlags::PRIMARY => PRIMARY,
                LinkOptFlags::DOWN => DOWN,
                _ => continue,
            };
            opt.push(name.to_string());
        }
        for (k, v) in &self.props {
            opt.push(format!("{}={}", k, v));
        }
        opt
    }

    pub fn from_option_args(args: &Vec<String>) -> Self {
        let mut props = BTreeMap::new();
        let mut flags = LinkOptFlags::empty();

        for arg in args {
            let kv = arg.split_once('=');
            let (key, value) = match kv {
                None => {
                    match arg.as_str() {
                        PRIMARY => flags.insert(LinkOptFlags::PRIMARY),
                        DOWN => flags.insert(LinkOptFlags::DOWN),
                        _ => log::error!("Unknown flag '{}' ", arg),
                    }
                    continue;
                }
                Some(kv) => kv,
            };
            match key {
                SPEED => match value.parse::<u32>() {
                    Ok(speed) if speed > 0 => {
                        props.insert(key.to_string(), value.to_string());
                    }
                    _ => log::error!("Invalid speed '{}', see option '{}'", value, arg),
                },
                MAC => match helpers::parse_unicast_mac(value) {
                    Ok(_) => {
                        props.insert(key.to_string(), value.to_string());
                    }
                    Err(e) => log::error!("Invalid mac '{}', {}", value, e),
                },
                _ => log::error!("Unknown key '{}' in option '{}'", key, arg),
            };
        }
        Self { props, flags }
    }

    /// Copies the options over the link config.
    pub fn apply(&self, link: &mut LinkConfig) {
        if let Some(speed) = self.props.get(SPEED).and_then(|s| s.parse().ok()) {
            link.speed = Some(speed);
        }
        if let Some(mac) = self.props.get(MAC) {
            link.mac = Some(mac.clone());
        }
        if self.flags.contains(LinkOptFlags::PRIMARY) {
            link.primary = true;
        }
    }
}

/// Splits a `name:opt,opt` link argument.
pub fn parse_link_arg(arg: &str) -> Result<(String, Options), anyhow::Error> {
    let (name, opts) = arg.split_once(':').unwrap_or((arg, ""));
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("No link name in '{}'", arg));
    }
    let args = opts
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect::<Vec<_>>();
    Ok((name.to_string(), Options::from_option_args(&args)))
}

/// Splits a `name@second` event argument.
pub fn parse_link_event(arg: &str) -> Result<(String, u32), anyhow::Error> {
    let (name, at) = arg
        .split_once('@')
        .ok_or_else(|| anyhow!("Expected name@second, got '{}'", arg))?;
    let at = at
        .parse::<u32>()
        .map_err(|e| anyhow!("Invalid second in '{}', {}", arg, e))?;
    Ok((name.to_string(), at))
}
