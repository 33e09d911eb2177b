//! Load daemon config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/peerlink/config.toml or
/// /etc/peerlink/config.toml.
/// Env overrides: PEERLINK_NAME, PEERLINK_DISCOVERY_PORT,
/// PEERLINK_STREAM_PORT, PEERLINK_DATAGRAM_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Display name announced on the LAN (default: hostname).
    #[serde(default = "default_name")]
    pub name: String,
    /// Discovery UDP port (default 7353).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Stream listener TCP port (default 7354).
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    /// Unreliable datagram UDP port (default 7355).
    #[serde(default = "default_datagram_port")]
    pub datagram_port: u16,
    /// Engine service interval in milliseconds (default 50).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Connect to every discovered peer automatically (default true).
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,
}

fn default_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("peerlink"))
}
fn default_discovery_port() -> u16 {
    peerlink_core::config::DEFAULT_DISCOVERY_PORT
}
fn default_stream_port() -> u16 {
    peerlink_core::config::DEFAULT_STREAM_PORT
}
fn default_datagram_port() -> u16 {
    peerlink_core::config::DEFAULT_DATAGRAM_PORT
}
fn default_tick_ms() -> u64 {
    50
}
fn default_auto_connect() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            discovery_port: default_discovery_port(),
            stream_port: default_stream_port(),
            datagram_port: default_datagram_port(),
            tick_ms: default_tick_ms(),
            auto_connect: default_auto_connect(),
        }
    }
}

impl Config {
    pub fn engine_config(&self) -> peerlink_core::Config {
        peerlink_core::Config {
            local_name: self.name.clone(),
            discovery_port: self.discovery_port,
            stream_port: self.stream_port,
            datagram_port: self.datagram_port,
            ..peerlink_core::Config::default()
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("PEERLINK_NAME") {
        if !s.is_empty() {
            c.name = s;
        }
    }
    if let Ok(s) = std::env::var("PEERLINK_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("PEERLINK_STREAM_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.stream_port = p;
        }
    }
    if let Ok(s) = std::env::var("PEERLINK_DATAGRAM_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.datagram_port = p;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
