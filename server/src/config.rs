//! Resolved configuration consumed by the network core.
//!
//! Loaded once from a TOML file; every field has a default so an empty or
//! missing file yields a working LAN host.

use crate::error::{NetError, NetResult};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// How the bot learns its own public address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IpAlgorithm {
    #[default]
    None,
    /// `value` holds the address itself.
    Manual,
    /// `value` holds an `http://` echo endpoint.
    Api,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default)]
pub struct PublicIpConfig {
    pub algorithm: IpAlgorithm,
    pub value: String,
}

/// Which RTT sample feeds the ping equalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RttMode {
    #[default]
    Average,
    Latest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub bind_address: Ipv4Addr,
    pub bind_address6: Ipv6Addr,
    pub enable_ipv6: bool,
    /// Inclusive range handed out to new game listeners. `0` asks the OS.
    pub min_host_port: u16,
    pub max_host_port: u16,
    /// LAN discovery port. `0` binds an ephemeral port.
    pub udp_port: u16,
    pub udp_server_enabled: bool,
    pub udp_broadcast_enabled: bool,
    pub udp_broadcast_target: Ipv4Addr,
    pub udp_dont_route: bool,
    pub udp_tunnel_enabled: bool,
    pub vlan_enabled: bool,
    pub gproxy_basic_enabled: bool,
    pub gproxy_extended_enabled: bool,
    pub udp_forward_enabled: bool,
    pub udp_forward_address: Option<SocketAddr>,
    pub udp_block_list: Vec<IpAddr>,
    pub async_observers_enabled: bool,
    /// Frames an observer may fall behind before it is dropped.
    pub observer_max_backlog: usize,
    pub public_ipv4: PublicIpConfig,
    pub public_ipv6: PublicIpConfig,
    pub rtt_mode: RttMode,
    pub anonymous_timeout_ms: u64,
    pub seeker_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub reconnect_wait_ms: u64,
    pub kicked_drain_ms: u64,
    pub tick_ms: u64,
    pub log_socket_errors: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_address: Ipv4Addr::UNSPECIFIED,
            bind_address6: Ipv6Addr::UNSPECIFIED,
            enable_ipv6: false,
            min_host_port: 6113,
            max_host_port: 6119,
            udp_port: shared::LAN_PORT,
            udp_server_enabled: true,
            udp_broadcast_enabled: true,
            udp_broadcast_target: Ipv4Addr::BROADCAST,
            udp_dont_route: false,
            udp_tunnel_enabled: true,
            vlan_enabled: true,
            gproxy_basic_enabled: true,
            gproxy_extended_enabled: true,
            udp_forward_enabled: false,
            udp_forward_address: None,
            udp_block_list: Vec::new(),
            async_observers_enabled: false,
            observer_max_backlog: 1_000,
            public_ipv4: PublicIpConfig::default(),
            public_ipv6: PublicIpConfig::default(),
            rtt_mode: RttMode::Average,
            anonymous_timeout_ms: 10_000,
            seeker_timeout_ms: 60_000,
            probe_timeout_ms: 3_000,
            reconnect_wait_ms: 90_000,
            kicked_drain_ms: 5_000,
            tick_ms: 10,
            log_socket_errors: false,
        }
    }
}

impl NetConfig {
    pub fn validate(&self) -> NetResult<()> {
        if self.min_host_port > self.max_host_port {
            return Err(NetError::Config(format!(
                "host port range {}..={} is inverted",
                self.min_host_port, self.max_host_port
            )));
        }
        if self.tick_ms == 0 {
            return Err(NetError::Config("tick_ms must be positive".to_string()));
        }
        if self.udp_forward_enabled && self.udp_forward_address.is_none() {
            return Err(NetError::Config(
                "udp_forward_enabled requires udp_forward_address".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.udp_block_list.contains(&ip)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Milliseconds between action frames.
    pub latency_ms: u16,
    pub ping_equalizer_enabled: bool,
    pub equalizer_min_frames: u32,
    pub equalizer_max_frames: u32,
    pub lobby_ping_interval_ms: u64,
    pub game_ping_interval_ms: u64,
    pub broadcast_interval_ms: u64,
    /// Case-insensitive substrings that may not appear in player names.
    pub censored_names: Vec<String>,
    pub war3_version: u32,
    pub tft: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            latency_ms: 100,
            ping_equalizer_enabled: false,
            equalizer_min_frames: 0,
            equalizer_max_frames: 10,
            lobby_ping_interval_ms: 5_000,
            game_ping_interval_ms: 1_000,
            broadcast_interval_ms: 3_000,
            censored_names: Vec::new(),
            war3_version: 26,
            tft: true,
        }
    }
}

/// A realm the bot is logged into, reduced to what the health check needs.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealmConfig {
    pub name: String,
    /// Address the realm reports for the bot.
    pub public_ip: Option<IpAddr>,
    /// Host port the realm advertises to its users.
    pub public_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LobbyConfig {
    pub name: String,
    pub slots: u8,
    /// Start loading once this many players are in the lobby.
    pub auto_start_players: Option<u8>,
    pub is_mirror: bool,
    pub map_path: String,
    pub map_width: u16,
    pub map_height: u16,
    pub map_crc: u32,
    pub map_flags: u32,
    pub map_game_type: u32,
    pub host_name: String,
    /// Extra client versions accepted besides `GameConfig::war3_version`.
    pub extra_versions: Vec<u32>,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            name: "Aura lobby".to_string(),
            slots: 12,
            auto_start_players: None,
            is_mirror: false,
            map_path: "Maps\\FrozenThrone\\(12)EmeraldGardens.w3x".to_string(),
            map_width: 116,
            map_height: 116,
            map_crc: 0,
            map_flags: 0x0000_6002,
            map_game_type: 1,
            host_name: "Aura".to_string(),
            extra_versions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BotConfig {
    pub net: NetConfig,
    pub game: GameConfig,
    pub realms: Vec<RealmConfig>,
    pub lobbies: Vec<LobbyConfig>,
    /// Run a health check for every configured lobby after startup.
    pub health_check_on_start: bool,
}

impl BotConfig {
    pub fn from_toml_str(text: &str) -> NetResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` if given. A missing path means defaults.
    pub fn load(path: Option<&Path>) -> NetResult<Self> {
        match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> NetResult<()> {
        self.net.validate()?;
        if self.game.latency_ms == 0 {
            return Err(NetError::Config("latency_ms must be positive".to_string()));
        }
        if self.game.equalizer_min_frames > self.game.equalizer_max_frames {
            return Err(NetError::Config(
                "equalizer_min_frames exceeds equalizer_max_frames".to_string(),
            ));
        }
        for lobby in &self.lobbies {
            if lobby.slots == 0 || lobby.slots > 24 {
                return Err(NetError::Config(format!(
                    "lobby {:?} has {} slots",
                    lobby.name, lobby.slots
                )));
            }
        }
        Ok(())
    }
}
