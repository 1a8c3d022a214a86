//! # Game Hosting Core
//!
//! This library is the network core of a Warcraft III hosting bot. It accepts
//! players over TCP, answers LAN discovery over UDP and TCP tunnels, lets
//! GProxy clients resume a game after losing their connection, and drives
//! the action clock of every running game.
//!
//! ## Core Responsibilities
//!
//! ### Connection Classification
//! Every accepted stream starts anonymous. The first packet decides what it
//! becomes:
//! - A lobby player (W3GS `REQJOIN`)
//! - An observer of a running game (`REQJOIN` while async observers are on)
//! - A returning GProxy user (GPS `RECONNECT`)
//! - A discovery tunnel (GPS `UDPSYN`) or a VLAN browser (any VLAN packet)
//!
//! The socket itself is moved from wrapper to wrapper and is never reopened.
//!
//! ### Discovery
//! Lobbies advertise themselves with `CREATEGAME`, `REFRESHGAME` and
//! periodic `GAMEINFO` on the LAN broadcast address and to every tunnel and
//! VLAN client. `SEARCHGAME` requests are answered directly.
//!
//! ### Action Scheduling
//! Once every player has loaded, a game closes one action frame per latency
//! interval. The ping equalizer holds fast players a few frames behind so
//! every client sees actions at roughly the same wall-clock time.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Reactor
//! One task owns the [`bot::Bot`] and ticks it on a fixed interval. Each tick
//! makes one non-blocking attempt on every socket. Nothing is shared across
//! tasks and nothing is locked; the only spawned work is DNS resolution,
//! whose answer is collected on a later tick.
//!
//! ### Ownership Hand-offs
//! Tables that give sockets to each other are taken out while they are
//! walked. Sockets handed back during a pass (kicked players, replaced
//! GProxy transports) wait in a staging queue that is merged afterwards.
//!
//! ## Module Organization
//!
//! ### Socket Layer (`socket`, `address`)
//! Buffered non-blocking TCP streams, listeners, outbound connects and the
//! discovery UDP socket, plus IPv4/IPv6 address translation.
//!
//! ### Connection Roles (`connection`, `game_seeker`, `async_observer`)
//! The anonymous connection state machine and the roles it promotes into.
//!
//! ### Network Manager (`net`)
//! Listeners, UDP routing, staging queues, the health check and public-IP
//! discovery sub-machines, and the DNS and self-IP caches.
//!
//! ### Games (`game`, `game_user`, `action_queue`)
//! Lobby seating, LAN advertising, per-user GProxy buffers and RTT samples,
//! and the action frame queue with its equalizer cursors.
//!
//! ### Probes (`health_check`, `ip_lookup`)
//! Outbound join probes that test a game's reachability, and the HTTP lookup
//! of the bot's own public address.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::bot::Bot;
//! use server::config::{BotConfig, LobbyConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = BotConfig::default();
//!     config.lobbies.push(LobbyConfig {
//!         name: "dota 6.83".to_string(),
//!         slots: 10,
//!         ..LobbyConfig::default()
//!     });
//!
//!     // Binds UDP 6112 and one host port per lobby
//!     let mut bot = Bot::new(config)?;
//!
//!     // Ticks every 10ms until Ctrl-C
//!     bot.run().await?;
//!     Ok(())
//! }
//! ```

pub mod action_queue;
pub mod address;
pub mod async_observer;
pub mod bot;
pub mod config;
pub mod connection;
pub mod error;
pub mod game;
pub mod game_seeker;
pub mod game_user;
pub mod health_check;
pub mod ip_lookup;
pub mod net;
pub mod socket;
