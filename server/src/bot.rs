//! Top-level driver: owns the network manager and every hosted game and
//! ticks them from a single task.

use crate::config::{BotConfig, LobbyConfig};
use crate::error::NetResult;
use crate::game::{Game, GameState};
use crate::health_check::{CommandContext, LogCommandContext};
use crate::net::Net;
use log::{debug, info, warn};
use std::time::Instant;
use tokio::time::{interval, MissedTickBehavior};

/// First host counter handed out.
const FIRST_HOST_COUNTER: u32 = 1;

#[derive(Debug)]
pub struct Bot {
    config: BotConfig,
    net: Net,
    games: Vec<Game>,
    next_host_counter: u32,
    started: Instant,
}

impl Bot {
    /// Binds the discovery socket and opens every configured lobby. Must run
    /// inside a tokio runtime.
    pub fn new(config: BotConfig) -> NetResult<Self> {
        config.validate()?;
        let now = Instant::now();
        let net = Net::new(&config.net)?;
        let mut bot = Self {
            config,
            net,
            games: Vec::new(),
            next_host_counter: FIRST_HOST_COUNTER,
            started: now,
        };
        bot.net.query_ip_addresses(now);

        for lobby in bot.config.lobbies.clone() {
            bot.create_lobby(lobby)?;
        }
        if bot.config.health_check_on_start {
            if let Some(host_counter) = bot.games.first().map(Game::host_counter) {
                bot.query_health_check(host_counter, Box::new(LogCommandContext::new("HEALTH")));
            }
        }
        Ok(bot)
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn net(&self) -> &Net {
        &self.net
    }

    pub fn games(&self) -> &[Game] {
        &self.games
    }

    pub fn game(&self, host_counter: u32) -> Option<&Game> {
        self.games.iter().find(|g| g.host_counter() == host_counter)
    }

    /// Opens a lobby on the next host port. Returns its host counter.
    pub fn create_lobby(&mut self, lobby: LobbyConfig) -> NetResult<u32> {
        let port = self.net.next_host_port();
        let port = self.net.get_or_create_tcp_server(port)?;
        let host_counter = self.next_host_counter;
        self.next_host_counter += 1;
        info!(
            "[GAME: {}] created on port {} (host counter {})",
            lobby.name, port, host_counter
        );
        self.games.push(Game::new(
            host_counter,
            port,
            lobby,
            self.config.game.clone(),
            Instant::now(),
        ));
        Ok(host_counter)
    }

    /// Probes the game's reachability; the report goes to `context`.
    pub fn query_health_check(
        &mut self,
        host_counter: u32,
        context: Box<dyn CommandContext>,
    ) -> bool {
        let Some(game) = self.games.iter().find(|g| g.host_counter() == host_counter) else {
            warn!("no game with host counter {} to check", host_counter);
            return false;
        };
        self.net
            .query_health_check(game, &self.config.realms, context, Instant::now())
    }

    /// One reactor tick.
    pub fn update(&mut self, now: Instant) {
        self.net.update(&self.config, &mut self.games, now);
        for game in &mut self.games {
            game.update(&mut self.net, now);
        }

        let net = &mut self.net;
        self.games.retain_mut(|game| {
            if game.state() != GameState::Exiting {
                return true;
            }
            info!("[GAME: {}] finished", game.name());
            game.close(net, now);
            false
        });
    }

    /// Hands every socket back for a last flush.
    pub fn shutdown(&mut self) {
        let now = Instant::now();
        for game in &mut self.games {
            game.close(&mut self.net, now);
        }
        self.games.clear();
        self.net.update(&self.config, &mut self.games, now);
        info!("shut down after {:?}", self.started.elapsed());
    }

    /// Ticks until Ctrl-C.
    pub async fn run(&mut self) -> NetResult<()> {
        let mut ticker = interval(self.config.net.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        info!(
            "running with {} lobbies, tick {:?}",
            self.games.len(),
            self.config.net.tick()
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.update(Instant::now());
                    if self.net.socket_count() > 1 + self.games.len() {
                        debug!("{} sockets polled", self.net.socket_count());
                    }
                }
                result = &mut shutdown => {
                    if let Err(e) = result {
                        warn!("ctrl-c handler failed: {}", e);
                    }
                    info!("shutting down");
                    break;
                }
            }
        }
        self.shutdown();
        Ok(())
    }
}
