//! The network manager: every listener, the LAN discovery socket and the
//! tables of connections that do not belong to a game yet.
//!
//! `Net` is ticked once per reactor pass. Tables that hand sockets to each
//! other are taken out of `self` while they are iterated, and anything
//! queued for them in the meantime is merged back afterwards, so no table is
//! ever mutated while it is being walked.

use crate::address::{self, Family};
use crate::config::{BotConfig, IpAlgorithm, NetConfig, PublicIpConfig, RealmConfig};
use crate::connection::{Connection, ConnectionContext, Role, UpdateStatus};
use crate::error::{NetError, NetResult};
use crate::game::Game;
use crate::game_seeker::GameSeeker;
use crate::health_check::{probe_targets, CommandContext, HealthCheck};
use crate::ip_lookup::{DnsCache, IpAddressLookup, LookupProgress};
use crate::socket::{StreamIoSocket, TcpServer, UdpPkt, UdpSocket};
use log::{debug, info, trace, warn};
use shared::relay;
use shared::w3gs::{self, W3GS_HEADER};
use shared::LAN_PORT;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

/// Pause before the single retry of a contested UDP bind.
pub const BIND_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Shortest datagram that can be a SEARCHGAME.
pub const SEARCHGAME_MIN_LEN: usize = 16;
/// Datagrams drained from the discovery socket per tick.
const UDP_DRAIN_LIMIT: usize = 64;

type SelfIpKey = (Family, IpAlgorithm, String);

fn self_ip_key(family: Family, config: &PublicIpConfig) -> SelfIpKey {
    (family, config.algorithm, config.value.clone())
}

fn bind_udp(config: &NetConfig) -> NetResult<UdpSocket> {
    let port = if config.udp_server_enabled {
        config.udp_port
    } else {
        0
    };
    let addr = SocketAddr::new(IpAddr::V4(config.bind_address), port);
    let broadcast = config.udp_broadcast_enabled;
    let socket = match UdpSocket::bind(addr, broadcast) {
        Ok(socket) => socket,
        Err(e) if config.udp_server_enabled => {
            warn!(
                "[UDP] cannot bind {} ({}), retrying in {:?}",
                addr, e, BIND_RETRY_DELAY
            );
            std::thread::sleep(BIND_RETRY_DELAY);
            UdpSocket::bind(addr, broadcast).map_err(|source| NetError::Bind { addr, source })?
        }
        Err(source) => return Err(NetError::Bind { addr, source }),
    };
    if config.udp_dont_route {
        if let Err(e) = socket.set_dont_route(true) {
            warn!("[UDP] SO_DONTROUTE: {}", e);
        }
    }
    Ok(socket)
}

/// Owns every socket that is not inside a game.
#[derive(Debug)]
pub struct Net {
    config: NetConfig,
    /// Listening discovery socket, or a deaf one that only sends.
    udp: UdpSocket,
    game_servers: HashMap<u16, TcpServer>,
    incoming: HashMap<u16, Vec<Connection>>,
    downgraded: Vec<Connection>,
    game_seekers: Vec<GameSeeker>,
    last_host_port: u16,
    health_check: Option<HealthCheck>,
    ip_lookups: Vec<IpAddressLookup>,
    dns: DnsCache,
    self_ip: HashMap<SelfIpKey, IpAddr>,
}

impl Net {
    /// Binds the discovery socket. Must run inside a tokio runtime.
    pub fn new(config: &NetConfig) -> NetResult<Self> {
        config.validate()?;
        let udp = bind_udp(config)?;
        if config.udp_server_enabled {
            info!("[UDP] listening for LAN discovery on port {}", udp.port());
        } else {
            info!("[UDP] discovery server disabled, sending from port {}", udp.port());
        }
        Ok(Self {
            config: config.clone(),
            udp,
            game_servers: HashMap::new(),
            incoming: HashMap::new(),
            downgraded: Vec::new(),
            game_seekers: Vec::new(),
            last_host_port: 0,
            health_check: None,
            ip_lookups: Vec::new(),
            dns: DnsCache::new(),
            self_ip: HashMap::new(),
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn udp_port(&self) -> u16 {
        self.udp.port()
    }

    /// Classified UDP-tunnel and VLAN clients.
    pub fn game_seekers(&self) -> impl Iterator<Item = &GameSeeker> {
        self.game_seekers.iter()
    }

    /// Connections not yet classified, plus kicked ones draining.
    pub fn incoming_connections(&self) -> impl Iterator<Item = &Connection> {
        self.incoming.values().flatten()
    }

    /// Whether a reachability check is still running.
    pub fn has_health_check(&self) -> bool {
        self.health_check.is_some()
    }

    /// Sockets the next tick will poll. Nothing to do when this is zero.
    pub fn socket_count(&self) -> usize {
        1 + self.game_servers.len()
            + self.incoming.values().map(Vec::len).sum::<usize>()
            + self.downgraded.len()
            + self.game_seekers.len()
            + self.health_check.as_ref().map_or(0, HealthCheck::probe_count)
            + self.ip_lookups.len()
    }

    fn bind_ip(&self) -> IpAddr {
        if self.config.enable_ipv6 {
            IpAddr::V6(self.config.bind_address6)
        } else {
            IpAddr::V4(self.config.bind_address)
        }
    }

    /// Round-robins through the configured host port range. `0` when the
    /// range asks the OS to pick.
    pub fn next_host_port(&mut self) -> u16 {
        let (min, max) = (self.config.min_host_port, self.config.max_host_port);
        if max == 0 {
            return 0;
        }
        let next = if self.last_host_port < min || self.last_host_port >= max {
            min
        } else {
            self.last_host_port + 1
        };
        self.last_host_port = next;
        next
    }

    /// Returns the port of the listener for `port`, binding it on first use.
    pub fn get_or_create_tcp_server(&mut self, port: u16) -> NetResult<u16> {
        if port != 0 && self.game_servers.contains_key(&port) {
            return Ok(port);
        }
        let bind = self.bind_ip();
        let server = TcpServer::listen(bind, port).map_err(|source| NetError::Bind {
            addr: SocketAddr::new(bind, port),
            source,
        })?;
        let port = server.port();
        info!("[TCP] listening for games on port {}", port);
        self.game_servers.insert(port, server);
        Ok(port)
    }

    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.game_servers.keys().copied()
    }

    /// Takes over a classified discovery socket.
    pub fn register_game_seeker(&mut self, port: u16, socket: StreamIoSocket, role: Role) {
        let timeout = Duration::from_millis(self.config.seeker_timeout_ms);
        self.game_seekers
            .push(GameSeeker::new(port, socket, role, timeout));
    }

    /// Takes back a socket whose user is gone so queued bytes can drain.
    /// Merged into the incoming table after the current pass.
    pub fn on_user_kicked(&mut self, port: u16, socket: StreamIoSocket, now: Instant) {
        let drain = Duration::from_millis(self.config.kicked_drain_ms);
        self.downgraded
            .push(Connection::kicked(port, socket, now, drain));
    }

    /// Moves sockets handed back during this pass into the incoming table.
    pub fn merge_downgraded(&mut self) {
        for connection in self.downgraded.drain(..) {
            self.incoming
                .entry(connection.port())
                .or_default()
                .push(connection);
        }
    }

    /// Routes one discovery datagram. With `tunnel` set the datagram came
    /// over TCP and replies go back on that stream instead.
    pub fn handle_udp(
        &mut self,
        pkt: &UdpPkt,
        games: &[Game],
        mut tunnel: Option<&mut StreamIoSocket>,
    ) {
        let sender = address::normalize(pkt.sender);
        if self.config.is_blocked(sender.ip()) {
            trace!("[UDP] ignoring blocked {}", sender);
            return;
        }
        // The relay sees every datagram, blocked senders excepted.
        if self.config.udp_forward_enabled {
            if let Some(relay_addr) = self.config.udp_forward_address {
                self.udp.send_to(relay_addr, &relay::wrap(sender, &pkt.data));
            }
        }

        let data = &pkt.data;
        if data.len() < SEARCHGAME_MIN_LEN
            || data[0] != W3GS_HEADER
            || data[1] != w3gs::opcode::SEARCHGAME
        {
            return;
        }
        let Some((product, version)) = w3gs::receive_searchgame(data) else {
            return;
        };
        let now = Instant::now();
        for game in games
            .iter()
            .filter(|g| g.is_joinable() && g.supports_version(product, version))
        {
            let reply = w3gs::send_gameinfo(&game.game_info(now));
            match tunnel.as_mut() {
                Some(socket) => socket.put_bytes(&reply),
                None => {
                    debug!("[UDP] {} searching, answering for {}", sender, game.name());
                    self.udp.send_to(sender, &reply);
                    // Clients behind a NAT search from a random port but
                    // listen on the LAN one.
                    if sender.port() != LAN_PORT {
                        self.udp
                            .send_to(SocketAddr::new(sender.ip(), LAN_PORT), &reply);
                    }
                }
            }
        }
    }

    /// Fans one advertisement out to the LAN and every discovery seeker.
    pub fn send_game_discovery(&mut self, w3gs_bytes: &[u8], vlan_bytes: &[u8]) {
        if self.config.udp_broadcast_enabled {
            self.udp
                .broadcast(self.config.udp_broadcast_target, LAN_PORT, w3gs_bytes);
        }
        for seeker in &mut self.game_seekers {
            match seeker.role() {
                Role::UdpTunnel => seeker.send(w3gs_bytes),
                Role::Vlan => seeker.send(vlan_bytes),
                _ => {}
            }
        }
    }

    /// Our public IPv4 per the configured algorithm, if known.
    pub fn public_ipv4(&self) -> Option<Ipv4Addr> {
        match self.public_ip(Family::V4)? {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(ip) => address::mapped_ipv4(&ip),
        }
    }

    /// IPv4-only values never count as an IPv6 address.
    pub fn public_ipv6(&self) -> Option<Ipv6Addr> {
        match self.public_ip(Family::V6)? {
            IpAddr::V6(ip) => Some(ip),
            IpAddr::V4(_) => None,
        }
    }

    fn public_ip(&self, family: Family) -> Option<IpAddr> {
        let config = self.public_ip_config(family);
        match config.algorithm {
            IpAlgorithm::None => None,
            IpAlgorithm::Manual => address::parse_ip(&config.value),
            IpAlgorithm::Api => self.self_ip.get(&self_ip_key(family, config)).copied(),
        }
    }

    fn public_ip_config(&self, family: Family) -> &PublicIpConfig {
        match family {
            Family::V4 => &self.config.public_ipv4,
            Family::V6 => &self.config.public_ipv6,
        }
    }

    /// Starts an HTTP lookup of our public address for every family whose
    /// algorithm is `api` and whose answer is not cached yet.
    pub fn query_ip_addresses(&mut self, now: Instant) {
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        for family in [Family::V4, Family::V6] {
            if family == Family::V6 && !self.config.enable_ipv6 {
                continue;
            }
            let config = self.public_ip_config(family).clone();
            if config.algorithm != IpAlgorithm::Api
                || self.self_ip.contains_key(&self_ip_key(family, &config))
                || self.ip_lookups.iter().any(|l| l.family() == family)
            {
                continue;
            }
            match IpAddressLookup::new(family, &config.value, now + timeout) {
                Some(lookup) => {
                    info!("[IP] querying {} for our public {:?} address", config.value, family);
                    self.ip_lookups.push(lookup);
                }
                None => warn!("[IP] cannot use {:?} as an IP echo endpoint", config.value),
            }
        }
    }

    /// Polls the running lookups and returns the families whose public
    /// address changed.
    fn update_ip_lookups(&mut self, now: Instant) -> Vec<Family> {
        let mut lookups = std::mem::take(&mut self.ip_lookups);
        let mut found = Vec::new();
        lookups.retain_mut(|lookup| match lookup.update(&mut self.dns, now) {
            LookupProgress::Pending => true,
            LookupProgress::Found(ip) => {
                found.push((lookup.family(), lookup.endpoint().to_string(), ip));
                false
            }
            LookupProgress::Failed => {
                warn!("[IP] lookup against {} failed", lookup.endpoint());
                false
            }
        });
        self.ip_lookups = lookups;

        let mut resolved = Vec::new();
        for (family, endpoint, ip) in found {
            let key = self_ip_key(family, self.public_ip_config(family));
            // The endpoint may have been reconfigured while the lookup ran.
            if key.2 != endpoint {
                continue;
            }
            info!("[IP] public {:?} address is {}", family, ip);
            if self.self_ip.insert(key, ip) != Some(ip) {
                resolved.push(family);
            }
        }
        resolved
    }

    /// Forgets every cached name; the next lookups resolve afresh.
    pub fn flush_dns_cache(&mut self) {
        self.dns.flush();
    }

    pub fn flush_self_ip_cache(&mut self) {
        self.self_ip.clear();
    }

    /// Starts a reachability check of `game`. Returns `false` while another
    /// check is still running.
    pub fn query_health_check(
        &mut self,
        game: &Game,
        realms: &[RealmConfig],
        context: Box<dyn CommandContext>,
        now: Instant,
    ) -> bool {
        if self.health_check.is_some() {
            return false;
        }
        let targets = probe_targets(
            game.host_port(),
            self.config.enable_ipv6,
            realms,
            self.public_ipv4(),
            self.public_ipv6(),
        );
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        info!(
            "[GAME: {}] health check with {} probes",
            game.name(),
            targets.len()
        );
        self.health_check = Some(HealthCheck::new(
            game.name().to_string(),
            game.host_counter(),
            targets,
            context,
            now,
            timeout,
        ));
        true
    }

    fn update_health_check(&mut self, now: Instant) {
        let running = match self.health_check.as_mut() {
            Some(check) => check.update(now),
            None => return,
        };
        if !running {
            if let Some(check) = self.health_check.take() {
                check.finish();
            }
        }
    }

    fn accept_connections(&mut self, now: Instant) {
        let timeout = Duration::from_millis(self.config.anonymous_timeout_ms);
        for (&port, server) in &self.game_servers {
            while let Some(mut socket) = server.accept() {
                socket.set_log_errors(self.config.log_socket_errors);
                debug!("[CONN] {} connected on port {}", socket.remote_addr(), port);
                self.incoming
                    .entry(port)
                    .or_default()
                    .push(Connection::new(port, socket, now, timeout));
            }
        }
    }

    fn drain_udp(&mut self, games: &[Game]) {
        if !self.config.udp_server_enabled {
            return;
        }
        for _ in 0..UDP_DRAIN_LIMIT {
            let Some(pkt) = self.udp.recv() else {
                break;
            };
            self.handle_udp(&pkt, games, None);
        }
    }

    fn update_incoming(&mut self, config: &BotConfig, games: &mut Vec<Game>, now: Instant) {
        let mut incoming = std::mem::take(&mut self.incoming);
        {
            let mut ctx = ConnectionContext {
                config,
                net: self,
                games,
                now,
            };
            for connections in incoming.values_mut() {
                connections.retain_mut(|connection| match connection.update(&mut ctx) {
                    UpdateStatus::Ok => true,
                    status => {
                        trace!("[{}] left the incoming table: {:?}", connection.role().label(), status);
                        false
                    }
                });
            }
        }
        // Connections queued while the table was taken out.
        for (port, mut added) in std::mem::take(&mut self.incoming) {
            incoming.entry(port).or_default().append(&mut added);
        }
        incoming.retain(|_, connections| !connections.is_empty());
        self.incoming = incoming;
    }

    fn update_seekers(&mut self, config: &BotConfig, games: &mut Vec<Game>, now: Instant) {
        let mut seekers = std::mem::take(&mut self.game_seekers);
        {
            let mut ctx = ConnectionContext {
                config,
                net: self,
                games,
                now,
            };
            seekers.retain_mut(|seeker| seeker.update(&mut ctx) == UpdateStatus::Ok);
        }
        seekers.append(&mut self.game_seekers);
        self.game_seekers = seekers;
    }

    fn update_observers(&mut self, config: &BotConfig, games: &mut Vec<Game>, now: Instant) {
        for index in 0..games.len() {
            let mut observers = games[index].take_observers();
            if observers.is_empty() {
                continue;
            }
            {
                let mut ctx = ConnectionContext {
                    config,
                    net: self,
                    games,
                    now,
                };
                observers.retain_mut(|observer| observer.update(&mut ctx) == UpdateStatus::Ok);
            }
            games[index].restore_observers(observers);
        }
    }

    /// One reactor pass over everything `Net` owns.
    pub fn update(&mut self, config: &BotConfig, games: &mut Vec<Game>, now: Instant) {
        self.accept_connections(now);
        self.drain_udp(games);
        self.update_incoming(config, games, now);
        self.update_seekers(config, games, now);
        self.update_observers(config, games, now);
        self.merge_downgraded();
        self.update_health_check(now);
        for family in self.update_ip_lookups(now) {
            for game in games.iter_mut() {
                game.on_self_ip_resolved(family);
            }
        }
    }
}
