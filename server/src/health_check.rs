//! Reachability probes for a hosted game.
//!
//! A health check opens one outbound connection per vantage point and
//! performs a real join handshake against the game. A probe passes when the
//! game answers with `SLOTINFOJOIN`; it then leaves again at once.

use crate::config::RealmConfig;
use crate::connection::pump;
use crate::socket::{ConnectProgress, TcpClient};
use log::{debug, info};
use shared::framing::FrameVerdict;
use shared::w3gs::{self, leave_reason, IncomingJoinRequest, W3GS_HEADER};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

/// Whoever asked for a check and wants the report.
pub trait CommandContext: fmt::Debug {
    fn send_reply(&mut self, message: &str);
}

/// Writes replies to the log. Used for checks the bot starts on its own.
#[derive(Debug, Clone)]
pub struct LogCommandContext {
    label: String,
}

impl LogCommandContext {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl CommandContext for LogCommandContext {
    fn send_reply(&mut self, message: &str) {
        info!("[{}] {}", self.label, message);
    }
}

/// One probe of one address.
#[derive(Debug)]
pub struct GameTestConnection {
    label: String,
    target: SocketAddr,
    host_counter: u32,
    name: String,
    client: TcpClient,
    deadline: Instant,
    can_connect: bool,
    passed: bool,
    settled: bool,
    sent_join: bool,
}

/// A join name no player is likely to hold, within the 15 byte limit.
fn probe_name() -> String {
    format!("Probe{:08X}", rand::random::<u32>())
}

impl GameTestConnection {
    pub fn new(
        label: String,
        target: SocketAddr,
        host_counter: u32,
        now: Instant,
        timeout: Duration,
    ) -> Self {
        Self {
            label,
            target,
            host_counter,
            name: probe_name(),
            client: TcpClient::connect(target),
            deadline: now + timeout,
            can_connect: false,
            passed: false,
            settled: false,
            sent_join: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn can_connect(&self) -> bool {
        self.can_connect
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    fn settle(&mut self) -> bool {
        self.settled = true;
        self.client.close();
        false
    }

    /// Advances the probe. Returns `false` once it has settled.
    pub fn update(&mut self, now: Instant) -> bool {
        if self.settled {
            return false;
        }
        if now >= self.deadline {
            debug!("[PROBE] {} {} timed out", self.label, self.target);
            return self.settle();
        }
        match self.client.check_connect() {
            ConnectProgress::Pending => return true,
            ConnectProgress::Failed(e) => {
                debug!("[PROBE] {} {}: {}", self.label, self.target, e.message);
                return self.settle();
            }
            ConnectProgress::Connected => self.can_connect = true,
        }
        let Some(socket) = self.client.socket_mut() else {
            return self.settle();
        };

        if !self.sent_join {
            self.sent_join = true;
            socket.put_bytes(&w3gs::send_reqjoin(&IncomingJoinRequest {
                host_counter: self.host_counter,
                entry_key: 0,
                listen_port: 0,
                peer_key: 0,
                name: self.name.clone(),
                internal_ip: Ipv4Addr::UNSPECIFIED,
            }));
        }
        socket.do_send();
        socket.do_recv();
        if socket.has_error() || socket.has_fin() {
            return self.settle();
        }

        let scan = pump(socket, |_, packet| match (packet[0], packet[1]) {
            (W3GS_HEADER, w3gs::opcode::SLOTINFOJOIN) => FrameVerdict::Stop(true),
            (W3GS_HEADER, w3gs::opcode::REJECTJOIN) => FrameVerdict::Stop(false),
            _ => FrameVerdict::Continue,
        });
        if scan.aborted {
            return self.settle();
        }
        match scan.stopped {
            Some(true) => {
                self.passed = true;
                socket.put_bytes(&w3gs::send_leavegame(leave_reason::LOBBY));
                socket.do_send();
                self.settle()
            }
            Some(false) => self.settle(),
            None => true,
        }
    }

    fn verdict(&self) -> &'static str {
        match (self.passed, self.can_connect) {
            (true, _) => "OK",
            (false, true) => "connected, no join reply",
            (false, false) => "unreachable",
        }
    }
}

/// Addresses worth probing for a game listening on `host_port`.
pub fn probe_targets(
    host_port: u16,
    enable_ipv6: bool,
    realms: &[RealmConfig],
    public_ipv4: Option<Ipv4Addr>,
    public_ipv6: Option<Ipv6Addr>,
) -> Vec<(String, SocketAddr)> {
    let mut targets = vec![(
        "loopback".to_string(),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), host_port),
    )];
    if enable_ipv6 {
        targets.push((
            "loopback6".to_string(),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), host_port),
        ));
    }
    for realm in realms {
        if let Some(ip) = realm.public_ip {
            let port = realm.public_port.unwrap_or(host_port);
            targets.push((realm.name.clone(), SocketAddr::new(ip, port)));
        }
    }
    if let Some(ip) = public_ipv4 {
        targets.push(("public".to_string(), SocketAddr::new(IpAddr::V4(ip), host_port)));
    }
    if let (Some(ip), true) = (public_ipv6, enable_ipv6) {
        targets.push(("public6".to_string(), SocketAddr::new(IpAddr::V6(ip), host_port)));
    }
    targets
}

/// A battery of probes against one game, reported as a whole.
#[derive(Debug)]
pub struct HealthCheck {
    game_name: String,
    probes: Vec<GameTestConnection>,
    context: Box<dyn CommandContext>,
    started_at: Instant,
}

impl HealthCheck {
    pub fn new(
        game_name: String,
        host_counter: u32,
        targets: Vec<(String, SocketAddr)>,
        context: Box<dyn CommandContext>,
        now: Instant,
        timeout: Duration,
    ) -> Self {
        let probes = targets
            .into_iter()
            .map(|(label, target)| GameTestConnection::new(label, target, host_counter, now, timeout))
            .collect();
        Self {
            game_name,
            probes,
            context,
            started_at: now,
        }
    }

    pub fn probes(&self) -> &[GameTestConnection] {
        &self.probes
    }

    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }

    /// Ticks every probe. Returns `false` once all have settled.
    pub fn update(&mut self, now: Instant) -> bool {
        let mut running = false;
        for probe in &mut self.probes {
            if probe.update(now) {
                running = true;
            }
        }
        running
    }

    pub fn report(&self) -> Vec<String> {
        let passed = self.probes.iter().filter(|p| p.passed()).count();
        let mut lines = vec![format!(
            "Health check for {}: {}/{} reachable",
            self.game_name,
            passed,
            self.probes.len()
        )];
        for probe in &self.probes {
            lines.push(format!(
                "{} ({}): {}",
                probe.label(),
                probe.target(),
                probe.verdict()
            ));
        }
        lines
    }

    /// Sends the report to whoever asked and drops every probe.
    pub fn finish(mut self) {
        debug!(
            "[GAME: {}] health check done in {:?}",
            self.game_name,
            self.started_at.elapsed()
        );
        for line in self.report() {
            self.context.send_reply(&line);
        }
    }
}
