//! Spectators attached to a running game.
//!
//! An observer is fed every frame the game closes, from its own backlog and
//! at a bounded pace. The only thing it may ask for is a seat in a lobby,
//! and only while TCP-tunnelled discovery is enabled. Anything else it sends
//! ends the connection.

use crate::connection::{classify_join, join_lobby, pump, ConnectionContext, Promotion, UpdateStatus};
use crate::socket::StreamIoSocket;
use log::{debug, info, warn};
use shared::framing::FrameVerdict;
use shared::w3gs::{opcode, W3GS_HEADER};
use std::collections::VecDeque;
use std::time::Instant;

/// Frames flushed to one observer per tick.
pub const FRAMES_PER_TICK: usize = 4;

/// A connection watching a loaded game without a seat in it.
#[derive(Debug)]
pub struct AsyncObserver {
    port: u16,
    socket: Option<StreamIoSocket>,
    name: String,
    backlog: VecDeque<Vec<u8>>,
    max_backlog: usize,
    /// Set once the backlog overflowed; the next update drops the observer.
    lagging: bool,
    frames_sent: u64,
    joined_at: Instant,
}

/// Observer whitelist: `REQJOIN` while tunnelling is on, nothing else.
fn dispatch_observer(ctx: &ConnectionContext<'_>, packet: &[u8]) -> FrameVerdict<Promotion> {
    match (packet[0], packet[1]) {
        (W3GS_HEADER, opcode::REQJOIN) if ctx.config.net.udp_tunnel_enabled => {
            classify_join(ctx, packet, false)
        }
        _ => FrameVerdict::Abort,
    }
}

impl AsyncObserver {
    /// Wraps a socket taken from a promoted connection. The observer is
    /// dropped once more than `max_backlog` frames wait unsent.
    pub fn new(
        port: u16,
        socket: StreamIoSocket,
        name: String,
        max_backlog: usize,
        now: Instant,
    ) -> Self {
        Self {
            port,
            socket: Some(socket),
            name,
            backlog: VecDeque::new(),
            max_backlog,
            lagging: false,
            frames_sent: 0,
            joined_at: now,
        }
    }

    /// Name the observer joined with.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket(&self) -> Option<&StreamIoSocket> {
        self.socket.as_ref()
    }

    /// Moves the socket out, leaving an empty shell.
    pub fn take_socket(&mut self) -> Option<StreamIoSocket> {
        self.socket.take()
    }

    /// Frames queued but not yet written to the socket.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Whether the backlog overflowed and the observer is about to go.
    pub fn is_lagging(&self) -> bool {
        self.lagging
    }

    /// Queues one serialized action frame.
    pub fn push_frame(&mut self, frame: Vec<u8>) {
        if self.lagging {
            return;
        }
        if self.backlog.len() >= self.max_backlog {
            // Nothing will be sent anymore, so free the memory right away.
            self.lagging = true;
            self.backlog.clear();
            return;
        }
        self.backlog.push_back(frame);
    }

    /// One tick: read, dispatch, then flush up to [`FRAMES_PER_TICK`]
    /// frames from the backlog.
    pub fn update(&mut self, ctx: &mut ConnectionContext<'_>) -> UpdateStatus {
        let Some(socket) = self.socket.as_mut() else {
            return UpdateStatus::Destroy;
        };
        if socket.has_error() || socket.has_fin() {
            info!(
                "[OBSERVER] {} left after {:?}",
                self.name,
                ctx.now.saturating_duration_since(self.joined_at)
            );
            return UpdateStatus::Destroy;
        }
        if self.lagging {
            warn!(
                "[OBSERVER] {} fell more than {} frames behind, dropping",
                self.name, self.max_backlog
            );
            return UpdateStatus::Destroy;
        }

        socket.do_recv();
        let scan = pump(socket, |_, packet| dispatch_observer(ctx, packet));
        if scan.aborted {
            // pump already dropped the whole receive buffer
            debug!("[OBSERVER] {} protocol violation", self.name);
            return UpdateStatus::Destroy;
        }

        match scan.stopped {
            Some(Promotion::Join(request)) => {
                let Some(socket) = self.socket.take() else {
                    return UpdateStatus::Destroy;
                };
                match join_lobby(ctx, socket, &request) {
                    Ok(uid) => info!("[OBSERVER] {} moved into a lobby as uid {}", self.name, uid),
                    // Rejected: the REJECTJOIN drains through the kicked queue
                    Err(socket) => ctx.net.on_user_kicked(self.port, socket, ctx.now),
                }
                return UpdateStatus::Promoted;
            }
            Some(_) => return UpdateStatus::Destroy,
            None => {}
        }

        // Pace the backlog so a late observer does not flood its link
        for _ in 0..FRAMES_PER_TICK {
            let Some(frame) = self.backlog.pop_front() else {
                break;
            };
            socket.put_bytes(&frame);
            self.frames_sent += 1;
        }
        socket.do_send();
        UpdateStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::loopback_config;
    use crate::config::{BotConfig, LobbyConfig};
    use crate::game::Game;
    use crate::net::Net;
    use crate::socket::tests::{connected_pair, poll_until};
    use shared::w3gs;
    use std::net::Ipv4Addr;

    fn update(observer: &mut AsyncObserver, config: &BotConfig, net: &mut Net, games: &mut Vec<Game>) -> UpdateStatus {
        let mut ctx = ConnectionContext {
            config,
            net,
            games,
            now: Instant::now(),
        };
        observer.update(&mut ctx)
    }

    #[tokio::test]
    async fn test_backlog_is_paced() {
        let config = loopback_config();
        let mut net = Net::new(&config.net).unwrap();
        let mut games = Vec::new();
        let (socket, _peer) = connected_pair().await;
        let mut observer = AsyncObserver::new(6113, socket, "Watcher".to_string(), 64, Instant::now());
        for seq in 0..10u32 {
            observer.push_frame(w3gs::send_ping_from_host(seq));
        }

        assert_eq!(update(&mut observer, &config, &mut net, &mut games), UpdateStatus::Ok);
        assert_eq!(observer.frames_sent(), 4);
        assert_eq!(observer.backlog_len(), 6);
        update(&mut observer, &config, &mut net, &mut games);
        update(&mut observer, &config, &mut net, &mut games);
        assert_eq!(observer.frames_sent(), 10);
        assert_eq!(observer.backlog_len(), 0);
    }

    #[tokio::test]
    async fn test_reqjoin_needs_tunnel() {
        let mut config = loopback_config();
        config.net.udp_tunnel_enabled = false;
        let mut net = Net::new(&config.net).unwrap();
        let mut games = vec![Game::new(
            42,
            6113,
            LobbyConfig::default(),
            config.game.clone(),
            Instant::now(),
        )];
        let (socket, peer) = connected_pair().await;
        let mut observer = AsyncObserver::new(6113, socket, "Watcher".to_string(), 64, Instant::now());

        peer.writable().await.unwrap();
        peer.try_write(&w3gs::send_reqjoin(&w3gs::IncomingJoinRequest {
            host_counter: 42,
            entry_key: 0,
            listen_port: 6112,
            peer_key: 0,
            name: "Watcher".to_string(),
            internal_ip: Ipv4Addr::LOCALHOST,
        }))
        .unwrap();

        let status = poll_until(|| match update(&mut observer, &config, &mut net, &mut games) {
            UpdateStatus::Ok => None,
            status => Some(status),
        })
        .await;
        assert_eq!(status, Some(UpdateStatus::Destroy));
        assert!(games[0].users().is_empty());
    }

    #[tokio::test]
    async fn test_reqjoin_moves_observer_into_lobby() {
        let config = loopback_config();
        let mut net = Net::new(&config.net).unwrap();
        let mut games = vec![Game::new(
            42,
            6113,
            LobbyConfig::default(),
            config.game.clone(),
            Instant::now(),
        )];
        let (socket, peer) = connected_pair().await;
        let socket_id = socket.id();
        let mut observer = AsyncObserver::new(6113, socket, "Watcher".to_string(), 64, Instant::now());

        peer.writable().await.unwrap();
        peer.try_write(&w3gs::send_reqjoin(&w3gs::IncomingJoinRequest {
            host_counter: 42,
            entry_key: 0,
            listen_port: 6112,
            peer_key: 0,
            name: "Watcher".to_string(),
            internal_ip: Ipv4Addr::LOCALHOST,
        }))
        .unwrap();

        let status = poll_until(|| match update(&mut observer, &config, &mut net, &mut games) {
            UpdateStatus::Ok => None,
            status => Some(status),
        })
        .await;
        assert_eq!(status, Some(UpdateStatus::Promoted));
        assert!(observer.socket().is_none());
        assert_eq!(games[0].users()[0].socket_id(), Some(socket_id));
    }

    #[tokio::test]
    async fn test_leavegame_is_a_protocol_violation() {
        let config = loopback_config();
        let mut net = Net::new(&config.net).unwrap();
        let mut games = Vec::new();
        let (socket, peer) = connected_pair().await;
        let mut observer = AsyncObserver::new(6113, socket, "Watcher".to_string(), 64, Instant::now());

        // LEAVEGAME followed by the start of another packet
        let mut bytes = w3gs::send_leavegame(w3gs::leave_reason::LOBBY);
        bytes.extend_from_slice(&[W3GS_HEADER, opcode::REQJOIN]);
        peer.writable().await.unwrap();
        peer.try_write(&bytes).unwrap();

        let status = poll_until(|| match update(&mut observer, &config, &mut net, &mut games) {
            UpdateStatus::Ok => None,
            status => Some(status),
        })
        .await;
        assert_eq!(status, Some(UpdateStatus::Destroy));
        // An aborted scan throws the whole buffer away, trailing bytes included
        assert!(observer.socket().unwrap().recv_buffer().is_empty());
    }

    #[tokio::test]
    async fn test_overflowing_backlog_drops_observer() {
        let config = loopback_config();
        let mut net = Net::new(&config.net).unwrap();
        let mut games = Vec::new();
        let (socket, _peer) = connected_pair().await;
        let mut observer = AsyncObserver::new(6113, socket, "Watcher".to_string(), 3, Instant::now());

        for seq in 0..3u32 {
            observer.push_frame(w3gs::send_ping_from_host(seq));
        }
        assert!(!observer.is_lagging());
        assert_eq!(observer.backlog_len(), 3);

        observer.push_frame(w3gs::send_ping_from_host(3));
        assert!(observer.is_lagging());
        assert_eq!(observer.backlog_len(), 0);
        observer.push_frame(w3gs::send_ping_from_host(4));
        assert_eq!(observer.backlog_len(), 0);

        assert_eq!(update(&mut observer, &config, &mut net, &mut games), UpdateStatus::Destroy);
        assert_eq!(observer.frames_sent(), 0);
    }
}
