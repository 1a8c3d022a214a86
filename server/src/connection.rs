//! Anonymous inbound connections and the promotion machinery shared by
//! every connection role.
//!
//! A freshly accepted stream starts as a [`Connection`] with [`Role::None`].
//! Each tick it reads what it can and runs the framing loop; the first packet
//! that identifies the peer decides where the socket goes next:
//!
//! - W3GS `REQJOIN` for a lobby: the socket moves into a new game user
//! - W3GS `REQJOIN` for a running game with async observers on: the socket
//!   moves into an observer of that game
//! - GPS `RECONNECT` with a valid key: the socket moves into the existing
//!   user that lost its transport
//! - GPS `UDPSYN` or any VLAN packet: the socket moves into a
//!   [`GameSeeker`](crate::game_seeker::GameSeeker) owned by the network
//!   manager
//!
//! The socket is moved out with [`Connection::take_socket`], so a promoted
//! connection is an empty shell that can be dropped without closing the
//! transport.

use crate::async_observer::AsyncObserver;
use crate::config::BotConfig;
use crate::game::{find_reconnect_target, Game, GameState, ReconnectLookup};
use crate::net::Net;
use crate::socket::{StreamIoSocket, UdpPkt};
use log::{debug, info};
use shared::framing::{scan_frames, FrameScan, FrameVerdict};
use shared::gps::{self, GPS_HEADER};
use shared::vlan::VLAN_HEADER;
use shared::w3gs::{self, reject_reason, IncomingJoinRequest, W3GS_HEADER};
use std::time::{Duration, Instant};

/// What a connection currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    None,
    Player,
    UdpTunnel,
    Vlan,
    KickedPlayer,
    Observer,
}

impl Role {
    /// Log prefix tag.
    pub fn label(self) -> &'static str {
        match self {
            Role::None => "CONN",
            Role::Player => "PLAYER",
            Role::UdpTunnel => "TUNNEL",
            Role::Vlan => "VLAN",
            Role::KickedPlayer => "KICKED",
            Role::Observer => "OBSERVER",
        }
    }
}

/// Bookkeeping the owning table performs after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Ok,
    /// The socket moved to another owner; drop this wrapper.
    Promoted,
    /// Like `Promoted`, but the triggering packet was left unconsumed for
    /// the new owner to read.
    PromotedPassthrough,
    /// The socket was handed back to a user that lost its transport.
    Reconnected,
    Destroy,
}

/// Where a dispatcher wants the socket to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promotion {
    /// Become a player in the lobby the request names.
    Join(IncomingJoinRequest),
    /// Watch a running game as an async observer.
    Observe(IncomingJoinRequest),
    /// Resume the transport of `uid` in `games[game]`.
    Reconnect { game: usize, uid: u8, last_packet: u32 },
    Seeker(Role),
    Close,
}

/// Everything a connection may touch while updating.
pub struct ConnectionContext<'a> {
    pub config: &'a BotConfig,
    pub net: &'a mut Net,
    pub games: &'a mut Vec<Game>,
    pub now: Instant,
}

/// Frames the socket's receive buffer and feeds each packet to `dispatch`.
///
/// Unconsumed bytes go back into the socket. On abort the buffer is dropped.
pub(crate) fn pump<S, F>(socket: &mut StreamIoSocket, mut dispatch: F) -> FrameScan<S>
where
    F: FnMut(&mut StreamIoSocket, &[u8]) -> FrameVerdict<S>,
{
    let buffer = socket.take_recv_buffer();
    if buffer.is_empty() {
        return FrameScan {
            consumed: 0,
            stopped: None,
            aborted: false,
        };
    }
    let scan = scan_frames(&buffer, |packet| dispatch(socket, packet));
    if !scan.aborted {
        socket.restore_recv_buffer(buffer[scan.consumed..].to_vec());
    }
    scan
}

/// Resolves the lobby a `REQJOIN` targets.
pub(crate) fn classify_join(
    ctx: &ConnectionContext<'_>,
    packet: &[u8],
    allow_observe: bool,
) -> FrameVerdict<Promotion> {
    let Some(request) = w3gs::receive_reqjoin(packet) else {
        return FrameVerdict::Abort;
    };
    let Some(game) = ctx
        .games
        .iter()
        .find(|g| g.host_counter() == request.host_counter)
    else {
        debug!("join for unknown host counter {}", request.host_counter);
        return FrameVerdict::Continue;
    };
    if game.is_mirror() {
        return FrameVerdict::Continue;
    }
    match game.state() {
        GameState::Lobby => FrameVerdict::Stop(Promotion::Join(request)),
        GameState::Loaded if allow_observe && ctx.config.net.async_observers_enabled => {
            FrameVerdict::Stop(Promotion::Observe(request))
        }
        _ => FrameVerdict::Continue,
    }
}

/// Hands LAN discovery riding on TCP to the UDP handler. Replies go back
/// on `socket`.
pub(crate) fn forward_discovery(
    ctx: &mut ConnectionContext<'_>,
    socket: &mut StreamIoSocket,
    packet: &[u8],
) {
    let pkt = UdpPkt {
        sender: socket.remote_addr(),
        data: packet.to_vec(),
    };
    ctx.net.handle_udp(&pkt, ctx.games.as_slice(), Some(socket));
}

/// Moves `socket` into the lobby named by `request`, or hands it back
/// carrying a rejection.
pub(crate) fn join_lobby(
    ctx: &mut ConnectionContext<'_>,
    socket: StreamIoSocket,
    request: &IncomingJoinRequest,
) -> Result<u8, StreamIoSocket> {
    match ctx
        .games
        .iter_mut()
        .find(|g| g.host_counter() == request.host_counter && g.is_joinable())
    {
        Some(game) => game.event_request_join(socket, request),
        None => {
            let mut socket = socket;
            socket.put_bytes(&w3gs::send_rejectjoin(reject_reason::STARTED));
            Err(socket)
        }
    }
}

fn reconnect_enabled(ctx: &ConnectionContext<'_>) -> bool {
    ctx.config.net.gproxy_basic_enabled || ctx.config.net.gproxy_extended_enabled
}

fn dispatch_anonymous(
    ctx: &mut ConnectionContext<'_>,
    socket: &mut StreamIoSocket,
    packet: &[u8],
) -> FrameVerdict<Promotion> {
    match (packet[0], packet[1]) {
        (W3GS_HEADER, w3gs::opcode::REQJOIN) => classify_join(ctx, packet, true),
        (W3GS_HEADER, op) if w3gs::is_discovery_opcode(op) => {
            if !ctx.config.net.udp_tunnel_enabled {
                return FrameVerdict::Abort;
            }
            forward_discovery(ctx, socket, packet);
            FrameVerdict::Continue
        }
        (GPS_HEADER, gps::opcode::RECONNECT) => {
            if !reconnect_enabled(ctx) || packet.len() < gps::RECONNECT_MIN_LEN {
                return FrameVerdict::Abort;
            }
            let Some(mut request) = gps::receive_gpsc_reconnect(packet) else {
                return FrameVerdict::Abort;
            };
            // Without the extended handshake the game id is not ours to check.
            if !ctx.config.net.gproxy_extended_enabled {
                request.game_id = None;
            }
            match find_reconnect_target(ctx.games, &request) {
                ReconnectLookup::Found { game, uid } => FrameVerdict::Stop(Promotion::Reconnect {
                    game,
                    uid,
                    last_packet: request.last_packet,
                }),
                ReconnectLookup::InvalidKey { game, uid } => {
                    socket.put_bytes(&gps::send_gpss_reject(gps::reject_reason::INVALID));
                    ctx.games[game].on_invalid_reconnect(uid, socket.remote_addr());
                    FrameVerdict::Continue
                }
                ReconnectLookup::NotFound => {
                    socket.put_bytes(&gps::send_gpss_reject(gps::reject_reason::NOT_FOUND));
                    FrameVerdict::Continue
                }
            }
        }
        (GPS_HEADER, gps::opcode::UDPSYN) if ctx.config.net.udp_tunnel_enabled => {
            FrameVerdict::Stop(Promotion::Seeker(Role::UdpTunnel))
        }
        (VLAN_HEADER, _) if ctx.config.net.vlan_enabled => {
            FrameVerdict::Passthrough(Promotion::Seeker(Role::Vlan))
        }
        _ => FrameVerdict::Abort,
    }
}

/// An accepted stream whose protocol is not known yet, or a kicked player
/// being drained.
#[derive(Debug)]
pub struct Connection {
    role: Role,
    port: u16,
    socket: Option<StreamIoSocket>,
    deadline: Option<Instant>,
    delete_me: bool,
}

impl Connection {
    /// An unclassified stream that must identify itself before `timeout`.
    pub fn new(port: u16, socket: StreamIoSocket, now: Instant, timeout: Duration) -> Self {
        Self {
            role: Role::None,
            port,
            socket: Some(socket),
            deadline: Some(now + timeout),
            delete_me: false,
        }
    }

    /// A socket that only drains its send buffer before closing.
    pub fn kicked(port: u16, socket: StreamIoSocket, now: Instant, drain: Duration) -> Self {
        Self {
            role: Role::KickedPlayer,
            port,
            socket: Some(socket),
            deadline: Some(now + drain),
            delete_me: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket(&self) -> Option<&StreamIoSocket> {
        self.socket.as_ref()
    }

    /// Moves the socket out, leaving a shell whose drop closes nothing.
    pub fn take_socket(&mut self) -> Option<StreamIoSocket> {
        self.socket.take()
    }

    /// Destroys the connection on its next update.
    pub fn set_delete_me(&mut self) {
        self.delete_me = true;
    }

    fn prefix(&self) -> String {
        match &self.socket {
            Some(socket) => format!("[{}] {}", self.role.label(), socket.remote_addr()),
            None => format!("[{}]", self.role.label()),
        }
    }

    fn kick(&mut self, now: Instant, drain: Duration) {
        self.role = Role::KickedPlayer;
        self.deadline = Some(now + drain);
    }

    /// Reads, frames and dispatches whatever arrived. Anything but
    /// [`UpdateStatus::Ok`] tells the caller to drop this wrapper.
    pub fn update(&mut self, ctx: &mut ConnectionContext<'_>) -> UpdateStatus {
        if self.delete_me {
            return UpdateStatus::Destroy;
        }
        let prefix = self.prefix();
        let Some(socket) = self.socket.as_mut() else {
            return UpdateStatus::Destroy;
        };
        if socket.has_error() || socket.has_fin() {
            debug!("{} closed: {}", prefix, socket.error_string());
            return UpdateStatus::Destroy;
        }
        if self.deadline.is_some_and(|deadline| ctx.now >= deadline) {
            debug!("{} timed out", prefix);
            return UpdateStatus::Destroy;
        }

        // Kicked sockets only flush; whatever the peer still sends is ignored.
        if self.role == Role::KickedPlayer {
            socket.discard();
            socket.do_send();
            if socket.send_buffer_is_empty() {
                return UpdateStatus::Destroy;
            }
            return UpdateStatus::Ok;
        }

        socket.do_recv();
        let scan = pump(socket, |socket, packet| dispatch_anonymous(ctx, socket, packet));
        if scan.aborted {
            debug!("{} protocol violation, dropping", prefix);
            return UpdateStatus::Destroy;
        }

        let status = match scan.stopped {
            Some(promotion) => self.promote(promotion, ctx),
            None => UpdateStatus::Ok,
        };

        // A rejected join turns this into a kicked connection that still
        // has the REJECTJOIN queued.
        if status == UpdateStatus::Ok {
            if let Some(socket) = self.socket.as_mut() {
                socket.do_send();
                if self.role == Role::KickedPlayer && socket.send_buffer_is_empty() {
                    return UpdateStatus::Destroy;
                }
            }
        }
        status
    }

    fn promote(&mut self, promotion: Promotion, ctx: &mut ConnectionContext<'_>) -> UpdateStatus {
        let prefix = self.prefix();
        let Some(mut socket) = self.take_socket() else {
            return UpdateStatus::Destroy;
        };
        match promotion {
            Promotion::Join(request) => match join_lobby(ctx, socket, &request) {
                Ok(uid) => {
                    info!("{} joined as {} (uid {})", prefix, request.name, uid);
                    self.role = Role::Player;
                    UpdateStatus::Promoted
                }
                Err(socket) => {
                    self.socket = Some(socket);
                    self.kick(ctx.now, Duration::from_millis(ctx.config.net.kicked_drain_ms));
                    UpdateStatus::Ok
                }
            },
            Promotion::Observe(request) => {
                let now = ctx.now;
                let max_backlog = ctx.config.net.observer_max_backlog;
                match ctx
                    .games
                    .iter_mut()
                    .find(|g| g.host_counter() == request.host_counter)
                {
                    Some(game) => {
                        info!("{} observing {} as {}", prefix, game.name(), request.name);
                        game.add_async_observer(AsyncObserver::new(
                            self.port,
                            socket,
                            request.name,
                            max_backlog,
                            now,
                        ));
                        self.role = Role::Observer;
                        UpdateStatus::Promoted
                    }
                    None => UpdateStatus::Destroy,
                }
            }
            Promotion::Reconnect {
                game,
                uid,
                last_packet,
            } => {
                info!("{} reconnected uid {}", prefix, uid);
                let now = ctx.now;
                if let Some(old) = ctx.games[game].reconnect_user(uid, socket, last_packet, now) {
                    ctx.net.on_user_kicked(old.local_port(), old, now);
                }
                self.role = Role::Player;
                UpdateStatus::Reconnected
            }
            Promotion::Seeker(role) => {
                info!("{} is a {} seeker", prefix, role.label());
                if role == Role::UdpTunnel {
                    socket.put_bytes(&gps::send_gpss_udpack());
                }
                ctx.net.register_game_seeker(self.port, socket, role);
                self.role = role;
                // The VLAN search packet is still in the buffer for the seeker.
                if role == Role::Vlan {
                    UpdateStatus::PromotedPassthrough
                } else {
                    UpdateStatus::Promoted
                }
            }
            Promotion::Close => UpdateStatus::Destroy,
        }
    }
}
