//! Classified discovery connections: UDP tunnels and VLAN clients.
//!
//! A UDP-tunnel seeker carries W3GS LAN discovery over TCP and may still
//! turn into a player with REQJOIN. A VLAN seeker browses lobbies with the
//! VLAN protocol and never joins over the same stream.

use crate::connection::{
    classify_join, forward_discovery, join_lobby, pump, ConnectionContext, Promotion, Role,
    UpdateStatus,
};
use crate::socket::StreamIoSocket;
use log::{debug, info};
use shared::framing::FrameVerdict;
use shared::gps::{self, GPS_HEADER};
use shared::vlan::{self, VLAN_HEADER};
use shared::w3gs::{self, W3GS_HEADER};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// A discovery client parked on a game port, fed every advertisement the
/// lobbies send.
#[derive(Debug)]
pub struct GameSeeker {
    role: Role,
    port: u16,
    socket: Option<StreamIoSocket>,
    timeout: Duration,
}

fn dispatch_tunnel(
    ctx: &mut ConnectionContext<'_>,
    socket: &mut StreamIoSocket,
    packet: &[u8],
) -> FrameVerdict<Promotion> {
    match (packet[0], packet[1]) {
        (W3GS_HEADER, w3gs::opcode::REQJOIN) => classify_join(ctx, packet, false),
        (W3GS_HEADER, op) if w3gs::is_discovery_opcode(op) => {
            forward_discovery(ctx, socket, packet);
            FrameVerdict::Continue
        }
        // Repeated handshakes are harmless.
        (GPS_HEADER, gps::opcode::UDPSYN) => FrameVerdict::Continue,
        (GPS_HEADER, gps::opcode::UDPFIN) => FrameVerdict::Stop(Promotion::Close),
        _ => FrameVerdict::Abort,
    }
}

fn dispatch_vlan(
    ctx: &mut ConnectionContext<'_>,
    socket: &mut StreamIoSocket,
    packet: &[u8],
) -> FrameVerdict<Promotion> {
    if packet[0] != VLAN_HEADER {
        return FrameVerdict::Abort;
    }
    // Other VLAN traffic from a browsing client is ignored.
    if packet[1] != vlan::opcode::SEARCHGAME {
        return FrameVerdict::Continue;
    }
    let Some((product, version)) = vlan::receive_vlan_searchgame(packet) else {
        return FrameVerdict::Abort;
    };
    let ip = ctx.net.public_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
    for game in ctx
        .games
        .iter()
        .filter(|g| g.is_joinable() && g.supports_version(product, version))
    {
        socket.put_bytes(&vlan::send_vlan_gameinfo(&game.vlan_game_info(ctx.now, ip)));
    }
    FrameVerdict::Continue
}

impl GameSeeker {
    /// `timeout` is how long the peer may stay silent.
    pub fn new(port: u16, socket: StreamIoSocket, role: Role, timeout: Duration) -> Self {
        Self {
            role,
            port,
            socket: Some(socket),
            timeout,
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

    pub fn take_socket(&mut self) -> Option<StreamIoSocket> {
        self.socket.take()
    }

    /// Queues an advertisement already encoded for this seeker's protocol.
    pub fn send(&mut self, bytes: &[u8]) {
        if let Some(socket) = self.socket.as_mut() {
            socket.put_bytes(bytes);
        }
    }

    /// Answers searches and forwards tunneled discovery. A tunnel that sends
    /// REQJOIN leaves the seeker table as a player.
    pub fn update(&mut self, ctx: &mut ConnectionContext<'_>) -> UpdateStatus {
        let role = self.role;
        let Some(socket) = self.socket.as_mut() else {
            return UpdateStatus::Destroy;
        };
        let prefix = format!("[{}] {}", role.label(), socket.remote_addr());
        if socket.has_error() || socket.has_fin() {
            debug!("{} closed: {}", prefix, socket.error_string());
            return UpdateStatus::Destroy;
        }
        if ctx.now.saturating_duration_since(socket.last_recv()) >= self.timeout {
            debug!("{} idle for too long", prefix);
            return UpdateStatus::Destroy;
        }

        socket.do_recv();
        let scan = pump(socket, |socket, packet| match role {
            Role::Vlan => dispatch_vlan(ctx, socket, packet),
            _ => dispatch_tunnel(ctx, socket, packet),
        });
        if scan.aborted {
            debug!("{} protocol violation, dropping", prefix);
            return UpdateStatus::Destroy;
        }

        match scan.stopped {
            Some(Promotion::Join(request)) => {
                let Some(socket) = self.socket.take() else {
                    return UpdateStatus::Destroy;
                };
                match join_lobby(ctx, socket, &request) {
                    Ok(uid) => {
                        info!("{} joined as {} (uid {})", prefix, request.name, uid);
                        self.role = Role::Player;
                    }
                    // Let the REJECTJOIN drain before the socket closes.
                    Err(socket) => ctx.net.on_user_kicked(self.port, socket, ctx.now),
                }
                UpdateStatus::Promoted
            }
            Some(_) => UpdateStatus::Destroy,
            None => {
                socket.do_send();
                UpdateStatus::Ok
            }
        }
    }
}
