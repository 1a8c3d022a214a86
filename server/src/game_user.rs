//! A player seated in a game, plus the GProxy state that lets it survive a
//! dropped transport.

use crate::action_queue::FrameCursor;
use crate::config::RttMode;
use crate::connection::pump;
use crate::socket::StreamIoSocket;
use log::{debug, info, warn};
use shared::framing::{scan_frames, FrameVerdict};
use shared::gps::{self, GpsInit, GPS_HEADER};
use shared::w3gs::{self, leave_reason, opcode, W3GS_HEADER};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

pub const MAX_NAME_LEN: usize = 15;
const RTT_SAMPLES: usize = 6;
/// Received W3GS packets between two server-side GProxy acks.
const ACK_EVERY: u32 = 10;

/// Something the owning game has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    Action(Vec<u8>),
    KeepAlive(u32),
    Loaded,
    Left(u32),
    /// The transport dropped. The user may still reconnect.
    Disconnected,
    ProtocolError,
}

/// Per-tick inputs a user needs from its game.
#[derive(Debug, Clone, Copy)]
pub struct UserTick {
    pub now: Instant,
    /// Milliseconds since the game was created.
    pub ticks: u32,
    pub gproxy_basic: bool,
    pub gproxy_extended: bool,
    pub reconnect_wait_ms: u64,
    pub game_id: u32,
}

#[derive(Debug, Clone, Default)]
struct GProxyState {
    reconnect_key: u32,
    extended: bool,
    buffer: VecDeque<Vec<u8>>,
    total_sent: u32,
    total_received: u32,
}

impl GProxyState {
    /// Drops everything the client confirmed. `last_packet` counts every
    /// W3GS packet the client ever received from us.
    fn trim(&mut self, last_packet: u32) {
        let first_buffered = self.total_sent.wrapping_sub(self.buffer.len() as u32);
        let confirmed = last_packet.saturating_sub(first_buffered) as usize;
        let confirmed = confirmed.min(self.buffer.len());
        self.buffer.drain(..confirmed);
    }
}

fn split_packets(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    scan_frames::<(), _>(bytes, |packet| {
        packets.push(packet.to_vec());
        FrameVerdict::Continue
    });
    packets
}

#[derive(Debug)]
pub struct GameUser {
    uid: u8,
    name: String,
    internal_ip: Ipv4Addr,
    external_ip: Ipv4Addr,
    socket: Option<StreamIoSocket>,
    rtts: VecDeque<u32>,
    gproxy: Option<GProxyState>,
    disconnected_at: Option<Instant>,
    failed_reconnects: u32,
    loaded: bool,
    cursor: FrameCursor,
}

impl GameUser {
    pub fn new(uid: u8, name: String, internal_ip: Ipv4Addr, socket: StreamIoSocket) -> Self {
        let external_ip = match socket.remote_addr() {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        Self {
            uid,
            name,
            internal_ip,
            external_ip,
            socket: Some(socket),
            rtts: VecDeque::with_capacity(RTT_SAMPLES),
            gproxy: None,
            disconnected_at: None,
            failed_reconnects: 0,
            loaded: false,
            cursor: FrameCursor::at(0),
        }
    }

    pub fn uid(&self) -> u8 {
        self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn internal_ip(&self) -> Ipv4Addr {
        self.internal_ip
    }

    pub fn external_ip(&self) -> Ipv4Addr {
        self.external_ip
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.socket.as_ref().map(|s| s.remote_addr().ip())
    }

    pub fn socket(&self) -> Option<&StreamIoSocket> {
        self.socket.as_ref()
    }

    pub fn socket_id(&self) -> Option<u64> {
        self.socket.as_ref().map(StreamIoSocket::id)
    }

    pub fn take_socket(&mut self) -> Option<StreamIoSocket> {
        self.socket.take()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn set_loaded(&mut self) {
        self.loaded = true;
    }

    pub fn cursor(&self) -> &FrameCursor {
        &self.cursor
    }

    pub fn cursor_mut(&mut self) -> &mut FrameCursor {
        &mut self.cursor
    }

    pub fn gproxy_enabled(&self) -> bool {
        self.gproxy.is_some()
    }

    pub fn gproxy_extended(&self) -> bool {
        self.gproxy.as_ref().is_some_and(|g| g.extended)
    }

    pub fn reconnect_key(&self) -> Option<u32> {
        self.gproxy.as_ref().map(|g| g.reconnect_key)
    }

    /// Packets sent but not yet confirmed by the client.
    pub fn gproxy_buffered(&self) -> usize {
        self.gproxy.as_ref().map_or(0, |g| g.buffer.len())
    }

    pub fn disconnected_at(&self) -> Option<Instant> {
        self.disconnected_at
    }

    pub fn failed_reconnects(&self) -> u32 {
        self.failed_reconnects
    }

    /// Queues one or more W3GS packets. GProxy users also keep a copy until
    /// the client acknowledges it.
    pub fn send(&mut self, bytes: &[u8]) {
        if let Some(gproxy) = self.gproxy.as_mut() {
            for packet in split_packets(bytes) {
                gproxy.total_sent = gproxy.total_sent.wrapping_add(1);
                gproxy.buffer.push_back(packet);
            }
        }
        if let Some(socket) = self.socket.as_mut() {
            socket.put_bytes(bytes);
        }
    }

    /// Queues protocol bytes that are neither counted nor buffered.
    fn send_control(&mut self, bytes: &[u8]) {
        if let Some(socket) = self.socket.as_mut() {
            socket.put_bytes(bytes);
        }
    }

    pub fn flush(&mut self) {
        if let Some(socket) = self.socket.as_mut() {
            socket.do_send();
        }
    }

    fn record_rtt(&mut self, rtt: u32) {
        if self.rtts.len() == RTT_SAMPLES {
            self.rtts.pop_front();
        }
        self.rtts.push_back(rtt);
    }

    pub fn average_rtt(&self) -> Option<f64> {
        if self.rtts.is_empty() {
            return None;
        }
        let sum: u64 = self.rtts.iter().map(|&r| r as u64).sum();
        Some(sum as f64 / self.rtts.len() as f64)
    }

    /// RTT used by the ping equalizer. Users without samples count as 0.
    pub fn rtt(&self, mode: RttMode) -> u32 {
        match mode {
            RttMode::Average => self.average_rtt().map_or(0, |avg| avg.round() as u32),
            RttMode::Latest => self.rtts.back().copied().unwrap_or(0),
        }
    }

    pub fn on_invalid_reconnect(&mut self, from: SocketAddr) {
        self.failed_reconnects += 1;
        warn!(
            "[USER: {}] rejected reconnect from {} with a wrong key ({} so far)",
            self.name, from, self.failed_reconnects
        );
    }

    /// Gives the user a fresh transport. Returns the one it replaced, if any.
    pub fn reconnect(&mut self, mut socket: StreamIoSocket, last_packet: u32) -> Option<StreamIoSocket> {
        if let Some(gproxy) = self.gproxy.as_mut() {
            socket.put_bytes(&gps::send_gpss_reconnect(gproxy.total_received));
            gproxy.trim(last_packet);
            for packet in &gproxy.buffer {
                socket.put_bytes(packet);
            }
            info!(
                "[USER: {}] resending {} unconfirmed packets",
                self.name,
                gproxy.buffer.len()
            );
        }
        self.disconnected_at = None;
        self.socket.replace(socket)
    }

    /// Reads and dispatches everything the client sent since the last tick.
    pub fn update(&mut self, tick: &UserTick) -> Vec<UserEvent> {
        let Some(mut socket) = self.socket.take() else {
            return Vec::new();
        };
        if socket.has_error() || socket.has_fin() {
            debug!("[USER: {}] transport lost: {}", self.name, socket.error_string());
            self.disconnected_at = Some(tick.now);
            return vec![UserEvent::Disconnected];
        }

        socket.do_recv();
        let mut events = Vec::new();
        let scan = pump(&mut socket, |socket, packet| {
            self.dispatch(socket, packet, tick, &mut events)
        });
        if scan.aborted {
            debug!("[USER: {}] protocol violation", self.name);
            events.push(UserEvent::ProtocolError);
        }
        socket.do_send();
        self.socket = Some(socket);
        events
    }

    fn dispatch(
        &mut self,
        socket: &mut StreamIoSocket,
        packet: &[u8],
        tick: &UserTick,
        events: &mut Vec<UserEvent>,
    ) -> FrameVerdict<()> {
        match packet[0] {
            W3GS_HEADER => {
                if let Some(gproxy) = self.gproxy.as_mut() {
                    gproxy.total_received = gproxy.total_received.wrapping_add(1);
                    if gproxy.total_received % ACK_EVERY == 0 {
                        socket.put_bytes(&gps::send_gpss_ack(gproxy.total_received));
                    }
                }
                self.dispatch_w3gs(packet, tick, events)
            }
            GPS_HEADER => {
                self.dispatch_gps(socket, packet, tick);
                FrameVerdict::Continue
            }
            _ => FrameVerdict::Abort,
        }
    }

    fn dispatch_w3gs(
        &mut self,
        packet: &[u8],
        tick: &UserTick,
        events: &mut Vec<UserEvent>,
    ) -> FrameVerdict<()> {
        match packet[1] {
            opcode::LEAVEGAME => {
                let reason = w3gs::receive_leavegame(packet).unwrap_or(leave_reason::DISCONNECT);
                events.push(UserEvent::Left(reason));
                return FrameVerdict::Stop(());
            }
            opcode::GAMELOADED_SELF => events.push(UserEvent::Loaded),
            opcode::OUTGOING_ACTION => match w3gs::receive_outgoing_action(packet) {
                Some(data) => events.push(UserEvent::Action(data)),
                None => return FrameVerdict::Abort,
            },
            opcode::OUTGOING_KEEPALIVE => {
                if let Some(checksum) = w3gs::receive_outgoing_keepalive(packet) {
                    events.push(UserEvent::KeepAlive(checksum));
                }
            }
            opcode::PONG_TO_HOST => {
                if let Some(sent) = w3gs::receive_pong_to_host(packet) {
                    self.record_rtt(tick.ticks.wrapping_sub(sent));
                }
            }
            _ => {}
        }
        FrameVerdict::Continue
    }

    fn dispatch_gps(&mut self, socket: &mut StreamIoSocket, packet: &[u8], tick: &UserTick) {
        match packet[1] {
            gps::opcode::INIT if tick.gproxy_basic => {
                let Some(version) = gps::receive_gpsc_init(packet) else {
                    return;
                };
                let gproxy = self.gproxy.get_or_insert_with(|| GProxyState {
                    reconnect_key: rand::random(),
                    ..GProxyState::default()
                });
                socket.put_bytes(&gps::send_gpss_init(&GpsInit {
                    reconnect_port: socket.local_port(),
                    uid: self.uid,
                    reconnect_key: gproxy.reconnect_key,
                    empty_actions: 0,
                }));
                info!("[USER: {}] GProxy v{} enabled", self.name, version);
            }
            gps::opcode::ACK => {
                if let (Some(last_packet), Some(gproxy)) =
                    (gps::receive_gpsc_ack(packet), self.gproxy.as_mut())
                {
                    gproxy.trim(last_packet);
                }
            }
            gps::opcode::SUPPORT_EXTENDED if tick.gproxy_extended => {
                let Some(gproxy) = self.gproxy.as_mut() else {
                    return;
                };
                if gps::receive_gpsc_support_extended(packet).is_none() {
                    return;
                }
                gproxy.extended = true;
                socket.put_bytes(&gps::send_gpss_support_extended(
                    tick.reconnect_wait_ms,
                    tick.game_id,
                ));
            }
            _ => {}
        }
    }

    /// Sends a ping carrying the game's millisecond tick.
    pub fn ping(&mut self, ticks: u32) {
        self.send(&w3gs::send_ping_from_host(ticks));
    }

    /// Rotates the reconnect key on a GProxy user.
    pub fn change_key(&mut self) {
        let Some(gproxy) = self.gproxy.as_mut() else {
            return;
        };
        gproxy.reconnect_key = rand::random();
        let packet = gps::send_gpss_changekey(gproxy.reconnect_key);
        self.send_control(&packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::tests::{connected_pair, poll_until};
    use assert_approx_eq::assert_approx_eq;
    use tokio::net::TcpStream;

    fn tick() -> UserTick {
        UserTick {
            now: Instant::now(),
            ticks: 1_000,
            gproxy_basic: true,
            gproxy_extended: true,
            reconnect_wait_ms: 90_000,
            game_id: 77,
        }
    }

    async fn read_exact(peer: &TcpStream, n: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        poll_until(|| {
            if let Ok(got) = peer.try_read(&mut buf) {
                out.extend_from_slice(&buf[..got]);
            }
            (out.len() >= n).then_some(())
        })
        .await
        .unwrap();
        out
    }

    async fn write(peer: &TcpStream, bytes: &[u8]) {
        peer.writable().await.unwrap();
        peer.try_write(bytes).unwrap();
    }

    async fn user_with_peer() -> (GameUser, TcpStream) {
        let (socket, peer) = connected_pair().await;
        (
            GameUser::new(3, "Grubby".to_string(), Ipv4Addr::new(10, 0, 0, 3), socket),
            peer,
        )
    }

    async fn events_until<F>(user: &mut GameUser, mut wanted: F) -> Vec<UserEvent>
    where
        F: FnMut(&[UserEvent]) -> bool,
    {
        let mut seen = Vec::new();
        poll_until(|| {
            seen.extend(user.update(&tick()));
            wanted(&seen).then_some(())
        })
        .await
        .unwrap();
        seen
    }

    #[test]
    fn test_rtt_window_and_modes() {
        tokio_test::block_on(async {
            let (mut user, _peer) = user_with_peer().await;
            assert_eq!(user.rtt(RttMode::Average), 0);
            for rtt in [100, 200, 300, 400, 500, 600, 700] {
                user.record_rtt(rtt);
            }
            assert_eq!(user.rtts.len(), RTT_SAMPLES);
            assert_approx_eq!(user.average_rtt().unwrap(), 450.0);
            assert_eq!(user.rtt(RttMode::Latest), 700);
            assert_eq!(user.rtt(RttMode::Average), 450);
        });
    }

    #[tokio::test]
    async fn test_pong_records_rtt() {
        let (mut user, peer) = user_with_peer().await;
        write(&peer, &w3gs::send_pong_to_host(940)).await;
        poll_until(|| {
            user.update(&tick());
            user.average_rtt()
        })
        .await
        .unwrap();
        assert_eq!(user.rtt(RttMode::Latest), 60);
    }

    #[tokio::test]
    async fn test_actions_and_leave_events() {
        let (mut user, peer) = user_with_peer().await;
        let mut bytes = w3gs::send_outgoing_action(&[0x10, 0x20]);
        bytes.extend(w3gs::send_leavegame(leave_reason::LOBBY));
        write(&peer, &bytes).await;

        let events = events_until(&mut user, |seen| seen.len() >= 2).await;
        assert_eq!(
            events,
            vec![
                UserEvent::Action(vec![0x10, 0x20]),
                UserEvent::Left(leave_reason::LOBBY)
            ]
        );
    }

    #[tokio::test]
    async fn test_foreign_magic_is_protocol_error() {
        let (mut user, peer) = user_with_peer().await;
        write(&peer, &[0x01, 0x02, 4, 0]).await;
        let events = events_until(&mut user, |seen| !seen.is_empty()).await;
        assert_eq!(events, vec![UserEvent::ProtocolError]);
    }

    #[tokio::test]
    async fn test_gproxy_init_ack_and_reconnect() {
        let (mut user, peer) = user_with_peer().await;
        write(&peer, &gps::send_gpsc_init(1)).await;
        poll_until(|| {
            user.update(&tick());
            user.gproxy_enabled().then_some(())
        })
        .await
        .unwrap();
        let init = gps::receive_gpss_init(&read_exact(&peer, 12).await).unwrap();
        assert_eq!(init.uid, 3);
        assert_eq!(Some(init.reconnect_key), user.reconnect_key());

        for ticks in [1, 2, 3] {
            user.ping(ticks);
        }
        assert_eq!(user.gproxy_buffered(), 3);
        user.flush();
        read_exact(&peer, 24).await;

        write(&peer, &gps::send_gpsc_ack(2)).await;
        poll_until(|| {
            user.update(&tick());
            (user.gproxy_buffered() == 1).then_some(())
        })
        .await
        .unwrap();

        let (socket, new_peer) = connected_pair().await;
        let old = user.reconnect(socket, 2);
        assert!(old.is_some());
        user.flush();
        let replay = read_exact(&new_peer, 16).await;
        assert_eq!(gps::receive_gpss_reconnect(&replay[..8]), Some(0));
        assert_eq!(&replay[8..], w3gs::send_ping_from_host(3).as_slice());
    }

    #[tokio::test]
    async fn test_peer_close_reports_disconnect() {
        let (mut user, peer) = user_with_peer().await;
        drop(peer);
        let events = events_until(&mut user, |seen| !seen.is_empty()).await;
        assert_eq!(events, vec![UserEvent::Disconnected]);
        assert!(user.socket().is_none());
        assert!(user.disconnected_at().is_some());
    }
}
