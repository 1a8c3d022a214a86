//! GProxy reconnect protocol.
//!
//! `send_gpss_*` builds server to client packets, `send_gpsc_*` builds client
//! to server packets. The client side exists for probes and tests.

use crate::framing::{validate_length, PacketBuilder, Reader};

pub const GPS_HEADER: u8 = 0xF8;

pub mod opcode {
    pub const INIT: u8 = 1;
    pub const RECONNECT: u8 = 2;
    pub const ACK: u8 = 3;
    pub const REJECT: u8 = 4;
    pub const UDPSYN: u8 = 11;
    pub const UDPACK: u8 = 12;
    pub const UDPFIN: u8 = 13;
    pub const SUPPORT_EXTENDED: u8 = 50;
    pub const CHANGEKEY: u8 = 51;
}

pub mod reject_reason {
    pub const INVALID: u32 = 1;
    pub const NOT_FOUND: u32 = 2;
}

/// Minimum length of a client RECONNECT; four more bytes carry a game id.
pub const RECONNECT_MIN_LEN: usize = 13;
pub const RECONNECT_EXTENDED_LEN: usize = 17;

fn builder(op: u8) -> PacketBuilder {
    PacketBuilder::new(GPS_HEADER, op)
}

fn body(packet: &[u8], op: u8, min_len: usize) -> Option<Reader<'_>> {
    if packet.len() < min_len
        || !validate_length(packet)
        || packet[0] != GPS_HEADER
        || packet[1] != op
    {
        return None;
    }
    Some(Reader::body(packet))
}

/// Server greeting once a user enables GProxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsInit {
    pub reconnect_port: u16,
    pub uid: u8,
    pub reconnect_key: u32,
    pub empty_actions: u8,
}

pub fn send_gpss_init(init: &GpsInit) -> Vec<u8> {
    builder(opcode::INIT)
        .u16_le(init.reconnect_port)
        .u8(init.uid)
        .u32_le(init.reconnect_key)
        .u8(init.empty_actions)
        .finish()
}

pub fn receive_gpss_init(packet: &[u8]) -> Option<GpsInit> {
    let mut reader = body(packet, opcode::INIT, 12)?;
    Some(GpsInit {
        reconnect_port: reader.u16_le()?,
        uid: reader.u8()?,
        reconnect_key: reader.u32_le()?,
        empty_actions: reader.u8()?,
    })
}

/// Tells a reconnected client how many packets the server has received.
pub fn send_gpss_reconnect(last_packet: u32) -> Vec<u8> {
    builder(opcode::RECONNECT).u32_le(last_packet).finish()
}

pub fn receive_gpss_reconnect(packet: &[u8]) -> Option<u32> {
    body(packet, opcode::RECONNECT, 8)?.u32_le()
}

pub fn send_gpss_ack(last_packet: u32) -> Vec<u8> {
    builder(opcode::ACK).u32_le(last_packet).finish()
}

pub fn send_gpss_reject(reason: u32) -> Vec<u8> {
    builder(opcode::REJECT).u32_le(reason).finish()
}

pub fn receive_gpss_reject(packet: &[u8]) -> Option<u32> {
    body(packet, opcode::REJECT, 8)?.u32_le()
}

pub fn send_gpss_udpack() -> Vec<u8> {
    builder(opcode::UDPACK).finish()
}

pub fn send_gpss_changekey(key: u32) -> Vec<u8> {
    builder(opcode::CHANGEKEY).u32_le(key).finish()
}

/// Reconnect window in seconds, then the game id only when it is nonzero.
pub fn send_gpss_support_extended(ticks: u64, game_id: u32) -> Vec<u8> {
    let b = builder(opcode::SUPPORT_EXTENDED).u32_le((ticks / 1000) as u32);
    if game_id != 0 {
        b.u32_le(game_id).finish()
    } else {
        b.finish()
    }
}

/// Returns `(elapsed_secs, game_id)`.
pub fn receive_gpss_support_extended(packet: &[u8]) -> Option<(u32, Option<u32>)> {
    let mut reader = body(packet, opcode::SUPPORT_EXTENDED, 8)?;
    let secs = reader.u32_le()?;
    let game_id = if reader.remaining() >= 4 {
        reader.u32_le()
    } else {
        None
    };
    Some((secs, game_id))
}

pub fn send_gpsc_init(version: u32) -> Vec<u8> {
    builder(opcode::INIT).u32_le(version).finish()
}

pub fn receive_gpsc_init(packet: &[u8]) -> Option<u32> {
    body(packet, opcode::INIT, 8)?.u32_le()
}

/// Client reconnect request. `game_id` is present on extended clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsReconnect {
    pub uid: u8,
    pub reconnect_key: u32,
    pub last_packet: u32,
    pub game_id: Option<u32>,
}

pub fn send_gpsc_reconnect(request: &GpsReconnect) -> Vec<u8> {
    let b = builder(opcode::RECONNECT)
        .u8(request.uid)
        .u32_le(request.reconnect_key)
        .u32_le(request.last_packet);
    match request.game_id {
        Some(game_id) => b.u32_le(game_id).finish(),
        None => b.finish(),
    }
}

pub fn receive_gpsc_reconnect(packet: &[u8]) -> Option<GpsReconnect> {
    let mut reader = body(packet, opcode::RECONNECT, RECONNECT_MIN_LEN)?;
    let uid = reader.u8()?;
    let reconnect_key = reader.u32_le()?;
    let last_packet = reader.u32_le()?;
    let game_id = if packet.len() >= RECONNECT_EXTENDED_LEN {
        reader.u32_le()
    } else {
        None
    };
    Some(GpsReconnect {
        uid,
        reconnect_key,
        last_packet,
        game_id,
    })
}

pub fn send_gpsc_ack(last_packet: u32) -> Vec<u8> {
    builder(opcode::ACK).u32_le(last_packet).finish()
}

pub fn receive_gpsc_ack(packet: &[u8]) -> Option<u32> {
    body(packet, opcode::ACK, 8)?.u32_le()
}

pub fn send_gpsc_support_extended(version: u32) -> Vec<u8> {
    builder(opcode::SUPPORT_EXTENDED).u32_le(version).finish()
}

pub fn receive_gpsc_support_extended(packet: &[u8]) -> Option<u32> {
    body(packet, opcode::SUPPORT_EXTENDED, 8)?.u32_le()
}

pub fn send_gpsc_udpsyn() -> Vec<u8> {
    builder(opcode::UDPSYN).finish()
}
