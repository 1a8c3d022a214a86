//! W3GS game protocol, limited to what a lobby host and its probes exchange.

use crate::framing::{validate_length, PacketBuilder, Reader};
use crate::product::Product;
use crate::stat_string::MapStats;
use std::net::Ipv4Addr;

pub const W3GS_HEADER: u8 = 0xF7;

pub mod opcode {
    pub const PING_FROM_HOST: u8 = 0x01;
    pub const SLOTINFOJOIN: u8 = 0x04;
    pub const REJECTJOIN: u8 = 0x05;
    pub const PLAYERINFO: u8 = 0x06;
    pub const PLAYERLEAVE_OTHERS: u8 = 0x07;
    pub const GAMELOADED_OTHERS: u8 = 0x08;
    pub const SLOTINFO: u8 = 0x09;
    pub const COUNTDOWN_START: u8 = 0x0A;
    pub const COUNTDOWN_END: u8 = 0x0B;
    pub const INCOMING_ACTION: u8 = 0x0C;
    pub const REQJOIN: u8 = 0x1E;
    pub const LEAVEGAME: u8 = 0x21;
    pub const GAMELOADED_SELF: u8 = 0x23;
    pub const OUTGOING_ACTION: u8 = 0x26;
    pub const OUTGOING_KEEPALIVE: u8 = 0x27;
    pub const CHAT_TO_HOST: u8 = 0x28;
    pub const SEARCHGAME: u8 = 0x2F;
    pub const GAMEINFO: u8 = 0x30;
    pub const CREATEGAME: u8 = 0x31;
    pub const REFRESHGAME: u8 = 0x32;
    pub const DECREATEGAME: u8 = 0x33;
    pub const PONG_TO_HOST: u8 = 0x46;
    pub const INCOMING_ACTION2: u8 = 0x48;
}

pub mod reject_reason {
    pub const FULL: u32 = 9;
    pub const STARTED: u32 = 10;
    pub const WRONG_PASSWORD: u32 = 27;
}

pub mod leave_reason {
    pub const DISCONNECT: u32 = 0x01;
    pub const LOST: u32 = 0x07;
    pub const LOBBY: u32 = 0x0D;
}

/// LAN discovery opcodes (`SEARCHGAME..=DECREATEGAME`).
pub fn is_discovery_opcode(op: u8) -> bool {
    (opcode::SEARCHGAME..=opcode::DECREATEGAME).contains(&op)
}

fn builder(op: u8) -> PacketBuilder {
    PacketBuilder::new(W3GS_HEADER, op)
}

fn body(packet: &[u8], op: u8) -> Option<Reader<'_>> {
    if !validate_length(packet) || packet[0] != W3GS_HEADER || packet[1] != op {
        return None;
    }
    Some(Reader::body(packet))
}

/// Join request sent by a client to a lobby.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingJoinRequest {
    pub host_counter: u32,
    pub entry_key: u32,
    pub listen_port: u16,
    pub peer_key: u32,
    pub name: String,
    pub internal_ip: Ipv4Addr,
}

pub fn receive_reqjoin(packet: &[u8]) -> Option<IncomingJoinRequest> {
    if packet.len() < 20 {
        return None;
    }
    let mut reader = body(packet, opcode::REQJOIN)?;
    let host_counter = reader.u32_le()?;
    let entry_key = reader.u32_le()?;
    reader.skip(1)?;
    let listen_port = reader.u16_le()?;
    let peer_key = reader.u32_le()?;
    let name = reader.cstring()?;
    if name.is_empty() || packet.len() < name.len() + 30 {
        return None;
    }
    // Unknown u32 and internal port precede the internal address.
    reader.skip(6)?;
    let ip = reader.array::<4>()?;
    Some(IncomingJoinRequest {
        host_counter,
        entry_key,
        listen_port,
        peer_key,
        name: String::from_utf8_lossy(name).into_owned(),
        internal_ip: Ipv4Addr::from(ip),
    })
}

pub fn send_reqjoin(request: &IncomingJoinRequest) -> Vec<u8> {
    builder(opcode::REQJOIN)
        .u32_le(request.host_counter)
        .u32_le(request.entry_key)
        .u8(0)
        .u16_le(request.listen_port)
        .u32_le(request.peer_key)
        .cstring(request.name.as_bytes())
        .u32_le(0)
        .u16_le(2)
        .bytes(&request.internal_ip.octets())
        .bytes(&[0u8; 8])
        .finish()
}

/// One lobby slot as laid out in SLOTINFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotData {
    pub uid: u8,
    pub download_status: u8,
    pub slot_status: u8,
    pub computer: u8,
    pub team: u8,
    pub color: u8,
    pub race: u8,
    pub computer_type: u8,
    pub handicap: u8,
}

pub mod slot_status {
    pub const OPEN: u8 = 0;
    pub const CLOSED: u8 = 1;
    pub const OCCUPIED: u8 = 2;
}

impl SlotData {
    pub fn open(team: u8, color: u8) -> Self {
        Self {
            uid: 0,
            download_status: 255,
            slot_status: slot_status::OPEN,
            computer: 0,
            team,
            color,
            race: 32,
            computer_type: 1,
            handicap: 100,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[
            self.uid,
            self.download_status,
            self.slot_status,
            self.computer,
            self.team,
            self.color,
            self.race,
            self.computer_type,
            self.handicap,
        ]);
    }
}

/// Serialises the slot table shared by SLOTINFO and SLOTINFOJOIN.
pub fn encode_slot_info(slots: &[SlotData], random_seed: u32, layout_style: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + slots.len() * 9);
    out.push(slots.len() as u8);
    for slot in slots {
        slot.encode(&mut out);
    }
    out.extend_from_slice(&random_seed.to_le_bytes());
    out.push(layout_style);
    out.push(slots.len() as u8);
    out
}

pub fn send_slotinfojoin(uid: u8, slot_info: &[u8], port: u16, external_ip: Ipv4Addr) -> Vec<u8> {
    builder(opcode::SLOTINFOJOIN)
        .u16_le(slot_info.len() as u16)
        .bytes(slot_info)
        .u8(uid)
        .bytes(&[2, 0])
        .u16_be(port)
        .bytes(&external_ip.octets())
        .bytes(&[0u8; 8])
        .finish()
}

/// Returns the UID assigned by a SLOTINFOJOIN.
pub fn receive_slotinfojoin(packet: &[u8]) -> Option<u8> {
    let mut reader = body(packet, opcode::SLOTINFOJOIN)?;
    let slot_info_len = reader.u16_le()? as usize;
    reader.skip(slot_info_len)?;
    reader.u8()
}

pub fn send_slotinfo(slot_info: &[u8]) -> Vec<u8> {
    builder(opcode::SLOTINFO)
        .u16_le(slot_info.len() as u16)
        .bytes(slot_info)
        .finish()
}

pub fn send_rejectjoin(reason: u32) -> Vec<u8> {
    builder(opcode::REJECTJOIN).u32_le(reason).finish()
}

pub fn receive_rejectjoin(packet: &[u8]) -> Option<u32> {
    body(packet, opcode::REJECTJOIN)?.u32_le()
}

pub fn send_playerinfo(uid: u8, name: &str, external_ip: Ipv4Addr, internal_ip: Ipv4Addr) -> Vec<u8> {
    builder(opcode::PLAYERINFO)
        .u32_le(2)
        .u8(uid)
        .cstring(name.as_bytes())
        .u8(1)
        .u8(0)
        .bytes(&[2, 0, 0, 0])
        .bytes(&external_ip.octets())
        .bytes(&[0u8; 8])
        .bytes(&[2, 0, 0, 0])
        .bytes(&internal_ip.octets())
        .bytes(&[0u8; 8])
        .finish()
}

pub fn send_playerleave_others(uid: u8, reason: u32) -> Vec<u8> {
    builder(opcode::PLAYERLEAVE_OTHERS)
        .u8(uid)
        .u32_le(reason)
        .finish()
}

/// Returns `(uid, reason)`.
pub fn receive_playerleave_others(packet: &[u8]) -> Option<(u8, u32)> {
    let mut reader = body(packet, opcode::PLAYERLEAVE_OTHERS)?;
    Some((reader.u8()?, reader.u32_le()?))
}

pub fn send_gameloaded_others(uid: u8) -> Vec<u8> {
    builder(opcode::GAMELOADED_OTHERS).u8(uid).finish()
}

pub fn send_countdown_start() -> Vec<u8> {
    builder(opcode::COUNTDOWN_START).finish()
}

pub fn send_countdown_end() -> Vec<u8> {
    builder(opcode::COUNTDOWN_END).finish()
}

pub fn send_ping_from_host(ticks: u32) -> Vec<u8> {
    builder(opcode::PING_FROM_HOST).u32_le(ticks).finish()
}

pub fn send_pong_to_host(ticks: u32) -> Vec<u8> {
    builder(opcode::PONG_TO_HOST).u32_le(ticks).finish()
}

pub fn receive_pong_to_host(packet: &[u8]) -> Option<u32> {
    body(packet, opcode::PONG_TO_HOST)?.u32_le()
}

pub fn send_gameloaded_self() -> Vec<u8> {
    builder(opcode::GAMELOADED_SELF).finish()
}

pub fn receive_leavegame(packet: &[u8]) -> Option<u32> {
    body(packet, opcode::LEAVEGAME)?.u32_le()
}

pub fn send_leavegame(reason: u32) -> Vec<u8> {
    builder(opcode::LEAVEGAME).u32_le(reason).finish()
}

/// Returns the action payload that follows the client's 4-byte CRC.
pub fn receive_outgoing_action(packet: &[u8]) -> Option<Vec<u8>> {
    let mut reader = body(packet, opcode::OUTGOING_ACTION)?;
    reader.skip(4)?;
    let action = reader.rest();
    if action.is_empty() {
        return None;
    }
    Some(action.to_vec())
}

pub fn send_outgoing_action(action: &[u8]) -> Vec<u8> {
    builder(opcode::OUTGOING_ACTION)
        .u32_le(0)
        .bytes(action)
        .finish()
}

/// Returns the client's game-state checksum.
pub fn receive_outgoing_keepalive(packet: &[u8]) -> Option<u32> {
    let mut reader = body(packet, opcode::OUTGOING_KEEPALIVE)?;
    reader.skip(1)?;
    reader.u32_le()
}

/// One player's action inside an action frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingAction {
    pub uid: u8,
    pub data: Vec<u8>,
}

impl IncomingAction {
    /// Size on the wire: UID, u16 length, payload.
    pub fn wire_len(&self) -> usize {
        3 + self.data.len()
    }
}

fn action_subpacket(actions: &[IncomingAction]) -> Vec<u8> {
    let mut sub = Vec::with_capacity(actions.iter().map(IncomingAction::wire_len).sum());
    for action in actions {
        sub.push(action.uid);
        sub.extend_from_slice(&(action.data.len() as u16).to_le_bytes());
        sub.extend_from_slice(&action.data);
    }
    sub
}

/// Low 16 bits of the CRC32 of the action sub-packet.
pub fn action_checksum(subpacket: &[u8]) -> u16 {
    (crc32fast::hash(subpacket) & 0xFFFF) as u16
}

/// Final packet of a frame: carries the time until the next frame.
pub fn send_incoming_action(send_interval: u16, actions: &[IncomingAction]) -> Vec<u8> {
    let b = builder(opcode::INCOMING_ACTION).u16_le(send_interval);
    if actions.is_empty() {
        return b.finish();
    }
    let sub = action_subpacket(actions);
    b.u16_le(action_checksum(&sub)).bytes(&sub).finish()
}

/// Non-final packet of a frame: more actions follow in the same frame.
pub fn send_incoming_action2(actions: &[IncomingAction]) -> Vec<u8> {
    let sub = action_subpacket(actions);
    builder(opcode::INCOMING_ACTION2)
        .u16_le(0)
        .u16_le(action_checksum(&sub))
        .bytes(&sub)
        .finish()
}

fn parse_actions(reader: &mut Reader<'_>) -> Option<Vec<IncomingAction>> {
    let mut actions = Vec::new();
    while reader.remaining() > 0 {
        let uid = reader.u8()?;
        let len = reader.u16_le()? as usize;
        actions.push(IncomingAction {
            uid,
            data: reader.take(len)?.to_vec(),
        });
    }
    Some(actions)
}

/// Returns `(send_interval, actions)` of an INCOMING_ACTION packet.
pub fn receive_incoming_action(packet: &[u8]) -> Option<(u16, Vec<IncomingAction>)> {
    let mut reader = body(packet, opcode::INCOMING_ACTION)?;
    let interval = reader.u16_le()?;
    if reader.remaining() == 0 {
        return Some((interval, Vec::new()));
    }
    let checksum = reader.u16_le()?;
    let sub_start = reader.position();
    if action_checksum(&packet[sub_start..]) != checksum {
        return None;
    }
    Some((interval, parse_actions(&mut reader)?))
}

pub fn receive_incoming_action2(packet: &[u8]) -> Option<Vec<IncomingAction>> {
    let mut reader = body(packet, opcode::INCOMING_ACTION2)?;
    reader.skip(2)?;
    let checksum = reader.u16_le()?;
    if action_checksum(&packet[reader.position()..]) != checksum {
        return None;
    }
    parse_actions(&mut reader)
}

pub fn send_searchgame(product: Product, version: u32) -> Vec<u8> {
    builder(opcode::SEARCHGAME)
        .bytes(&product.wire_bytes())
        .u32_le(version)
        .u32_le(0)
        .finish()
}

/// Returns `(product, version)` of a LAN search. Requires the full 16 bytes.
pub fn receive_searchgame(packet: &[u8]) -> Option<(Product, u32)> {
    if packet.len() < 16 {
        return None;
    }
    let mut reader = body(packet, opcode::SEARCHGAME)?;
    let product = Product::decode(reader.array::<4>()?)?;
    let version = reader.u32_le()?;
    Some((product, version))
}

/// Lobby advertisement fields shared by W3GS and VLAN GAMEINFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInfo {
    pub product: Product,
    pub version: u32,
    pub host_counter: u32,
    pub entry_key: u32,
    pub game_name: String,
    pub stats: MapStats,
    pub slots_total: u32,
    pub game_type: u32,
    pub slots_open: u32,
    pub elapsed_secs: u32,
    pub port: u16,
}

pub(crate) fn write_gameinfo_head(b: PacketBuilder, info: &GameInfo) -> PacketBuilder {
    b.bytes(&info.product.wire_bytes())
        .u32_le(info.version)
        .u32_le(info.host_counter)
        .u32_le(info.entry_key)
        .cstring(info.game_name.as_bytes())
        .u8(0)
        .cstring(&info.stats.encode())
        .u32_le(info.slots_total)
        .u32_le(info.game_type)
        .u32_le(1)
        .u32_le(info.slots_open)
        .u32_le(info.elapsed_secs)
}

/// Fields of GAMEINFO up to and including elapsed time; the port follows.
pub(crate) fn read_gameinfo_head(reader: &mut Reader<'_>) -> Option<GameInfo> {
    let product = Product::decode(reader.array::<4>()?)?;
    let version = reader.u32_le()?;
    let host_counter = reader.u32_le()?;
    let entry_key = reader.u32_le()?;
    let game_name = String::from_utf8_lossy(reader.cstring()?).into_owned();
    reader.skip(1)?;
    let stats = MapStats::decode(reader.cstring()?)?;
    let slots_total = reader.u32_le()?;
    let game_type = reader.u32_le()?;
    reader.skip(4)?;
    let slots_open = reader.u32_le()?;
    let elapsed_secs = reader.u32_le()?;
    Some(GameInfo {
        product,
        version,
        host_counter,
        entry_key,
        game_name,
        stats,
        slots_total,
        game_type,
        slots_open,
        elapsed_secs,
        port: 0,
    })
}

/// LAN advertisement. The trailing port is little-endian here.
pub fn send_gameinfo(info: &GameInfo) -> Vec<u8> {
    write_gameinfo_head(builder(opcode::GAMEINFO), info)
        .u16_le(info.port)
        .finish()
}

pub fn receive_gameinfo(packet: &[u8]) -> Option<GameInfo> {
    let mut reader = body(packet, opcode::GAMEINFO)?;
    let mut info = read_gameinfo_head(&mut reader)?;
    info.port = reader.u16_le()?;
    Some(info)
}

pub fn send_creategame(product: Product, version: u32, host_counter: u32) -> Vec<u8> {
    builder(opcode::CREATEGAME)
        .bytes(&product.wire_bytes())
        .u32_le(version)
        .u32_le(host_counter)
        .finish()
}

pub fn send_refreshgame(host_counter: u32, players: u32, slots_total: u32) -> Vec<u8> {
    builder(opcode::REFRESHGAME)
        .u32_le(host_counter)
        .u32_le(players)
        .u32_le(slots_total)
        .finish()
}

pub fn send_decreategame(host_counter: u32) -> Vec<u8> {
    builder(opcode::DECREATEGAME).u32_le(host_counter).finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join() -> IncomingJoinRequest {
        IncomingJoinRequest {
            host_counter: 42,
            entry_key: 0x1234_5678,
            listen_port: 6112,
            peer_key: 7,
            name: "Grubby".to_string(),
            internal_ip: Ipv4Addr::new(192, 168, 0, 10),
        }
    }

    fn sample_info() -> GameInfo {
        GameInfo {
            product: Product::FrozenThrone,
            version: 27,
            host_counter: 3,
            entry_key: 99,
            game_name: "dota -ap".to_string(),
            stats: MapStats {
                map_flags: 2,
                map_width: 64,
                map_height: 64,
                map_crc: 0xABCD,
                map_path: "Maps\\test.w3x".to_string(),
                host_name: "Aura".to_string(),
            },
            slots_total: 12,
            game_type: 1,
            slots_open: 10,
            elapsed_secs: 30,
            port: 6113,
        }
    }

    #[test]
    fn test_reqjoin_layout() {
        let bytes = send_reqjoin(&join());
        assert_eq!(&bytes[..2], &[0xF7, 0x1E]);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]) as usize, bytes.len());
        assert_eq!(&bytes[4..8], &42u32.to_le_bytes());
        assert_eq!(receive_reqjoin(&bytes), Some(join()));
    }

    #[test]
    fn test_reqjoin_rejects_short_and_empty_name() {
        let bytes = send_reqjoin(&join());
        let mut short = bytes[..bytes.len() - 3].to_vec();
        let len = short.len() as u16;
        short[2..4].copy_from_slice(&len.to_le_bytes());
        assert_eq!(receive_reqjoin(&short), None);

        let mut anonymous = join();
        anonymous.name.clear();
        assert_eq!(receive_reqjoin(&send_reqjoin(&anonymous)), None);
        assert_eq!(receive_reqjoin(&[0xF7, 0x1E, 4, 0]), None);
    }

    #[test]
    fn test_slotinfojoin_carries_uid() {
        let info = encode_slot_info(&[SlotData::open(0, 0), SlotData::open(1, 1)], 5, 3);
        let bytes = send_slotinfojoin(2, &info, 6113, Ipv4Addr::LOCALHOST);
        assert_eq!(receive_slotinfojoin(&bytes), Some(2));
        assert_eq!(&bytes[bytes.len() - 14..bytes.len() - 12], &6113u16.to_be_bytes());
    }

    #[test]
    fn test_incoming_action_checksum() {
        let actions = vec![
            IncomingAction { uid: 1, data: vec![0x10, 0x20] },
            IncomingAction { uid: 2, data: vec![0x30] },
        ];
        let bytes = send_incoming_action(100, &actions);
        assert_eq!(receive_incoming_action(&bytes), Some((100, actions.clone())));

        let mut corrupt = bytes.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        assert_eq!(receive_incoming_action(&corrupt), None);

        let more = send_incoming_action2(&actions);
        assert_eq!(more[1], opcode::INCOMING_ACTION2);
        assert_eq!(receive_incoming_action2(&more), Some(actions));
    }

    #[test]
    fn test_empty_incoming_action_has_no_checksum() {
        let bytes = send_incoming_action(250, &[]);
        assert_eq!(bytes, vec![0xF7, 0x0C, 6, 0, 250, 0]);
        assert_eq!(receive_incoming_action(&bytes), Some((250, Vec::new())));
    }

    #[test]
    fn test_searchgame_both_product_orders() {
        let wire = send_searchgame(Product::FrozenThrone, 26);
        assert_eq!(&wire[4..8], b"PX3W");
        assert_eq!(receive_searchgame(&wire), Some((Product::FrozenThrone, 26)));

        let mut ascii = wire.clone();
        ascii[4..8].copy_from_slice(b"W3XP");
        assert_eq!(receive_searchgame(&ascii), Some((Product::FrozenThrone, 26)));

        assert_eq!(receive_searchgame(&wire[..12]), None);
    }

    #[test]
    fn test_gameinfo_fields() {
        let info = sample_info();
        let bytes = send_gameinfo(&info);
        assert_eq!(&bytes[bytes.len() - 2..], &6113u16.to_le_bytes());
        assert_eq!(receive_gameinfo(&bytes), Some(info));
        assert_eq!(receive_gameinfo(&bytes[..bytes.len() - 1]), None);
    }

    #[test]
    fn test_discovery_range() {
        assert!(is_discovery_opcode(opcode::SEARCHGAME));
        assert!(is_discovery_opcode(opcode::DECREATEGAME));
        assert!(!is_discovery_opcode(opcode::REQJOIN));
        assert!(!is_discovery_opcode(opcode::CHAT_TO_HOST));
    }

    #[test]
    fn test_keepalive_and_pong() {
        let keepalive = PacketBuilder::new(W3GS_HEADER, opcode::OUTGOING_KEEPALIVE)
            .u8(0)
            .u32_le(0xCAFE)
            .finish();
        assert_eq!(receive_outgoing_keepalive(&keepalive), Some(0xCAFE));

        let pong = PacketBuilder::new(W3GS_HEADER, opcode::PONG_TO_HOST)
            .u32_le(1234)
            .finish();
        assert_eq!(receive_pong_to_host(&pong), Some(1234));
        assert_eq!(receive_pong_to_host(&send_ping_from_host(1234)), None);
    }
}
