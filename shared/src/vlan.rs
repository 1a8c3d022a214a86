//! LAN discovery carried over a TCP tunnel.

use crate::framing::{validate_length, PacketBuilder, Reader};
use crate::product::Product;
use crate::w3gs::{read_gameinfo_head, write_gameinfo_head, GameInfo};
use std::net::Ipv4Addr;

pub const VLAN_HEADER: u8 = 0xFA;

pub mod opcode {
    pub const SEARCHGAME: u8 = 0x2F;
    pub const GAMEINFO: u8 = 0x30;
    pub const CREATEGAME: u8 = 0x31;
    pub const REFRESHGAME: u8 = 0x32;
    pub const DECREATEGAME: u8 = 0x33;
}

fn builder(op: u8) -> PacketBuilder {
    PacketBuilder::new(VLAN_HEADER, op)
}

fn body(packet: &[u8], op: u8, min_len: usize) -> Option<Reader<'_>> {
    if packet.len() < min_len
        || !validate_length(packet)
        || packet[0] != VLAN_HEADER
        || packet[1] != op
    {
        return None;
    }
    Some(Reader::body(packet))
}

/// Search request; the product id goes out in ASCII order.
pub fn send_vlan_searchgame(product: Product, version: u32) -> Vec<u8> {
    let id = match product {
        Product::ReignOfChaos => Product::ROC_ASCII,
        Product::FrozenThrone => Product::TFT_ASCII,
    };
    builder(opcode::SEARCHGAME).bytes(&id).u32_le(version).finish()
}

/// Returns `(product, version)`; either product byte order is accepted.
pub fn receive_vlan_searchgame(packet: &[u8]) -> Option<(Product, u32)> {
    let mut reader = body(packet, opcode::SEARCHGAME, 12)?;
    let product = Product::decode(reader.array::<4>()?)?;
    Some((product, reader.u32_le()?))
}

/// GAMEINFO as tunnelled over VLAN: the lobby address travels with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanGameInfo {
    pub info: GameInfo,
    pub ip: Ipv4Addr,
}

/// Same body as W3GS GAMEINFO, followed by the IP and a network-order port.
pub fn send_vlan_gameinfo(game: &VlanGameInfo) -> Vec<u8> {
    write_gameinfo_head(builder(opcode::GAMEINFO), &game.info)
        .bytes(&game.ip.octets())
        .u16_be(game.info.port)
        .finish()
}

pub fn receive_vlan_gameinfo(packet: &[u8]) -> Option<VlanGameInfo> {
    let mut reader = body(packet, opcode::GAMEINFO, 4)?;
    let mut info = read_gameinfo_head(&mut reader)?;
    let ip = Ipv4Addr::from(reader.array::<4>()?);
    info.port = reader.u16_be()?;
    Some(VlanGameInfo { info, ip })
}

pub fn send_vlan_creategame(product: Product, version: u32, host_counter: u32) -> Vec<u8> {
    builder(opcode::CREATEGAME)
        .bytes(&product.wire_bytes())
        .u32_le(version)
        .u32_le(host_counter)
        .finish()
}

/// Returns `(product, version, host_counter)`.
pub fn receive_vlan_creategame(packet: &[u8]) -> Option<(Product, u32, u32)> {
    let mut reader = body(packet, opcode::CREATEGAME, 16)?;
    let product = Product::decode(reader.array::<4>()?)?;
    Some((product, reader.u32_le()?, reader.u32_le()?))
}

pub fn send_vlan_refreshgame(host_counter: u32, players: u32, slots_total: u32) -> Vec<u8> {
    builder(opcode::REFRESHGAME)
        .u32_le(host_counter)
        .u32_le(players)
        .u32_le(slots_total)
        .finish()
}

/// Returns `(host_counter, players, slots_total)`.
pub fn receive_vlan_refreshgame(packet: &[u8]) -> Option<(u32, u32, u32)> {
    let mut reader = body(packet, opcode::REFRESHGAME, 16)?;
    Some((reader.u32_le()?, reader.u32_le()?, reader.u32_le()?))
}

pub fn send_vlan_decreategame(host_counter: u32) -> Vec<u8> {
    builder(opcode::DECREATEGAME).u32_le(host_counter).finish()
}

pub fn receive_vlan_decreategame(packet: &[u8]) -> Option<u32> {
    body(packet, opcode::DECREATEGAME, 8)?.u32_le()
}
