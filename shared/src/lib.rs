//! Wire codecs shared by the host and its diagnostic clients.
//!
//! Every protocol spoken by the host rides on the same 4-byte envelope:
//! one magic byte naming the protocol family, one opcode byte, and a
//! little-endian `u16` total length that includes the header itself.
//!
//! - [`w3gs`]: the Warcraft III game/lobby protocol subset the host needs
//! - [`gps`]: the GProxy reconnect protocol
//! - [`vlan`]: LAN discovery carried over a TCP tunnel
//! - [`stat_string`]: the even-byte-free encoding nested inside GAMEINFO
//! - [`relay`]: encapsulation for forwarded UDP datagrams
//!
//! Builders are named `send_*` and return finished packets with the length
//! backpatched. Parsers are named `receive_*` and return `None` for anything
//! malformed; they never panic on short or hostile input.

pub mod framing;
pub mod gps;
pub mod product;
pub mod relay;
pub mod stat_string;
pub mod vlan;
pub mod w3gs;

pub use framing::{
    scan_frames, FrameScan, FrameVerdict, PacketBuilder, PacketHeader, Reader, HEADER_SIZE,
};
pub use product::Product;

/// Canonical LAN discovery port used by game clients.
pub const LAN_PORT: u16 = 6112;
