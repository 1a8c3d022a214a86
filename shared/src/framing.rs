//! Length-prefixed packet envelope shared by W3GS, GPS and VLAN.

/// Size of the magic/opcode/length header.
pub const HEADER_SIZE: usize = 4;

/// Decoded envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u8,
    pub opcode: u8,
    /// Total packet length, header included.
    pub length: u16,
}

impl PacketHeader {
    /// Reads the header at the front of `buf`, if four bytes are available.
    pub fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: buf[0],
            opcode: buf[1],
            length: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }
}

/// True when `packet` is exactly as long as its header claims.
pub fn validate_length(packet: &[u8]) -> bool {
    match PacketHeader::peek(packet) {
        Some(header) => header.length as usize == packet.len(),
        None => false,
    }
}

/// What a role's dispatcher decided about one framed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameVerdict<S> {
    /// Packet handled, keep scanning.
    Continue,
    /// Packet handled and consumed, stop scanning with this outcome.
    Stop(S),
    /// Stop scanning without consuming this packet; the new owner re-reads it.
    Passthrough(S),
    /// Protocol violation.
    Abort,
}

/// Result of running the framing loop over a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameScan<S> {
    /// Bytes at the front of the buffer that were fully processed.
    pub consumed: usize,
    /// Set when the dispatcher stopped the scan.
    pub stopped: Option<S>,
    /// Set on a malformed length or a rejected packet.
    pub aborted: bool,
}

/// Peels complete packets off the front of `buf` and hands each to `dispatch`.
///
/// A declared length below [`HEADER_SIZE`] aborts. A packet whose declared
/// length runs past the end of `buf` is left alone for the next read.
pub fn scan_frames<S, F>(buf: &[u8], mut dispatch: F) -> FrameScan<S>
where
    F: FnMut(&[u8]) -> FrameVerdict<S>,
{
    let mut consumed = 0;

    while let Some(header) = PacketHeader::peek(&buf[consumed..]) {
        let length = header.length as usize;
        if length < HEADER_SIZE {
            return FrameScan {
                consumed,
                stopped: None,
                aborted: true,
            };
        }
        if buf.len() - consumed < length {
            break;
        }

        let packet = &buf[consumed..consumed + length];
        match dispatch(packet) {
            FrameVerdict::Continue => consumed += length,
            FrameVerdict::Stop(outcome) => {
                return FrameScan {
                    consumed: consumed + length,
                    stopped: Some(outcome),
                    aborted: false,
                };
            }
            FrameVerdict::Passthrough(outcome) => {
                return FrameScan {
                    consumed,
                    stopped: Some(outcome),
                    aborted: false,
                };
            }
            FrameVerdict::Abort => {
                return FrameScan {
                    consumed,
                    stopped: None,
                    aborted: true,
                };
            }
        }
    }

    FrameScan {
        consumed,
        stopped: None,
        aborted: false,
    }
}

/// Builds one packet and backpatches its length on [`PacketBuilder::finish`].
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    bytes: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(magic: u8, opcode: u8) -> Self {
        let mut bytes = Vec::with_capacity(32);
        bytes.extend_from_slice(&[magic, opcode, 0, 0]);
        Self { bytes }
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.bytes.push(value);
        self
    }

    pub fn u16_le(mut self, value: u16) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Network byte order, as used for ports embedded in socket addresses.
    pub fn u16_be(mut self, value: u16) -> Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn u32_le(mut self, value: u32) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.bytes.extend_from_slice(value);
        self
    }

    /// Appends `value` followed by a NUL terminator.
    pub fn cstring(mut self, value: &[u8]) -> Self {
        self.bytes.extend_from_slice(value);
        self.bytes.push(0);
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() == HEADER_SIZE
    }

    pub fn finish(mut self) -> Vec<u8> {
        let length = self.bytes.len().min(u16::MAX as usize) as u16;
        self.bytes[2..4].copy_from_slice(&length.to_le_bytes());
        self.bytes
    }
}

/// Bounds-checked cursor over a packet body.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Starts reading after the 4-byte header.
    pub fn body(packet: &'a [u8]) -> Self {
        Self {
            data: packet,
            pos: HEADER_SIZE.min(packet.len()),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    pub fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Some(out)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn u16_le(&mut self) -> Option<u16> {
        self.array::<2>().map(u16::from_le_bytes)
    }

    pub fn u16_be(&mut self) -> Option<u16> {
        self.array::<2>().map(u16::from_be_bytes)
    }

    pub fn u32_le(&mut self) -> Option<u32> {
        self.array::<4>().map(u32::from_le_bytes)
    }

    /// Reads up to the next NUL and skips it. Fails if no NUL remains.
    pub fn cstring(&mut self) -> Option<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|&b| b == 0)?;
        self.pos += end + 1;
        Some(&rest[..end])
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}
