//! Stat string codec and the map/host fields it carries.
//!
//! Encoding removes every even byte value, NUL included, so the result can be
//! embedded as a C string. Even bytes are written as `b + 1`; a leading mask
//! byte per group of seven records which bytes were odd to begin with.

use crate::framing::Reader;

pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 7 + 1);
    for group in data.chunks(7) {
        let mut mask = 1u8;
        let mask_index = out.len();
        out.push(0);
        for (i, &b) in group.iter().enumerate() {
            if b % 2 == 0 {
                out.push(b.wrapping_add(1));
            } else {
                out.push(b);
                mask |= 1 << (i + 1);
            }
        }
        out[mask_index] = mask;
    }
    out
}

pub fn decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut mask = 0u8;
    for (i, &b) in data.iter().enumerate() {
        if i % 8 == 0 {
            mask = b;
        } else if mask & (1 << (i % 8)) == 0 {
            out.push(b.wrapping_sub(1));
        } else {
            out.push(b);
        }
    }
    out
}

/// Decoded contents of a stat string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapStats {
    pub map_flags: u32,
    pub map_width: u16,
    pub map_height: u16,
    pub map_crc: u32,
    pub map_path: String,
    pub host_name: String,
}

impl MapStats {
    /// Raw (pre-encoding) layout.
    pub fn to_raw(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(24 + self.map_path.len() + self.host_name.len());
        raw.extend_from_slice(&self.map_flags.to_le_bytes());
        raw.push(0);
        raw.extend_from_slice(&self.map_width.to_le_bytes());
        raw.extend_from_slice(&self.map_height.to_le_bytes());
        raw.extend_from_slice(&self.map_crc.to_le_bytes());
        raw.extend_from_slice(self.map_path.as_bytes());
        raw.push(0);
        raw.extend_from_slice(self.host_name.as_bytes());
        raw.push(0);
        raw.push(0);
        raw
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(&self.to_raw())
    }

    /// Parses a decoded stat string. Length is checked before every field.
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        if raw.len() < 14 {
            return None;
        }
        let mut reader = Reader::new(raw);
        let map_flags = reader.u32_le()?;
        reader.skip(1)?;
        let map_width = reader.u16_le()?;
        let map_height = reader.u16_le()?;
        let map_crc = reader.u32_le()?;
        let map_path = String::from_utf8_lossy(reader.cstring()?).into_owned();
        let host_name = String::from_utf8_lossy(reader.cstring()?).into_owned();
        Some(Self {
            map_flags,
            map_width,
            map_height,
            map_crc,
            map_path,
            host_name,
        })
    }

    pub fn decode(encoded: &[u8]) -> Option<Self> {
        Self::from_raw(&decode(encoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MapStats {
        MapStats {
            map_flags: 0x0000_6002,
            map_width: 116,
            map_height: 116,
            map_crc: 0xDEAD_BEEF,
            map_path: "Maps\\Download\\DotA v6.83d.w3x".to_string(),
            host_name: "Aura".to_string(),
        }
    }

    #[test]
    fn test_encoded_has_no_nul() {
        let encoded = sample().encode();
        assert!(!encoded.contains(&0));
    }

    #[test]
    fn test_decode_restores_fields() {
        let stats = sample();
        assert_eq!(MapStats::decode(&stats.encode()), Some(stats));
    }

    #[test]
    fn test_known_group() {
        assert_eq!(encode(&[0, 1, 2]), vec![0b0000_0101, 1, 1, 3]);
        assert_eq!(decode(&[0b0000_0101, 1, 1, 3]), vec![0, 1, 2]);
    }

    #[test]
    fn test_truncated_stats_rejected() {
        let raw = sample().to_raw();
        assert_eq!(MapStats::from_raw(&raw[..10]), None);
        // Path present but host name terminator missing.
        let cut = raw.len() - 3;
        assert_eq!(MapStats::from_raw(&raw[..cut]), None);
    }
}
