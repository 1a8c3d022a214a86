//! Game product identifiers embedded in discovery packets.

/// Reign of Chaos or The Frozen Throne.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Product {
    ReignOfChaos,
    FrozenThrone,
}

impl Product {
    /// ASCII reading order, as typed by humans.
    pub const ROC_ASCII: [u8; 4] = *b"WAR3";
    pub const TFT_ASCII: [u8; 4] = *b"W3XP";
    /// On-wire order of the little-endian integer form.
    pub const ROC_WIRE: [u8; 4] = *b"3RAW";
    pub const TFT_WIRE: [u8; 4] = *b"PX3W";

    /// Accepts either byte order. Anything else is not a product id.
    pub fn decode(raw: [u8; 4]) -> Option<Self> {
        match raw {
            Self::ROC_ASCII | Self::ROC_WIRE => Some(Self::ReignOfChaos),
            Self::TFT_ASCII | Self::TFT_WIRE => Some(Self::FrozenThrone),
            _ => None,
        }
    }

    /// Bytes written into outgoing packets.
    pub fn wire_bytes(self) -> [u8; 4] {
        match self {
            Self::ReignOfChaos => Self::ROC_WIRE,
            Self::FrozenThrone => Self::TFT_WIRE,
        }
    }

    pub fn is_tft(self) -> bool {
        self == Self::FrozenThrone
    }

    pub fn from_tft(tft: bool) -> Self {
        if tft {
            Self::FrozenThrone
        } else {
            Self::ReignOfChaos
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_orders_decode() {
        assert_eq!(Product::decode(*b"WAR3"), Some(Product::ReignOfChaos));
        assert_eq!(Product::decode(*b"3RAW"), Some(Product::ReignOfChaos));
        assert_eq!(Product::decode(*b"W3XP"), Some(Product::FrozenThrone));
        assert_eq!(Product::decode(*b"PX3W"), Some(Product::FrozenThrone));
        assert_eq!(Product::decode(*b"D2XP"), None);
    }

    #[test]
    fn test_wire_bytes_pinned() {
        assert_eq!(Product::FrozenThrone.wire_bytes(), [0x50, 0x58, 0x33, 0x57]);
        assert_eq!(Product::ReignOfChaos.wire_bytes(), [0x33, 0x52, 0x41, 0x57]);
        assert_eq!(
            u32::from_le_bytes(Product::FrozenThrone.wire_bytes()),
            u32::from_be_bytes(*b"W3XP")
        );
    }
}
