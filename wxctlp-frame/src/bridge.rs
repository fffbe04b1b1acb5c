use crate::FrameError;

/// Leading bytes of a settings datagram. A packet datagram starts with its
/// length byte, which never exceeds 64, so `W` (0x57) cannot be confused
/// with one.
pub const SETTINGS_MAGIC: [u8; 4] = *b"WXCF";

/// AES-128 key carried in the settings
pub const KEY_LEN: usize = 16;

/// `magic | network | node | freq (u16 le) | receive | encrypted | key`
pub const SETTINGS_LEN: usize = SETTINGS_MAGIC.len() + 6 + KEY_LEN;

/// Radio settings pushed by the gateway to the bridge that owns the RFM69
/// module. The bridge applies them before it forwards or transmits anything
/// else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    pub network_id: u8,
    pub node_id: u8,
    /// Carrier band in MHz, 0 leaves the bridge's band untouched
    pub frequency_mhz: u16,
    /// Listen for packets; the module sleeps otherwise
    pub receive: bool,
    /// AES key, `None` turns payload encryption off
    pub key: Option<[u8; KEY_LEN]>,
}

impl BridgeSettings {
    pub fn is_settings(buf: &[u8]) -> bool {
        buf.starts_with(&SETTINGS_MAGIC)
    }

    pub fn encode(&self) -> [u8; SETTINGS_LEN] {
        let mut buf = [0u8; SETTINGS_LEN];
        buf[0..4].copy_from_slice(&SETTINGS_MAGIC);
        buf[4] = self.network_id;
        buf[5] = self.node_id;
        buf[6..8].copy_from_slice(&self.frequency_mhz.to_le_bytes());
        buf[8] = self.receive as u8;
        if let Some(key) = &self.key {
            buf[9] = 1;
            buf[10..].copy_from_slice(key);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if !Self::is_settings(buf) || buf.len() != SETTINGS_LEN {
            return Err(FrameError::NotSettings { len: buf.len() });
        }
        let key = match buf[9] {
            0 => None,
            _ => {
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&buf[10..]);
                Some(key)
            }
        };
        Ok(Self {
            network_id: buf[4],
            node_id: buf[5],
            frequency_mhz: u16::from_le_bytes([buf[6], buf[7]]),
            receive: buf[8] != 0,
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RadioPacket, HEADER_LEN, MAX_PAYLOAD_LEN};

    #[test]
    fn lays_out_settings_little_endian() {
        let settings = BridgeSettings {
            network_id: 100,
            node_id: 1,
            frequency_mhz: 868,
            receive: true,
            key: Some(*b"sampleEncryptKey"),
        };
        let buf = settings.encode();
        assert_eq!(&buf[..10], &[b'W', b'X', b'C', b'F', 100, 1, 0x64, 0x03, 1, 1]);
        assert_eq!(&buf[10..], b"sampleEncryptKey");
        assert_eq!(BridgeSettings::decode(&buf), Ok(settings));
    }

    #[test]
    fn missing_key_means_plaintext() {
        let settings = BridgeSettings {
            network_id: 7,
            node_id: 2,
            frequency_mhz: 0,
            receive: false,
            key: None,
        };
        let buf = settings.encode();
        assert_eq!(buf[9], 0);
        assert_eq!(BridgeSettings::decode(&buf).unwrap().key, None);
    }

    #[test]
    fn packets_are_never_taken_for_settings() {
        let packet = RadioPacket::new(1, 7, &[0xff; MAX_PAYLOAD_LEN]).unwrap();
        let mut buf = [0u8; HEADER_LEN + MAX_PAYLOAD_LEN];
        let len = packet.encode(&mut buf);
        assert!(!BridgeSettings::is_settings(&buf[..len]));
        assert_eq!(
            BridgeSettings::decode(&buf[..len]),
            Err(FrameError::NotSettings { len })
        );
        assert!(BridgeSettings::decode(&SETTINGS_MAGIC).is_err());
    }
}
