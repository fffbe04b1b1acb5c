use async_trait::async_trait;
use std::{fmt, str::FromStr};
use wxctlp_frame::RadioPacket;

use crate::RadioError;

/// RFM69 AES-128 key size
pub const ENCRYPTION_KEY_LEN: usize = wxctlp_frame::KEY_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Sleep,
    Standby,
    Transmitter,
    Receiver,
}

/// Frequency bands supported by RFM69 modules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Mhz315,
    Mhz433,
    Mhz868,
    Mhz915,
}

impl FromStr for Frequency {
    type Err = RadioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let band = s.trim();
        let band = band
            .strip_suffix("MHz")
            .or_else(|| band.strip_suffix("mhz"))
            .unwrap_or(band)
            .trim();
        match band {
            "315" => Ok(Self::Mhz315),
            "433" => Ok(Self::Mhz433),
            "868" => Ok(Self::Mhz868),
            "915" => Ok(Self::Mhz915),
            _ => Err(RadioError::InvalidFrequency(s.to_string())),
        }
    }
}

impl Frequency {
    pub fn mhz(&self) -> u16 {
        match self {
            Self::Mhz315 => 315,
            Self::Mhz433 => 433,
            Self::Mhz868 => 868,
            Self::Mhz915 => 915,
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MHz", self.mhz())
    }
}

/// Capability interface over a packet radio. Implementations must keep
/// `receive` cancel safe: the receive task races it against the stop signal.
#[async_trait]
pub trait Transceiver: Send + 'static {
    async fn open(&mut self, network_id: u8, node_id: u8) -> Result<(), RadioError>;

    fn set_encryption_key(&mut self, key: &[u8]) -> Result<(), RadioError>;

    fn set_frequency(&mut self, frequency: Frequency) -> Result<(), RadioError>;

    /// Switch the operating mode. Key and band set beforehand take effect
    /// here at the latest.
    async fn set_mode(&mut self, mode: Mode) -> Result<(), RadioError>;

    /// Wait for the next packet addressed to this node or to broadcast
    async fn receive(&mut self) -> Result<RadioPacket, RadioError>;

    async fn send(&mut self, packet: &RadioPacket) -> Result<(), RadioError>;

    async fn close(&mut self) -> Result<(), RadioError>;
}

pub(crate) fn validate_key(key: &[u8]) -> Result<(), RadioError> {
    if key.len() != ENCRYPTION_KEY_LEN {
        return Err(RadioError::InvalidKey(key.len()));
    }
    Ok(())
}
