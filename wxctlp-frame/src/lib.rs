//! Wire protocol shared by the weather sensors and the gateway.
//!
//! Two layers are defined here:
//!
//! 1. [`RadioPacket`], the RFM69 packet framing (`len | to | from | ctl |
//!    payload`) as exchanged with the radio modem. The sensor id is the
//!    packet source address, never part of the payload.
//! 2. [`Metric`], the telemetry record carried as the packet payload. The
//!    layout is a fixed 24 byte little-endian struct with no padding:
//!
//! | offset | field       | type  |
//! |--------|-------------|-------|
//! | 0      | battery     | f32   |
//! | 4      | temperature | f32   |
//! | 8      | humidity    | f32   |
//! | 12     | pressure    | f32   |
//! | 16     | rssi        | i32   |
//! | 20     | uptime      | i32   |
//!
//! A third datagram kind, [`BridgeSettings`], only travels from the gateway
//! to the radio bridge and carries the network id, band and AES key the
//! bridge programs into the module.
//!
//! An older firmware revision embedded a JSON document in the payload; that
//! encoding carries no version marker and is not accepted.
//!
//! The crate builds without `std` so the same codec can be linked into
//! sensor firmware.
#![cfg_attr(not(feature = "std"), no_std)]

mod bridge;
mod packet;

pub use bridge::{BridgeSettings, KEY_LEN, SETTINGS_LEN, SETTINGS_MAGIC};
pub use packet::{RadioPacket, ACK_REQUESTED, ACK_SENT, HEADER_LEN, MAX_PAYLOAD_LEN};

#[cfg(feature = "std")]
use thiserror::Error;

/// Size in bytes of an encoded [`Metric`]
pub const FRAME_LEN: usize = 24;

/// Destination address used by RFM69 nodes to reach every listener
pub const BROADCAST_ADDR: u8 = 255;

#[cfg_attr(feature = "std", derive(Error))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[cfg_attr(
        feature = "std",
        error("Telemetry frame truncated: got {len} bytes, need 24")
    )]
    Truncated { len: usize },
    #[cfg_attr(feature = "std", error("Radio packet shorter than its header"))]
    HeaderTruncated,
    #[cfg_attr(
        feature = "std",
        error("Radio packet length byte {declared} does not match {actual} received bytes")
    )]
    LengthMismatch { declared: usize, actual: usize },
    #[cfg_attr(feature = "std", error("Radio payload of {len} bytes exceeds 61"))]
    PayloadTooLarge { len: usize },
    #[cfg_attr(feature = "std", error("Datagram of {len} bytes is not a bridge settings record"))]
    NotSettings { len: usize },
}

/// One telemetry record reported by a weather sensor
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Metric {
    pub battery: f32,
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
    pub rssi: i32,
    pub uptime: i32,
}

impl Metric {
    /// Decode a frame payload. Bytes past [`FRAME_LEN`] are ignored, the
    /// radio modem may pad payloads to its block size.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < FRAME_LEN {
            return Err(FrameError::Truncated { len: buf.len() });
        }

        Ok(Self {
            battery: f32::from_le_bytes(word(buf, 0)),
            temperature: f32::from_le_bytes(word(buf, 4)),
            humidity: f32::from_le_bytes(word(buf, 8)),
            pressure: f32::from_le_bytes(word(buf, 12)),
            rssi: i32::from_le_bytes(word(buf, 16)),
            uptime: i32::from_le_bytes(word(buf, 20)),
        })
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..4].copy_from_slice(&self.battery.to_le_bytes());
        buf[4..8].copy_from_slice(&self.temperature.to_le_bytes());
        buf[8..12].copy_from_slice(&self.humidity.to_le_bytes());
        buf[12..16].copy_from_slice(&self.pressure.to_le_bytes());
        buf[16..20].copy_from_slice(&self.rssi.to_le_bytes());
        buf[20..24].copy_from_slice(&self.uptime.to_le_bytes());
        buf
    }
}

impl core::fmt::Display for Metric {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Temperature: {:.6}, Humidity: {:.6}, Pressure: {:.6}, Battery: {:.6}, RSSI: {}, Uptime: {}",
            self.temperature, self.humidity, self.pressure, self.battery, self.rssi, self.uptime
        )
    }
}

fn word(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut w = [0u8; 4];
    w.copy_from_slice(&buf[offset..offset + 4]);
    w
}
