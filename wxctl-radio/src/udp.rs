//! [`Transceiver`] backed by a UDP radio bridge: a modem process that owns
//! the RFM69 hardware, performs the AES and sync-word filtering, and
//! exchanges raw RFM69 packets (see [`wxctlp_frame::RadioPacket`]) with the
//! gateway as one datagram per packet.
//!
//! Every mode change sends the bridge a [`BridgeSettings`] datagram with the
//! network id, node id, band and AES key, so the module is programmed with
//! whatever the gateway was configured with.
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use wxctlp_frame::{
    BridgeSettings, RadioPacket, BROADCAST_ADDR, HEADER_LEN, KEY_LEN, MAX_PAYLOAD_LEN,
};

use crate::{
    transceiver::{validate_key, Frequency, Mode, Transceiver},
    RadioError,
};

pub struct UdpTransceiver {
    bind: SocketAddr,
    bridge: SocketAddr,
    socket: Option<UdpSocket>,
    network_id: u8,
    node_id: u8,
    key: Option<[u8; KEY_LEN]>,
    frequency: Option<Frequency>,
    mode: Mode,
}

impl UdpTransceiver {
    pub fn new(bind: SocketAddr, bridge: SocketAddr) -> Self {
        Self {
            bind,
            bridge,
            socket: None,
            network_id: 0,
            node_id: 0,
            key: None,
            frequency: None,
            mode: Mode::Standby,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn frequency(&self) -> Option<Frequency> {
        self.frequency
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    fn socket(&self) -> Result<&UdpSocket, RadioError> {
        self.socket.as_ref().ok_or(RadioError::NotOpen)
    }

    fn settings(&self, mode: Mode) -> BridgeSettings {
        BridgeSettings {
            network_id: self.network_id,
            node_id: self.node_id,
            frequency_mhz: self.frequency.map(|f| f.mhz()).unwrap_or(0),
            receive: mode == Mode::Receiver,
            key: self.key,
        }
    }

    async fn push_settings(&self, mode: Mode) -> Result<(), RadioError> {
        let settings = self.settings(mode);
        self.socket()?.send_to(&settings.encode(), self.bridge).await?;
        log::debug!(
            "Bridge {} set to network {} node {} at {}MHz, {:?}, encryption {}",
            self.bridge,
            settings.network_id,
            settings.node_id,
            settings.frequency_mhz,
            mode,
            if settings.key.is_some() { "on" } else { "off" }
        );
        Ok(())
    }
}

#[async_trait]
impl Transceiver for UdpTransceiver {
    async fn open(&mut self, network_id: u8, node_id: u8) -> Result<(), RadioError> {
        let socket = UdpSocket::bind(self.bind).await.map_err(|e| {
            log::error!("Unable to bind radio bridge socket {}: {e:}", self.bind);
            RadioError::Open(e.to_string())
        })?;
        log::debug!(
            "Radio bridge socket bound to {:?}, bridge at {}",
            socket.local_addr(),
            self.bridge
        );
        self.network_id = network_id;
        self.node_id = node_id;
        self.socket = Some(socket);
        Ok(())
    }

    fn set_encryption_key(&mut self, key: &[u8]) -> Result<(), RadioError> {
        validate_key(key)?;
        let mut stored = [0u8; KEY_LEN];
        stored.copy_from_slice(key);
        self.key = Some(stored);
        Ok(())
    }

    fn set_frequency(&mut self, frequency: Frequency) -> Result<(), RadioError> {
        log::debug!("Network {} operating at {frequency}", self.network_id);
        self.frequency = Some(frequency);
        Ok(())
    }

    async fn set_mode(&mut self, mode: Mode) -> Result<(), RadioError> {
        self.push_settings(mode).await?;
        self.mode = mode;
        Ok(())
    }

    async fn receive(&mut self) -> Result<RadioPacket, RadioError> {
        let node_id = self.node_id;
        let socket = self.socket()?;
        let mut buffer = [0u8; HEADER_LEN + MAX_PAYLOAD_LEN];

        loop {
            let (len, from) = socket.recv_from(&mut buffer).await?;
            match RadioPacket::decode(&buffer[..len]) {
                Ok(packet) if packet.to == node_id || packet.to == BROADCAST_ADDR => {
                    return Ok(packet);
                }
                Ok(packet) => {
                    log::trace!("Ignoring packet for node {} from {from:}", packet.to);
                }
                Err(e) => {
                    log::warn!("Malformed radio packet from bridge {from:}: {e:}");
                }
            }
        }
    }

    async fn send(&mut self, packet: &RadioPacket) -> Result<(), RadioError> {
        let mut buffer = [0u8; HEADER_LEN + MAX_PAYLOAD_LEN];
        let len = packet.encode(&mut buffer);
        self.socket()?.send_to(&buffer[..len], self.bridge).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RadioError> {
        match self.socket.take() {
            Some(socket) => {
                // Best effort, the bridge keeps listening if this is lost
                let sleep = self.settings(Mode::Sleep).encode();
                if let Err(e) = socket.send_to(&sleep, self.bridge).await {
                    log::warn!("Unable to put bridge {} to sleep: {e:}", self.bridge);
                }
                self.mode = Mode::Sleep;
                drop(socket);
                Ok(())
            }
            None => Err(RadioError::Close("transceiver was not open".to_string())),
        }
    }
}
