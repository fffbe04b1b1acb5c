//! Capability interface over an MQTT client library. Only the session task
//! of a [`crate::HomieClient`] calls into a transport.
mod rumqtt;

pub use rumqtt::RumqttTransport;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Duration;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect Error: {0}")]
    Connect(String),
    #[error("Publish Error on {topic}: {reason}")]
    Publish { topic: String, reason: String },
    #[error("Subscribe Error on {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("Unsubscribe Error on {topic}: {reason}")]
    Unsubscribe { topic: String, reason: String },
    #[error("Disconnect Error: {0}")]
    Disconnect(String),
    #[error("TLS Error: {0}")]
    Tls(String),
    #[error("Transport is not connected")]
    NotConnected,
}

/// PEM encoded TLS material, already read from disk
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TlsIdentity {
    /// Trust anchors; the system roots when absent
    pub ca: Option<Vec<u8>>,
    /// Client certificate and private key
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("ca", &self.ca.is_some())
            .field("client_auth", &self.client_auth.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Everything a transport needs to open one broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub will: LastWill,
    pub tls: Option<TlsIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Message(InboundMessage),
    /// The library re-established a dropped connection on its own; the
    /// broker may have fired the last will in between
    Reconnected,
}

/// All publishes are QoS 1. Implementations must keep `next_event`
/// cancel safe.
#[async_trait]
pub trait MqttTransport: Send + 'static {
    /// Open the session; returns once the broker acknowledged the connection
    async fn connect(&mut self, options: &SessionOptions) -> Result<(), TransportError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Next message or reconnection on the session, `None` once the session
    /// is gone
    async fn next_event(&mut self) -> Option<SessionEvent>;

    /// Close the session, giving in-flight messages up to `linger` to flush
    async fn disconnect(&mut self, linger: Duration) -> Result<(), TransportError>;
}
