//! The `wxctl-homie` crate publishes the weather controller as a device on
//! an MQTT broker following the Homie 2.0.0 convention.
//!
//! A [`HomieClient`] is a long-lived actor owning a single broker session.
//! Every topic operation (publish, subscribe, unsubscribe) and every local
//! property update is turned into a [`PendingOperation`] and pushed onto one
//! bounded queue; a single session task drains that queue, dispatches inbound
//! messages to their handlers and publishes the uptime heartbeat. Callers
//! never touch the session or the property values directly.
//!
//! The session task selects with a fixed priority:
//! 1. stop signal
//! 2. queued operations, in arrival order
//! 3. inbound messages from the broker
//! 4. the 10 second `$stats/uptime` heartbeat
//!
//! The device tree ([`Node`]s and their properties) outlives the session, so
//! [`HomieClient::restart`] can rebuild the connection (e.g. after a
//! configuration change) and republish every node with its settable
//! property subscriptions.
//!
//! # Topics
//! Everything lives under `<prefix><device-id>/`:
//!
//! | suffix | content |
//! |---|---|
//! | `$homie`, `$name`, `$mac`, `$localip`, `$fw/name`, `$fw/version`, `$implementation` | device metadata |
//! | `$stats/interval`, `$stats/uptime` | heartbeat |
//! | `$online` | `true` after announcement, `false` on stop and as last will |
//! | `<node>/$type`, `<node>/$properties` | node metadata |
//! | `<node>/<property>` | retained property value |
//! | `<node>/<property>/set` | inbound command for settable properties |
//! | `$implementation/config/set` | inbound configuration payload |
//!
//! # Examples
//! ```rust,no_run
//! use wxctl_homie::{ConnectionConfig, HomieClient, RumqttTransport, SystemInterfaces};
//!
//! # async fn run() -> Result<(), wxctl_homie::HomieError> {
//! let mut client = HomieClient::new(
//!     ConnectionConfig::default(),
//!     RumqttTransport::new(),
//!     SystemInterfaces,
//! );
//! client.start().await?;
//! client.add_node("7", "weather_sensor", &["temperature"], vec![]);
//! client.set_property("7", "temperature", "21.50");
//! client.stop().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod identity;
mod node;
mod operation;
mod transport;

pub use client::{ConnectionState, HomieClient, HomieDevice};
pub use config::{ConnectionConfig, TlsMaterial};
pub use identity::{
    find_mac_and_ip, homie_id, DeviceIdentity, IdentityError, InterfaceSource, NetworkInterface,
    SystemInterfaces,
};
pub use node::{DeviceTree, Node, Property, SettableCallback, SettableProperty, UpdateOrigin};
pub use operation::{
    ConfigCallback, InboundHandler, OperationError, OperationId, OperationQueue, PendingOperation,
    TopicCallback,
};
pub use transport::{
    InboundMessage, LastWill, MqttTransport, RumqttTransport, SessionEvent, SessionOptions,
    TlsIdentity, TransportError,
};

use thiserror::Error;
use tokio::time::Duration;

#[derive(Error, Debug)]
pub enum HomieError {
    #[error("could not connect to MQTT at {url}")]
    Connection { url: String },
    #[error("could not connect to MQTT at {url}: we are being shutdown")]
    Shutdown { url: String },
    #[error("mqtt subsystem did not stop in time")]
    StopTimeout,
    #[error("mqtt subsystem is not running")]
    NotStarted,
    #[error("mqtt session task failed: {0}")]
    Task(String),
    #[error("mqtt transport is unavailable")]
    TransportUnavailable,
    #[error("Identity Error")]
    Identity(#[from] IdentityError),
    #[error("TLS material Error: {0}")]
    Tls(String),
    #[error("Transport Error")]
    Transport(#[from] TransportError),
}

/// Homie convention version announced on `$homie`
pub const HOMIE_VERSION: &str = "2.0.0";
pub const FIRMWARE_VERSION: &str = "0.0.1";
pub const IMPLEMENTATION: &str = "vx-go-homie";

/// Topic suffix receiving remote configuration payloads
pub const CONFIG_SET_TOPIC: &str = "$implementation/config/set";

/// Heartbeat period, also announced on `$stats/interval`
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);
pub const KEEP_ALIVE: Duration = Duration::from_secs(10);

pub(crate) const CONNECT_ATTEMPTS: u32 = 10;
pub(crate) const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub(crate) const DISCONNECT_LINGER: Duration = Duration::from_secs(1);
pub(crate) const STOP_TIMEOUT: Duration = Duration::from_secs(30);

// Announcement plus a handful of messages per node on restart must fit
pub(crate) const OPERATION_QUEUE_DEPTH: usize = 1024;
