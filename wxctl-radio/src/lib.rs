//! The `wxctl-radio` crate owns the packet radio side of the weather
//! controller. A [`RadioClient`] holds exclusive ownership of a
//! [`Transceiver`] and runs a single receive task that:
//!
//! 1. Acknowledges packets addressed to this node when the sender asked
//!    for it (best effort, never retried)
//! 2. Decodes the payload as a [`wxctlp_frame::Metric`], dropping and
//!    logging anything malformed
//! 3. Hands each decoded metric, with the sender's node id, to the
//!    registered callback
//!
//! The callback runs on the receive task, so it must hand work off quickly
//! (e.g. forward into a channel or an actor mailbox).
//!
//! # Examples
//! ```rust,no_run
//! # async fn run() -> Result<(), wxctl_radio::RadioError> {
//! let transceiver = wxctl_radio::UdpTransceiver::new(
//!     "0.0.0.0:5555".parse().unwrap(),
//!     "127.0.0.1:5556".parse().unwrap(),
//! );
//! let mut radio = wxctl_radio::RadioClient::new(100, 1, transceiver, |sensor_id, metric| {
//!     log::info!("sensor {sensor_id}: {metric}");
//! });
//! radio.start("sampleEncryptKey", "868").await?;
//! // ...
//! radio.stop().await?;
//! # Ok(())
//! # }
//! ```

mod radio;
mod transceiver;
mod udp;

pub use radio::{MetricCallback, RadioClient, RadioSession, RadioState};
pub use transceiver::{Frequency, Mode, Transceiver, ENCRYPTION_KEY_LEN};
pub use udp::UdpTransceiver;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RadioError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Unable to open transceiver: {0}")]
    Open(String),
    #[error("Unable to close transceiver: {0}")]
    Close(String),
    #[error("Encryption key must be 16 bytes, got {0}")]
    InvalidKey(usize),
    #[error("Unsupported frequency band {0}")]
    InvalidFrequency(String),
    #[error("Transceiver is not open")]
    NotOpen,
    #[error("Radio subsystem is not running")]
    NotStarted,
    #[error("Radio subsystem is already running")]
    AlreadyRunning,
    #[error("Radio receive task did not stop in time")]
    StopTimeout,
    #[error("Radio receive task failed: {0}")]
    Task(String),
    #[error("Frame Error")]
    Frame(#[from] wxctlp_frame::FrameError),
}

// Bound on how long stop() waits for the receive task to hand back
// the transceiver
const STOP_TIMEOUT_SECS: u64 = 10;

// Back-off after a failed receive so a dead socket does not spin the task
const RECEIVE_BACKOFF_MILLIS: u64 = 100;
