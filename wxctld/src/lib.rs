//! Gateway daemon of the weather controller: telemetry decoded by the radio
//! actor becomes Homie node properties, and configuration pushed on
//! `$implementation/config/set` is merged, persisted and applied by
//! restarting the MQTT session.

pub mod gateway;
pub mod telemetry;

use thiserror::Error;
use wxctl_homie::HomieError;
use wxctl_radio::RadioError;
use wxctldb::ConfigError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("MQTT Error")]
    Homie(#[from] HomieError),
    #[error("Radio Error")]
    Radio(#[from] RadioError),
    #[error("Configuration Error")]
    Config(#[from] ConfigError),
}
