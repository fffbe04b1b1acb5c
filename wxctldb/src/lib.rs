//! The `wxctldb` crate holds the weather controller configuration: its JSON
//! schema ([`Config`]), the merge applied to remote configuration payloads,
//! and the persisted copy kept in a single sqlite key-value table
//! ([`ConfigStore`]).
//!
//! Only one document is stored, under the `config` key of the
//! `weathercontroller` bucket. A missing or unreadable document falls back to
//! [`Config::default`].

mod config;
mod models;
mod schema;
mod store;

pub use config::{Config, HomieConfig, MqttConfig, RadioConfig, SslConfig};
pub use store::{ConfigStore, CONFIG_BUCKET, CONFIG_KEY};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Malformed configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Store Error")]
    Store(#[from] diesel::result::Error),
    #[error("Store Connection Error")]
    Connection(#[from] diesel::ConnectionError),
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
}
