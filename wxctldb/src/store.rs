use diesel::{prelude::*, sqlite::SqliteConnection};

use crate::{models::KvEntry, schema::kv_store, Config, ConfigError};

pub const CONFIG_BUCKET: &str = "weathercontroller";
pub const CONFIG_KEY: &str = "config";

/// Embedded key-value store persisting the configuration document
pub struct ConfigStore {
    conn: SqliteConnection,
}

impl ConfigStore {
    /// Open (or create) the store at `url`, a file path or `:memory:`
    pub fn open(url: &str) -> Result<Self, ConfigError> {
        let mut conn = SqliteConnection::establish(url)?;
        diesel::sql_query(
            "CREATE TABLE IF NOT EXISTS kv_store (
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (bucket, key)
            )",
        )
        .execute(&mut conn)?;
        log::debug!("config store opened at {url}");
        Ok(Self { conn })
    }

    pub fn get(&mut self, bucket: &str, key: &str) -> Result<Option<String>, ConfigError> {
        let entry = kv_store::table
            .find((bucket, key))
            .select(KvEntry::as_select())
            .first(&mut self.conn)
            .optional()?;
        Ok(entry.map(|e| e.value))
    }

    pub fn put(&mut self, bucket: &str, key: &str, value: &str) -> Result<(), ConfigError> {
        let entry = KvEntry {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        };
        diesel::replace_into(kv_store::table)
            .values(&entry)
            .execute(&mut self.conn)?;
        Ok(())
    }

    /// The persisted configuration, or the defaults when none is stored or
    /// it cannot be read
    pub fn load(&mut self) -> Config {
        match self.get(CONFIG_BUCKET, CONFIG_KEY) {
            Ok(Some(json)) => Config::from_json(&json).unwrap_or_else(|e| {
                log::error!("stored configuration is unreadable, using defaults: {e:}");
                Config::default()
            }),
            Ok(None) => {
                log::info!("no stored configuration, using defaults");
                Config::default()
            }
            Err(e) => {
                log::error!("unable to read configuration store, using defaults: {e:}");
                Config::default()
            }
        }
    }

    pub fn save(&mut self, config: &Config) -> Result<(), ConfigError> {
        let json = config.to_json()?;
        self.put(CONFIG_BUCKET, CONFIG_KEY, &json)?;
        log::debug!("configuration saved");
        Ok(())
    }
}
