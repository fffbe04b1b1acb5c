use std::path::PathBuf;

/// Paths of the PEM files used on a TLS session. Without a CA the system
/// roots are trusted; a private key adds a client certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
}

/// Broker and device settings for one connection cycle. Replaced wholesale
/// by [`crate::HomieClient::reconfigure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub tls: TlsMaterial,
    /// Broker sub-path appended to the URL
    pub path: String,
    /// Topic prefix, e.g. `devices/`
    pub prefix: String,
    pub device_name: String,
    pub firmware_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "iot.eclipse.org".to_string(),
            port: 1883,
            ssl: true,
            tls: TlsMaterial::default(),
            path: String::new(),
            prefix: "devices/".to_string(),
            device_name: "weatherStation".to_string(),
            firmware_name: "weathercontroller".to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn url(&self) -> String {
        let scheme = if self.ssl { "ssl" } else { "tcp" };
        format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
    }

    /// The `ssl://` scheme always means a TLS session
    pub fn tls_enabled(&self) -> bool {
        self.ssl
    }

    pub fn client_auth_enabled(&self) -> bool {
        self.ssl && self.tls.private_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_scheme_follows_ssl_flag() {
        let mut config = ConnectionConfig {
            host: "172.20.0.100".to_string(),
            ssl: false,
            ..Default::default()
        };
        assert_eq!(config.url(), "tcp://172.20.0.100:1883");

        config.ssl = true;
        config.port = 8883;
        config.path = "/mqtt".to_string();
        assert_eq!(config.url(), "ssl://172.20.0.100:8883/mqtt");
    }

    #[test]
    fn ssl_flag_enables_tls_and_key_adds_client_auth() {
        let mut config = ConnectionConfig::default();
        assert!(config.tls_enabled());
        assert!(!config.client_auth_enabled());

        config.tls.private_key = Some("key.pem".into());
        assert!(config.client_auth_enabled());

        config.ssl = false;
        assert!(!config.tls_enabled());
        assert!(!config.client_auth_enabled());
    }
}
