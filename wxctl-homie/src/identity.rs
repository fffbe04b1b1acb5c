use std::net::IpAddr;
use thiserror::Error;

use crate::ConnectionConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Unable to enumerate network interfaces: {0}")]
    Enumeration(String),
    #[error("No active non-loopback network interface found")]
    NoInterface,
}

/// Snapshot of one host network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    /// Colon separated hardware address, e.g. `b8:27:eb:12:34:56`
    pub mac: String,
    pub addrs: Vec<IpAddr>,
}

/// Trait to allow different ways of listing host interfaces
pub trait InterfaceSource: Send + Sync {
    fn interfaces(&self) -> Result<Vec<NetworkInterface>, IdentityError>;
}

/// [`InterfaceSource`] reading the host's interfaces through `sysinfo`
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> Result<Vec<NetworkInterface>, IdentityError> {
        let networks = sysinfo::Networks::new_with_refreshed_list();
        let mut interfaces = networks
            .list()
            .iter()
            .map(|(name, data)| NetworkInterface {
                name: name.clone(),
                mac: data.mac_address().to_string(),
                addrs: data.ip_networks().iter().map(|n| n.addr).collect(),
            })
            .collect::<Vec<_>>();

        if interfaces.is_empty() {
            return Err(IdentityError::Enumeration(
                "no interfaces reported by the system".to_string(),
            ));
        }
        // Listing order is a hash map order; make "first" stable
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(interfaces)
    }
}

/// Identity of the device for one connection cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Homie device id, also used as MQTT client id
    pub id: String,
    pub mac: String,
    pub ip: IpAddr,
    pub url: String,
}

impl DeviceIdentity {
    pub fn derive(
        source: &dyn InterfaceSource,
        config: &ConnectionConfig,
    ) -> Result<Self, IdentityError> {
        let interfaces = source.interfaces()?;
        let (mac, ip) = find_mac_and_ip(&interfaces)?;
        Ok(Self {
            id: homie_id(&mac),
            mac,
            ip,
            url: config.url(),
        })
    }

    /// `<prefix><id>/`, the root of every topic this device owns
    pub fn device_prefix(&self, prefix: &str) -> String {
        format!("{prefix}{}/", self.id)
    }
}

/// Pick the first interface with a hardware address and a non-loopback
/// address. IPv4 addresses are preferred over IPv6 on that interface.
pub fn find_mac_and_ip(interfaces: &[NetworkInterface]) -> Result<(String, IpAddr), IdentityError> {
    interfaces
        .iter()
        .filter(|iface| !iface.mac.is_empty() && homie_id(&iface.mac).chars().any(|c| c != '0'))
        .find_map(|iface| {
            let usable = iface.addrs.iter().filter(|ip| !ip.is_loopback() && !ip.is_unspecified());
            let ip = usable
                .clone()
                .find(|ip| ip.is_ipv4())
                .or_else(|| usable.clone().next())?;
            Some((iface.mac.clone(), *ip))
        })
        .ok_or(IdentityError::NoInterface)
}

/// Homie device id derived from a hardware address: separators stripped,
/// lower case
pub fn homie_id(mac: &str) -> String {
    mac.chars()
        .filter(|c| *c != ':' && *c != '-')
        .flat_map(|c| c.to_lowercase())
        .collect()
}
