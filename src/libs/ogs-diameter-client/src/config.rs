//! Diameter client configuration types
//!
//! These are plain structs supplied by the embedding gateway (typically
//! deserialized from its YAML configuration); nothing here reads files,
//! environment or command-line flags.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DiameterError, DiameterResult};

/// Transport used to reach a Diameter peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Tcp,
    Sctp,
}

impl FromStr for TransportProtocol {
    type Err = DiameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(TransportProtocol::Tcp),
            "sctp" | "sctp4" | "sctp6" => Ok(TransportProtocol::Sctp),
            other => Err(DiameterError::Config(format!(
                "unsupported transport protocol {other:?}"
            ))),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => write!(f, "tcp"),
            TransportProtocol::Sctp => write!(f, "sctp"),
        }
    }
}

/// Connection key of a pooled peer link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerConnConfig {
    /// Remote `host:port`
    pub address: String,
    #[serde(default)]
    pub protocol: TransportProtocol,
    /// Local `ip:port` to bind before dialing; empty for any
    #[serde(default)]
    pub local_address: String,
}

impl PeerConnConfig {
    pub fn new(address: impl Into<String>, protocol: TransportProtocol) -> Self {
        Self {
            address: address.into(),
            protocol,
            local_address: String::new(),
        }
    }

    pub fn with_local_address(mut self, local_address: impl Into<String>) -> Self {
        self.local_address = local_address.into();
        self
    }

    /// The remote address when it is an `ip:port` literal
    pub fn remote_socket_addr(&self) -> Option<SocketAddr> {
        self.address.parse().ok()
    }

    /// Check the remote address is `ip:port` or `host:port`
    pub fn check_remote(&self) -> DiameterResult<()> {
        if self.remote_socket_addr().is_some() {
            return Ok(());
        }
        match self.address.rsplit_once(':') {
            Some((host, port))
                if !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok() =>
            {
                Ok(())
            }
            _ => Err(DiameterError::Config(format!(
                "bad peer address {:?}: expected host:port",
                self.address
            ))),
        }
    }

    /// Resolve the local bind address, if one is configured
    pub fn local_addr(&self) -> DiameterResult<Option<SocketAddr>> {
        if self.local_address.is_empty() {
            return Ok(None);
        }
        self.local_address.parse().map(Some).map_err(|e| {
            DiameterError::Config(format!(
                "bad local address {:?}: {e}",
                self.local_address
            ))
        })
    }

    pub fn validate(&self) -> DiameterResult<()> {
        self.check_remote()?;
        self.local_addr()?;
        Ok(())
    }
}

impl fmt::Display for PeerConnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)?;
        if !self.local_address.is_empty() {
            write!(f, " (local {})", self.local_address)?;
        }
        Ok(())
    }
}

/// A peer plus the destination routing applied to requests sent to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerServerConfig {
    #[serde(flatten)]
    pub conn: PeerConnConfig,
    /// Destination-Host override; empty uses the peer's Origin-Host
    #[serde(default)]
    pub dest_host: String,
    /// Destination-Realm override; empty uses the peer's Origin-Realm
    #[serde(default)]
    pub dest_realm: String,
    /// Never add Destination-Host
    #[serde(default)]
    pub disable_dest_host: bool,
    /// Replace a Destination-Host already present in the request
    #[serde(default)]
    pub overwrite_dest_host: bool,
}

impl PeerServerConfig {
    pub fn new(conn: PeerConnConfig) -> Self {
        Self {
            conn,
            dest_host: String::new(),
            dest_realm: String::new(),
            disable_dest_host: false,
            overwrite_dest_host: false,
        }
    }

    pub fn with_destination(
        mut self,
        dest_host: impl Into<String>,
        dest_realm: impl Into<String>,
    ) -> Self {
        self.dest_host = dest_host.into();
        self.dest_realm = dest_realm.into();
        self
    }
}

/// Local identity and behaviour of the Diameter client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Origin-Host (FQDN)
    pub host: String,
    /// Origin-Realm
    pub realm: String,
    pub product_name: String,
    /// Auth-Application-Id values advertised and used
    pub auth_app_ids: Vec<u32>,
    /// Acct-Application-Id values advertised
    pub acct_app_ids: Vec<u32>,
    /// Vendor for Vendor-Specific-Application-Id, 0 for none
    pub vendor_id: u32,
    /// Extra send attempts after the first failure
    pub retransmits: u32,
    /// Tw timer; a link silent for 3× this is reported dead, 0 disables
    #[serde(with = "secs")]
    pub watchdog_interval: Duration,
    pub recovery: RecoveryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            realm: String::new(),
            product_name: "ogs-diameter-client".to_string(),
            auth_app_ids: Vec::new(),
            acct_app_ids: Vec::new(),
            vendor_id: crate::VENDOR_ID_3GPP,
            retransmits: 1,
            watchdog_interval: Duration::from_secs(3),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            realm: realm.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> DiameterResult<()> {
        if self.host.is_empty() {
            return Err(DiameterError::Config("origin host is empty".into()));
        }
        if self.realm.is_empty() {
            return Err(DiameterError::Config("origin realm is empty".into()));
        }
        if self.product_name.is_empty() {
            return Err(DiameterError::Config("product name is empty".into()));
        }
        Ok(())
    }
}

/// Backoff used when redialing a link that the watchdog reported dead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// First delay; doubles on each failed attempt
    #[serde(with = "secs")]
    pub base_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl RecoveryConfig {
    /// Delay before attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_interval
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }
}

/// Durations as (fractional) seconds in configuration files
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
