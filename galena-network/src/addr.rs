//! Network identity of a peer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("expected <ip>:<port>, got {0:?}")]
    BadHostname(String),
}

/// A peer address. Two addresses are equal only when ip, port and public
/// key all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    pub ip: String,
    pub port: u16,
    pub pub_key: Option<String>,
}

impl Addr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            pub_key: None,
        }
    }

    pub fn with_key(ip: impl Into<String>, port: u16, pub_key: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            pub_key: Some(pub_key.into()),
        }
    }

    pub fn from_hostname(hostname: &str) -> Result<Self, AddrError> {
        let (ip, port) = hostname
            .rsplit_once(':')
            .ok_or_else(|| AddrError::BadHostname(hostname.into()))?;
        let port = port
            .parse()
            .map_err(|_| AddrError::BadHostname(hostname.into()))?;
        Ok(Self::new(ip, port))
    }

    /// Parse a seed list, skipping entries that do not look like
    /// `<ip>:<port>`.
    pub fn parse_list(hostnames: &[String]) -> Vec<Addr> {
        hostnames
            .iter()
            .filter_map(|h| Self::from_hostname(h).ok())
            .collect()
    }

    pub fn hostname(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.pub_key {
            Some(key) => write!(f, "{}:{}:{}", self.ip, self.port, key),
            None => write!(f, "{}:{}", self.ip, self.port),
        }
    }
}
