// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server identity: public address and primary domain
//!
//! The address lookup is the only network call in Rotor. It never fails
//! loudly; a failed lookup comes back as [`IpLookup::Failed`] so the caller
//! decides whether to stop.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, RotorError};

/// Outcome of a public address lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpLookup {
    /// Address reported by the endpoint
    Address(String),
    /// Why the lookup failed
    Failed(String),
}

impl std::fmt::Display for IpLookup {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpLookup::Address(address) => write!(formatter, "{}", address),
            IpLookup::Failed(reason) => write!(formatter, "Error: {}", reason),
        }
    }
}

/// Ask `endpoint` for this host's public address
pub fn lookup_public_ip(endpoint: &str, timeout: Duration) -> IpLookup {
    let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(error) => return IpLookup::Failed(error.to_string()),
    };

    let response = client
        .get(endpoint)
        .send()
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.text());

    match response {
        Ok(body) => {
            let address = body.trim();
            if address.is_empty() {
                IpLookup::Failed(format!("empty response from {}", endpoint))
            } else {
                debug!(address = %address, "Resolved public address");
                IpLookup::Address(address.to_string())
            }
        }
        Err(error) => {
            warn!(endpoint = %endpoint, error = %error, "Public address lookup failed");
            IpLookup::Failed(error.to_string())
        }
    }
}

/// Known servers: public address to primary domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ServerList(BTreeMap<String, String>);

impl ServerList {
    /// Load a JSON object mapping address to domain
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(RotorError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path).map_err(|e| RotorError::io(path, e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Domain for `ip`
    pub fn domain_for(&self, ip: &str) -> Option<&str> {
        self.0.get(ip).map(String::as_str)
    }

    /// Identity for `ip`, or a configuration error when the address is unknown
    pub fn resolve(&self, ip: &str) -> Result<ServerIdentity> {
        let domain = self.domain_for(ip).ok_or_else(|| {
            RotorError::invalid_config(format!("address {} is not in the server list", ip))
        })?;
        Ok(ServerIdentity {
            ip: ip.to_string(),
            domain: domain.to_string(),
        })
    }
}

/// This server's address and primary domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct ServerIdentity {
    pub ip: String,
    pub domain: String,
}

impl From<(String, String)> for ServerIdentity {
    fn from((ip, domain): (String, String)) -> Self {
        Self { ip, domain }
    }
}

impl From<ServerIdentity> for (String, String) {
    fn from(identity: ServerIdentity) -> Self {
        (identity.ip, identity.domain)
    }
}

impl ServerIdentity {
    /// Write `[ip, domain]` to `record` and the bare domain to `domain_txt`
    pub fn save(&self, record: &Path, domain_txt: &Path) -> Result<()> {
        crate::write_json_pretty(record, self)?;
        crate::ensure_parent(domain_txt)?;
        std::fs::write(domain_txt, &self.domain).map_err(|e| RotorError::io(domain_txt, e))
    }

    /// Read a record written by [`ServerIdentity::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| RotorError::io(path, e))?;
        Ok(serde_json::from_str(&contents)?)
    }
}
