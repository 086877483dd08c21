// SPDX-License-Identifier: AGPL-3.0-or-later
//! Masquerade domain selection
//!
//! Picks three distinct decoy domains from the configured pool. Position
//! matters: 0 is the reality handshake domain, 1 the shadow-TLS handshake
//! domain, 2 the hysteria masquerade domain.

use std::collections::HashSet;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RotorError};

/// Number of domains drawn per run
pub const SELECTION_SIZE: usize = 3;

/// Candidate decoy domains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasqueradePool {
    domains: Vec<String>,
}

impl MasqueradePool {
    /// Build a pool, rejecting it unless it holds enough distinct entries
    pub fn new(domains: Vec<String>) -> Result<Self> {
        let distinct: HashSet<&str> = domains
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .collect();

        if distinct.len() < SELECTION_SIZE {
            return Err(RotorError::invalid_config(format!(
                "masquerade pool needs at least {} distinct domains, found {}",
                SELECTION_SIZE,
                distinct.len()
            )));
        }

        let domains = domains
            .into_iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();

        Ok(Self { domains })
    }

    /// Load a pool from a JSON array of strings
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(RotorError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path).map_err(|e| RotorError::io(path, e))?;
        let domains: Vec<String> = serde_json::from_str(&contents)?;
        Self::new(domains)
    }

    /// All candidates in file order
    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Draw uniformly at random, keeping a draw only if it is not already
    /// selected, until three domains are collected.
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> SelectedDomains {
        let mut picked: [String; SELECTION_SIZE] = Default::default();
        let mut draws = 0usize;

        for slot in 0..SELECTION_SIZE {
            loop {
                draws += 1;
                let candidate = &self.domains[rng.gen_range(0..self.domains.len())];
                if !picked[..slot].contains(candidate) {
                    picked[slot] = candidate.clone();
                    break;
                }
            }
        }

        debug!(draws, pool = self.domains.len(), "Selected masquerade domains");
        SelectedDomains(picked)
    }
}

/// Three distinct decoy domains in positional order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct SelectedDomains([String; SELECTION_SIZE]);

impl SelectedDomains {
    /// Reality handshake and server name domain
    pub fn reality(&self) -> &str {
        &self.0[0]
    }

    /// Shadow-TLS handshake domain
    pub fn shadowtls(&self) -> &str {
        &self.0[1]
    }

    /// Hysteria masquerade domain
    pub fn hysteria(&self) -> &str {
        &self.0[2]
    }

    /// Domains in positional order
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Write the selection as a JSON array
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        crate::write_json_pretty(path.as_ref(), self)
    }
}

impl TryFrom<Vec<String>> for SelectedDomains {
    type Error = RotorError;

    fn try_from(domains: Vec<String>) -> Result<Self> {
        let unique: HashSet<&String> = domains.iter().collect();
        if unique.len() != domains.len() {
            return Err(RotorError::invalid_config(
                "selected domains must be pairwise distinct",
            ));
        }

        let array: [String; SELECTION_SIZE] = domains.try_into().map_err(|v: Vec<String>| {
            RotorError::invalid_config(format!(
                "expected {} selected domains, found {}",
                SELECTION_SIZE,
                v.len()
            ))
        })?;
        Ok(Self(array))
    }
}

impl From<SelectedDomains> for Vec<String> {
    fn from(selected: SelectedDomains) -> Self {
        selected.0.into()
    }
}

/// Selected-domain side file as read by later stages.
///
/// Read leniently: later stages use whichever leading entries are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainRecord(Vec<String>);

impl DomainRecord {
    /// Load the record written by [`SelectedDomains::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| RotorError::io(path, e))?;
        let domains: Vec<String> = serde_json::from_str(&contents)?;
        Ok(Self(domains))
    }

    pub fn reality(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn shadowtls(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

impl From<&SelectedDomains> for DomainRecord {
    fn from(selected: &SelectedDomains) -> Self {
        Self(selected.as_slice().to_vec())
    }
}
