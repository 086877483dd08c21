// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rotor: per-deployment secret rotation for a multi-protocol proxy
//!
//! Generates fresh credentials, paths and decoy domains for every managed
//! inbound of a sing-box style service document, then carries the same
//! values into the haproxy configuration that fronts it.
//!
//! # Stages
//!
//! * **resolve** - look up the public address and pick the primary domain
//! * **mutate** - rewrite the service document, record provenance, hand off
//!   the change set
//! * **patch** - apply the change set and decoy domains to haproxy.cfg

pub mod audit;
pub mod changeset;
pub mod config;
pub mod domains;
pub mod error;
pub mod haproxy;
pub mod mutator;
pub mod secrets;
pub mod server;
pub mod stages;

pub use changeset::ChangeSet;
pub use config::{Config, ResolvedPaths};
pub use error::{Result, RotorError};

use std::path::Path;

use serde::Serialize;

/// Create the parent directory of `path` if it is missing
pub(crate) fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|e| RotorError::io(parent, e))
        }
        _ => Ok(()),
    }
}

/// Serialize `value` as JSON with four-space indentation and write it to `path`
pub(crate) fn write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value.serialize(&mut serializer)?;
    buffer.push(b'\n');

    ensure_parent(path)?;
    std::fs::write(path, buffer).map_err(|e| RotorError::io(path, e))
}
