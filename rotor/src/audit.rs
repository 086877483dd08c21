// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provenance store for generated values
//!
//! Append-only SQLite tables, one row per run:
//!
//! * `fakedomain` - the three selected decoy domains
//! * `protocol_path` - one column per change-set producing inbound tag
//! * `realitykey` - the reality public key
//! * `server_conf` - resolved server address and domain
//!
//! The `protocol_path` columns are generated from the mutator's rule table,
//! and an existing table is checked against it when the store is opened.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::changeset::{storage_key, ChangeSet};
use crate::domains::SelectedDomains;
use crate::error::{Result, RotorError};
use crate::mutator::recorded_tags;

/// Table holding one column per recorded tag
pub const PATH_TABLE: &str = "protocol_path";

/// Column names of [`PATH_TABLE`], in rule-table order
pub fn path_columns() -> Vec<String> {
    recorded_tags().map(storage_key).collect()
}

/// Fail unless `changes` carries a value for every audited column
pub fn ensure_complete(changes: &ChangeSet) -> Result<()> {
    let supplied = changes.storage();
    let missing: Vec<String> = recorded_tags()
        .filter(|tag| !supplied.contains_key(&storage_key(tag)))
        .map(str::to_string)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(RotorError::IncompleteChangeSet {
            missing: missing.join(", "),
        })
    }
}

/// Audit store connection, opened once per run
pub struct AuditSink {
    conn: Connection,
}

impl AuditSink {
    /// Open (creating if needed) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        crate::ensure_parent(path)?;

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        debug!(path = %path.display(), "Opened audit store");
        Self::init(conn)
    }

    /// Store that lives only as long as the value
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        let columns = path_columns()
            .iter()
            .map(|column| format!("    {} TEXT NOT NULL", column))
            .collect::<Vec<_>>()
            .join(",\n");

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS fakedomain (
                reality   TEXT,
                shadowtls TEXT,
                hysteria  TEXT
            );
            CREATE TABLE IF NOT EXISTS {PATH_TABLE} (
            {columns}
            );
            CREATE TABLE IF NOT EXISTS realitykey (
                key TEXT
            );
            CREATE TABLE IF NOT EXISTS server_conf (
                ip     TEXT,
                domain TEXT
            );"
        ))?;

        let sink = Self { conn };
        sink.validate_schema()?;
        Ok(sink)
    }

    /// Compare the existing path table with the rule table
    fn validate_schema(&self) -> Result<()> {
        let mut statement = self
            .conn
            .prepare(&format!("PRAGMA table_info({PATH_TABLE})"))?;
        let found: BTreeSet<String> = statement
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<_, _>>()?;
        let expected: BTreeSet<String> = path_columns().into_iter().collect();

        if found != expected {
            return Err(RotorError::SchemaMismatch {
                table: PATH_TABLE.to_string(),
                expected: expected.into_iter().collect::<Vec<_>>().join(", "),
                found: found.into_iter().collect::<Vec<_>>().join(", "),
            });
        }
        Ok(())
    }

    /// Append the decoy domain triple
    pub fn record_domains(&mut self, domains: &SelectedDomains) -> Result<()> {
        self.conn.execute(
            "INSERT INTO fakedomain (reality, shadowtls, hysteria) VALUES (?1, ?2, ?3)",
            params![domains.reality(), domains.shadowtls(), domains.hysteria()],
        )?;
        info!("Recorded masquerade domains");
        Ok(())
    }

    /// Append one row holding every recorded tag's value
    pub fn record_paths(&mut self, changes: &ChangeSet) -> Result<()> {
        ensure_complete(changes)?;

        let storage = changes.storage();
        let columns = path_columns();

        for extra in storage.keys().filter(|key| !columns.contains(key)) {
            warn!(column = %extra, "Change set entry has no audit column; not recorded");
        }

        let placeholders = (1..=columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {PATH_TABLE} ({}) VALUES ({})",
            columns.join(", "),
            placeholders
        );
        let values = columns.iter().filter_map(|column| storage.get(column));

        self.conn.execute(&sql, params_from_iter(values))?;
        info!(columns = columns.len(), "Recorded inbound paths");
        Ok(())
    }

    /// Append the reality public key
    pub fn record_reality_key(&mut self, public_key: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO realitykey (key) VALUES (?1)",
            params![public_key],
        )?;
        info!("Recorded reality public key");
        Ok(())
    }

    /// Append the resolved server identity
    pub fn record_server(&mut self, ip: &str, domain: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO server_conf (ip, domain) VALUES (?1, ?2)",
            params![ip, domain],
        )?;
        info!(ip = %ip, domain = %domain, "Recorded server identity");
        Ok(())
    }

    /// Most recent domain triple
    pub fn latest_domains(&self) -> Result<Option<Vec<String>>> {
        let row = self
            .conn
            .query_row(
                "SELECT reality, shadowtls, hysteria FROM fakedomain ORDER BY rowid DESC LIMIT 1",
                [],
                |row| {
                    Ok(vec![
                        row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                        row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    ])
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Most recent path row keyed by column name
    pub fn latest_paths(&self) -> Result<Option<BTreeMap<String, String>>> {
        let columns = path_columns();
        let sql = format!(
            "SELECT {} FROM {PATH_TABLE} ORDER BY rowid DESC LIMIT 1",
            columns.join(", ")
        );

        let row = self
            .conn
            .query_row(&sql, [], |row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| Ok::<_, rusqlite::Error>((column.clone(), row.get::<_, String>(i)?)))
                    .collect::<rusqlite::Result<BTreeMap<_, _>>>()
            })
            .optional()?;
        Ok(row)
    }

    /// Most recent reality public key
    pub fn latest_reality_key(&self) -> Result<Option<String>> {
        let key = self
            .conn
            .query_row(
                "SELECT key FROM realitykey ORDER BY rowid DESC LIMIT 1",
                [],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(key.flatten())
    }

    /// Most recent server identity as `(ip, domain)`
    pub fn latest_server(&self) -> Result<Option<(String, String)>> {
        let row = self
            .conn
            .query_row(
                "SELECT ip, domain FROM server_conf ORDER BY rowid DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Number of recorded mutation runs
    pub fn run_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {PATH_TABLE}"),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}
