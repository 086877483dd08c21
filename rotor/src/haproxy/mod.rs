// SPDX-License-Identifier: AGPL-3.0-or-later
//! haproxy.cfg synchronisation
//!
//! Applies a change set and the selected decoy domains to the load-balancer
//! configuration. Unknown tags and missing directives are reported as notes,
//! never as errors. File access fails, and so does a decoy domain equal to
//! the other slot's placeholder, since the next patch would rewrite it again.

mod backends;
mod directive;

pub use backends::BackendMap;
pub use directive::{BackendDirective, DomainChange, DomainSwap, PathRewrite};

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::changeset::ChangeSet;
use crate::config::PatcherConfig;
use crate::error::{Result, RotorError};

/// Kind of a patch log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoteKind {
    /// Tag with no backend mapping, skipped
    Warn,
    /// Mapped backend has no path directive
    Miss,
    /// Backend path replaced
    Path,
    /// Decoy domain replaced
    Host,
    /// Backup of the original file created
    Backup,
    /// File written
    Write,
}

impl std::fmt::Display for NoteKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoteKind::Warn => write!(formatter, "WARN"),
            NoteKind::Miss => write!(formatter, "MISS"),
            NoteKind::Path => write!(formatter, "PATH"),
            NoteKind::Host => write!(formatter, "HOST"),
            NoteKind::Backup => write!(formatter, "BACKUP"),
            NoteKind::Write => write!(formatter, "WRITE"),
        }
    }
}

/// One entry of the patch log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub kind: NoteKind,
    pub message: String,
}

impl Note {
    fn new(kind: NoteKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Note {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "[{}] {}", self.kind, self.message)
    }
}

/// What to apply
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchRequest<'a> {
    /// New path or service name per inbound tag
    pub changes: Option<&'a ChangeSet>,
    /// Replacement for the reality decoy domain
    pub reality_server_name: Option<&'a str>,
    /// Replacement for the shadow-TLS decoy domain
    pub shadowtls_server_name: Option<&'a str>,
}

/// Patched text and the ordered log of what happened
#[derive(Debug, Clone, Default)]
pub struct PatchOutcome {
    pub text: String,
    pub notes: Vec<Note>,
    /// Where the text was written, `None` for dry runs
    pub written: Option<PathBuf>,
}

impl PatchOutcome {
    /// Number of notes of `kind`
    pub fn count(&self, kind: NoteKind) -> usize {
        self.notes.iter().filter(|note| note.kind == kind).count()
    }
}

/// Rewrites haproxy.cfg text
#[derive(Debug, Clone)]
pub struct Patcher {
    routes: Vec<(String, Vec<BackendDirective>)>,
    placeholders: PatcherConfig,
}

impl Patcher {
    /// Build a patcher for `backends` and the configured placeholder domains
    pub fn new(backends: &BackendMap, config: &PatcherConfig) -> Result<Self> {
        let routes = backends
            .iter()
            .map(|(tag, names)| {
                let directives = names
                    .iter()
                    .map(|name| BackendDirective::new(name))
                    .collect::<Result<Vec<_>>>()?;
                Ok((tag.to_string(), directives))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            routes,
            placeholders: config.clone(),
        })
    }

    /// Patcher with the standard backend mapping
    pub fn standard(config: &PatcherConfig) -> Result<Self> {
        Self::new(&BackendMap::standard(), config)
    }

    fn directives(&self, tag: &str) -> Option<&[BackendDirective]> {
        self.routes
            .iter()
            .find(|(known, _)| known == tag)
            .map(|(_, directives)| directives.as_slice())
    }

    /// Apply `request` to `text` in memory
    pub fn patch_text(&self, text: &str, request: &PatchRequest<'_>) -> Result<PatchOutcome> {
        check_server_names(
            &self.placeholders,
            request.reality_server_name,
            request.shadowtls_server_name,
        )?;

        let mut notes = Vec::new();
        let mut text = text.to_string();

        if let Some(changes) = request.changes {
            text = self.replace_paths(text, changes, &mut notes);
        }
        text = self.replace_domains(text, request, &mut notes)?;

        Ok(PatchOutcome {
            text,
            notes,
            written: None,
        })
    }

    fn replace_domains(
        &self,
        text: String,
        request: &PatchRequest<'_>,
        notes: &mut Vec<Note>,
    ) -> Result<String> {
        let slots = [
            (
                "Reality",
                self.placeholders.reality_placeholder.as_str(),
                non_empty(request.reality_server_name),
            ),
            (
                "ShadowTLS",
                self.placeholders.shadowtls_placeholder.as_str(),
                non_empty(request.shadowtls_server_name),
            ),
        ];
        let active: Vec<(&str, &str, &str)> = slots
            .iter()
            .filter_map(|(label, placeholder, domain)| domain.map(|d| (*label, *placeholder, d)))
            .collect();

        if active.is_empty() {
            return Ok(text);
        }

        let swap = DomainSwap::new(active.iter().map(|(_, placeholder, domain)| (*placeholder, *domain)))?;
        let (text, changes) = swap.replace(&text);
        for change in changes {
            notes.push(Note::new(
                NoteKind::Host,
                format!("{}: {} -> {}", active[change.slot].0, change.old, change.new),
            ));
        }
        Ok(text)
    }

    fn replace_paths(&self, mut text: String, changes: &ChangeSet, notes: &mut Vec<Note>) -> String {
        for (tag, value) in changes.iter() {
            let Some(directives) = self.directives(tag) else {
                warn!(tag = %tag, "No haproxy backend for tag");
                notes.push(Note::new(NoteKind::Warn, format!("unknown tag '{}', skipped", tag)));
                continue;
            };

            let new_path = ensure_leading_slash(value);
            for directive in directives {
                let rewrite = directive.replace_path(&text, &new_path);
                for old in &rewrite.replaced {
                    notes.push(Note::new(
                        NoteKind::Path,
                        format!("{}: {} -> {}", directive.backend(), old, new_path),
                    ));
                }
                if rewrite.matches == 0 {
                    warn!(backend = %directive.backend(), "No path_beg directive for backend");
                    notes.push(Note::new(
                        NoteKind::Miss,
                        format!("use_backend {} with path_beg not found", directive.backend()),
                    ));
                }
                text = rewrite.text;
            }
        }
        text
    }

    /// Read `source`, patch it and write the result.
    ///
    /// Writing back to `source` first copies it to `<source>.bak`. A distinct
    /// `target` is written without touching `source`. With `dry_run` nothing
    /// on disk changes.
    pub fn apply_file(
        &self,
        source: &Path,
        request: &PatchRequest<'_>,
        target: Option<&Path>,
        dry_run: bool,
    ) -> Result<PatchOutcome> {
        let original = std::fs::read_to_string(source).map_err(|e| RotorError::io(source, e))?;
        let mut outcome = self.patch_text(&original, request)?;

        if dry_run {
            info!(path = %source.display(), notes = outcome.notes.len(), "Dry run, nothing written");
            return Ok(outcome);
        }

        let target = target.unwrap_or(source);
        if same_path(source, target) {
            let backup = backup_path(source);
            std::fs::copy(source, &backup).map_err(|e| RotorError::io(&backup, e))?;
            outcome.notes.push(Note::new(
                NoteKind::Backup,
                format!("backup created: {}", backup.display()),
            ));
        }

        std::fs::write(target, &outcome.text).map_err(|e| RotorError::io(target, e))?;
        outcome
            .notes
            .push(Note::new(NoteKind::Write, format!("written: {}", target.display())));
        info!(path = %target.display(), "Wrote haproxy configuration");

        outcome.written = Some(target.to_path_buf());
        Ok(outcome)
    }
}

/// Reject decoy domains equal to the other slot's placeholder.
///
/// Such a domain would be written where the other placeholder used to be and
/// then rewritten by the next patch.
pub fn check_server_names(
    config: &PatcherConfig,
    reality: Option<&str>,
    shadowtls: Option<&str>,
) -> Result<()> {
    let collisions = [
        ("reality", reality, &config.shadowtls_placeholder),
        ("shadowtls", shadowtls, &config.reality_placeholder),
    ];

    for (slot, domain, other) in collisions {
        if let Some(domain) = non_empty(domain).filter(|d| *d == other.trim()) {
            return Err(RotorError::invalid_config(format!(
                "{} decoy domain {} is the other slot's placeholder",
                slot, domain
            )));
        }
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn ensure_leading_slash(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// `<path>.bak`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".bak");
    PathBuf::from(name)
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (std::path::absolute(a), std::path::absolute(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
