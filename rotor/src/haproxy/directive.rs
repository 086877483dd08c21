// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pattern-level access to haproxy.cfg
//!
//! The configuration is never parsed. Two shapes are located by anchored
//! regular expressions: `use_backend <name> if { path_beg <path> }` routing
//! directives and literal placeholder domains. Callers only see "find the directive
//! for a backend" and "replace its path", so the matching strategy can change
//! without touching them.

use regex::{Captures, Regex};

use crate::error::Result;

/// Path routing directives of a single backend
#[derive(Debug, Clone)]
pub struct BackendDirective {
    backend: String,
    pattern: Regex,
}

/// Result of rewriting one backend's directives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRewrite {
    /// Text after rewriting
    pub text: String,
    /// Directives found, including ones already holding the new path
    pub matches: usize,
    /// Previous paths of the directives that actually changed
    pub replaced: Vec<String>,
}

impl BackendDirective {
    /// Compile the matcher for `backend`
    pub fn new(backend: &str) -> Result<Self> {
        let pattern = Regex::new(&format!(
            r"(use_backend\s+{}\s+if\s+\{{\s*path_beg\s+)(/[^ \}}\n]+)",
            regex::escape(backend)
        ))?;
        Ok(Self {
            backend: backend.to_string(),
            pattern,
        })
    }

    /// Backend name this directive matches
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Current paths routed to the backend, in file order
    pub fn paths<'t>(&self, text: &'t str) -> Vec<&'t str> {
        self.pattern
            .captures_iter(text)
            .filter_map(|caps| caps.get(2).map(|m| m.as_str()))
            .collect()
    }

    /// Replace the path of every matching directive, keeping the rest of the line
    pub fn replace_path(&self, text: &str, new_path: &str) -> PathRewrite {
        let mut matches = 0usize;
        let mut replaced = Vec::new();

        let rewritten = self.pattern.replace_all(text, |caps: &Captures<'_>| {
            matches += 1;
            let old = &caps[2];
            if old != new_path {
                replaced.push(old.to_string());
            }
            format!("{}{}", &caps[1], new_path)
        });

        PathRewrite {
            text: rewritten.into_owned(),
            matches,
            replaced,
        }
    }
}

/// One replaced domain occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainChange {
    /// Index of the `(placeholder, replacement)` pair that matched
    pub slot: usize,
    pub old: String,
    pub new: String,
}

/// Literal placeholder domains, each with its own replacement.
///
/// All placeholders are rewritten in a single pass, so a replacement is never
/// rewritten again by a later placeholder. `domain:80` becomes
/// `replacement:80`. An occurrence inside a longer hostname
/// (`cdn.www.habbo.com`, `www.habbo.community`) is left alone.
#[derive(Debug, Clone)]
pub struct DomainSwap {
    pairs: Vec<(String, String)>,
    pattern: Option<Regex>,
}

impl DomainSwap {
    /// Compile a matcher for every placeholder in `pairs`
    pub fn new<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let pairs: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(placeholder, replacement)| (placeholder.to_string(), replacement.to_string()))
            .collect();

        let pattern = if pairs.is_empty() {
            None
        } else {
            let alternatives = pairs
                .iter()
                .map(|(placeholder, _)| regex::escape(placeholder))
                .collect::<Vec<_>>()
                .join("|");
            Some(Regex::new(&format!("({})(:80)?", alternatives))?)
        };

        Ok(Self { pairs, pattern })
    }

    /// Rewrite `text`, returning it with every occurrence that changed
    pub fn replace(&self, text: &str) -> (String, Vec<DomainChange>) {
        let Some(pattern) = &self.pattern else {
            return (text.to_string(), Vec::new());
        };

        let mut output = String::with_capacity(text.len());
        let mut changes = Vec::new();
        let mut last = 0;

        for caps in pattern.captures_iter(text) {
            let Some(domain) = caps.get(1) else {
                continue;
            };
            let end = match caps.get(2) {
                Some(port) if standalone(text, domain.start(), port.end()) => port.end(),
                _ if standalone(text, domain.start(), domain.end()) => domain.end(),
                _ => continue,
            };
            let Some(slot) = self.pairs.iter().position(|(p, _)| p == domain.as_str()) else {
                continue;
            };

            let old = &text[domain.start()..end];
            let new = format!("{}{}", self.pairs[slot].1, &text[domain.end()..end]);
            if old != new {
                changes.push(DomainChange {
                    slot,
                    old: old.to_string(),
                    new: new.clone(),
                });
            }

            output.push_str(&text[last..domain.start()]);
            output.push_str(&new);
            last = end;
        }

        output.push_str(&text[last..]);
        (output, changes)
    }
}

fn is_hostname_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-'
}

/// `text[start..end]` is not part of a longer hostname
fn standalone(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(is_hostname_char) && !after.is_some_and(is_hostname_char)
}
