// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stage orchestration
//!
//! Each stage is a separate invocation. They share state only through the
//! side files named in [`ResolvedPaths`]: `resolve` writes the primary
//! domain, `mutate` writes the change set and the selected domains, `patch`
//! reads both.

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::audit::{self, AuditSink};
use crate::changeset::ChangeSet;
use crate::config::{Config, PatcherConfig, ResolvedPaths};
use crate::domains::{DomainRecord, MasqueradePool, SelectedDomains};
use crate::error::{Result, RotorError};
use crate::haproxy::{self, PatchOutcome, PatchRequest, Patcher};
use crate::mutator::{self, MutationContext};
use crate::secrets::SecretSource;
use crate::server::{lookup_public_ip, IpLookup, ServerIdentity, ServerList};

/// Redraws allowed when a selection collides with a haproxy placeholder
const SELECTION_ATTEMPTS: usize = 64;

/// Summary of a mutation run
#[derive(Debug, Clone)]
pub struct MutationReport {
    /// Decoy domains chosen for this run
    pub domains: SelectedDomains,
    /// Generated values by tag
    pub changes: ChangeSet,
    /// Managed tags that were rewritten
    pub applied: Vec<String>,
    /// Unmanaged tags left alone
    pub untouched: Vec<String>,
    /// Whether a reality public key was produced
    pub reality_key: bool,
    /// Whether anything was persisted
    pub dry_run: bool,
}

/// Determine this server's identity and write it for later stages.
///
/// `ip` skips the network lookup.
pub fn resolve(config: &Config, paths: &ResolvedPaths, ip: Option<&str>, dry_run: bool) -> Result<ServerIdentity> {
    let address = match ip {
        Some(ip) => ip.to_string(),
        None => {
            let timeout = Duration::from_secs(config.network.timeout_secs);
            match lookup_public_ip(&config.network.ip_endpoint, timeout) {
                IpLookup::Address(address) => address,
                IpLookup::Failed(reason) => {
                    return Err(RotorError::invalid_config(format!(
                        "public address lookup failed: {}",
                        reason
                    )))
                }
            }
        }
    };

    let identity = ServerList::load(&paths.server_list)?.resolve(&address)?;
    info!(ip = %identity.ip, domain = %identity.domain, "Resolved server identity");

    if dry_run {
        return Ok(identity);
    }

    identity.save(&paths.server_identity, &paths.domain_txt)?;
    AuditSink::open(&paths.sqlite)?.record_server(&identity.ip, &identity.domain)?;
    Ok(identity)
}

/// Select decoy domains, rotate every managed inbound and record the result.
///
/// All inputs are read and the whole document is transformed in memory
/// before anything is written. A run that would leave an audited tag without
/// a value stops before touching any file.
pub fn mutate<S, R>(
    config: &Config,
    paths: &ResolvedPaths,
    source: &mut S,
    rng: &mut R,
    dry_run: bool,
) -> Result<MutationReport>
where
    S: SecretSource + ?Sized,
    R: Rng + ?Sized,
{
    let pool = MasqueradePool::load(&paths.masquerade_pool)?;
    let primary_domain = mutator::read_primary_domain(&paths.domain_txt)?;
    let mut document = mutator::read_document(&paths.server_json)?;
    let mut sink = if dry_run {
        None
    } else {
        Some(AuditSink::open(&paths.sqlite)?)
    };

    let domains = select_domains(&pool, &config.patcher, rng)?;
    let context = MutationContext {
        domains: &domains,
        primary_domain: &primary_domain,
    };
    let outcome = mutator::mutate_document(&mut document, &context, source)?;
    audit::ensure_complete(&outcome.changes)?;

    if !outcome.untouched.is_empty() {
        info!(tags = ?outcome.untouched, "Unmanaged inbounds left untouched");
    }

    if let Some(sink) = sink.as_mut() {
        mutator::write_document(&paths.server_json, &document)?;
        info!(path = %paths.server_json.display(), "Wrote service document");

        sink.record_domains(&domains)?;
        sink.record_paths(&outcome.changes)?;
        match outcome.reality_public_key.as_deref() {
            Some(public_key) => sink.record_reality_key(public_key)?,
            None => warn!("No reality inbound; public key not recorded"),
        }

        outcome.changes.save(&paths.changes)?;
        domains.save(&paths.selected_domains)?;
        info!(path = %paths.changes.display(), entries = outcome.changes.len(), "Wrote change set");
    }

    Ok(MutationReport {
        domains,
        changes: outcome.changes,
        applied: outcome.applied,
        untouched: outcome.untouched,
        reality_key: outcome.reality_public_key.is_some(),
        dry_run,
    })
}

/// Draw decoy domains the patch stage can apply without rewriting them on
/// the next run
fn select_domains<R: Rng + ?Sized>(
    pool: &MasqueradePool,
    placeholders: &PatcherConfig,
    rng: &mut R,
) -> Result<SelectedDomains> {
    for attempt in 1..=SELECTION_ATTEMPTS {
        let domains = pool.select(rng);
        let checked = haproxy::check_server_names(
            placeholders,
            Some(domains.reality()),
            Some(domains.shadowtls()),
        );
        match checked {
            Ok(()) => return Ok(domains),
            Err(error) => debug!(attempt, error = %error, "Redrawing masquerade domains"),
        }
    }

    Err(RotorError::invalid_config(format!(
        "no masquerade selection avoided the haproxy placeholders after {} attempts",
        SELECTION_ATTEMPTS
    )))
}

/// Apply the latest change set and decoy domains to haproxy.cfg
pub fn patch(config: &Config, paths: &ResolvedPaths, target: Option<&Path>, dry_run: bool) -> Result<PatchOutcome> {
    let changes = ChangeSet::load(&paths.changes)?;
    let record = DomainRecord::load(&paths.selected_domains)?;
    let patcher = Patcher::standard(&config.patcher)?;

    let request = PatchRequest {
        changes: Some(&changes),
        reality_server_name: record.reality(),
        shadowtls_server_name: record.shadowtls(),
    };
    patcher.apply_file(&paths.haproxy, &request, target, dry_run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use crate::haproxy::{BackendDirective, BackendMap, NoteKind};
    use crate::secrets::OsSecretSource;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    const SERVER_JSON: &str = include_str!("../tests/fixtures/server.json");
    const HAPROXY_CFG: &str = include_str!("../tests/fixtures/haproxy.cfg");
    const MASQ_LIST: &str = include_str!("../tests/fixtures/masq_domain_list.json");
    const SERVER_LIST: &str = include_str!("../tests/fixtures/serverlist.json");

    fn deployment() -> (TempDir, ResolvedPaths) {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path().to_string_lossy().to_string();
        let paths = PathsConfig::default().resolve(|key| (key == "APP_ROOT").then(|| root.clone()));

        fs::create_dir_all(paths.haproxy.parent().unwrap()).unwrap();
        fs::create_dir_all(&paths.data_dir).unwrap();
        fs::write(&paths.server_json, SERVER_JSON).unwrap();
        fs::write(&paths.haproxy, HAPROXY_CFG).unwrap();
        fs::write(&paths.masquerade_pool, MASQ_LIST).unwrap();
        fs::write(&paths.server_list, SERVER_LIST).unwrap();
        (temp_dir, paths)
    }

    fn run_mutate(paths: &ResolvedPaths, seed: u64) -> MutationReport {
        let mut rng = StdRng::seed_from_u64(seed);
        mutate(&Config::default(), paths, &mut OsSecretSource::default(), &mut rng, false).unwrap()
    }

    #[test]
    fn test_resolve_with_explicit_ip() {
        let (_temp_dir, paths) = deployment();
        let identity = resolve(&Config::default(), &paths, Some("203.0.113.7"), false).unwrap();

        assert_eq!(identity.domain, "edge1.example.net");
        assert_eq!(fs::read_to_string(&paths.domain_txt).unwrap(), "edge1.example.net");
        assert_eq!(ServerIdentity::load(&paths.server_identity).unwrap(), identity);

        let sink = AuditSink::open(&paths.sqlite).unwrap();
        assert_eq!(
            sink.latest_server().unwrap(),
            Some(("203.0.113.7".to_string(), "edge1.example.net".to_string()))
        );
    }

    #[test]
    fn test_resolve_unknown_ip_fails() {
        let (_temp_dir, paths) = deployment();
        let result = resolve(&Config::default(), &paths, Some("192.0.2.99"), false);
        assert!(matches!(result, Err(RotorError::InvalidConfig { .. })));
        assert!(!paths.domain_txt.exists());
    }

    #[test]
    fn test_mutate_requires_primary_domain() {
        let (_temp_dir, paths) = deployment();
        let result = mutate(&Config::default(), &paths, &mut OsSecretSource::default(), &mut StdRng::seed_from_u64(1), false);
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&paths.server_json).unwrap(), SERVER_JSON);
    }

    #[test]
    fn test_mutate_writes_document_side_files_and_audit() {
        let (_temp_dir, paths) = deployment();
        fs::write(&paths.domain_txt, "edge1.example.net").unwrap();

        let report = run_mutate(&paths, 3);
        assert_eq!(report.changes.len(), 14);
        assert_eq!(report.untouched, vec!["mixed-in"]);
        assert!(report.reality_key);

        let document = mutator::read_document(&paths.server_json).unwrap();
        let inbounds = document["inbounds"].as_array().unwrap();
        let by_tag = |tag: &str| {
            inbounds
                .iter()
                .find(|inbound| inbound["tag"] == tag)
                .unwrap()
                .clone()
        };

        assert_eq!(
            by_tag("v10-vless-ws")["transport"]["path"],
            report.changes.get("v10-vless-ws").unwrap()
        );
        assert_eq!(by_tag("realityin_43124")["tls"]["server_name"], report.domains.reality());
        assert_eq!(by_tag("shadowtls")["handshake"]["server"], report.domains.shadowtls());
        assert_eq!(
            by_tag("hysteria_in_50062")["masquerade"],
            format!("https://{}:80/", report.domains.hysteria())
        );
        assert_eq!(by_tag("tuic_in_55851")["tls"]["server_name"], "edge1.example.net");
        assert_eq!(by_tag("mixed-in")["listen_port"], 2080);

        assert_eq!(ChangeSet::load(&paths.changes).unwrap(), report.changes);
        let record = DomainRecord::load(&paths.selected_domains).unwrap();
        assert_eq!(record, DomainRecord::from(&report.domains));

        let sink = AuditSink::open(&paths.sqlite).unwrap();
        assert_eq!(sink.latest_paths().unwrap(), Some(report.changes.storage()));
        assert_eq!(
            sink.latest_domains().unwrap(),
            Some(report.domains.as_slice().to_vec())
        );
        assert!(sink.latest_reality_key().unwrap().is_some());
    }

    #[test]
    fn test_mutate_dry_run_writes_nothing() {
        let (_temp_dir, paths) = deployment();
        fs::write(&paths.domain_txt, "edge1.example.net").unwrap();

        let report = mutate(&Config::default(), &paths, &mut OsSecretSource::default(), &mut StdRng::seed_from_u64(5), true).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.changes.len(), 14);
        assert_eq!(fs::read_to_string(&paths.server_json).unwrap(), SERVER_JSON);
        assert!(!paths.changes.exists());
        assert!(!paths.sqlite.exists());
    }

    #[test]
    fn test_incomplete_document_changes_nothing() {
        let (_temp_dir, paths) = deployment();
        fs::write(&paths.domain_txt, "edge1.example.net").unwrap();
        let partial = r#"{"inbounds": [{"tag": "v10-vless-ws", "transport": {"path": "/x"}}]}"#;
        fs::write(&paths.server_json, partial).unwrap();

        let err = mutate(&Config::default(), &paths, &mut OsSecretSource::default(), &mut StdRng::seed_from_u64(2), false)
            .unwrap_err();
        assert!(matches!(err, RotorError::IncompleteChangeSet { .. }));
        assert_eq!(fs::read_to_string(&paths.server_json).unwrap(), partial);
        assert!(!paths.changes.exists());
        assert_eq!(AuditSink::open(&paths.sqlite).unwrap().run_count().unwrap(), 0);
    }

    #[test]
    fn test_patch_follows_mutation() {
        let (_temp_dir, paths) = deployment();
        fs::write(&paths.domain_txt, "edge1.example.net").unwrap();
        let report = run_mutate(&paths, 11);

        let outcome = patch(&Config::default(), &paths, None, false).unwrap();
        let written = fs::read_to_string(&paths.haproxy).unwrap();
        assert_eq!(written, outcome.text);
        assert_eq!(
            fs::read_to_string(crate::haproxy::backup_path(&paths.haproxy)).unwrap(),
            HAPROXY_CFG
        );

        let map = BackendMap::standard();
        for (tag, value) in report.changes.iter() {
            let Some(backends) = map.backends(tag) else {
                continue;
            };
            let expected = if value.starts_with('/') {
                value.to_string()
            } else {
                format!("/{}", value)
            };
            for backend in backends {
                let directive = BackendDirective::new(backend).unwrap();
                assert_eq!(directive.paths(&written), vec![expected.as_str()], "backend {}", backend);
            }
        }

        assert!(written.contains(&format!("-i {} }}", report.domains.reality())));
        assert!(written.contains(&format!("-i {} }}", report.domains.shadowtls())));
        assert!(!written.contains("www.habbo.com"));
        assert!(!written.contains("www.shamela.ws"));

        // ss-new, realityin_43124 and hysteria_in_50062 have no backend
        assert_eq!(outcome.count(NoteKind::Warn), 3);
        assert_eq!(outcome.count(NoteKind::Miss), 0);
        assert_eq!(outcome.count(NoteKind::Backup), 1);

        let again = patch(&Config::default(), &paths, None, false).unwrap();
        assert_eq!(again.count(NoteKind::Path), 0);
        assert_eq!(again.count(NoteKind::Host), 0);
        assert_eq!(fs::read_to_string(&paths.haproxy).unwrap(), written);
    }

    #[test]
    fn test_selection_avoids_other_placeholders() {
        let config = Config::default();
        let pool = MasqueradePool::new(vec![
            "www.shamela.ws".to_string(),
            "www.habbo.com".to_string(),
            "a.example".to_string(),
        ])
        .unwrap();

        for seed in 0..100 {
            let domains = select_domains(&pool, &config.patcher, &mut StdRng::seed_from_u64(seed)).unwrap();
            assert_ne!(domains.reality(), "www.shamela.ws");
            assert_ne!(domains.shadowtls(), "www.habbo.com");
        }
    }

    #[test]
    fn test_placeholder_pool_patches_to_fixed_point() {
        let (_temp_dir, paths) = deployment();
        fs::write(&paths.domain_txt, "edge1.example.net").unwrap();
        fs::write(
            &paths.masquerade_pool,
            r#"["www.habbo.com", "www.shamela.ws", "a.example"]"#,
        )
        .unwrap();

        for seed in 0..8 {
            run_mutate(&paths, seed);
            patch(&Config::default(), &paths, None, false).unwrap();
            let first = fs::read_to_string(&paths.haproxy).unwrap();

            let again = patch(&Config::default(), &paths, None, false).unwrap();
            assert_eq!(again.count(NoteKind::Host), 0, "seed {}", seed);
            assert_eq!(fs::read_to_string(&paths.haproxy).unwrap(), first);
            fs::write(&paths.haproxy, HAPROXY_CFG).unwrap();
        }
    }

    #[test]
    fn test_failed_change_set_write_keeps_old_domains() {
        let (_temp_dir, mut paths) = deployment();
        fs::write(&paths.domain_txt, "edge1.example.net").unwrap();
        paths.changes = paths.domain_txt.join("changes_dict.json");

        let mut rng = StdRng::seed_from_u64(4);
        let result = mutate(&Config::default(), &paths, &mut OsSecretSource::default(), &mut rng, false);
        assert!(result.is_err());
        assert!(!paths.selected_domains.exists());
    }

    #[test]
    fn test_patch_without_change_set_fails() {
        let (_temp_dir, paths) = deployment();
        assert!(matches!(
            patch(&Config::default(), &paths, None, false),
            Err(RotorError::Io { .. })
        ));
    }
}
