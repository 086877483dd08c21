// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service-definition document mutation
//!
//! Walks the `inbounds` list, looks each tag up in the rule table and writes
//! freshly generated values into the owned field. Inbounds with unknown tags
//! are left exactly as they were.

mod rules;

pub use rules::{recorded_tags, rule_for, InboundRule, RULES};

use std::collections::HashSet;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::changeset::ChangeSet;
use crate::domains::SelectedDomains;
use crate::error::{Result, RotorError};
use crate::secrets::SecretSource;

/// Values the mutator takes from outside the generator
#[derive(Debug, Clone, Copy)]
pub struct MutationContext<'a> {
    /// Decoy domains for this run
    pub domains: &'a SelectedDomains,
    /// The server's own domain
    pub primary_domain: &'a str,
}

/// Result of mutating one document
#[derive(Debug, Clone, Default)]
pub struct MutationOutcome {
    /// Generated values by tag
    pub changes: ChangeSet,
    /// Reality public key, for the audit store only
    pub reality_public_key: Option<String>,
    /// Managed tags found in the document, in document order
    pub applied: Vec<String>,
    /// Tags present in the document but not managed
    pub untouched: Vec<String>,
}

/// Mutate `document` in memory
pub fn mutate_document<S>(
    document: &mut Value,
    context: &MutationContext<'_>,
    source: &mut S,
) -> Result<MutationOutcome>
where
    S: SecretSource + ?Sized,
{
    let inbounds = document
        .get_mut("inbounds")
        .ok_or_else(|| RotorError::invalid_document("missing top-level 'inbounds'"))?
        .as_array_mut()
        .ok_or_else(|| RotorError::invalid_document("'inbounds' is not a list"))?;

    let mut outcome = MutationOutcome::default();
    let mut seen = HashSet::new();

    for (index, inbound) in inbounds.iter_mut().enumerate() {
        let inbound = inbound.as_object_mut().ok_or_else(|| {
            RotorError::invalid_document(format!("inbound #{} is not an object", index))
        })?;

        let Some(tag) = inbound.get("tag").and_then(Value::as_str).map(str::to_string) else {
            debug!(index, "Skipping inbound without tag");
            continue;
        };

        let Some(rule) = rule_for(&tag) else {
            debug!(tag = %tag, "Leaving unmanaged inbound untouched");
            outcome.untouched.push(tag);
            continue;
        };

        if !seen.insert(tag.clone()) {
            return Err(RotorError::DuplicateTag { tag });
        }

        apply_rule(rule, &tag, inbound, context, source, &mut outcome)?;
        info!(tag = %tag, field = rule.field(), "Rotated inbound");
        outcome.applied.push(tag);
    }

    Ok(outcome)
}

fn apply_rule<S>(
    rule: InboundRule,
    tag: &str,
    inbound: &mut Map<String, Value>,
    context: &MutationContext<'_>,
    source: &mut S,
    outcome: &mut MutationOutcome,
) -> Result<()>
where
    S: SecretSource + ?Sized,
{
    let domains = context.domains;

    match rule {
        InboundRule::TransportPath { prefix } => {
            let path = source.prefixed_token(prefix);
            object_at(inbound, tag, &["transport"])?.insert("path".into(), path.clone().into());
            outcome.changes.insert(tag, path)?;
        }
        InboundRule::ServiceName { prefix } => {
            let name = source.prefixed_token(prefix);
            object_at(inbound, tag, &["transport"])?
                .insert("service_name".into(), name.clone().into());
            outcome.changes.insert(tag, name)?;
        }
        InboundRule::StreamCipherKey => {
            let password = source.stream_cipher_key();
            inbound.insert("password".into(), password.clone().into());
            outcome.changes.insert(tag, password)?;
        }
        InboundRule::Reality => {
            let keypair = source.reality_keypair();
            object_at(inbound, tag, &["tls"])?
                .insert("server_name".into(), domains.reality().into());
            object_at(inbound, tag, &["tls", "reality"])?
                .insert("private_key".into(), keypair.private_key.clone().into());
            object_at(inbound, tag, &["tls", "reality", "handshake"])?
                .insert("server".into(), domains.reality().into());
            outcome.changes.insert(tag, keypair.private_key)?;
            outcome.reality_public_key = Some(keypair.public_key);
        }
        InboundRule::ShadowTls => {
            object_at(inbound, tag, &["handshake"])?
                .insert("server".into(), domains.shadowtls().into());
        }
        InboundRule::Hysteria => {
            let password = source.token();
            inbound.insert(
                "masquerade".into(),
                format!("https://{}:80/", domains.hysteria()).into(),
            );
            object_at(inbound, tag, &["obfs"])?.insert("password".into(), password.clone().into());
            object_at(inbound, tag, &["tls"])?
                .insert("server_name".into(), context.primary_domain.into());
            outcome.changes.insert(tag, password)?;
        }
        InboundRule::PrimaryServerName => {
            object_at(inbound, tag, &["tls"])?
                .insert("server_name".into(), context.primary_domain.into());
        }
    }

    Ok(())
}

/// Nested object at `path`, created when absent
fn object_at<'v>(
    inbound: &'v mut Map<String, Value>,
    tag: &str,
    path: &[&str],
) -> Result<&'v mut Map<String, Value>> {
    let mut current = inbound;
    for (depth, key) in path.iter().enumerate() {
        current = current
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| {
                RotorError::invalid_document(format!(
                    "inbound '{}': '{}' is not an object",
                    tag,
                    path[..=depth].join(".")
                ))
            })?;
    }
    Ok(current)
}

/// Read and parse the service document
pub fn read_document<P: AsRef<Path>>(path: P) -> Result<Value> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(RotorError::ConfigNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path).map_err(|e| RotorError::io(path, e))?;
    serde_json::from_str(&contents).map_err(|e| {
        RotorError::invalid_document(format!("{}: {}", path.display(), e))
    })
}

/// Overwrite the service document in place.
///
/// Truncates and rewrites the file; callers finish every transformation in
/// memory before calling this.
pub fn write_document<P: AsRef<Path>>(path: P, document: &Value) -> Result<()> {
    crate::write_json_pretty(path.as_ref(), document)
}

/// Read the server's primary domain from its one-line file
pub fn read_primary_domain<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| RotorError::io(path, e))?;
    let domain = contents.trim();
    if domain.is_empty() {
        return Err(RotorError::invalid_config(format!(
            "primary domain file {} is empty",
            path.display()
        )));
    }
    Ok(domain.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::RealityKeypair;
    use serde_json::json;

    /// Deterministic source: tokens count up, keys are fixed
    struct SequenceSource {
        next: u32,
    }

    impl SecretSource for SequenceSource {
        fn token(&mut self) -> String {
            self.next += 1;
            format!("TOKEN{:02}", self.next)
        }

        fn stream_cipher_key(&mut self) -> String {
            "c3RyZWFtLWNpcGhlci1rZXk=".to_string()
        }

        fn reality_keypair(&mut self) -> RealityKeypair {
            RealityKeypair {
                private_key: "PRIVATE".to_string(),
                public_key: "PUBLIC".to_string(),
            }
        }
    }

    fn domains() -> SelectedDomains {
        SelectedDomains::try_from(vec![
            "reality.example".to_string(),
            "shadow.example".to_string(),
            "hyst.example".to_string(),
        ])
        .unwrap()
    }

    fn run(document: &mut Value) -> Result<MutationOutcome> {
        let domains = domains();
        let context = MutationContext {
            domains: &domains,
            primary_domain: "proxy.example.net",
        };
        mutate_document(document, &context, &mut SequenceSource { next: 0 })
    }

    #[test]
    fn test_transport_paths_and_service_names() {
        let mut document = json!({
            "inbounds": [
                {"tag": "v10-vless-ws", "type": "vless", "transport": {"type": "ws", "path": "/old"}},
                {"tag": "v10-vmess-tcp", "type": "vmess", "transport": {"type": "http"}},
                {"tag": "v10-vless-httpupgrade", "type": "vless"},
                {"tag": "v10-trojan-grpc", "type": "trojan", "transport": {"type": "grpc", "service_name": "x"}}
            ]
        });

        let outcome = run(&mut document).unwrap();
        let inbounds = document["inbounds"].as_array().unwrap();

        assert_eq!(inbounds[0]["transport"]["path"], "/assetsTOKEN01");
        assert_eq!(inbounds[0]["transport"]["type"], "ws");
        assert_eq!(inbounds[1]["transport"]["path"], "/userTOKEN02");
        assert_eq!(inbounds[2]["transport"]["path"], "/filesTOKEN03");
        assert_eq!(inbounds[3]["transport"]["service_name"], "apiTOKEN04");

        assert_eq!(outcome.changes.len(), 4);
        assert_eq!(outcome.changes.get("v10-vless-ws"), Some("/assetsTOKEN01"));
        assert_eq!(outcome.changes.get("v10-trojan-grpc"), Some("apiTOKEN04"));
    }

    #[test]
    fn test_reality_inbound() {
        let mut document = json!({
            "inbounds": [{"tag": "realityin_43124", "type": "vless",
                          "tls": {"enabled": true, "reality": {"enabled": true}}}]
        });

        let outcome = run(&mut document).unwrap();
        let tls = &document["inbounds"][0]["tls"];

        assert_eq!(tls["enabled"], true);
        assert_eq!(tls["server_name"], "reality.example");
        assert_eq!(tls["reality"]["enabled"], true);
        assert_eq!(tls["reality"]["private_key"], "PRIVATE");
        assert_eq!(tls["reality"]["handshake"]["server"], "reality.example");

        assert_eq!(outcome.changes.get("realityin_43124"), Some("PRIVATE"));
        assert_eq!(outcome.reality_public_key.as_deref(), Some("PUBLIC"));
        assert!(!document.to_string().contains("PUBLIC"));
    }

    #[test]
    fn test_shadowtls_and_tuic_do_not_enter_change_set() {
        let mut document = json!({
            "inbounds": [
                {"tag": "shadowtls", "type": "shadowtls"},
                {"tag": "tuic_in_55851", "type": "tuic", "tls": {"server_name": "old"}}
            ]
        });

        let outcome = run(&mut document).unwrap();
        assert_eq!(document["inbounds"][0]["handshake"]["server"], "shadow.example");
        assert_eq!(document["inbounds"][1]["tls"]["server_name"], "proxy.example.net");
        assert!(outcome.changes.is_empty());
        assert_eq!(outcome.applied, vec!["shadowtls", "tuic_in_55851"]);
    }

    #[test]
    fn test_hysteria_and_stream_cipher() {
        let mut document = json!({
            "inbounds": [
                {"tag": "hysteria_in_50062", "type": "hysteria2", "obfs": {"type": "salamander"}},
                {"tag": "ss-new", "type": "shadowsocks", "method": "2022-blake3-aes-256-gcm"}
            ]
        });

        let outcome = run(&mut document).unwrap();
        let hysteria = &document["inbounds"][0];
        assert_eq!(hysteria["masquerade"], "https://hyst.example:80/");
        assert_eq!(hysteria["obfs"]["type"], "salamander");
        assert_eq!(hysteria["obfs"]["password"], "TOKEN01");
        assert_eq!(hysteria["tls"]["server_name"], "proxy.example.net");
        assert_eq!(document["inbounds"][1]["password"], "c3RyZWFtLWNpcGhlci1rZXk=");

        assert_eq!(outcome.changes.get("hysteria_in_50062"), Some("TOKEN01"));
        assert_eq!(outcome.changes.get("ss-new"), Some("c3RyZWFtLWNpcGhlci1rZXk="));
    }

    #[test]
    fn test_unknown_tags_untouched() {
        let unknown = json!({"tag": "direct-out", "type": "mixed", "transport": {"path": "/keep"}});
        let untagged = json!({"type": "socks", "listen": "::"});
        let mut document = json!({
            "log": {"level": "info"},
            "inbounds": [unknown.clone(), {"tag": "v10-vless-ws"}, untagged.clone()]
        });

        let outcome = run(&mut document).unwrap();
        assert_eq!(document["inbounds"][0], unknown);
        assert_eq!(document["inbounds"][2], untagged);
        assert_eq!(document["log"], json!({"level": "info"}));
        assert_eq!(outcome.untouched, vec!["direct-out"]);
    }

    #[test]
    fn test_key_order_preserved() {
        let mut document = json!({
            "inbounds": [{"type": "vless", "tag": "v10-vless-ws", "listen": "127.0.0.1",
                          "transport": {"type": "ws", "path": "/old", "early_data": 0}}]
        });
        run(&mut document).unwrap();

        let keys: Vec<&String> = document["inbounds"][0]["transport"]
            .as_object()
            .unwrap()
            .keys()
            .collect();
        assert_eq!(keys, vec!["type", "path", "early_data"]);
    }

    #[test]
    fn test_malformed_documents() {
        assert!(matches!(
            run(&mut json!({"outbounds": []})),
            Err(RotorError::InvalidDocument { .. })
        ));
        assert!(matches!(
            run(&mut json!({"inbounds": {}})),
            Err(RotorError::InvalidDocument { .. })
        ));
        assert!(matches!(
            run(&mut json!({"inbounds": ["v10-vless-ws"]})),
            Err(RotorError::InvalidDocument { .. })
        ));

        let err = run(&mut json!({"inbounds": [{"tag": "realityin_43124", "tls": {"reality": true}}]}))
            .unwrap_err();
        assert!(err.to_string().contains("tls.reality"));
    }

    #[test]
    fn test_duplicate_managed_tag() {
        let mut document = json!({
            "inbounds": [{"tag": "v10-vless-ws"}, {"tag": "v10-vless-ws"}]
        });
        assert!(matches!(run(&mut document), Err(RotorError::DuplicateTag { .. })));
    }

    #[test]
    fn test_document_file_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("server.json");
        std::fs::write(&path, r#"{"inbounds": [{"tag": "ss-new", "password": "old"}]}"#).unwrap();

        let mut document = read_document(&path).unwrap();
        run(&mut document).unwrap();
        write_document(&path, &document).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("    \"inbounds\""));
        assert_eq!(read_document(&path).unwrap(), document);
    }

    #[test]
    fn test_read_primary_domain() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("domain.txt");

        std::fs::write(&path, "proxy.example.net\n").unwrap();
        assert_eq!(read_primary_domain(&path).unwrap(), "proxy.example.net");

        std::fs::write(&path, "  \n").unwrap();
        assert!(read_primary_domain(&path).is_err());
    }
}
