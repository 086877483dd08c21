// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound tag to haproxy backend names

/// Tags served over both TLS and plain HTTP have a second `-http` backend
const STANDARD: &[(&str, &[&str])] = &[
    ("v10-vless-ws", &["v10-vless-ws"]),
    ("v10-vless-grpc", &["v10-vless-grpc", "v10-vless-grpc-http"]),
    ("v10-vless-httpupgrade", &["v10-vless-httpupgrade"]),
    ("v10-vless-tcp", &["v10-vless-tcp", "v10-vless-tcp-http"]),
    ("v10-vmess-ws", &["v10-vmess-ws"]),
    ("v10-vmess-grpc", &["v10-vmess-grpc", "v10-vmess-grpc-http"]),
    ("v10-vmess-httpupgrade", &["v10-vmess-httpupgrade"]),
    ("v10-vmess-tcp", &["v10-vmess-tcp", "v10-vmess-tcp-http"]),
    ("v10-trojan-ws", &["v10-trojan-ws"]),
    ("v10-trojan-grpc", &["v10-trojan-grpc", "v10-trojan-grpc-http"]),
    ("v10-trojan-httpupgrade", &["v10-trojan-httpupgrade"]),
    ("v10-trojan-tcp", &["v10-trojan-tcp", "v10-trojan-tcp-http"]),
];

/// Which backends route each inbound tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMap {
    entries: Vec<(String, Vec<String>)>,
}

impl BackendMap {
    /// The mapping used by the shipped haproxy.cfg
    pub fn standard() -> Self {
        STANDARD
            .iter()
            .map(|(tag, backends)| (tag.to_string(), backends.iter().map(|b| b.to_string()).collect()))
            .collect()
    }

    /// Backends for `tag`, if mapped
    pub fn backends(&self, tag: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(known, _)| known == tag)
            .map(|(_, backends)| backends.as_slice())
    }

    /// All `(tag, backends)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(tag, backends)| (tag.as_str(), backends.as_slice()))
    }
}

impl Default for BackendMap {
    fn default() -> Self {
        Self::standard()
    }
}

impl FromIterator<(String, Vec<String>)> for BackendMap {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
