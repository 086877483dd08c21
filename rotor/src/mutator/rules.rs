// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound tag dispatch table
//!
//! One row per managed inbound. The row says which field the tag owns and
//! how its value is produced. The audit schema is derived from this table.

use crate::secrets::{GRPC_PREFIX, HTTPUPGRADE_PREFIX, TCP_PREFIX, WEBSOCKET_PREFIX};

/// What the mutator does to an inbound with a given tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRule {
    /// `transport.path = prefix + token`
    TransportPath { prefix: &'static str },
    /// `transport.service_name = prefix + token`
    ServiceName { prefix: &'static str },
    /// Top-level `password` = base64 stream-cipher key
    StreamCipherKey,
    /// `tls.reality.private_key`, plus server name and handshake server set
    /// to the reality decoy domain
    Reality,
    /// `handshake.server` = shadow-TLS decoy domain
    ShadowTls,
    /// `obfs.password`, `tls.server_name` = primary domain, `masquerade` URL
    Hysteria,
    /// `tls.server_name` = primary domain
    PrimaryServerName,
}

impl InboundRule {
    /// Whether the rule contributes an entry to the change set
    pub fn records_change(self) -> bool {
        !matches!(self, InboundRule::ShadowTls | InboundRule::PrimaryServerName)
    }

    /// Dotted path of the field whose value enters the change set, or of the
    /// single field set for rules that record nothing
    pub fn field(self) -> &'static str {
        match self {
            InboundRule::TransportPath { .. } => "transport.path",
            InboundRule::ServiceName { .. } => "transport.service_name",
            InboundRule::StreamCipherKey => "password",
            InboundRule::Reality => "tls.reality.private_key",
            InboundRule::ShadowTls => "handshake.server",
            InboundRule::Hysteria => "obfs.password",
            InboundRule::PrimaryServerName => "tls.server_name",
        }
    }
}

const WS: InboundRule = InboundRule::TransportPath {
    prefix: WEBSOCKET_PREFIX,
};
const TCP: InboundRule = InboundRule::TransportPath { prefix: TCP_PREFIX };
const HTTPUPGRADE: InboundRule = InboundRule::TransportPath {
    prefix: HTTPUPGRADE_PREFIX,
};
const GRPC: InboundRule = InboundRule::ServiceName {
    prefix: GRPC_PREFIX,
};

/// Every managed inbound tag
pub const RULES: &[(&str, InboundRule)] = &[
    ("v10-trojan-grpc", GRPC),
    ("v10-vless-grpc", GRPC),
    ("v10-vmess-grpc", GRPC),
    ("v10-vless-httpupgrade", HTTPUPGRADE),
    ("v10-vmess-httpupgrade", HTTPUPGRADE),
    ("v10-vless-tcp", TCP),
    ("v10-vmess-tcp", TCP),
    ("v10-trojan-tcp", TCP),
    ("v10-vmess-ws", WS),
    ("v10-trojan-ws", WS),
    ("v10-vless-ws", WS),
    ("ss-new", InboundRule::StreamCipherKey),
    ("realityin_43124", InboundRule::Reality),
    ("hysteria_in_50062", InboundRule::Hysteria),
    ("shadowtls", InboundRule::ShadowTls),
    ("tuic_in_55851", InboundRule::PrimaryServerName),
];

/// Rule for `tag`, if the tag is managed
pub fn rule_for(tag: &str) -> Option<InboundRule> {
    RULES
        .iter()
        .find(|(known, _)| *known == tag)
        .map(|(_, rule)| *rule)
}

/// Tags whose values enter the change set, in table order
pub fn recorded_tags() -> impl Iterator<Item = &'static str> {
    RULES
        .iter()
        .filter(|(_, rule)| rule.records_change())
        .map(|(tag, _)| *tag)
}
