//! The versioned analysis artifact handed to upstream consumers.
//!
//! Field names and ordering here are a contract: sessions are sorted by
//! `(first_ts, id)`, the timeline by `(ts, evidence_frame)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::rules::RuleFlag;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Other,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
            Transport::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: Option<u16>,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

/// `ip:port`, with a missing port written as `None`. This is the text compared
/// when canonicalizing and hashed into session ids, so it must not change.
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.ip, port),
            None => write!(f, "{}:None", self.ip),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPair {
    pub a: Endpoint,
    pub b: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub first_frame: u64,
    pub last_frame: u64,
    /// The first N frames seen for the session, in capture order.
    pub sample_frames: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsObservation {
    pub name: String,
    pub ts: f64,
    pub evidence_frame: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpObservation {
    pub method: String,
    pub host: Option<String>,
    pub uri: Option<String>,
    pub ts: f64,
    pub evidence_frame: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsObservation {
    pub server_name: String,
    pub ts: f64,
    pub evidence_frame: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observations {
    pub dns_queries: Vec<DnsObservation>,
    pub http_requests: Vec<HttpObservation>,
    pub tls_sni: Vec<TlsObservation>,
}

/// A bidirectional conversation between two endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub transport: Transport,
    pub endpoints: EndpointPair,
    pub first_ts: f64,
    pub last_ts: f64,
    pub duration_seconds: f64,
    pub packet_count: u64,
    pub byte_count: u64,
    /// `frame.protocols` chain → packets carrying it.
    pub protocol_chains: BTreeMap<String, u64>,
    pub evidence: Evidence,
    pub observations: Observations,
    pub rule_flags: Vec<RuleFlag>,
}

/// Event payload, keyed by kind. Serialized as `"kind"` plus an optional `"meta"` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "meta", rename_all = "snake_case")]
pub enum EventBody {
    SessionStart,
    PayloadObserved {
        bytes: u64,
    },
    ProtocolObserved {
        protocol: String,
    },
    DnsQuery {
        name: String,
    },
    HttpRequest {
        method: String,
        host: Option<String>,
        uri: Option<String>,
    },
    TlsSni {
        server_name: String,
    },
}

impl EventBody {
    pub fn kind(&self) -> &'static str {
        match self {
            EventBody::SessionStart => "session_start",
            EventBody::PayloadObserved { .. } => "payload_observed",
            EventBody::ProtocolObserved { .. } => "protocol_observed",
            EventBody::DnsQuery { .. } => "dns_query",
            EventBody::HttpRequest { .. } => "http_request",
            EventBody::TlsSni { .. } => "tls_sni",
        }
    }

    pub fn summary(&self) -> String {
        match self {
            EventBody::SessionStart => "Session started".to_string(),
            EventBody::PayloadObserved { bytes } => {
                format!("First payload observed ({} bytes)", bytes)
            }
            EventBody::ProtocolObserved { protocol } => format!("Protocol observed: {}", protocol),
            EventBody::DnsQuery { name } => format!("DNS query: {}", name),
            EventBody::HttpRequest { method, host, uri } => format!(
                "HTTP request: {} {}{}",
                method,
                host.as_deref().unwrap_or(""),
                uri.as_deref().unwrap_or("")
            ),
            EventBody::TlsSni { server_name } => format!("TLS SNI: {}", server_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub ts: f64,
    pub session_id: String,
    pub summary: String,
    pub evidence_frame: u64,
    #[serde(flatten)]
    pub body: EventBody,
}

impl TimelineEvent {
    pub fn new(ts: f64, session_id: &str, evidence_frame: u64, body: EventBody) -> Self {
        Self {
            ts,
            session_id: session_id.to_string(),
            summary: body.summary(),
            evidence_frame,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcapMetadata {
    pub path: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    /// Every row the dissector produced, including rows dropped for missing fields.
    pub packets_analyzed: u64,
    pub first_ts: Option<f64>,
    pub last_ts: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tooling {
    pub tshark_path: String,
    pub tshark_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisArtifact {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub rules_version: u32,
    pub pcap: PcapMetadata,
    pub tooling: Tooling,
    pub sessions: Vec<Session>,
    pub timeline: Vec<TimelineEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_kind_and_meta() {
        let event = TimelineEvent::new(
            1.5,
            "abc",
            7,
            EventBody::DnsQuery {
                name: "example.com".to_string(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "dns_query");
        assert_eq!(json["summary"], "DNS query: example.com");
        assert_eq!(json["meta"]["name"], "example.com");
        assert_eq!(json["evidence_frame"], 7);

        let start = serde_json::to_value(TimelineEvent::new(1.0, "abc", 1, EventBody::SessionStart))
            .unwrap();
        assert_eq!(start["kind"], "session_start");
        assert!(start.get("meta").is_none());
    }

    #[test]
    fn endpoint_text_marks_missing_port() {
        assert_eq!(Endpoint::new("10.0.0.1", Some(80)).to_string(), "10.0.0.1:80");
        assert_eq!(Endpoint::new("10.0.0.1", None).to_string(), "10.0.0.1:None");
    }

    #[test]
    fn http_summary_joins_host_and_uri() {
        let body = EventBody::HttpRequest {
            method: "GET".into(),
            host: Some("example.com".into()),
            uri: Some("/index.html".into()),
        };
        assert_eq!(body.summary(), "HTTP request: GET example.com/index.html");
        assert_eq!(body.kind(), "http_request");
    }
}
