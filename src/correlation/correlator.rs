use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, trace};
use sha1::{Digest, Sha1};

use super::rules::{self, RuleSignals};
use super::types::*;
use crate::configuration::types::RuleThresholds;
use crate::dissector::field_reader::HeaderIndex;

/// Length of the hex session id.
const SESSION_ID_LEN: usize = 12;

/// One dissector row, normalized. Only rows with a frame number and timestamp exist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketRecord {
    pub frame: u64,
    pub ts: f64,
    pub frame_len: Option<u64>,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub tcp_ports: (Option<u16>, Option<u16>),
    pub udp_ports: (Option<u16>, Option<u16>),
    /// TCP segment payload length (`tcp.len`).
    pub tcp_payload: Option<u64>,
    /// UDP datagram length including its 8-byte header (`udp.length`).
    pub udp_length: Option<u64>,
    pub protocols: Option<String>,
    pub dns_query: Option<String>,
    pub http_method: Option<String>,
    pub http_host: Option<String>,
    pub http_uri: Option<String>,
    pub tls_sni: Option<String>,
}

fn port(header: &HeaderIndex, record: &[String], name: &str) -> Option<u16> {
    header.get(record, name)?.parse().ok()
}

impl PacketRecord {
    pub fn from_fields(header: &HeaderIndex, record: &[String]) -> Option<Self> {
        let text = |name: &str| header.get(record, name).map(str::to_string);
        Some(Self {
            frame: header.get_u64(record, "frame.number")?,
            ts: header.get_f64(record, "frame.time_epoch")?,
            frame_len: header.get_u64(record, "frame.len"),
            src_ip: text("ip.src").or_else(|| text("ipv6.src")),
            dst_ip: text("ip.dst").or_else(|| text("ipv6.dst")),
            tcp_ports: (
                port(header, record, "tcp.srcport"),
                port(header, record, "tcp.dstport"),
            ),
            udp_ports: (
                port(header, record, "udp.srcport"),
                port(header, record, "udp.dstport"),
            ),
            tcp_payload: header.get_u64(record, "tcp.len"),
            udp_length: header.get_u64(record, "udp.length"),
            protocols: text("frame.protocols"),
            dns_query: text("dns.qry.name"),
            http_method: text("http.request.method"),
            http_host: text("http.host"),
            http_uri: text("http.request.uri"),
            tls_sni: text("tls.handshake.extensions_server_name"),
        })
    }

    /// Transport plus the ports that go with it, inferred from which port fields are present.
    pub fn transport(&self) -> (Transport, Option<u16>, Option<u16>) {
        match (self.tcp_ports, self.udp_ports) {
            ((src, dst), _) if src.is_some() || dst.is_some() => (Transport::Tcp, src, dst),
            (_, (src, dst)) if src.is_some() || dst.is_some() => (Transport::Udp, src, dst),
            _ => (Transport::Other, None, None),
        }
    }

    fn payload_bytes(&self) -> u64 {
        match self.transport().0 {
            Transport::Tcp => self.tcp_payload.unwrap_or(0),
            Transport::Udp => self.udp_length.map(|l| l.saturating_sub(8)).unwrap_or(0),
            Transport::Other => 0,
        }
    }
}

/// Orders two endpoints by their `ip:port` text; the smaller one becomes side A.
///
/// Plain string comparison: `10.0.0.9` sorts after `10.0.0.10`. Session ids
/// depend on this, so it must not become numeric.
pub fn canonical_pair(src: Endpoint, dst: Endpoint) -> EndpointPair {
    if src.to_string() <= dst.to_string() {
        EndpointPair { a: src, b: dst }
    } else {
        EndpointPair { a: dst, b: src }
    }
}

/// `transport:a->b` over the canonical pair.
pub fn session_key(transport: Transport, pair: &EndpointPair) -> String {
    format!("{}:{}->{}", transport, pair.a, pair.b)
}

/// First 12 hex characters of the SHA-1 of the session key.
pub fn session_id(key: &str) -> String {
    let digest = Sha1::digest(key.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(SESSION_ID_LEN);
    id
}

struct SessionBuilder {
    session: Session,
    seen_tokens: HashSet<String>,
    payload_seen: bool,
}

/// Result of a correlation pass, before file metadata is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    pub packets_analyzed: u64,
    pub first_ts: Option<f64>,
    pub last_ts: Option<f64>,
    pub sessions: Vec<Session>,
    pub timeline: Vec<TimelineEvent>,
}

/// Folds packets into sessions and timeline events. Pure: no I/O.
pub struct Correlator {
    sample_frames: usize,
    header: Option<HeaderIndex>,
    sessions: HashMap<String, SessionBuilder>,
    events: Vec<TimelineEvent>,
    rows: u64,
    dropped: u64,
    first_ts: Option<f64>,
    last_ts: Option<f64>,
}

impl Correlator {
    pub fn new(sample_frames: usize) -> Self {
        Self {
            sample_frames,
            header: None,
            sessions: HashMap::new(),
            events: Vec::new(),
            rows: 0,
            dropped: 0,
            first_ts: None,
            last_ts: None,
        }
    }

    /// Feeds one tokenized record. The first record is taken as the header.
    pub fn ingest_record(&mut self, record: Vec<String>) {
        if self.header.is_none() {
            self.header = Some(HeaderIndex::new(&record));
            return;
        }
        let header = match &self.header {
            Some(header) => header,
            None => return,
        };
        if record.len() == 1 && record[0].trim().is_empty() {
            return;
        }
        self.rows += 1;
        match PacketRecord::from_fields(header, &record) {
            Some(packet) => self.observe(&packet),
            None => {
                self.dropped += 1;
                trace!("Dropping row {} without frame number or timestamp", self.rows);
            }
        }
    }

    /// Feeds one already-normalized packet (counted as an analyzed row).
    pub fn ingest_packet(&mut self, packet: &PacketRecord) {
        self.rows += 1;
        self.observe(packet);
    }

    fn observe(&mut self, packet: &PacketRecord) {
        let ts = packet.ts;
        self.first_ts = Some(self.first_ts.map_or(ts, |t| t.min(ts)));
        self.last_ts = Some(self.last_ts.map_or(ts, |t| t.max(ts)));

        let (src_ip, dst_ip) = match (&packet.src_ip, &packet.dst_ip) {
            (Some(src), Some(dst)) => (src.clone(), dst.clone()),
            _ => {
                self.dropped += 1;
                return;
            }
        };

        let (transport, src_port, dst_port) = packet.transport();
        let pair = canonical_pair(
            Endpoint::new(src_ip, src_port),
            Endpoint::new(dst_ip, dst_port),
        );
        let key = session_key(transport, &pair);
        let frame = packet.frame;

        let builder = self.sessions.entry(key).or_insert_with_key(|key| {
            let id = session_id(key);
            debug!("[{}] New session {}", id, key);
            self.events
                .push(TimelineEvent::new(ts, &id, frame, EventBody::SessionStart));
            SessionBuilder {
                session: Session {
                    id,
                    transport,
                    endpoints: pair,
                    first_ts: ts,
                    last_ts: ts,
                    duration_seconds: 0.0,
                    packet_count: 0,
                    byte_count: 0,
                    protocol_chains: BTreeMap::new(),
                    evidence: Evidence {
                        first_frame: frame,
                        last_frame: frame,
                        sample_frames: Vec::new(),
                    },
                    observations: Observations::default(),
                    rule_flags: Vec::new(),
                },
                seen_tokens: HashSet::new(),
                payload_seen: false,
            }
        });

        let session = &mut builder.session;
        let id = session.id.clone();
        session.packet_count += 1;
        session.byte_count += packet.frame_len.unwrap_or(0);
        session.first_ts = session.first_ts.min(ts);
        session.last_ts = session.last_ts.max(ts);
        session.evidence.first_frame = session.evidence.first_frame.min(frame);
        session.evidence.last_frame = session.evidence.last_frame.max(frame);
        if session.evidence.sample_frames.len() < self.sample_frames {
            session.evidence.sample_frames.push(frame);
        }

        let payload = packet.payload_bytes();
        if payload > 0 && !builder.payload_seen {
            builder.payload_seen = true;
            self.events.push(TimelineEvent::new(
                ts,
                &id,
                frame,
                EventBody::PayloadObserved { bytes: payload },
            ));
        }

        if let Some(chain) = &packet.protocols {
            *session.protocol_chains.entry(chain.clone()).or_insert(0) += 1;
            for token in chain.split(':').map(str::trim).filter(|t| !t.is_empty()) {
                if builder.seen_tokens.insert(token.to_string()) {
                    self.events.push(TimelineEvent::new(
                        ts,
                        &id,
                        frame,
                        EventBody::ProtocolObserved {
                            protocol: token.to_string(),
                        },
                    ));
                }
            }
        }

        if let Some(name) = &packet.dns_query {
            session.observations.dns_queries.push(DnsObservation {
                name: name.clone(),
                ts,
                evidence_frame: frame,
            });
            self.events.push(TimelineEvent::new(
                ts,
                &id,
                frame,
                EventBody::DnsQuery { name: name.clone() },
            ));
        }

        if let Some(method) = &packet.http_method {
            if packet.http_host.is_some() || packet.http_uri.is_some() {
                session.observations.http_requests.push(HttpObservation {
                    method: method.clone(),
                    host: packet.http_host.clone(),
                    uri: packet.http_uri.clone(),
                    ts,
                    evidence_frame: frame,
                });
                self.events.push(TimelineEvent::new(
                    ts,
                    &id,
                    frame,
                    EventBody::HttpRequest {
                        method: method.clone(),
                        host: packet.http_host.clone(),
                        uri: packet.http_uri.clone(),
                    },
                ));
            }
        }

        if let Some(server_name) = &packet.tls_sni {
            session.observations.tls_sni.push(TlsObservation {
                server_name: server_name.clone(),
                ts,
                evidence_frame: frame,
            });
            self.events.push(TimelineEvent::new(
                ts,
                &id,
                frame,
                EventBody::TlsSni {
                    server_name: server_name.clone(),
                },
            ));
        }
    }

    /// Applies rule flags and the contractual orderings.
    pub fn finish(self, thresholds: &RuleThresholds) -> Correlation {
        let mut sessions: Vec<Session> = self
            .sessions
            .into_values()
            .map(|builder| {
                let mut session = builder.session;
                session.duration_seconds = session.last_ts - session.first_ts;
                let signals = RuleSignals {
                    transport: session.transport,
                    packet_count: session.packet_count,
                    byte_count: session.byte_count,
                    duration_seconds: session.duration_seconds,
                    ports: [session.endpoints.a.port, session.endpoints.b.port],
                    protocol_tokens: rules::protocol_tokens(session.protocol_chains.keys()),
                };
                session.rule_flags = rules::evaluate(&signals, thresholds);
                session
            })
            .collect();
        sessions.sort_by(|x, y| x.first_ts.total_cmp(&y.first_ts).then_with(|| x.id.cmp(&y.id)));

        let mut timeline = self.events;
        // Stable: events from one frame keep their emission order.
        timeline.sort_by(|x, y| {
            x.ts.total_cmp(&y.ts)
                .then_with(|| x.evidence_frame.cmp(&y.evidence_frame))
        });

        debug!(
            "Correlated {} row(s) into {} session(s), {} event(s), {} dropped",
            self.rows,
            sessions.len(),
            timeline.len(),
            self.dropped
        );
        Correlation {
            packets_analyzed: self.rows,
            first_ts: self.first_ts,
            last_ts: self.last_ts,
            sessions,
            timeline,
        }
    }
}
