use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::builtin_follow;
use super::follower::{reassemble, render_follow, PayloadPacket};
use super::types::{FollowRequest, FollowResult, FollowSource, TcpStreamEntry};
use crate::correlation::types::Endpoint;
use crate::dissector::field_reader::{FieldReader, HeaderIndex};
use crate::dissector::process::StreamingTool;
use crate::error_handling::types::ForensicError;

const LIST_FIELDS: &[&str] = &[
    "tcp.stream",
    "frame.number",
    "frame.time_epoch",
    "frame.len",
    "ip.src",
    "ip.dst",
    "ipv6.src",
    "ipv6.dst",
    "tcp.srcport",
    "tcp.dstport",
    "tcp.len",
];

const FOLLOW_FIELDS: &[&str] = &[
    "frame.number",
    "frame.time_epoch",
    "ip.src",
    "ip.dst",
    "ipv6.src",
    "ipv6.dst",
    "tcp.srcport",
    "tcp.dstport",
    "tcp.seq",
    "tcp.payload",
];

fn field_args(pcap: &Path, display_filter: &str, max_packets: Option<u64>, fields: &[&str]) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-r".into(),
        pcap.to_string_lossy().into_owned(),
        "-n".into(),
        "-Y".into(),
        display_filter.into(),
        "-T".into(),
        "fields".into(),
        "-E".into(),
        "header=y".into(),
        "-E".into(),
        "separator=\t".into(),
        "-E".into(),
        "quote=d".into(),
        "-E".into(),
        "occurrence=f".into(),
    ];
    if let Some(count) = max_packets {
        args.push("-c".into());
        args.push(count.to_string());
    }
    for field in fields {
        args.push("-e".into());
        args.push(field.to_string());
    }
    args
}

pub fn list_args(pcap: &Path, max_packets: Option<u64>) -> Vec<String> {
    field_args(pcap, "tcp", max_packets, LIST_FIELDS)
}

pub fn payload_args(pcap: &Path, stream_id: u64) -> Vec<String> {
    field_args(
        pcap,
        &format!("tcp.stream=={} && tcp.len>0", stream_id),
        None,
        FOLLOW_FIELDS,
    )
}

fn endpoint(header: &HeaderIndex, record: &[String], side: &str) -> Option<Endpoint> {
    let ip = header
        .get(record, &format!("ip.{}", side))
        .or_else(|| header.get(record, &format!("ipv6.{}", side)))?;
    let port = header
        .get(record, &format!("tcp.{}port", side))
        .and_then(|p| p.parse().ok());
    Some(Endpoint::new(ip, port))
}

/// Aggregates `-Y tcp` rows into one entry per stream.
#[derive(Debug, Default)]
pub struct StreamTable {
    header: Option<HeaderIndex>,
    streams: BTreeMap<u64, TcpStreamEntry>,
}

impl StreamTable {
    pub fn ingest_record(&mut self, record: Vec<String>) {
        if self.header.is_none() {
            self.header = Some(HeaderIndex::new(&record));
            return;
        }
        let header = match &self.header {
            Some(header) => header,
            None => return,
        };
        let (stream_id, frame, ts) = match (
            header.get_u64(&record, "tcp.stream"),
            header.get_u64(&record, "frame.number"),
            header.get_f64(&record, "frame.time_epoch"),
        ) {
            (Some(s), Some(f), Some(t)) => (s, f, t),
            _ => return,
        };
        let frame_len = header.get_u64(&record, "frame.len").unwrap_or(0);
        let payload = header.get_u64(&record, "tcp.len").unwrap_or(0);

        if let Some(entry) = self.streams.get_mut(&stream_id) {
            entry.first_ts = entry.first_ts.min(ts);
            entry.last_ts = entry.last_ts.max(ts);
            entry.packet_count += 1;
            entry.byte_count += frame_len;
            entry.payload_bytes += payload;
            entry.first_frame = entry.first_frame.min(frame);
            entry.last_frame = entry.last_frame.max(frame);
            return;
        }
        let (client, server) = match (
            endpoint(header, &record, "src"),
            endpoint(header, &record, "dst"),
        ) {
            (Some(c), Some(s)) => (c, s),
            _ => return,
        };
        self.streams.insert(
            stream_id,
            TcpStreamEntry {
                stream_id,
                client,
                server,
                first_ts: ts,
                last_ts: ts,
                packet_count: 1,
                byte_count: frame_len,
                payload_bytes: payload,
                first_frame: frame,
                last_frame: frame,
            },
        );
    }

    /// Entries by first-seen time, at most `limit` of them.
    pub fn finish(self, limit: Option<usize>) -> Vec<TcpStreamEntry> {
        let mut entries: Vec<TcpStreamEntry> = self.streams.into_values().collect();
        entries.sort_by(|x, y| {
            x.first_ts
                .total_cmp(&y.first_ts)
                .then_with(|| x.stream_id.cmp(&y.stream_id))
        });
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        entries
    }
}

/// Converts one follow row. `Err` carries a note for rows that cannot be used.
fn payload_packet(header: &HeaderIndex, record: &[String]) -> Result<Option<PayloadPacket>, String> {
    let (frame, ts) = match (
        header.get_u64(record, "frame.number"),
        header.get_f64(record, "frame.time_epoch"),
    ) {
        (Some(f), Some(t)) => (f, t),
        _ => return Ok(None),
    };
    let (src, dst) = match (endpoint(header, record, "src"), endpoint(header, record, "dst")) {
        (Some(s), Some(d)) => (s, d),
        _ => return Err(format!("frame {} has no addresses", frame)),
    };
    let hex_payload: String = match header.get(record, "tcp.payload") {
        Some(text) => text.chars().filter(|c| *c != ':').collect(),
        None => return Ok(None),
    };
    let payload = hex::decode(&hex_payload)
        .map_err(|e| format!("frame {} payload is not hex: {}", frame, e))?;
    Ok(Some(PayloadPacket {
        frame,
        ts,
        src,
        dst,
        seq: header.get_u64(record, "tcp.seq"),
        payload,
    }))
}

/// Answers stream listing and follow queries against one capture file.
///
/// Deadlines come from the caller; dropping a query future kills its dissector.
#[derive(Debug, Clone)]
pub struct StreamReconstructor {
    tshark: PathBuf,
}

impl StreamReconstructor {
    pub fn new(tshark: PathBuf) -> Self {
        Self { tshark }
    }

    async fn each_record<F>(&self, args: &[String], mut on_record: F) -> Result<(), ForensicError>
    where
        F: FnMut(Vec<String>),
    {
        let mut tool = StreamingTool::spawn(&self.tshark, args)?;
        let mut reader = FieldReader::default();
        while let Some(line) = tool.next_line().await? {
            if let Some(record) = reader.push_line(&line) {
                on_record(record);
            }
        }
        if let Some(record) = reader.finish() {
            on_record(record);
        }
        tool.finish().await
    }

    pub async fn list_streams(
        &self,
        pcap: &Path,
        limit: Option<usize>,
        max_packets: Option<u64>,
    ) -> Result<Vec<TcpStreamEntry>, ForensicError> {
        let mut table = StreamTable::default();
        self.each_record(&list_args(pcap, max_packets), |record| {
            table.ingest_record(record)
        })
        .await?;
        let entries = table.finish(limit);
        debug!("{}: listed {} tcp stream(s)", pcap.display(), entries.len());
        Ok(entries)
    }

    pub async fn follow_stream(
        &self,
        pcap: &Path,
        request: &FollowRequest,
    ) -> Result<FollowResult, ForensicError> {
        info!("Following tcp stream {} in {}", request.stream_id, pcap.display());
        let mut header: Option<HeaderIndex> = None;
        let mut packets = Vec::new();
        let mut notes = Vec::new();
        self.each_record(&payload_args(pcap, request.stream_id), |record| {
            if header.is_none() {
                header = Some(HeaderIndex::new(&record));
                return;
            }
            if let Some(index) = &header {
                match payload_packet(index, &record) {
                    Ok(Some(packet)) => packets.push(packet),
                    Ok(None) => {}
                    Err(note) => notes.push(note),
                }
            }
        })
        .await?;

        if !packets.is_empty() {
            let mut reassembly = reassemble(packets);
            notes.append(&mut reassembly.notes);
            reassembly.notes = notes;
            return render_follow(FollowSource::PacketPayload, reassembly, request);
        }

        debug!(
            "tcp stream {} has no decodable payload rows, trying the dissector's follow report",
            request.stream_id
        );
        let mut report = String::new();
        let args = builtin_follow::follow_args(&pcap.to_string_lossy(), request.stream_id);
        let outcome = async {
            let mut tool = StreamingTool::spawn(&self.tshark, &args)?;
            while let Some(line) = tool.next_line().await? {
                report.push_str(&line);
                report.push('\n');
            }
            tool.finish().await
        }
        .await;
        if let Err(e) = outcome {
            match e {
                ForensicError::Configuration(_) => return Err(e),
                other => {
                    warn!("Follow report for tcp stream {} failed: {}", request.stream_id, other);
                    notes.push(format!("follow report failed: {}", other));
                    return Ok(FollowResult::no_payload(request.stream_id, notes));
                }
            }
        }

        let mut reassembly = builtin_follow::parse_report(&report);
        if reassembly.is_empty() {
            return Ok(FollowResult::no_payload(request.stream_id, notes));
        }
        notes.append(&mut reassembly.notes);
        reassembly.notes = notes;
        render_follow(FollowSource::BuiltinFollow, reassembly, request)
    }
}
