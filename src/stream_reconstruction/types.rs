use serde::{Deserialize, Serialize};

use crate::configuration::types::FollowConfig;
use crate::correlation::types::Endpoint;

/// Aggregated view of one TCP stream as numbered by the dissector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpStreamEntry {
    pub stream_id: u64,
    /// Source and destination of the first packet seen.
    pub client: Endpoint,
    pub server: Endpoint,
    pub first_ts: f64,
    pub last_ts: f64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub payload_bytes: u64,
    pub first_frame: u64,
    pub last_frame: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionFilter {
    #[default]
    Both,
    ClientToServer,
    ServerToClient,
}

impl DirectionFilter {
    pub fn includes(self, direction: Direction) -> bool {
        match self {
            DirectionFilter::Both => true,
            DirectionFilter::ClientToServer => direction == Direction::ClientToServer,
            DirectionFilter::ServerToClient => direction == Direction::ServerToClient,
        }
    }
}

/// Byte budgets for the three follow outputs, each enforced on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowBudgets {
    pub max_bytes_per_direction: usize,
    pub max_combined_bytes: usize,
    pub max_segment_bytes: usize,
}

impl From<&FollowConfig> for FollowBudgets {
    fn from(config: &FollowConfig) -> Self {
        Self {
            max_bytes_per_direction: config.max_bytes_per_direction,
            max_combined_bytes: config.max_combined_bytes,
            max_segment_bytes: config.max_segment_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Contains,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub term: String,
    pub mode: MatchMode,
    pub case_sensitive: bool,
    /// Packets of context kept on each side of a match.
    pub context_packets: usize,
    pub max_matches: usize,
}

impl SearchOptions {
    pub fn contains(term: impl Into<String>, config: &FollowConfig) -> Self {
        Self {
            term: term.into(),
            mode: MatchMode::Contains,
            case_sensitive: false,
            context_packets: config.context_packets,
            max_matches: config.max_matches,
        }
    }
}

/// Inclusive bounds that restrict which packets a search considers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketRange {
    pub frame_min: Option<u64>,
    pub frame_max: Option<u64>,
    pub ts_min: Option<f64>,
    pub ts_max: Option<f64>,
}

impl PacketRange {
    pub fn contains(&self, frame: Option<u64>, ts: Option<f64>) -> bool {
        let frame_ok = match frame {
            Some(f) => {
                self.frame_min.map_or(true, |min| f >= min)
                    && self.frame_max.map_or(true, |max| f <= max)
            }
            None => self.frame_min.is_none() && self.frame_max.is_none(),
        };
        let ts_ok = match ts {
            Some(t) => {
                self.ts_min.map_or(true, |min| t >= min) && self.ts_max.map_or(true, |max| t <= max)
            }
            None => self.ts_min.is_none() && self.ts_max.is_none(),
        };
        frame_ok && ts_ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowRequest {
    pub stream_id: u64,
    pub budgets: FollowBudgets,
    pub direction: DirectionFilter,
    pub search: Option<SearchOptions>,
    pub range: PacketRange,
}

impl FollowRequest {
    pub fn new(stream_id: u64, config: &FollowConfig) -> Self {
        Self {
            stream_id,
            budgets: FollowBudgets::from(config),
            direction: DirectionFilter::Both,
            search: None,
            range: PacketRange::default(),
        }
    }
}

/// Where the reconstructed bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowSource {
    PacketPayload,
    BuiltinFollow,
    NoPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionText {
    pub src: Option<Endpoint>,
    pub dst: Option<Endpoint>,
    pub packet_count: u64,
    /// Payload bytes before any budget is applied.
    pub total_bytes: u64,
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub frame: Option<u64>,
    pub ts: Option<f64>,
    pub direction: Direction,
    pub matched: bool,
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub match_count: usize,
    pub segments: Vec<Segment>,
    /// More matches existed than `max_matches`, or a segment was cut.
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowResult {
    pub stream_id: u64,
    pub source: FollowSource,
    pub client_to_server: DirectionText,
    pub server_to_client: DirectionText,
    pub combined: String,
    pub combined_truncated: bool,
    pub search: Option<SearchResult>,
    pub notes: Vec<String>,
}

impl FollowResult {
    pub fn no_payload(stream_id: u64, mut notes: Vec<String>) -> Self {
        notes.push(format!("no payload-bearing packets in tcp stream {}", stream_id));
        Self {
            stream_id,
            source: FollowSource::NoPayload,
            client_to_server: DirectionText::default(),
            server_to_client: DirectionText::default(),
            combined: String::new(),
            combined_truncated: false,
            search: None,
            notes,
        }
    }
}
