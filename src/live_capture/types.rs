use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a live capture. `Stopped` and `Errored` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Starting,
    Running,
    Stopped,
    Errored,
}

impl CaptureState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CaptureState::Stopped | CaptureState::Errored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    Pcap,
    PcapNg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn u32(self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Interface number or name as listed by the capture tool. Chosen automatically when absent.
    pub interface: Option<String>,
    pub duration_secs: Option<u64>,
    pub max_packets: Option<u64>,
    /// Capture (BPF) filter.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub index: u32,
    pub name: String,
    pub description: Option<String>,
}

/// Returned by `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureHandle {
    pub capture_id: String,
    pub interface: String,
    pub file_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub state: CaptureState,
}

/// Returned by `poll`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureStats {
    pub capture_id: String,
    pub state: CaptureState,
    pub size_bytes: u64,
    pub packet_count: u64,
    pub format: Option<CaptureFormat>,
    pub byte_order: Option<ByteOrder>,
    pub error: Option<String>,
}
