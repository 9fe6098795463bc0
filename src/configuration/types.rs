use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the external dissector is located and driven.
#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DissectorConfig {
    /// Explicit dissector binary. Falls back to `TSHARK_PATH`, then the search path.
    pub tshark_path: Option<PathBuf>,
    /// Wall-clock budget for a full-capture correlation run.
    pub analysis_timeout_secs: u64,
    /// Wall-clock budget for each stream listing / follow call.
    pub stream_timeout_secs: u64,
    pub sample_frames_per_session: usize,
    /// Cap on packets read per correlation run.
    pub max_packets: Option<u64>,
    pub include_sha256: bool,
}

impl Default for DissectorConfig {
    fn default() -> Self {
        Self {
            tshark_path: None,
            analysis_timeout_secs: 300,
            stream_timeout_secs: 60,
            sample_frames_per_session: 8,
            max_packets: None,
            include_sha256: true,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub max_concurrent_jobs: usize,
    pub max_queued_jobs: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            max_queued_jobs: 8,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture binary. Defaults to the resolved dissector binary.
    pub capture_tool_path: Option<PathBuf>,
    /// How long after spawn an exit counts as a start failure.
    pub grace_period_ms: u64,
    /// How long `stop` waits for the process after the interrupt before killing it.
    pub stop_timeout_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_tool_path: None,
            grace_period_ms: 750,
            stop_timeout_secs: 10,
        }
    }
}

/// Default budgets for follow-stream output.
#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FollowConfig {
    pub max_bytes_per_direction: usize,
    pub max_combined_bytes: usize,
    pub max_segment_bytes: usize,
    pub context_packets: usize,
    pub max_matches: usize,
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_direction: 64 * 1024,
            max_combined_bytes: 128 * 1024,
            max_segment_bytes: 32 * 1024,
            context_packets: 2,
            max_matches: 50,
        }
    }
}

/// Thresholds feeding the session rule flags.
#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuleThresholds {
    pub many_packets: u64,
    pub long_duration_secs: f64,
    pub large_bytes: u64,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            many_packets: 1000,
            long_duration_secs: 60.0,
            large_bytes: 10 * 1024 * 1024,
        }
    }
}
