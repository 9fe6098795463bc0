use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a registered capture file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Upload,
    LiveCapture,
}

/// A capture file known to the registry. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSession {
    pub id: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub owner: Option<String>,
    pub source: SessionSource,
}

impl CaptureSession {
    /// `owner == None` means the lookup is unscoped.
    pub fn visible_to(&self, owner: Option<&str>) -> bool {
        match owner {
            None => true,
            Some(o) => self.owner.as_deref() == Some(o),
        }
    }
}

/// Sidecar persisted next to each capture so ownership survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionSidecar {
    pub owner: Option<String>,
    pub source: SessionSource,
}
