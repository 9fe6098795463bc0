//! Live capture lifecycle and incremental progress tracking.

pub mod capture_format;
pub mod capture_monitor;
pub mod interfaces;
pub mod types;

pub use capture_format::IncrementalParser;
pub use capture_monitor::CaptureMonitor;
pub use types::{CaptureHandle, CaptureState, CaptureStats, NetworkInterface, StartOptions};
