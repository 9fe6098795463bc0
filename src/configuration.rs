pub mod config;
pub mod types;

pub use config::Config;
pub use types::{CaptureConfig, DispatcherConfig, DissectorConfig, FollowConfig, RuleThresholds};
