pub mod configuration;
pub mod controller;
pub mod correlation;
pub mod dissector;
pub mod error_handling;
pub mod job_dispatch;
pub mod live_capture;
pub mod session_management;
pub mod stream_reconstruction;
