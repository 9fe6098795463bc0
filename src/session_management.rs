//! Session registry.
//!
//! A "session" here is a capture file known to the engine: either uploaded or
//! produced by a finished live capture. The registry assigns opaque ids, keeps
//! the files under one storage directory and scopes lookups by owner.

/// Capture session record and ownership sidecar.
pub mod session;
/// Id → file mapping with disk hydration.
pub mod session_registry;

pub use session::{CaptureSession, SessionSource};
pub use session_registry::SessionRegistry;
