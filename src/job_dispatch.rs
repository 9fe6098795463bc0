//! Bounded execution of heavy dissection jobs.
//!
//! Every dissector invocation goes through [`AnalysisDispatcher`], which caps
//! how many run at once, queues a bounded number of callers in FIFO order and
//! tears down jobs that exceed their wall-clock budget.

pub mod dispatcher;
pub mod types;

pub use dispatcher::{AnalysisDispatcher, Permit, QueuedSlot, Reservation};
pub use types::DispatchStats;
