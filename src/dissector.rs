//! Plumbing around the external dissector (tshark): locating it, running it
//! under a deadline and tokenizing its field output.

#[cfg(all(test, unix))]
pub(crate) mod fake_tool;
pub mod field_reader;
pub mod locator;
pub mod process;

pub use field_reader::{FieldReader, HeaderIndex};
pub use locator::{resolve_tshark, tshark_version};
pub use process::{run_tool, StreamingTool, ToolOutput};
