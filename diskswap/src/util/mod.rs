//! Small helpers shared across pipeline stages.

pub mod cmd;
pub mod format;

pub use cmd::{run, run_ok, run_quiet};
pub use format::format_bytes;
