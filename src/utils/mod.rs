//! Shared utilities: wall-clock helpers, the scan-side cancellation
//! primitive and a bounded buffer pool.
mod buf_pool;
mod cancel;
mod time;

pub use buf_pool::*;
pub use cancel::*;
pub(crate) use time::*;
