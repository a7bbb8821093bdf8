//! Producer-side topic feed: one actor per topic coordinating upstream
//! per-vbucket streams, per-node kv-data paths and downstream endpoints.
mod command;
mod endpoint;
mod engine;
mod feed;
mod feeder;
mod kvdata;
mod opaque;

pub(crate) use command::*;
pub use endpoint::*;
pub use engine::*;
pub use feed::*;
pub use feeder::*;
pub(crate) use kvdata::*;
pub(crate) use opaque::*;
