//! # vbflow
//!
//! A mutation-stream control plane coupling per-node mutation *producers* to
//! secondary-index *consumers* through named, long-lived topics.
//!
//! ## Architecture
//! - **Producer side** ([`feed`]): one [`feed::Feed`] actor per topic. It
//!   opens per-vbucket upstream streams for a set of buckets, spawns one
//!   KV-data path per `(bucket, kv-node)`, and routes projected records to
//!   downstream endpoints. Control operations are serialized through a typed
//!   command channel; per-vbucket feedback (`StreamRequest` / `StreamEnd`)
//!   flows back on a dedicated back-channel and is correlated by opaque tag.
//! - **Consumer side** ([`manager`]): a [`manager::StreamManager`] that keeps
//!   topics aligned with the authoritative index topology, issuing
//!   add/delete-instance calls through the [`admin`] transport whenever index
//!   definitions transition lifecycle states.
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use vbflow::config::VbflowConfig;
//! use vbflow::manager::{StreamId, StreamManager};
//!
//! # async fn demo(admin: Arc<dyn vbflow::admin::StreamAdmin>,
//! #               handler: Arc<dyn vbflow::mutation::MutationHandler>,
//! #               store: Arc<dyn vbflow::manager::TopologyStore>) -> vbflow::Result<()> {
//! let config = VbflowConfig::new()?;
//! let manager = StreamManager::new(store, handler, admin, None, config.manager.clone());
//! manager.start_stream(StreamId::Maint)?;
//! manager.start_handling_topology_change();
//! # Ok(())
//! # }
//! ```
//!
//! Mutation wire transport, the topology persistent store and the
//! scan-serving path are external collaborators; the crate consumes them
//! through traits ([`feed::BucketFeeder`], [`manager::TopologyStore`],
//! [`mutation::MutationHandler`]).

pub mod admin;
pub mod config;
pub mod feed;
pub mod manager;
pub mod mutation;
pub mod proto;

mod constants;
mod errors;
mod metrics;

pub use constants::port_for_stream;
pub use errors::*;

#[doc(hidden)]
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
