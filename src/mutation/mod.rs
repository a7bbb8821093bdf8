//! Mutation events and the consumer-side dispatch surface.
//!
//! Producers emit a stream of per-vbucket events. Data commands carry
//! document keys and values; control commands delimit streams and
//! snapshots. One tagged value covers both, so a single dispatch replaces
//! one callback per kind.

use bytes::Bytes;

use crate::manager::StreamId;

/// Producer-reported status on a per-vbucket control event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Success,
    /// The producer rejected the requested start point; the event's
    /// `(seqno, vbuuid)` is the rollback point to resume from.
    Rollback,
}

impl Default for StreamStatus {
    fn default() -> Self {
        StreamStatus::Success
    }
}

/// The kind of a mutation event.
///
/// `Upsert`, `Deletion` and `UpsertDeletion` are data commands; the rest
/// are control commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationKind {
    Upsert,
    Deletion,
    UpsertDeletion,
    /// Periodic seqno heartbeat for an idle vbucket.
    Sync,
    /// The producer dropped buffered data for the vbucket.
    DropData,
    StreamBegin,
    StreamEnd,
    /// Snapshot boundary `(start, end)` for the vbucket.
    Snapshot { start: u64, end: u64 },
}

/// One per-vbucket event flowing from a producer node.
#[derive(Clone, Debug)]
pub struct Mutation {
    pub bucket: String,
    /// Producer node that emitted the event.
    pub kvaddr: String,
    pub vbno: u16,
    pub vbuuid: u64,
    pub seqno: u64,
    /// Correlation tag echoed from the control op that opened the stream.
    pub opaque: u32,
    pub status: StreamStatus,
    pub kind: MutationKind,
    pub key: Bytes,
    pub value: Bytes,
}

impl Mutation {
    /// Control event constructor; data fields stay empty.
    pub fn control(
        bucket: &str,
        kvaddr: &str,
        vbno: u16,
        vbuuid: u64,
        seqno: u64,
        opaque: u32,
        kind: MutationKind,
    ) -> Self {
        Mutation {
            bucket: bucket.to_string(),
            kvaddr: kvaddr.to_string(),
            vbno,
            vbuuid,
            seqno,
            opaque,
            status: StreamStatus::Success,
            kind,
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(
            self.kind,
            MutationKind::Upsert | MutationKind::Deletion | MutationKind::UpsertDeletion
        )
    }
}

/// Transport failure reported by the mutation receive path: the remote
/// endpoint connection and the vbuckets it was carrying.
#[derive(Clone, Debug)]
pub struct ConnectionError {
    pub raddr: String,
    pub vbnos: Vec<u16>,
}

/// Consumer-side mutation sink.
///
/// `dispatch` is invoked once per event in vbucket order; `offset` is the
/// event's position within its transport batch.
pub trait MutationHandler: Send + Sync {
    fn dispatch(
        &self,
        stream_id: StreamId,
        mutation: &Mutation,
        offset: usize,
    );

    fn handle_connection_error(
        &self,
        stream_id: StreamId,
        err: ConnectionError,
    );
}
