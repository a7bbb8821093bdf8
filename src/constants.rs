use crate::manager::StreamId;

/// Upper bound on vbuckets per bucket. The timestamp parallel arrays never
/// grow past this.
pub const MAX_VBUCKETS: usize = 1024;

/// Capacity of a feed's command channel.
pub(crate) const FEED_REQ_CHAN_SIZE: usize = 10000;

/// Capacity of a feed's feedback back-channel. Must hold every re-queued
/// message of an interrupted wait plus a full round of per-vbucket feedback.
pub(crate) const FEED_BACK_CHAN_SIZE: usize = 10000;

/// Capacity of a kv-data path's command and event channels.
pub(crate) const KVDATA_CHAN_SIZE: usize = 1000;

/// Default base for per-stream listening ports.
pub(crate) const STREAM_PORT_BASE: u16 = 9100;

/// Fixed stream-id to listening-port mapping published by the host.
///
/// The receiver for a stream binds to this port at `StartStream`; producers
/// are told the same address when instances are added to the stream.
pub fn port_for_stream(base: u16, id: StreamId) -> u16 {
    match id {
        StreamId::Maint => base,
        StreamId::Catchup => base + 1,
        StreamId::Init => base + 2,
    }
}
