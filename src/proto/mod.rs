//! Protocol buffer wire types for the topic admin surface.
//!
//! Messages are grouped the way the admin transport frames them: `common`
//! carries timestamps and failover logs, `topic` the per-topic control
//! requests/responses, `instance` the index-instance payloads handed to a
//! producer when instances join a stream.

pub mod common {
    /// One `(start, end)` snapshot boundary, parallel to a timestamp entry.
    #[derive(Clone, Copy, PartialEq, prost::Message)]
    pub struct Snapshot {
        #[prost(uint64, tag = "1")]
        pub start: u64,
        #[prost(uint64, tag = "2")]
        pub end: u64,
    }

    /// Branch-aware vbucket timestamp: parallel arrays over vbuckets.
    ///
    /// `vbnos[i]`, `seqnos[i]`, `vbuuids[i]` and `snapshots[i]` describe one
    /// vbucket. The arrays are kept sorted by vbucket number.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TsVbuuid {
        #[prost(string, tag = "1")]
        pub pool: String,
        #[prost(string, tag = "2")]
        pub bucket: String,
        #[prost(uint32, repeated, tag = "3")]
        pub vbnos: Vec<u32>,
        #[prost(uint64, repeated, tag = "4")]
        pub seqnos: Vec<u64>,
        #[prost(uint64, repeated, tag = "5")]
        pub vbuuids: Vec<u64>,
        #[prost(message, repeated, tag = "6")]
        pub snapshots: Vec<Snapshot>,
        #[prost(uint64, tag = "7")]
        pub crc64: u64,
    }

    /// Failover history for one vbucket, newest branch first.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FailoverLog {
        #[prost(uint32, tag = "1")]
        pub vbno: u32,
        #[prost(uint64, repeated, tag = "2")]
        pub vbuuids: Vec<u64>,
        #[prost(uint64, repeated, tag = "3")]
        pub seqnos: Vec<u64>,
    }
}

pub mod instance {
    /// Lifecycle state of an index instance.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
    #[repr(i32)]
    pub enum IndexState {
        Unspecified = 0,
        Created = 1,
        Ready = 2,
        Initial = 3,
        Active = 4,
        Deleted = 5,
    }

    /// Index definition carried alongside each instance.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct IndexDefn {
        #[prost(uint64, tag = "1")]
        pub defn_id: u64,
        #[prost(string, tag = "2")]
        pub bucket: String,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(string, repeated, tag = "4")]
        pub sec_exprs: Vec<String>,
    }

    /// One index instance subscribed to a topic. `endpoints` name the
    /// downstream addresses that must receive projected records.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Instance {
        #[prost(uint64, tag = "1")]
        pub instance_id: u64,
        #[prost(enumeration = "IndexState", tag = "2")]
        pub state: i32,
        #[prost(message, optional, tag = "3")]
        pub definition: Option<IndexDefn>,
        #[prost(string, repeated, tag = "4")]
        pub endpoints: Vec<String>,
    }
}

pub mod topic {
    use super::common::TsVbuuid;
    use super::instance::Instance;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct MutationTopicRequest {
        #[prost(string, tag = "1")]
        pub topic: String,
        #[prost(string, tag = "2")]
        pub endpoint_type: String,
        #[prost(message, repeated, tag = "3")]
        pub req_timestamps: Vec<TsVbuuid>,
        #[prost(message, repeated, tag = "4")]
        pub instances: Vec<Instance>,
        #[prost(uint32, tag = "5")]
        pub version: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TopicResponse {
        #[prost(string, tag = "1")]
        pub topic: String,
        #[prost(uint64, repeated, tag = "2")]
        pub instance_ids: Vec<u64>,
        #[prost(message, repeated, tag = "3")]
        pub req_timestamps: Vec<TsVbuuid>,
        #[prost(message, repeated, tag = "4")]
        pub rollback_timestamps: Vec<TsVbuuid>,
        #[prost(string, tag = "5")]
        pub error: String,
    }

    /// Response carrying only the current request timestamps.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TimestampResponse {
        #[prost(string, tag = "1")]
        pub topic: String,
        #[prost(message, repeated, tag = "2")]
        pub current_timestamps: Vec<TsVbuuid>,
        #[prost(string, tag = "3")]
        pub error: String,
    }

    /// Error-only response for operations with no payload.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ErrorResponse {
        #[prost(string, tag = "1")]
        pub error: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RestartVbucketsRequest {
        #[prost(string, tag = "1")]
        pub topic: String,
        #[prost(message, repeated, tag = "2")]
        pub restart_timestamps: Vec<TsVbuuid>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ShutdownVbucketsRequest {
        #[prost(string, tag = "1")]
        pub topic: String,
        #[prost(message, repeated, tag = "2")]
        pub shutdown_timestamps: Vec<TsVbuuid>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct AddBucketsRequest {
        #[prost(string, tag = "1")]
        pub topic: String,
        #[prost(message, repeated, tag = "2")]
        pub req_timestamps: Vec<TsVbuuid>,
        #[prost(message, repeated, tag = "3")]
        pub instances: Vec<Instance>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct DelBucketsRequest {
        #[prost(string, tag = "1")]
        pub topic: String,
        #[prost(string, repeated, tag = "2")]
        pub buckets: Vec<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct AddInstancesRequest {
        #[prost(string, tag = "1")]
        pub topic: String,
        #[prost(message, repeated, tag = "2")]
        pub instances: Vec<Instance>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct DelInstancesRequest {
        #[prost(string, tag = "1")]
        pub topic: String,
        #[prost(uint64, repeated, tag = "2")]
        pub instance_ids: Vec<u64>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RepairEndpointsRequest {
        #[prost(string, tag = "1")]
        pub topic: String,
        #[prost(string, repeated, tag = "2")]
        pub endpoints: Vec<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ShutdownTopicRequest {
        #[prost(string, tag = "1")]
        pub topic: String,
    }

    /// Vbucket list hosted by one kv-node, parallel to `kvaddrs`.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Vbuckets {
        #[prost(uint32, repeated, tag = "1")]
        pub vbnos: Vec<u32>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct VbmapRequest {
        #[prost(string, tag = "1")]
        pub pool: String,
        #[prost(string, tag = "2")]
        pub bucket: String,
        #[prost(string, repeated, tag = "3")]
        pub kvaddrs: Vec<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct VbmapResponse {
        #[prost(string, repeated, tag = "1")]
        pub kvaddrs: Vec<String>,
        #[prost(message, repeated, tag = "2")]
        pub kvvbnos: Vec<Vbuckets>,
        #[prost(string, tag = "3")]
        pub error: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FailoverLogRequest {
        #[prost(string, tag = "1")]
        pub pool: String,
        #[prost(string, tag = "2")]
        pub bucket: String,
        #[prost(uint32, repeated, tag = "3")]
        pub vbnos: Vec<u32>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FailoverLogResponse {
        #[prost(message, repeated, tag = "1")]
        pub logs: Vec<super::common::FailoverLog>,
        #[prost(string, tag = "2")]
        pub error: String,
    }
}

mod topic_ext;
mod ts_ext;

#[cfg(test)]
mod topic_ext_test;
#[cfg(test)]
mod ts_ext_test;
