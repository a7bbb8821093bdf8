//! Index-topology model and the state-transition diff that drives
//! reconciliation.

use serde::Deserialize;
use serde::Serialize;

use crate::proto::instance;
use crate::proto::instance::IndexDefn;
use crate::proto::instance::Instance;
use crate::Result;
use crate::StreamError;

/// Lifecycle state of an index instance in the topology store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexState {
    Created,
    Ready,
    Initial,
    Active,
    Deleted,
}

impl From<IndexState> for instance::IndexState {
    fn from(state: IndexState) -> Self {
        match state {
            IndexState::Created => instance::IndexState::Created,
            IndexState::Ready => instance::IndexState::Ready,
            IndexState::Initial => instance::IndexState::Initial,
            IndexState::Active => instance::IndexState::Active,
            IndexState::Deleted => instance::IndexState::Deleted,
        }
    }
}

/// Index of every per-bucket topology in the store.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalTopology {
    pub topology_keys: Vec<String>,
}

impl GlobalTopology {
    /// Bucket component of a topology key (`.../<bucket>`).
    pub fn bucket_from_key(key: &str) -> &str {
        key.rsplit('/').next().unwrap_or(key)
    }
}

/// One index instance within a definition's distribution.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexInstDistribution {
    pub inst_id: u64,
    pub state: IndexState,
}

/// One index definition with its distributed instances.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexDefnDistribution {
    pub bucket: String,
    pub name: String,
    pub defn_id: u64,
    #[serde(default)]
    pub sec_exprs: Vec<String>,
    pub instances: Vec<IndexInstDistribution>,
}

/// Authoritative per-bucket mapping of index definitions to instances.
/// `version` increases monotonically with every store write.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexTopology {
    pub version: u64,
    pub bucket: String,
    pub definitions: Vec<IndexDefnDistribution>,
}

impl IndexTopology {
    /// Decode one topology-change payload.
    pub fn decode(raw: &[u8]) -> Result<IndexTopology> {
        serde_json::from_slice(raw)
            .map_err(|err| StreamError::MalformedTopology(err.to_string()).into())
    }

    pub fn find_index_definition(
        &self,
        bucket: &str,
        name: &str,
    ) -> Option<&IndexDefnDistribution> {
        self.definitions
            .iter()
            .find(|defn| defn.bucket == bucket && defn.name == name)
    }
}

/// One instance selected by the topology diff, with enough of its
/// definition to materialize a wire [`Instance`].
#[derive(Clone, Debug)]
pub struct ChangeRecord {
    pub defn_id: u64,
    pub bucket: String,
    pub name: String,
    pub sec_exprs: Vec<String>,
    pub inst_id: u64,
    pub state: IndexState,
}

impl ChangeRecord {
    /// Wire instance message routed at `addr`, the stream's receive
    /// address on this node.
    pub fn as_instance(
        &self,
        addr: &str,
    ) -> Instance {
        Instance {
            instance_id: self.inst_id,
            state: instance::IndexState::from(self.state) as i32,
            definition: Some(IndexDefn {
                defn_id: self.defn_id,
                bucket: self.bucket.clone(),
                name: self.name.clone(),
                sec_exprs: self.sec_exprs.clone(),
            }),
            endpoints: vec![addr.to_string()],
        }
    }
}

/// True when `state` is one of `possible`; a `None` list means "any".
pub(crate) fn in_state(
    state: IndexState,
    possible: Option<&[IndexState]>,
) -> bool {
    match possible {
        None => true,
        Some(states) => states.contains(&state),
    }
}

/// Instances of `new_defn` whose state sits in `to_states` and, when a
/// matching instance exists in `old_defn`, transitioned out of
/// `from_states`. Without a matching old instance, `from_states` is
/// ignored.
pub(crate) fn add_instances_to_change_list(
    old_defn: Option<&IndexDefnDistribution>,
    new_defn: &IndexDefnDistribution,
    from_states: Option<&[IndexState]>,
    to_states: Option<&[IndexState]>,
) -> Vec<ChangeRecord> {
    let mut changes = Vec::new();
    for new_inst in &new_defn.instances {
        let mut add = in_state(new_inst.state, to_states);

        if let Some(old_defn) = old_defn {
            for old_inst in &old_defn.instances {
                if new_inst.inst_id == old_inst.inst_id {
                    add = add
                        && in_state(old_inst.state, from_states)
                        && old_inst.state != new_inst.state;
                }
            }
        }

        if add {
            changes.push(ChangeRecord {
                defn_id: new_defn.defn_id,
                bucket: new_defn.bucket.clone(),
                name: new_defn.name.clone(),
                sec_exprs: new_defn.sec_exprs.clone(),
                inst_id: new_inst.inst_id,
                state: new_inst.state,
            });
        }
    }
    changes
}
