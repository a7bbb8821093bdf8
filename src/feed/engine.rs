//! Engines: the (evaluator, router) pair attached to one index instance.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use super::endpoint::RouterEndpoint;
use crate::mutation::Mutation;
use crate::proto::instance::Instance;
use crate::Result;

/// Decides whether a mutation is relevant to an index instance and
/// extracts the secondary key to project.
pub trait Evaluator: Send + Sync {
    /// Bucket this instance indexes.
    fn bucket(&self) -> &str;

    /// `None` when the mutation does not match this instance.
    fn evaluate(
        &self,
        mutation: &Mutation,
    ) -> Result<Option<Bytes>>;
}

/// Names the endpoint address(es) that must receive a projected record.
pub trait Router: Send + Sync {
    /// Every endpoint this router can select.
    fn endpoints(&self) -> Vec<String>;

    /// Endpoints for one vbucket's records.
    fn route(
        &self,
        vbno: u16,
    ) -> Vec<String>;
}

/// A secondary-key record on its way to a downstream endpoint.
#[derive(Clone, Debug)]
pub struct ProjectedRecord {
    pub instance_id: u64,
    pub bucket: String,
    pub vbno: u16,
    pub vbuuid: u64,
    pub seqno: u64,
    pub key: Bytes,
    pub seckey: Bytes,
}

/// One index instance subscribed to a topic.
#[derive(Clone)]
pub struct Engine {
    uuid: u64,
    evaluator: Arc<dyn Evaluator>,
    router: Arc<dyn Router>,
}

impl Engine {
    pub fn new(
        uuid: u64,
        evaluator: Arc<dyn Evaluator>,
        router: Arc<dyn Router>,
    ) -> Self {
        Engine {
            uuid,
            evaluator,
            router,
        }
    }

    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    pub fn bucket(&self) -> &str {
        self.evaluator.bucket()
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    /// Evaluate `mutation` and hand the projection to every endpoint the
    /// router selects. Returns the number of endpoints written.
    pub(crate) async fn transform_route(
        &self,
        mutation: &Mutation,
        endpoints: &HashMap<String, Arc<dyn RouterEndpoint>>,
    ) -> Result<usize> {
        let seckey = match self.evaluator.evaluate(mutation)? {
            Some(seckey) => seckey,
            None => return Ok(0),
        };

        let record = ProjectedRecord {
            instance_id: self.uuid,
            bucket: mutation.bucket.clone(),
            vbno: mutation.vbno,
            vbuuid: mutation.vbuuid,
            seqno: mutation.seqno,
            key: mutation.key.clone(),
            seckey,
        };

        let mut routed = 0;
        for raddr in self.router.route(mutation.vbno) {
            match endpoints.get(&raddr) {
                Some(endpoint) => {
                    endpoint.send(record.clone()).await?;
                    routed += 1;
                }
                None => {
                    warn!("engine {} routed to unknown endpoint {}", self.uuid, raddr);
                }
            }
        }
        Ok(routed)
    }
}

/// Evaluator materialized from a wire [`Instance`]: matches every data
/// mutation in the instance's bucket and projects the document value (or
/// the key for deletions) as the secondary key. Expression evaluation
/// belongs to the host.
pub struct IndexEvaluator {
    bucket: String,
}

impl IndexEvaluator {
    pub fn from_instance(instance: &Instance) -> Self {
        IndexEvaluator {
            bucket: instance.bucket().to_string(),
        }
    }
}

impl Evaluator for IndexEvaluator {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn evaluate(
        &self,
        mutation: &Mutation,
    ) -> Result<Option<Bytes>> {
        if !mutation.is_data() || mutation.bucket != self.bucket {
            return Ok(None);
        }
        if mutation.value.is_empty() {
            Ok(Some(mutation.key.clone()))
        } else {
            Ok(Some(mutation.value.clone()))
        }
    }
}

/// Router materialized from a wire [`Instance`]: fans every vbucket out to
/// the instance's full endpoint set.
pub struct InstanceRouter {
    endpoints: Vec<String>,
}

impl InstanceRouter {
    pub fn from_instance(instance: &Instance) -> Self {
        InstanceRouter {
            endpoints: instance.endpoints.clone(),
        }
    }
}

impl Router for InstanceRouter {
    fn endpoints(&self) -> Vec<String> {
        self.endpoints.clone()
    }

    fn route(
        &self,
        _vbno: u16,
    ) -> Vec<String> {
        self.endpoints.clone()
    }
}
