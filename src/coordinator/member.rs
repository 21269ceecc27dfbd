//! Cluster members and the channel contract used to reach them

use crate::common::Result;
use crate::coordinator::handler::SubmitRequest;
use crate::coordinator::OperationId;
use crate::protocol::{NodeRequest, NodeResponse, SubmitResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Correlation token of one client submit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionOperationId(Uuid);

impl SessionOperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionOperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionOperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Transport the coordinator uses to talk to one member.
///
/// Delivery is "eventually or never": implementations may drop messages,
/// which is why every operation carries a timeout. Calls must not block on
/// the remote side; the coordinator invokes them from its execution queue.
pub trait DistributedChannel: Send + Sync {
    /// Run a node-local step on the remote member. Its answer comes back
    /// through [`crate::Coordinator::receive`].
    fn send_request(&self, operation_id: OperationId, request: &NodeRequest) -> Result<()>;

    /// Deliver a node answer to the coordinator side of this channel.
    fn send_response(&self, operation_id: OperationId, response: &NodeResponse) -> Result<()>;

    /// Deliver the final result of a submit to the original caller.
    fn reply(&self, session_id: SessionOperationId, response: &SubmitResponse) -> Result<()>;

    /// Hand a submit request to the coordinator reachable through this channel.
    fn submit(&self, session_id: SessionOperationId, request: Arc<dyn SubmitRequest>) -> Result<()>;
}

/// Handle on one cluster node: a stable name and the channel to reach it.
#[derive(Clone)]
pub struct DistributedMember {
    name: Arc<str>,
    channel: Arc<dyn DistributedChannel>,
}

impl DistributedMember {
    pub fn new(name: impl Into<String>, channel: Arc<dyn DistributedChannel>) -> Self {
        Self {
            name: Arc::from(name.into()),
            channel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &Arc<dyn DistributedChannel> {
        &self.channel
    }

    pub fn send_request(&self, operation_id: OperationId, request: &NodeRequest) -> Result<()> {
        self.channel.send_request(operation_id, request)
    }

    pub fn send_response(&self, operation_id: OperationId, response: &NodeResponse) -> Result<()> {
        self.channel.send_response(operation_id, response)
    }

    /// Forward the result of a submit back to whoever owns this member's channel.
    pub fn reply(&self, session_id: SessionOperationId, response: &SubmitResponse) -> Result<()> {
        self.channel.reply(session_id, response)
    }

    pub fn submit(
        &self,
        session_id: SessionOperationId,
        request: Arc<dyn SubmitRequest>,
    ) -> Result<()> {
        self.channel.submit(session_id, request)
    }
}

impl std::fmt::Debug for DistributedMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedMember")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
