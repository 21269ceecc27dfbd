//! Bookkeeping for one in-flight node operation

use crate::coordinator::handler::SubmitRequest;
use crate::coordinator::member::DistributedMember;
use crate::coordinator::OperationId;
use crate::protocol::{Message, NodeRequest, NodeResponse};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Live record of a dispatched operation: who was asked, who answered.
///
/// The involved set is a snapshot of the member registry taken when the
/// operation was sent. Responses are keyed by member name in arrival
/// order; a second response from the same member replaces the first in
/// place, so size-based quorum checks never double count.
pub struct RequestContext {
    operation_id: OperationId,
    submit: Option<Arc<dyn SubmitRequest>>,
    request: NodeRequest,
    involved: Vec<DistributedMember>,
    responses: Vec<(String, NodeResponse)>,
    created_at: Instant,
}

impl RequestContext {
    pub(crate) fn new(
        operation_id: OperationId,
        submit: Option<Arc<dyn SubmitRequest>>,
        request: NodeRequest,
        involved: Vec<DistributedMember>,
    ) -> Self {
        Self {
            operation_id,
            submit,
            request,
            involved,
            responses: Vec::new(),
            created_at: Instant::now(),
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    /// Submit request this operation belongs to, if any.
    pub fn submit_request(&self) -> Option<&Arc<dyn SubmitRequest>> {
        self.submit.as_ref()
    }

    pub fn request(&self) -> &NodeRequest {
        &self.request
    }

    pub fn involved_members(&self) -> &[DistributedMember] {
        &self.involved
    }

    pub fn involved_member(&self, name: &str) -> Option<&DistributedMember> {
        self.involved.iter().find(|m| m.name() == name)
    }

    pub fn responses(&self) -> &[(String, NodeResponse)] {
        &self.responses
    }

    pub fn response_from(&self, name: &str) -> Option<&NodeResponse> {
        self.responses
            .iter()
            .find(|(member, _)| member == name)
            .map(|(_, response)| response)
    }

    /// Every involved member has answered at least once.
    pub fn all_responded(&self) -> bool {
        self.responses.len() == self.involved.len()
    }

    /// Involved members that have not answered yet.
    pub fn missing_members(&self) -> Vec<&str> {
        self.involved
            .iter()
            .map(|m| m.name())
            .filter(|name| self.response_from(name).is_none())
            .collect()
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Record `response`, returning `true` if it replaced an earlier one.
    pub(crate) fn record_response(&mut self, member: &str, response: NodeResponse) -> bool {
        match self.responses.iter_mut().find(|(name, _)| name == member) {
            Some((_, existing)) => {
                *existing = response;
                true
            }
            None => {
                self.responses.push((member.to_string(), response));
                false
            }
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            operation_id: self.operation_id,
            request_type: self.request.type_tag(),
            involved: self.involved.iter().map(|m| m.name().to_string()).collect(),
            responded: self.responses.iter().map(|(name, _)| name.clone()).collect(),
            originated_by_submit: self.submit.is_some(),
            age_ms: self.elapsed().as_millis() as u64,
        }
    }
}

/// Read-only view of a context, for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextSnapshot {
    pub operation_id: OperationId,
    pub request_type: u16,
    pub involved: Vec<String>,
    pub responded: Vec<String>,
    pub originated_by_submit: bool,
    pub age_ms: u64,
}
