//! Two-phase structural change (add or remove a node)
//!
//! Phase 1 asks every member to prepare the change. Once all of them have
//! answered, the coordinator either commits (everyone prepared) or aborts
//! (anyone refused). The submitter gets exactly one reply: `Applied` with
//! the resulting host list, or `Failed` with the reason.

use crate::common::{Error, Result};
use crate::coordinator::context::RequestContext;
use crate::coordinator::core::CoordinatorCore;
use crate::coordinator::handler::{ResponseHandler, SubmitRequest};
use crate::coordinator::member::{DistributedMember, SessionOperationId};
use crate::coordinator::OperationId;
use crate::protocol::{NodeRequest, NodeResponse, StructuralChange, SubmitResponse};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Submit type tag of [`StructuralChangeRequest`]
pub const STRUCTURAL_CHANGE_REQUEST: u16 = 1;

/// Rebuild a submit request received over the wire.
pub fn decode_submit_request(tag: u16, payload: &[u8]) -> Result<Arc<dyn SubmitRequest>> {
    match tag {
        STRUCTURAL_CHANGE_REQUEST => Ok(Arc::new(StructuralChangeRequest::new(
            bincode::deserialize(payload)?,
        ))),
        tag => Err(Error::UnknownMessageType {
            kind: "submit request",
            tag,
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralChangeRequest {
    change: StructuralChange,
}

impl StructuralChangeRequest {
    pub fn new(change: StructuralChange) -> Self {
        Self { change }
    }

    pub fn change(&self) -> &StructuralChange {
        &self.change
    }
}

impl SubmitRequest for StructuralChangeRequest {
    fn begin(
        self: Arc<Self>,
        member: &DistributedMember,
        session_id: SessionOperationId,
        coordinator: &mut CoordinatorCore,
    ) {
        info!(change = %self.change, requester = member.name(), "Preparing structural change");

        let request = NodeRequest::Prepare {
            change: self.change.clone(),
        };
        let handler = PrepareHandler {
            requester: member.clone(),
            session_id,
            change: self.change.clone(),
        };
        let submit: Arc<dyn SubmitRequest> = self.clone();
        if let Err(e) = coordinator.send_operation(Some(submit), request, handler) {
            error!(change = %self.change, error = %e, "Failed to start structural change");
            reply(
                member,
                session_id,
                SubmitResponse::Failed {
                    reason: e.to_string(),
                },
            );
        }
    }

    fn request_type(&self) -> u16 {
        STRUCTURAL_CHANGE_REQUEST
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.change)?)
    }
}

fn reply(requester: &DistributedMember, session_id: SessionOperationId, response: SubmitResponse) {
    if let Err(e) = requester.reply(session_id, &response) {
        warn!(
            requester = requester.name(),
            %session_id,
            error = %e,
            "Failed to deliver submit reply"
        );
    }
}

/// Describe every answer that is not `expected`.
fn refusals(context: &RequestContext, expected: &NodeResponse) -> Vec<String> {
    context
        .responses()
        .iter()
        .filter(|(_, response)| response != expected)
        .map(|(member, response)| format!("{}: {}", member, response))
        .collect()
}

fn send_abort(coordinator: &mut CoordinatorCore, prepared: OperationId) {
    let result = coordinator.send_operation(
        None,
        NodeRequest::Abort { prepared },
        AbortHandler { prepared },
    );
    if let Err(e) = result {
        error!(%prepared, error = %e, "Failed to send abort");
    }
}

struct PrepareHandler {
    requester: DistributedMember,
    session_id: SessionOperationId,
    change: StructuralChange,
}

impl PrepareHandler {
    fn abort(&self, coordinator: &mut CoordinatorCore, context: &RequestContext, reason: String) {
        warn!(change = %self.change, %reason, "Aborting structural change");
        send_abort(coordinator, context.operation_id());
        reply(
            &self.requester,
            self.session_id,
            SubmitResponse::Failed { reason },
        );
    }
}

impl ResponseHandler for PrepareHandler {
    fn receive(
        &mut self,
        coordinator: &mut CoordinatorCore,
        context: &RequestContext,
        _member: &DistributedMember,
        _response: &NodeResponse,
    ) -> bool {
        if !context.all_responded() {
            return false;
        }

        let refused = refusals(context, &NodeResponse::Prepared);
        if !refused.is_empty() {
            self.abort(
                coordinator,
                context,
                format!("prepare refused by {}", refused.join(", ")),
            );
            return true;
        }

        debug!(change = %self.change, prepared = %context.operation_id(), "All members prepared");
        let commit = NodeRequest::Commit {
            prepared: context.operation_id(),
        };
        let handler = CommitHandler {
            requester: self.requester.clone(),
            session_id: self.session_id,
            change: self.change.clone(),
        };
        let submit = context.submit_request().cloned();
        if let Err(e) = coordinator.send_operation(submit, commit, handler) {
            self.abort(coordinator, context, format!("commit not sent: {}", e));
        }
        true
    }

    fn timeout(&mut self, coordinator: &mut CoordinatorCore, context: &RequestContext) -> bool {
        let reason = format!(
            "prepare timed out waiting for {}",
            context.missing_members().join(", ")
        );
        self.abort(coordinator, context, reason);
        true
    }
}

struct CommitHandler {
    requester: DistributedMember,
    session_id: SessionOperationId,
    change: StructuralChange,
}

impl ResponseHandler for CommitHandler {
    fn receive(
        &mut self,
        _coordinator: &mut CoordinatorCore,
        context: &RequestContext,
        _member: &DistributedMember,
        _response: &NodeResponse,
    ) -> bool {
        if !context.all_responded() {
            return false;
        }

        let refused = refusals(context, &NodeResponse::Committed);
        let response = if refused.is_empty() {
            let hosts = context
                .involved_members()
                .iter()
                .map(|m| m.name().to_string())
                .filter(|name| match &self.change {
                    StructuralChange::RemoveNode { name: removed } => name != removed,
                    StructuralChange::AddNode { .. } => true,
                });
            let mut hosts: Vec<String> = hosts.collect();
            if let StructuralChange::AddNode { name } = &self.change {
                if !hosts.contains(name) {
                    hosts.push(name.clone());
                }
            }
            info!(change = %self.change, hosts = ?hosts, "Structural change applied");
            SubmitResponse::Applied {
                change: self.change.clone(),
                hosts,
            }
        } else {
            error!(change = %self.change, refused = ?refused, "Commit not acknowledged");
            SubmitResponse::Failed {
                reason: format!("commit refused by {}", refused.join(", ")),
            }
        };

        reply(&self.requester, self.session_id, response);
        true
    }

    fn timeout(&mut self, _coordinator: &mut CoordinatorCore, context: &RequestContext) -> bool {
        reply(
            &self.requester,
            self.session_id,
            SubmitResponse::Failed {
                reason: format!(
                    "commit timed out waiting for {}",
                    context.missing_members().join(", ")
                ),
            },
        );
        true
    }
}

struct AbortHandler {
    prepared: OperationId,
}

impl ResponseHandler for AbortHandler {
    fn receive(
        &mut self,
        _coordinator: &mut CoordinatorCore,
        context: &RequestContext,
        _member: &DistributedMember,
        _response: &NodeResponse,
    ) -> bool {
        context.all_responded()
    }

    fn timeout(&mut self, _coordinator: &mut CoordinatorCore, context: &RequestContext) -> bool {
        warn!(
            prepared = %self.prepared,
            missing = ?context.missing_members(),
            "Abort not acknowledged by every member"
        );
        true
    }
}
