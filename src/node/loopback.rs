//! In-process channel between a coordinator and a local member
//!
//! Requests are executed synchronously by the member's [`NodeExecutor`]
//! and answered back through [`Coordinator::receive`]. Every message still
//! goes through the binary codec, so the loopback exercises the same
//! serialization boundary a network transport would.

use crate::common::{Error, Result};
use crate::coordinator::{
    decode_submit_request, Coordinator, DistributedChannel, DistributedMember, OperationId,
    SessionOperationId, SubmitRequest,
};
use crate::node::executor::NodeExecutor;
use crate::protocol::{Message, NodeRequest, NodeResponse, SubmitResponse};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A submit reply observed on a loopback channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub member: String,
    pub session_id: SessionOperationId,
    pub response: SubmitResponse,
}

#[derive(Clone)]
pub struct LoopbackChannel {
    name: String,
    coordinator: Coordinator,
    executor: Arc<dyn NodeExecutor>,
    reachable: Arc<AtomicBool>,
    replies: Option<mpsc::UnboundedSender<Reply>>,
}

impl LoopbackChannel {
    pub fn new(
        name: impl Into<String>,
        coordinator: Coordinator,
        executor: Arc<dyn NodeExecutor>,
    ) -> Self {
        Self {
            name: name.into(),
            coordinator,
            executor,
            reachable: Arc::new(AtomicBool::new(true)),
            replies: None,
        }
    }

    /// Forward submit replies delivered to this member to `sink`.
    pub fn with_replies(mut self, sink: mpsc::UnboundedSender<Reply>) -> Self {
        self.replies = Some(sink);
        self
    }

    /// While unreachable, requests to this member are silently lost.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Member handle backed by this channel.
    pub fn member(&self) -> DistributedMember {
        DistributedMember::new(self.name.clone(), Arc::new(self.clone()))
    }
}

impl DistributedChannel for LoopbackChannel {
    fn send_request(&self, operation_id: OperationId, request: &NodeRequest) -> Result<()> {
        if !self.is_reachable() {
            trace!(member = %self.name, %operation_id, "Request lost, member unreachable");
            return Ok(());
        }

        let request = NodeRequest::decode(&request.encode()?)?;
        let response = match self.executor.execute(operation_id, request) {
            Ok(response) => response,
            Err(e) => {
                debug!(member = %self.name, %operation_id, error = %e, "Node execution failed");
                NodeResponse::Failed {
                    reason: e.to_string(),
                }
            }
        };

        self.send_response(operation_id, &response)
    }

    fn send_response(&self, operation_id: OperationId, response: &NodeResponse) -> Result<()> {
        let response = NodeResponse::decode(&response.encode()?)?;
        self.coordinator.receive(&self.name, operation_id, response);
        Ok(())
    }

    fn reply(&self, session_id: SessionOperationId, response: &SubmitResponse) -> Result<()> {
        let response = SubmitResponse::decode(&response.encode()?)?;
        match &self.replies {
            Some(sink) => sink
                .send(Reply {
                    member: self.name.clone(),
                    session_id,
                    response,
                })
                .map_err(|_| Error::Transport(format!("reply observer for {} is gone", self.name))),
            None => {
                debug!(member = %self.name, %session_id, "Reply dropped, no observer attached");
                Ok(())
            }
        }
    }

    fn submit(
        &self,
        session_id: SessionOperationId,
        request: Arc<dyn SubmitRequest>,
    ) -> Result<()> {
        if self.coordinator.is_closed() {
            return Err(Error::CoordinatorClosed);
        }
        let payload = request.encode()?;
        let request = decode_submit_request(request.request_type(), &payload)?;
        self.coordinator.submit(self.member(), session_id, request);
        Ok(())
    }
}
