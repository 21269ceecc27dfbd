//! Callbacks that give operations their meaning
//!
//! The coordinator never decides when an operation is done. A
//! [`ResponseHandler`] is consulted on every response and once on timeout;
//! the first `true` it returns retires the context. Both callbacks run on
//! the coordinator's execution queue, so they never race each other.

use crate::common::Result;
use crate::coordinator::context::RequestContext;
use crate::coordinator::core::CoordinatorCore;
use crate::coordinator::member::{DistributedMember, SessionOperationId};
use crate::protocol::NodeResponse;
use std::sync::Arc;

/// Completion policy for one in-flight operation.
pub trait ResponseHandler: Send + 'static {
    /// Called after `response` from `member` was recorded in `context`.
    /// Return `true` when the operation is complete.
    fn receive(
        &mut self,
        coordinator: &mut CoordinatorCore,
        context: &RequestContext,
        member: &DistributedMember,
        response: &NodeResponse,
    ) -> bool;

    /// Called at most once, when the deadline passes before completion.
    /// Return `true` to retire the context.
    ///
    /// Returning `false` keeps the context without arming a new deadline:
    /// only a later response or [`crate::Coordinator::close`] releases it.
    fn timeout(&mut self, coordinator: &mut CoordinatorCore, context: &RequestContext) -> bool;
}

/// A client-initiated, possibly multi-phase operation.
pub trait SubmitRequest: Send + Sync + 'static {
    /// Entry point, run on the execution queue. Issues node operations
    /// through [`CoordinatorCore::send_operation`].
    fn begin(
        self: Arc<Self>,
        member: &DistributedMember,
        session_id: SessionOperationId,
        coordinator: &mut CoordinatorCore,
    );

    /// Tag used to pick the decoder on the receiving side.
    fn request_type(&self) -> u16;

    fn encode(&self) -> Result<Vec<u8>>;
}

/// [`ResponseHandler`] assembled from a pair of closures.
pub struct FnHandler<R, T> {
    on_receive: R,
    on_timeout: T,
}

/// Build a handler from a receive closure and a timeout closure.
pub fn handler_fn<R, T>(on_receive: R, on_timeout: T) -> FnHandler<R, T>
where
    R: FnMut(&mut CoordinatorCore, &RequestContext, &DistributedMember, &NodeResponse) -> bool
        + Send
        + 'static,
    T: FnMut(&mut CoordinatorCore, &RequestContext) -> bool + Send + 'static,
{
    FnHandler {
        on_receive,
        on_timeout,
    }
}

impl<R, T> ResponseHandler for FnHandler<R, T>
where
    R: FnMut(&mut CoordinatorCore, &RequestContext, &DistributedMember, &NodeResponse) -> bool
        + Send
        + 'static,
    T: FnMut(&mut CoordinatorCore, &RequestContext) -> bool + Send + 'static,
{
    fn receive(
        &mut self,
        coordinator: &mut CoordinatorCore,
        context: &RequestContext,
        member: &DistributedMember,
        response: &NodeResponse,
    ) -> bool {
        (self.on_receive)(coordinator, context, member, response)
    }

    fn timeout(&mut self, coordinator: &mut CoordinatorCore, context: &RequestContext) -> bool {
        (self.on_timeout)(coordinator, context)
    }
}
