//! Coordinator state owned by the execution queue
//!
//! [`CoordinatorCore`] holds the member registry, the context table and
//! the operation log. Only the queue worker touches it, which is what
//! makes every state transition serialized without locks. Code that runs
//! on the queue (submit `begin`, handler callbacks, `execute` closures)
//! receives `&mut CoordinatorCore`.

use crate::common::Result;
use crate::coordinator::context::{ContextSnapshot, RequestContext};
use crate::coordinator::handler::{ResponseHandler, SubmitRequest};
use crate::coordinator::member::{DistributedMember, SessionOperationId};
use crate::coordinator::oplog::{OperationId, OperationLog};
use crate::coordinator::server::{Command, Coordinator, WeakCoordinator};
use crate::protocol::{NodeRequest, NodeResponse};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ContextEntry {
    context: RequestContext,
    handler: Box<dyn ResponseHandler>,
    timer: Option<JoinHandle<()>>,
}

impl ContextEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct CoordinatorCore {
    request_timeout: Duration,
    members: BTreeMap<String, DistributedMember>,
    contexts: HashMap<OperationId, ContextEntry>,
    log: Arc<dyn OperationLog>,
    handle: WeakCoordinator,
}

impl CoordinatorCore {
    pub(crate) fn new(
        request_timeout: Duration,
        log: Arc<dyn OperationLog>,
        handle: WeakCoordinator,
    ) -> Self {
        Self {
            request_timeout,
            members: BTreeMap::new(),
            contexts: HashMap::new(),
            log,
            handle,
        }
    }

    /// Thread-safe handle on this coordinator, while any user handle is alive.
    pub fn handle(&self) -> Option<Coordinator> {
        self.handle.upgrade()
    }

    pub fn members(&self) -> impl Iterator<Item = &DistributedMember> {
        self.members.values()
    }

    pub fn member(&self, name: &str) -> Option<&DistributedMember> {
        self.members.get(name)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn contexts(&self) -> Vec<ContextSnapshot> {
        let mut snapshots: Vec<ContextSnapshot> = self
            .contexts
            .values()
            .map(|entry| entry.context.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.operation_id);
        snapshots
    }

    pub fn last_operation_id(&self) -> Option<OperationId> {
        self.log.last_id()
    }

    /// Dispatch `request` to every registered member.
    ///
    /// Allocates the next operation id, snapshots the member registry as
    /// the involved set, stores a context governed by `handler` and arms
    /// its timeout. The caller's `submit` (if any) is kept on the context
    /// so chained phases can reach it.
    pub fn send_operation<H>(
        &mut self,
        submit: Option<Arc<dyn SubmitRequest>>,
        request: NodeRequest,
        handler: H,
    ) -> Result<OperationId>
    where
        H: ResponseHandler,
    {
        let operation_id = self.log.next_id()?;
        let involved: Vec<DistributedMember> = self.members.values().cloned().collect();

        if involved.is_empty() {
            warn!(
                %operation_id,
                "No members registered, operation can only finish by timeout"
            );
        }

        let timer = self.arm_timeout(operation_id);
        let context = RequestContext::new(operation_id, submit, request.clone(), involved.clone());
        self.contexts.insert(
            operation_id,
            ContextEntry {
                context,
                handler: Box::new(handler),
                timer: Some(timer),
            },
        );

        debug!(
            %operation_id,
            involved = involved.len(),
            "Dispatching node operation"
        );

        for member in &involved {
            if let Err(e) = member.send_request(operation_id, &request) {
                warn!(
                    %operation_id,
                    member = member.name(),
                    error = %e,
                    retryable = e.is_retryable(),
                    "Failed to dispatch node request"
                );
            }
        }

        Ok(operation_id)
    }

    fn arm_timeout(&self, operation_id: OperationId) -> JoinHandle<()> {
        let handle = self.handle.clone();
        let after = self.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(handle) = handle.upgrade() {
                handle.enqueue(Command::Timeout(operation_id));
            }
        })
    }

    pub(crate) fn apply_join(&mut self, member: DistributedMember) {
        let name = member.name().to_string();
        match self.members.insert(name.clone(), member) {
            Some(_) => warn!(member = %name, "Member joined twice, replacing registration"),
            None => info!(member = %name, "Member joined"),
        }
    }

    pub(crate) fn apply_leave(&mut self, name: &str) {
        match self.members.remove(name) {
            Some(_) => info!(member = name, "Member left"),
            None => debug!(member = name, "Leave for unknown member ignored"),
        }
    }

    pub(crate) fn apply_submit(
        &mut self,
        member: DistributedMember,
        session_id: SessionOperationId,
        request: Arc<dyn SubmitRequest>,
    ) {
        debug!(
            member = member.name(),
            %session_id,
            request_type = request.request_type(),
            "Beginning submit request"
        );
        request.begin(&member, session_id, self);
    }

    pub(crate) fn apply_receive(
        &mut self,
        from: &str,
        operation_id: OperationId,
        response: NodeResponse,
    ) {
        // The entry is detached while its handler runs so the handler can
        // borrow the core mutably; nothing else observes the table meanwhile.
        let Some(mut entry) = self.contexts.remove(&operation_id) else {
            debug!(%operation_id, member = from, "Dropping response for unknown operation");
            return;
        };

        let Some(member) = entry.context.involved_member(from).cloned() else {
            warn!(
                %operation_id,
                member = from,
                "Dropping response from member not involved in operation"
            );
            self.contexts.insert(operation_id, entry);
            return;
        };

        if entry.context.record_response(from, response.clone()) {
            debug!(%operation_id, member = from, "Duplicate response replaced earlier one");
        }

        let complete = entry
            .handler
            .receive(self, &entry.context, &member, &response);

        if complete {
            self.retire(entry, "completed");
        } else {
            self.contexts.insert(operation_id, entry);
        }
    }

    pub(crate) fn apply_timeout(&mut self, operation_id: OperationId) {
        let Some(mut entry) = self.contexts.remove(&operation_id) else {
            return;
        };
        entry.timer = None;

        warn!(
            %operation_id,
            responded = entry.context.responses().len(),
            involved = entry.context.involved_members().len(),
            "Operation timed out"
        );

        if entry.handler.timeout(self, &entry.context) {
            self.retire(entry, "timed out");
        } else {
            warn!(
                %operation_id,
                missing = ?entry.context.missing_members(),
                "Handler kept operation open after timeout, no further deadline"
            );
            self.contexts.insert(operation_id, entry);
        }
    }

    fn retire(&mut self, mut entry: ContextEntry, outcome: &'static str) {
        entry.cancel_timer();
        debug!(
            operation_id = %entry.context.operation_id(),
            outcome,
            elapsed_ms = entry.context.elapsed().as_millis() as u64,
            "Operation retired"
        );
    }

    /// Cancel every timer and release all contexts and members.
    pub(crate) fn shutdown(&mut self) {
        let released = self.contexts.len();
        for (_, mut entry) in self.contexts.drain() {
            entry.cancel_timer();
        }
        self.members.clear();
        info!(released, "Coordinator closed");
    }
}
