//! Coordinator handle and its execution queue
//!
//! Every public entry point turns into a [`Command`] on an unbounded
//! channel. A single worker task drains the channel and applies commands
//! to the [`CoordinatorCore`] in FIFO order. Timers enqueue too, so a
//! timeout can never interleave with a response for the same operation.

use crate::common::{CoordinatorConfig, Result};
use crate::coordinator::context::ContextSnapshot;
use crate::coordinator::core::CoordinatorCore;
use crate::coordinator::handler::SubmitRequest;
use crate::coordinator::member::{DistributedMember, SessionOperationId};
use crate::coordinator::oplog::{FileOperationLog, MemOperationLog, OperationId, OperationLog};
use crate::protocol::NodeResponse;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce(&mut CoordinatorCore) + Send>;

pub(crate) enum Command {
    Join(DistributedMember),
    Leave(String),
    Submit {
        member: DistributedMember,
        session_id: SessionOperationId,
        request: Arc<dyn SubmitRequest>,
    },
    Receive {
        from: String,
        operation_id: OperationId,
        response: NodeResponse,
    },
    Timeout(OperationId),
    Execute(Job),
    Close(oneshot::Sender<()>),
}

/// Cloneable, thread-safe handle on a running coordinator.
///
/// None of the methods block: they enqueue work and return. Effects are
/// observed through handler callbacks or the async query methods. Once
/// [`Coordinator::close`] has run, every entry point is a no-op.
#[derive(Clone)]
pub struct Coordinator {
    tx: mpsc::UnboundedSender<Command>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Handle that does not keep the execution queue alive.
#[derive(Clone)]
pub(crate) struct WeakCoordinator {
    tx: mpsc::WeakUnboundedSender<Command>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WeakCoordinator {
    pub(crate) fn upgrade(&self) -> Option<Coordinator> {
        self.tx.upgrade().map(|tx| Coordinator {
            tx,
            worker: self.worker.clone(),
        })
    }
}

impl Coordinator {
    /// Start a coordinator on the current Tokio runtime.
    ///
    /// The worker stops on [`Coordinator::close`] or once every handle
    /// has been dropped. Members whose channels hold a handle keep it
    /// alive, so such clusters must be closed explicitly.
    pub fn spawn(config: &CoordinatorConfig, log: Arc<dyn OperationLog>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            tx,
            worker: Arc::new(Mutex::new(None)),
        };

        let core = CoordinatorCore::new(config.request_timeout(), log, handle.downgrade());
        let worker = tokio::spawn(run(core, rx));
        if let Ok(mut slot) = handle.worker.lock() {
            *slot = Some(worker);
        }

        handle
    }

    /// Start a coordinator with the operation log the config asks for.
    pub fn open(config: &CoordinatorConfig) -> Result<Self> {
        let log: Arc<dyn OperationLog> = match &config.oplog_path {
            Some(path) => Arc::new(FileOperationLog::open(path, config.sync_policy)?),
            None => Arc::new(MemOperationLog::new()),
        };
        Ok(Self::spawn(config, log))
    }

    /// Register a member. A second join with the same name replaces the first.
    pub fn join(&self, member: DistributedMember) {
        self.enqueue(Command::Join(member));
    }

    /// Remove a member from the registry. In-flight operations keep their snapshot.
    pub fn leave(&self, name: &str) {
        self.enqueue(Command::Leave(name.to_string()));
    }

    /// Schedule `request.begin(member, session_id, ..)` on the queue.
    pub fn submit(
        &self,
        member: DistributedMember,
        session_id: SessionOperationId,
        request: Arc<dyn SubmitRequest>,
    ) {
        self.enqueue(Command::Submit {
            member,
            session_id,
            request,
        });
    }

    /// Deliver a member's answer. Answers for retired or unknown operations
    /// are dropped.
    pub fn receive(&self, from: &str, operation_id: OperationId, response: NodeResponse) {
        self.enqueue(Command::Receive {
            from: from.to_string(),
            operation_id,
            response,
        });
    }

    /// Run `job` on the execution queue.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce(&mut CoordinatorCore) + Send + 'static,
    {
        self.enqueue(Command::Execute(Box::new(job)));
    }

    /// Snapshot of the live context table, ordered by operation id.
    pub async fn contexts(&self) -> Vec<ContextSnapshot> {
        self.query(|core| core.contexts()).await.unwrap_or_default()
    }

    /// Names of the registered members.
    pub async fn members(&self) -> Vec<String> {
        self.query(|core| {
            core.members()
                .map(|m| m.name().to_string())
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default()
    }

    async fn query<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&CoordinatorCore) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(move |core| {
            let _ = tx.send(f(core));
        });
        rx.await.ok()
    }

    /// Stop the queue, cancel outstanding timeouts and release all contexts.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Close(tx)).is_ok() {
            let _ = rx.await;
        }

        let worker = match self.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Coordinator worker ended abnormally: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn downgrade(&self) -> WeakCoordinator {
        WeakCoordinator {
            tx: self.tx.downgrade(),
            worker: self.worker.clone(),
        }
    }

    pub(crate) fn enqueue(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("Coordinator closed, dropping command");
        }
    }
}

async fn run(mut core: CoordinatorCore, mut rx: mpsc::UnboundedReceiver<Command>) {
    info!("Coordinator started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Join(member) => core.apply_join(member),
            Command::Leave(name) => core.apply_leave(&name),
            Command::Submit {
                member,
                session_id,
                request,
            } => core.apply_submit(member, session_id, request),
            Command::Receive {
                from,
                operation_id,
                response,
            } => core.apply_receive(&from, operation_id, response),
            Command::Timeout(operation_id) => core.apply_timeout(operation_id),
            Command::Execute(job) => job(&mut core),
            Command::Close(done) => {
                rx.close();
                core.shutdown();
                let _ = done.send(());
                return;
            }
        }
    }

    debug!("Every coordinator handle dropped");
    core.shutdown();
}
