//! Member-side execution of node requests

use crate::common::{Error, Result};
use crate::coordinator::OperationId;
use crate::protocol::{NodeRequest, NodeResponse, StructuralChange};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Runs node-local steps on a member.
///
/// An `Err` is not a transport failure: the channel turns it into a
/// [`NodeResponse::Failed`] so the coordinator's handler can weigh it.
pub trait NodeExecutor: Send + Sync {
    fn execute(&self, operation_id: OperationId, request: NodeRequest) -> Result<NodeResponse>;
}

#[derive(Debug, Default)]
struct ClusterView {
    hosts: BTreeSet<String>,
    pending: HashMap<OperationId, StructuralChange>,
}

/// One member's view of the cluster layout, changed only through
/// prepare/commit.
#[derive(Debug, Default)]
pub struct StructuralExecutor {
    view: Mutex<ClusterView>,
}

impl StructuralExecutor {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            view: Mutex::new(ClusterView {
                hosts: hosts.into_iter().map(Into::into).collect(),
                pending: HashMap::new(),
            }),
        }
    }

    /// Committed hosts, sorted by name.
    pub fn hosts(&self) -> Vec<String> {
        self.lock().hosts.iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterView> {
        self.view.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ClusterView {
    fn validate(&self, change: &StructuralChange) -> Result<()> {
        if let Some((op, _)) = self
            .pending
            .iter()
            .find(|(_, pending)| pending.node() == change.node())
        {
            return Err(Error::Rejected(format!(
                "node {} already has a pending change ({})",
                change.node(),
                op
            )));
        }

        match change {
            StructuralChange::AddNode { name } if self.hosts.contains(name) => Err(
                Error::Rejected(format!("node {} is already a member", name)),
            ),
            StructuralChange::RemoveNode { name } if !self.hosts.contains(name) => Err(
                Error::Rejected(format!("node {} is not a member", name)),
            ),
            _ => Ok(()),
        }
    }

    fn apply(&mut self, change: StructuralChange) {
        match change {
            StructuralChange::AddNode { name } => {
                self.hosts.insert(name);
            }
            StructuralChange::RemoveNode { name } => {
                self.hosts.remove(&name);
            }
        }
    }
}

impl NodeExecutor for StructuralExecutor {
    fn execute(&self, operation_id: OperationId, request: NodeRequest) -> Result<NodeResponse> {
        let mut view = self.lock();
        match request {
            NodeRequest::Prepare { change } => {
                view.validate(&change)?;
                view.pending.insert(operation_id, change);
                Ok(NodeResponse::Prepared)
            }
            NodeRequest::Commit { prepared } => {
                let change = view.pending.remove(&prepared).ok_or_else(|| {
                    Error::Rejected(format!("no prepared change for {}", prepared))
                })?;
                view.apply(change);
                Ok(NodeResponse::Committed)
            }
            NodeRequest::Abort { prepared } => {
                view.pending.remove(&prepared);
                Ok(NodeResponse::Aborted)
            }
            NodeRequest::Custom { tag, .. } => Err(Error::Rejected(format!(
                "unsupported custom request #{}",
                tag
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(name: &str) -> NodeRequest {
        NodeRequest::Prepare {
            change: StructuralChange::AddNode { name: name.into() },
        }
    }

    #[test]
    fn test_prepare_commit() {
        let executor = StructuralExecutor::new(["one", "two"]);
        let prepared = OperationId::new(10);

        assert_eq!(
            executor.execute(prepared, add("three")).unwrap(),
            NodeResponse::Prepared
        );
        assert_eq!(executor.pending_count(), 1);
        assert_eq!(executor.hosts(), ["one", "two"]);

        assert_eq!(
            executor
                .execute(OperationId::new(11), NodeRequest::Commit { prepared })
                .unwrap(),
            NodeResponse::Committed
        );
        assert_eq!(executor.hosts(), ["one", "three", "two"]);
        assert_eq!(executor.pending_count(), 0);
    }

    #[test]
    fn test_abort_discards() {
        let executor = StructuralExecutor::new(["one"]);
        let prepared = OperationId::new(1);
        executor.execute(prepared, add("two")).unwrap();

        assert_eq!(
            executor
                .execute(OperationId::new(2), NodeRequest::Abort { prepared })
                .unwrap(),
            NodeResponse::Aborted
        );
        assert_eq!(executor.hosts(), ["one"]);

        // Commit after abort has nothing to apply
        let result = executor.execute(OperationId::new(3), NodeRequest::Commit { prepared });
        assert!(matches!(result, Err(Error::Rejected(_))));
    }

    #[test]
    fn test_rejections() {
        let executor = StructuralExecutor::new(["one"]);
        assert!(executor.execute(OperationId::new(1), add("one")).is_err());

        let remove_ghost = NodeRequest::Prepare {
            change: StructuralChange::RemoveNode {
                name: "ghost".into(),
            },
        };
        assert!(executor.execute(OperationId::new(2), remove_ghost).is_err());

        executor.execute(OperationId::new(3), add("two")).unwrap();
        // Conflicts with the pending add of the same node
        assert!(executor.execute(OperationId::new(4), add("two")).is_err());

        let custom = NodeRequest::Custom {
            tag: 0x8001,
            payload: vec![],
        };
        assert!(executor.execute(OperationId::new(5), custom).is_err());
    }
}
