//! Two-phase structural changes over in-process loopback members

use minicoord::common::CoordinatorConfig;
use minicoord::coordinator::{MemOperationLog, StructuralChangeRequest};
use minicoord::node::{LoopbackChannel, Reply, StructuralExecutor};
use minicoord::protocol::{StructuralChange, SubmitResponse};
use minicoord::{Coordinator, SessionOperationId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Cluster {
    coordinator: Coordinator,
    channels: Vec<LoopbackChannel>,
    executors: Vec<Arc<StructuralExecutor>>,
    replies: mpsc::UnboundedReceiver<Reply>,
}

impl Cluster {
    fn start(timeout_ms: u64, hosts: &[&[&str]]) -> Self {
        let config = CoordinatorConfig {
            request_timeout_ms: timeout_ms,
            ..Default::default()
        };
        let coordinator = Coordinator::spawn(&config, Arc::new(MemOperationLog::new()));
        let (tx, replies) = mpsc::unbounded_channel();

        let mut channels = Vec::new();
        let mut executors = Vec::new();
        for (i, view) in hosts.iter().enumerate() {
            let executor = Arc::new(StructuralExecutor::new(view.iter().copied()));
            let channel = LoopbackChannel::new(
                format!("node-{}", i + 1),
                coordinator.clone(),
                executor.clone(),
            )
            .with_replies(tx.clone());
            coordinator.join(channel.member());
            channels.push(channel);
            executors.push(executor);
        }

        Self {
            coordinator,
            channels,
            executors,
            replies,
        }
    }

    async fn submit(&mut self, change: StructuralChange) -> Reply {
        let session_id = SessionOperationId::new();
        self.channels[0]
            .member()
            .submit(session_id, Arc::new(StructuralChangeRequest::new(change)))
            .unwrap();

        let reply = timeout(Duration::from_secs(3), self.replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.session_id, session_id);
        assert_eq!(reply.member, "node-1");
        reply
    }
}

const THREE: &[&str] = &["node-1", "node-2", "node-3"];

#[tokio::test]
async fn test_add_node_applied_everywhere() {
    let mut cluster = Cluster::start(1_000, &[THREE, THREE, THREE]);
    let change = StructuralChange::AddNode {
        name: "node-4".into(),
    };

    let reply = cluster.submit(change.clone()).await;
    assert_eq!(
        reply.response,
        SubmitResponse::Applied {
            change,
            hosts: vec![
                "node-1".into(),
                "node-2".into(),
                "node-3".into(),
                "node-4".into()
            ],
        }
    );

    for executor in &cluster.executors {
        assert_eq!(executor.hosts(), ["node-1", "node-2", "node-3", "node-4"]);
        assert_eq!(executor.pending_count(), 0);
    }
    assert!(cluster.coordinator.contexts().await.is_empty());
    cluster.coordinator.close().await;
}

#[tokio::test]
async fn test_remove_node_applied_everywhere() {
    let mut cluster = Cluster::start(1_000, &[THREE, THREE, THREE]);
    let change = StructuralChange::RemoveNode {
        name: "node-3".into(),
    };

    let reply = cluster.submit(change.clone()).await;
    assert_eq!(
        reply.response,
        SubmitResponse::Applied {
            change,
            hosts: vec!["node-1".into(), "node-2".into()],
        }
    );
    for executor in &cluster.executors {
        assert_eq!(executor.hosts(), ["node-1", "node-2"]);
    }
    cluster.coordinator.close().await;
}

#[tokio::test]
async fn test_rejected_prepare_aborts() {
    // node-2 already believes node-4 is a member
    let with_four: &[&str] = &["node-1", "node-2", "node-3", "node-4"];
    let mut cluster = Cluster::start(1_000, &[THREE, with_four, THREE]);

    let reply = cluster
        .submit(StructuralChange::AddNode {
            name: "node-4".into(),
        })
        .await;
    match &reply.response {
        SubmitResponse::Failed { reason } => {
            assert!(reason.contains("node-2"), "reason: {}", reason);
            assert!(!reason.contains("node-1"), "reason: {}", reason);
        }
        other => panic!("unexpected reply {:?}", other),
    }

    // Abort acks arrive right behind the reply; the queue drains them first
    assert!(cluster.coordinator.contexts().await.is_empty());
    assert_eq!(cluster.executors[0].hosts(), THREE);
    assert_eq!(cluster.executors[1].hosts(), with_four);
    assert!(cluster.executors.iter().all(|e| e.pending_count() == 0));
    cluster.coordinator.close().await;
}

#[tokio::test]
async fn test_unreachable_member_fails_after_timeout() {
    let mut cluster = Cluster::start(100, &[THREE, THREE, THREE]);
    cluster.channels[2].set_reachable(false);

    let reply = cluster
        .submit(StructuralChange::AddNode {
            name: "node-4".into(),
        })
        .await;
    match &reply.response {
        SubmitResponse::Failed { reason } => {
            assert!(reason.contains("timed out"), "reason: {}", reason);
            assert!(reason.contains("node-3"), "reason: {}", reason);
        }
        other => panic!("unexpected reply {:?}", other),
    }

    assert!(cluster.executors.iter().all(|e| e.hosts() == THREE));
    // Reachable members dropped their prepared change on abort
    assert_eq!(cluster.executors[0].pending_count(), 0);
    assert_eq!(cluster.executors[1].pending_count(), 0);

    // The abort itself waits for node-3 until its own deadline
    let contexts = cluster.coordinator.contexts().await;
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].responded, vec!["node-1", "node-2"]);

    cluster.coordinator.close().await;
    assert!(cluster.coordinator.contexts().await.is_empty());
}

#[tokio::test]
async fn test_sequential_changes() {
    let mut cluster = Cluster::start(1_000, &[THREE, THREE, THREE]);

    cluster
        .submit(StructuralChange::AddNode {
            name: "node-4".into(),
        })
        .await;
    let reply = cluster
        .submit(StructuralChange::RemoveNode {
            name: "node-1".into(),
        })
        .await;

    assert!(matches!(reply.response, SubmitResponse::Applied { .. }));
    for executor in &cluster.executors {
        assert_eq!(executor.hosts(), ["node-2", "node-3", "node-4"]);
    }
    cluster.coordinator.close().await;
}
