//! # minicoord
//!
//! The structural coordination core of a distributed database cluster:
//! - Member registry with snapshot semantics per operation
//! - Operation log for strictly increasing operation ids (in memory or on disk)
//! - Request contexts collecting one response per member
//! - Pluggable completion policies (`ResponseHandler`) with per-operation timeouts
//! - Chained phases (prepare → commit) issued from inside handlers
//!
//! ## Architecture
//!
//! ```text
//!  submit / receive / join            timers
//!          │                            │
//!          ▼                            ▼
//! ┌───────────────────────────────────────────────┐
//! │        execution queue (one worker)           │
//! │  CoordinatorCore: members, contexts, op log   │
//! └──────────┬──────────────────────┬─────────────┘
//!            │ send_request         │ reply
//!   ┌────────▼───────┐     ┌────────▼───────┐
//!   │ member "one"   │ ... │ member "two"   │
//!   │ (channel)      │     │ (channel)      │
//!   └────────────────┘     └────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Add a node to a three member in-process cluster
//! minicoord simulate --members one,two,three --add four
//!
//! # Same, with one member not answering
//! minicoord simulate --members one,two,three --add four --unreachable two
//!
//! # Inspect a durable operation log
//! minicoord oplog ./coord-data/ops.log
//! ```

pub mod common;
pub mod coordinator;
pub mod node;
pub mod protocol;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{
    Coordinator, CoordinatorCore, DistributedChannel, DistributedMember, OperationId,
    RequestContext, ResponseHandler, SessionOperationId, SubmitRequest,
};
pub use protocol::{NodeRequest, NodeResponse, SubmitResponse};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
