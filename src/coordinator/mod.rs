//! Structural coordinator
//!
//! The coordinator is responsible for:
//! - Member registry (who takes part in new operations)
//! - Operation ids (ordering via the operation log)
//! - In-flight contexts (who was asked, who answered)
//! - Deadlines (one timeout per operation)
//! - Chaining phases from inside response handlers
//!
//! All state changes run on one execution queue; see [`server`].

pub mod context;
pub mod core;
pub mod handler;
pub mod member;
pub mod oplog;
pub mod server;
pub mod structural;

pub use context::{ContextSnapshot, RequestContext};
pub use self::core::CoordinatorCore;
pub use handler::{handler_fn, FnHandler, ResponseHandler, SubmitRequest};
pub use member::{DistributedChannel, DistributedMember, SessionOperationId};
pub use oplog::{FileOperationLog, LogRecord, MemOperationLog, OperationId, OperationLog};
pub use server::Coordinator;
pub use structural::{decode_submit_request, StructuralChangeRequest, STRUCTURAL_CHANGE_REQUEST};
