//! Member side of the cluster
//!
//! What a member does when the coordinator asks it to run a node request,
//! and an in-process channel that wires members to a coordinator without
//! a network.

pub mod executor;
pub mod loopback;

pub use executor::{NodeExecutor, StructuralExecutor};
pub use loopback::{LoopbackChannel, Reply};
