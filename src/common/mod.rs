//! Common utilities and types shared across minicoord

pub mod config;
pub mod error;
pub mod utils;

pub use self::config::{Config, CoordinatorConfig, SyncPolicy};
pub use error::{Error, Result};
pub use utils::{crc32, parse_duration, timestamp_now_millis};
