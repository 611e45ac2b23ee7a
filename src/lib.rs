//! taskswarm library root.

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version spoken between manager and workers.
pub const PROTOCOL_VERSION: i64 = 11;

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub type Result<T> = error::SwarmResult<T>;

pub mod net;

pub use crate::core::category::AllocationMode;
pub use crate::core::manager::Manager;
pub use crate::core::resources::ResourceSummary;
pub use crate::core::scheduler::SchedulePolicy;
pub use crate::core::task::{Task, TaskResultCode, TaskState};
pub use crate::error::{SwarmError, SwarmResult};
