//! Task ledger — durable records of logical user requests.

pub mod ledger;
pub mod model;

pub use ledger::{TaskLedger, spawn_retention_sweep};
pub use model::{Task, TaskPatch, TaskSeed, TaskSource, TaskStatus};
