//! Workers — named execution contexts and their registry.

pub mod model;
pub mod registry;

pub use model::{Worker, WorkerKind};
pub use registry::WorkerRegistry;
