// Topichub - Shared topic-tree synchronization and persistence engine

pub mod config;
pub mod convergent;
pub mod error;
pub mod model;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;

pub use config::EngineConfig;
pub use error::EngineError;
pub use sync::{Mutation, MutationOutcome, SyncCoordinator};
