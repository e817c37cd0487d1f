//! Engine wiring: debounced persistence and the mutation/broadcast core.

pub mod autosave;
mod coordinator;

pub use autosave::{AutosaveHandle, AutosaveWorker, SaveState, SaveTrigger, SnapshotSource};
pub use coordinator::{EngineStatus, Mutation, MutationOutcome, SyncCoordinator};
