//! Convergent replication for the shared topic tree
//!
//! Op-based last-writer-wins merge with informed-remove existence, in
//! place of a full CRDT library. Consistency guarantee (weaker than
//! intent-preserving sequence CRDTs, adequate for a small configuration
//! tree): replicas that have seen the same operation set materialize
//! identical documents; field conflicts resolve by (timestamp, author);
//! concurrent edits a remover had not seen keep the edited item alive.

mod adapter;
mod horizon;
mod operation;
mod replica;

pub use adapter::{CommitOrigin, CommittedOp, ReplicationAdapter};
pub use horizon::{Horizon, ReplicaId, SeqNum};
pub use operation::{OpEnvelope, OpId, Operation, TopicField};
pub use replica::{seed_from_document, TopicTreeReplica};
