//! Operation log and materialization for the shared topic tree
//!
//! A `TopicTreeReplica` stores every operation it has seen, keyed by
//! `(author, seq)`, and materializes them into a `Document`. Scalar fields
//! resolve latest-wins; existence follows informed-remove semantics: a
//! remove only discards state its author's horizon had seen, so a
//! concurrent unseen edit keeps the item alive on every replica.
//!
//! Replicas that have ingested the same operation set materialize
//! identical documents regardless of arrival order.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Application, Direction, Document, Topic};

use super::horizon::{Horizon, ReplicaId, SeqNum};
use super::operation::{OpEnvelope, Operation, TopicField};

pub struct TopicTreeReplica {
    replica_id: ReplicaId,

    /// Next sequence number for local operations.
    next_seq: SeqNum,

    /// What this replica has seen.
    horizon: Horizon,

    /// All operations, ordered by (author, seq).
    operations: BTreeMap<(ReplicaId, SeqNum), OpEnvelope>,
}

impl TopicTreeReplica {
    pub fn new(replica_id: impl Into<ReplicaId>) -> Self {
        Self {
            replica_id: replica_id.into(),
            next_seq: 1,
            horizon: Horizon::new(),
            operations: BTreeMap::new(),
        }
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn horizon(&self) -> &Horizon {
        &self.horizon
    }

    /// Wrap a local mutation in an envelope carrying the current horizon
    /// and commit it to the log.
    pub fn apply_local(&mut self, op: Operation) -> OpEnvelope {
        let envelope = OpEnvelope::new(
            self.replica_id.clone(),
            self.next_seq,
            self.horizon.clone(),
            op,
        );
        self.next_seq += 1;
        self.store(envelope.clone());
        envelope
    }

    /// Ingest an operation committed elsewhere. Idempotent: returns false
    /// if this replica already had it.
    pub fn apply_remote(&mut self, envelope: OpEnvelope) -> bool {
        let key = (envelope.author.clone(), envelope.seq);
        if self.operations.contains_key(&key) {
            return false;
        }
        self.store(envelope);
        true
    }

    fn store(&mut self, envelope: OpEnvelope) {
        self.horizon.observe(&envelope.author, envelope.seq);
        self.operations
            .insert((envelope.author.clone(), envelope.seq), envelope);
    }

    /// Operations the given horizon has not seen, for catching up a peer.
    pub fn operations_since(&self, since: &Horizon) -> Vec<OpEnvelope> {
        self.operations
            .iter()
            .filter(|((author, seq), _)| !since.has_seen(author, *seq))
            .map(|(_, env)| env.clone())
            .collect()
    }

    pub fn op_count(&self) -> usize {
        self.operations.len()
    }

    /// Materialize the current document from the full operation log.
    pub fn materialize(&self) -> Document {
        let mut doc = Document::new();

        // Group every envelope by the application it touches.
        let mut per_app: BTreeMap<&str, Vec<&OpEnvelope>> = BTreeMap::new();
        for env in self.operations.values() {
            per_app.entry(env.op.app_name()).or_default().push(env);
        }

        let mut apps: Vec<(Application, (u64, &ReplicaId, SeqNum))> = Vec::new();
        for (name, envs) in per_app {
            if let Some(entry) = self.materialize_application(name, &envs) {
                apps.push(entry);
            }
        }

        // Creation order: earliest surviving add wins the slot.
        apps.sort_by(|a, b| a.1.cmp(&b.1));
        doc.applications = apps.into_iter().map(|(app, _)| app).collect();
        doc
    }

    /// Materialize one application, returning it with its creation key,
    /// or None if it does not currently exist.
    fn materialize_application<'a>(
        &self,
        name: &str,
        envs: &[&'a OpEnvelope],
    ) -> Option<(Application, (u64, &'a ReplicaId, SeqNum))> {
        let mut adds: Vec<&OpEnvelope> = Vec::new();
        let mut removes: Vec<&OpEnvelope> = Vec::new();
        let mut desc_sets: Vec<&OpEnvelope> = Vec::new();
        let mut topic_envs: BTreeMap<&str, Vec<&OpEnvelope>> = BTreeMap::new();

        for env in envs {
            match &env.op {
                Operation::AddApplication { .. } => adds.push(env),
                Operation::RemoveApplication { .. } => removes.push(env),
                Operation::SetApplicationDescription { .. } => desc_sets.push(env),
                _ => {
                    if let Some(topic) = env.op.topic_name() {
                        topic_envs.entry(topic).or_default().push(env);
                    }
                }
            }
        }

        if adds.is_empty() {
            return None;
        }

        // Informed remove: the application survives if any affecting
        // operation (add, description set, or topic edit) was not seen by
        // every remove. Topic edits count: a deleter who never saw them
        // did not know what it was deleting.
        if !removes.is_empty() {
            let survives = adds
                .iter()
                .chain(desc_sets.iter())
                .chain(topic_envs.values().flatten())
                .any(|op| removes.iter().all(|rem| !rem.had_seen(op)));
            if !survives {
                return None;
            }
        }

        let created = adds.iter().map(|e| e.order_key()).min()?;

        // Description: latest-wins across adds and explicit sets.
        let description = adds
            .iter()
            .chain(desc_sets.iter())
            .max_by_key(|e| e.order_key())
            .map(|e| match &e.op {
                Operation::AddApplication { description, .. } => description.clone(),
                Operation::SetApplicationDescription { value, .. } => value.clone(),
                _ => String::new(),
            })
            .unwrap_or_default();

        let mut app = Application::new(name, description);

        let mut topics: Vec<(Topic, (u64, &ReplicaId, SeqNum))> = Vec::new();
        for (topic_name, t_envs) in &topic_envs {
            if let Some(entry) = materialize_topic(topic_name, t_envs, &removes) {
                topics.push(entry);
            }
        }
        topics.sort_by(|a, b| a.1.cmp(&b.1));
        app.topics = topics.into_iter().map(|(t, _)| t).collect();

        Some((app, created))
    }
}

/// Materialize one topic. `app_removes` are RemoveApplication envelopes for
/// the owning application: they act as informed removes of every topic op
/// they had seen, so removing an application discards exactly the topics it
/// knew about.
fn materialize_topic<'a>(
    name: &str,
    envs: &[&'a OpEnvelope],
    app_removes: &[&OpEnvelope],
) -> Option<(Topic, (u64, &'a ReplicaId, SeqNum))> {
    let mut adds: Vec<&OpEnvelope> = Vec::new();
    let mut removes: Vec<&OpEnvelope> = Vec::new();
    let mut sets: Vec<&OpEnvelope> = Vec::new();

    for env in envs {
        match &env.op {
            Operation::AddTopic { .. } => adds.push(env),
            Operation::RemoveTopic { .. } => removes.push(env),
            Operation::SetTopicField { .. } => sets.push(env),
            _ => {}
        }
    }

    if adds.is_empty() {
        return None;
    }

    let all_removes: Vec<&OpEnvelope> = removes.iter().chain(app_removes.iter()).copied().collect();
    if !all_removes.is_empty() {
        let survives = adds
            .iter()
            .chain(sets.iter())
            .any(|op| all_removes.iter().all(|rem| !rem.had_seen(op)));
        if !survives {
            return None;
        }
    }

    let created = adds.iter().map(|e| e.order_key()).min()?;

    // Latest add fixes direction and seeds the scalar fields.
    let latest_add = adds.iter().max_by_key(|e| e.order_key())?;
    let (mut proto, direction, mut description) = match &latest_add.op {
        Operation::AddTopic {
            proto,
            direction,
            description,
            ..
        } => (proto.clone(), *direction, description.clone()),
        _ => (String::new(), Direction::Publish, String::new()),
    };

    // Field sets override latest-wins, but only those later than the add.
    let mut resolve = |field: TopicField, slot: &mut String| {
        let winner = sets
            .iter()
            .filter(|e| matches!(&e.op, Operation::SetTopicField { field: f, .. } if *f == field))
            .max_by_key(|e| e.order_key());
        if let Some(env) = winner {
            if env.order_key() > latest_add.order_key() {
                if let Operation::SetTopicField { value, .. } = &env.op {
                    *slot = value.clone();
                }
            }
        }
    };
    resolve(TopicField::Proto, &mut proto);
    resolve(TopicField::Description, &mut description);

    Some((Topic::new(name, proto, direction, description), created))
}

/// Seed a fresh replica from a loaded document snapshot, used when the
/// process restarts and replays the persisted state as local operations.
pub fn seed_from_document(replica: &mut TopicTreeReplica, doc: &Document) {
    let mut seen_apps = BTreeSet::new();
    for app in &doc.applications {
        if !seen_apps.insert(app.name.clone()) {
            continue;
        }
        replica.apply_local(Operation::AddApplication {
            name: app.name.clone(),
            description: app.description.clone(),
        });
        for topic in &app.topics {
            replica.apply_local(Operation::AddTopic {
                app: app.name.clone(),
                name: topic.name.clone(),
                proto: topic.proto.clone(),
                direction: topic.direction,
                description: topic.description.clone(),
            });
        }
    }
}
