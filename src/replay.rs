//! # Time Travel
//!
//! Entity state at any point in history is a pure fold over the entity's
//! event log. The storage layer supplies the constrained, `sequence ASC`
//! ordered slice (`sequence <= atVersion`, `timestamp <= asOf`, or both);
//! this module folds it.
//!
//! ## Fold Rules
//!
//! - Start from no state.
//! - An event whose *event form* is `deleted` marks the state deleted and
//!   advances the version to the event's sequence.
//! - Any other event merges its `after` snapshot into the state, preserving
//!   `id`/`type` and advancing the version to the event's sequence.
//!
//! Replaying all events of a live entity therefore reproduces exactly the
//! entity's current snapshot; that equivalence is an invariant the tests
//! pin down.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{to_rfc3339, EventRecord, Sequence};

// =============================================================================
// Reconstructed State
// =============================================================================

/// The result of folding an entity's events up to some point.
#[derive(Debug, Clone)]
pub struct ReplayedState {
    /// Snapshot-form state (payload plus `$`-meta keys).
    pub state: Map<String, Value>,
    /// Sequence of the last folded event; equals the entity version at that
    /// point in history.
    pub version: Sequence,
    /// True when the last relevant event was a deletion.
    pub deleted: bool,
}

impl ReplayedState {
    /// The snapshot as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.state.clone())
    }
}

/// Folds events (ordered `sequence ASC`) into a state. `None` when the slice
/// is empty: the entity did not exist at the requested point.
pub fn fold_events(events: &[EventRecord]) -> Option<ReplayedState> {
    let mut state: Option<ReplayedState> = None;

    for event in events {
        if event.conjugation.event == "deleted" {
            if let Some(current) = state.as_mut() {
                current.deleted = true;
                current.version = event.sequence;
                current
                    .state
                    .insert("$deletedAt".to_string(), Value::String(to_rfc3339(event.timestamp)));
                current
                    .state
                    .insert("$version".to_string(), Value::from(event.sequence.as_raw()));
            }
            continue;
        }

        let after = match event.after.as_ref().and_then(Value::as_object) {
            Some(after) => after,
            // An event without an object `after` cannot advance state.
            None => continue,
        };

        let current = state.get_or_insert_with(|| ReplayedState {
            state: Map::new(),
            version: event.sequence,
            deleted: false,
        });
        for (key, value) in after {
            current.state.insert(key.clone(), value.clone());
        }
        current.state.insert("id".to_string(), Value::String(event.entity_id.clone()));
        current
            .state
            .insert("type".to_string(), Value::String(event.entity_type.clone()));
        current
            .state
            .insert("$version".to_string(), Value::from(event.sequence.as_raw()));
        current.version = event.sequence;
        current.deleted = false;
    }

    state
}

// =============================================================================
// Field-Level Diff
// =============================================================================

/// One changed field between two reconstructed states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub from: Value,
    pub to: Value,
}

/// Compares two snapshot-form states field by field.
///
/// Only non-meta keys (not prefixed with `$`) participate; comparison is
/// structural JSON equality. Missing keys compare as null.
pub fn diff_fields(before: &Map<String, Value>, after: &Map<String, Value>) -> Vec<FieldChange> {
    let mut keys: std::collections::BTreeSet<&String> = std::collections::BTreeSet::new();
    keys.extend(before.keys().filter(|k| !k.starts_with('$')));
    keys.extend(after.keys().filter(|k| !k.starts_with('$')));

    let mut changes = Vec::new();
    for key in keys {
        let from = before.get(key).cloned().unwrap_or(Value::Null);
        let to = after.get(key).cloned().unwrap_or(Value::Null);
        if from != to {
            changes.push(FieldChange { field: key.clone(), from, to });
        }
    }
    changes
}

/// The full diff between two versions of an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDiff {
    pub entity_type: String,
    pub entity_id: String,
    pub from: u64,
    pub to: u64,
    pub changes: Vec<FieldChange>,
    /// Events with `from < sequence <= to`.
    pub events: Vec<EventRecord>,
    pub before_state: Value,
    pub after_state: Value,
}

// =============================================================================
// Tests
// =============================================================================
