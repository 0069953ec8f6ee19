//! Typed resource snapshot shared with subscribers.
//!
//! The view wraps the current snapshot of one resource. Writes happen
//! only inside tasks drained from the owning event subscription's queue,
//! so there is a single writer per resource; subscribers read through
//! the lock from their own connection lanes.

use crate::value::{Resource, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Mutation event delivered to subscribers, carrying the fields
/// relevant to its kind.
#[derive(Debug, Clone, Default)]
pub struct ResourceEvent {
    /// Event kind (`change`, `add`, `remove`, or a custom name).
    pub kind: String,
    /// Raw payload, for custom events.
    pub payload: serde_json::Value,
    /// Element index, for collection add/remove.
    pub idx: usize,
    /// Added or removed element, for collection add/remove.
    pub value: Option<Value>,
    /// New field values, for model change. Deleted fields carry the
    /// delete sentinel.
    pub changed: HashMap<String, Value>,
    /// Prior field values, for model change. Previously absent fields
    /// carry the delete sentinel.
    pub old_values: HashMap<String, Value>,
}

impl ResourceEvent {
    /// A custom event forwarding its payload verbatim.
    pub fn custom(kind: &str, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
            ..Default::default()
        }
    }
}

/// Shared snapshot of one resource.
#[derive(Debug)]
pub struct ResourceView {
    rid: String,
    state: RwLock<Resource>,
}

impl ResourceView {
    /// Wrap an initial snapshot.
    pub fn new(rid: impl Into<String>, resource: Resource) -> Arc<Self> {
        Arc::new(Self {
            rid: rid.into(),
            state: RwLock::new(resource),
        })
    }

    /// The resource ID this view mirrors.
    pub fn rid(&self) -> &str {
        &self.rid
    }

    /// Clone the current snapshot.
    pub fn snapshot(&self) -> Resource {
        self.state.read().unwrap().clone()
    }

    /// Apply a `change`, `add`, or `remove` event to the snapshot and
    /// build the event to deliver. Returns `None` when the payload does
    /// not fit the resource; such events are dropped by the caller.
    pub(crate) fn apply_event(
        &self,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Option<ResourceEvent> {
        let mut state = self.state.write().unwrap();
        match (kind, &mut *state) {
            ("change", Resource::Model(model)) => {
                let props = payload.as_object()?;
                let mut changed = HashMap::with_capacity(props.len());
                let mut old_values = HashMap::with_capacity(props.len());
                for (field, raw) in props {
                    let new = Value::from_json(raw.clone());
                    let old = model.get(field).cloned().unwrap_or(Value::Delete);
                    match &new {
                        Value::Delete => {
                            model.remove(field);
                        }
                        v => {
                            model.insert(field.clone(), v.clone());
                        }
                    }
                    changed.insert(field.clone(), new);
                    old_values.insert(field.clone(), old);
                }
                Some(ResourceEvent {
                    kind: kind.to_string(),
                    changed,
                    old_values,
                    ..Default::default()
                })
            }
            ("add", Resource::Collection(coll)) => {
                let idx = payload.get("idx")?.as_u64()? as usize;
                if idx > coll.len() {
                    warn!("{}: add event index {} out of bounds", self.rid, idx);
                    return None;
                }
                let value = Value::from_json(payload.get("value")?.clone());
                coll.insert(idx, value.clone());
                Some(ResourceEvent {
                    kind: kind.to_string(),
                    idx,
                    value: Some(value),
                    ..Default::default()
                })
            }
            ("remove", Resource::Collection(coll)) => {
                let idx = payload.get("idx")?.as_u64()? as usize;
                if idx >= coll.len() {
                    warn!("{}: remove event index {} out of bounds", self.rid, idx);
                    return None;
                }
                let value = coll.remove(idx);
                Some(ResourceEvent {
                    kind: kind.to_string(),
                    idx,
                    value: Some(value),
                    ..Default::default()
                })
            }
            _ => None,
        }
    }

    /// Replace the snapshot with a freshly fetched one and synthesize
    /// the events that carry subscribers from the stale snapshot to the
    /// fresh one.
    pub(crate) fn reset_diff(&self, fresh: Resource) -> Vec<ResourceEvent> {
        let mut state = self.state.write().unwrap();
        let events = match (&*state, &fresh) {
            (Resource::Model(old), Resource::Model(new)) => diff_model(old, new),
            (Resource::Collection(old), Resource::Collection(new)) => diff_collection(old, new),
            _ => {
                warn!(
                    "{}: reset changed resource type from {} to {}",
                    self.rid,
                    state.kind(),
                    fresh.kind()
                );
                Vec::new()
            }
        };
        *state = fresh;
        events
    }
}

fn diff_model(old: &HashMap<String, Value>, new: &HashMap<String, Value>) -> Vec<ResourceEvent> {
    let mut changed = HashMap::new();
    let mut old_values = HashMap::new();

    for (field, value) in new {
        if old.get(field) != Some(value) {
            changed.insert(field.clone(), value.clone());
            old_values.insert(
                field.clone(),
                old.get(field).cloned().unwrap_or(Value::Delete),
            );
        }
    }
    for (field, value) in old {
        if !new.contains_key(field) {
            changed.insert(field.clone(), Value::Delete);
            old_values.insert(field.clone(), value.clone());
        }
    }

    if changed.is_empty() {
        return Vec::new();
    }
    vec![ResourceEvent {
        kind: "change".to_string(),
        changed,
        old_values,
        ..Default::default()
    }]
}

/// Diff two collections into a sequential remove/add event script via a
/// longest common subsequence. Removes are emitted in descending index
/// order, then adds ascending, so each index is valid at the time its
/// event applies.
fn diff_collection(old: &[Value], new: &[Value]) -> Vec<ResourceEvent> {
    let n = old.len();
    let m = new.len();

    // LCS length table.
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in 1..=n {
        for j in 1..=m {
            lcs[i][j] = if old[i - 1] == new[j - 1] {
                lcs[i - 1][j - 1] + 1
            } else {
                lcs[i - 1][j].max(lcs[i][j - 1])
            };
        }
    }

    // Backtrack to mark kept elements.
    let mut keep_old = vec![false; n];
    let mut keep_new = vec![false; m];
    let (mut i, mut j) = (n, m);
    while i > 0 && j > 0 {
        if old[i - 1] == new[j - 1] && lcs[i][j] == lcs[i - 1][j - 1] + 1 {
            keep_old[i - 1] = true;
            keep_new[j - 1] = true;
            i -= 1;
            j -= 1;
        } else if lcs[i - 1][j] >= lcs[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }

    let mut events = Vec::new();
    for i in (0..n).rev() {
        if !keep_old[i] {
            events.push(ResourceEvent {
                kind: "remove".to_string(),
                idx: i,
                value: Some(old[i].clone()),
                ..Default::default()
            });
        }
    }
    for j in 0..m {
        if !keep_new[j] {
            events.push(ResourceEvent {
                kind: "add".to_string(),
                idx: j,
                value: Some(new[j].clone()),
                ..Default::default()
            });
        }
    }
    events
}
