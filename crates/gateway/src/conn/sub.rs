//! Per-connection subscription graph nodes and the transitive loader.
//!
//! Each node tracks direct client subscriptions and indirect references
//! from other resources in the same connection's graph. Loading a
//! resource walks its snapshot for references and loads each of them
//! the same way; a load tracker attached to every reached node fires
//! the composite response once all of them are Ready or Error. Cycles
//! terminate because a referenced resource that already has a node is
//! not descended into again.

use crate::cache::{ResourceEvent, ResourceView, Subscriber};
use crate::codec::AccessResult;
use crate::conn::{Conn, ConnTask};
use crate::error::ResError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

static NEXT_SUB_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    /// Snapshot or access check still outstanding.
    Loading,
    /// Snapshot present and read access granted.
    Ready,
    /// Load failed or access denied.
    Error,
    /// Reclaimed; kept only transiently.
    Disposed,
}

/// One resource in a connection's subscription graph.
pub(crate) struct SubNode {
    /// Count of explicit client subscribe requests.
    pub direct: u32,
    /// Count of parent nodes embedding this resource.
    pub indirect: u32,
    /// Distinct child resource IDs, in insertion order.
    pub refs: Vec<String>,
    /// Per-occurrence embedding counts behind `refs`.
    ref_counts: HashMap<String, u32>,
    pub state: NodeState,
    pub view: Option<Arc<ResourceView>>,
    pub err: Option<ResError>,
    pub access: Option<AccessResult>,
    pub snapshot_pending: bool,
    pub access_pending: bool,
    /// Load trackers waiting on this node.
    pub trackers: Vec<u64>,
    /// Events held until their referenced resources are loaded.
    pub event_queue: VecDeque<PendingEvent>,
    subscriber: Arc<ConnSubscriber>,
}

impl SubNode {
    pub fn new(subscriber: Arc<ConnSubscriber>, direct: bool) -> Self {
        Self {
            direct: direct as u32,
            indirect: !direct as u32,
            refs: Vec::new(),
            ref_counts: HashMap::new(),
            state: NodeState::Loading,
            view: None,
            err: None,
            access: None,
            snapshot_pending: true,
            access_pending: true,
            trackers: Vec::new(),
            event_queue: VecDeque::new(),
            subscriber,
        }
    }

    pub fn subscriber_id(&self) -> u64 {
        self.subscriber.id
    }

    /// Add one embedding occurrence of a child. Returns whether this is
    /// the first occurrence from this parent.
    pub fn inc_ref(&mut self, child: &str) -> bool {
        let count = self.ref_counts.entry(child.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.refs.push(child.to_string());
            true
        } else {
            false
        }
    }

    /// Drop one embedding occurrence of a child. Returns whether the
    /// last occurrence from this parent is gone.
    pub fn dec_ref(&mut self, child: &str) -> bool {
        match self.ref_counts.get_mut(child) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.ref_counts.remove(child);
                self.refs.retain(|r| r != child);
                true
            }
            None => false,
        }
    }
}

/// An event held on a node until its newly referenced resources have
/// loaded.
pub(crate) struct PendingEvent {
    pub id: u64,
    pub ev: ResourceEvent,
    /// Children newly referenced by this event; their data is embedded
    /// into the delivered event.
    pub added: Vec<String>,
    /// Children unreferenced by this event; reclaimed after delivery.
    pub removed: Vec<String>,
    pub blocked: bool,
}

/// Tracks a load wave across the graph and fires its goal when every
/// attached node has left the Loading state.
pub(crate) struct LoadTracker {
    pub pending: usize,
    pub rids: HashSet<String>,
    pub goal: TrackerGoal,
}

pub(crate) enum TrackerGoal {
    /// Respond to a `subscribe` request rooted at `root`.
    Subscribe {
        id: Option<serde_json::Value>,
        root: String,
    },
    /// Respond to a `new` request with the created resource.
    New {
        id: Option<serde_json::Value>,
        root: String,
    },
    /// Unblock a held event on `rid`.
    FlushEvent { rid: String, event_id: u64 },
}

/// Cache-facing subscriber handle for one graph node. Callbacks cross
/// from cache workers onto the connection lane by posting tasks; they
/// never touch connection state directly.
pub(crate) struct ConnSubscriber {
    id: u64,
    cid: String,
    rid: String,
    query: String,
    tx: mpsc::UnboundedSender<ConnTask>,
}

impl ConnSubscriber {
    pub fn new(cid: String, rid: &str, tx: mpsc::UnboundedSender<ConnTask>) -> Self {
        Self {
            id: NEXT_SUB_ID.fetch_add(1, Ordering::Relaxed),
            cid,
            rid: rid.to_string(),
            query: crate::pattern::rid_query(rid).to_string(),
            tx,
        }
    }
}

impl Subscriber for ConnSubscriber {
    fn sub_id(&self) -> u64 {
        self.id
    }

    fn cid(&self) -> &str {
        &self.cid
    }

    fn resource_name(&self) -> &str {
        &self.rid
    }

    fn resource_query(&self) -> &str {
        &self.query
    }

    fn loaded(&self, result: Result<Arc<ResourceView>, ResError>) {
        let rid = self.rid.clone();
        let _ = self
            .tx
            .send(Box::new(move |conn| conn.handle_loaded(&rid, result)));
    }

    fn event(&self, event: &ResourceEvent) {
        let rid = self.rid.clone();
        let event = event.clone();
        let _ = self
            .tx
            .send(Box::new(move |conn| conn.handle_event(&rid, event)));
    }

    fn reaccess(&self) {
        let rid = self.rid.clone();
        let _ = self
            .tx
            .send(Box::new(move |conn| conn.handle_reaccess(&rid)));
    }
}

impl Conn {
    /// Add a reference to a resource, creating its node and starting
    /// its load on first use, then attach the tracker to the subgraph.
    pub(crate) fn reference_node(&mut self, rid: &str, direct: bool, tracker: Option<u64>) {
        if let Some(node) = self.subs.get_mut(rid) {
            if direct {
                node.direct += 1;
            } else {
                node.indirect += 1;
            }
        } else {
            let subscriber = Arc::new(ConnSubscriber::new(
                self.cid.clone(),
                rid,
                self.tx.clone(),
            ));
            let node = SubNode::new(subscriber.clone(), direct);
            self.subs.insert(rid.to_string(), node);
            self.cache.subscribe(subscriber);
            self.issue_access(rid);
        }

        if let Some(tid) = tracker {
            self.attach_tracker(tid, rid);
        }
    }

    fn issue_access(&mut self, rid: &str) {
        let Some(node) = self.subs.get_mut(rid) else {
            return;
        };
        if node.access.is_some() {
            node.access_pending = false;
            return;
        }
        node.access_pending = true;

        let tx = self.tx.clone();
        let rid_owned = rid.to_string();
        self.cache.access(rid, &self.cid, self.token.clone(), move |result| {
            let _ = tx.send(Box::new(move |conn: &mut Conn| {
                conn.handle_access(&rid_owned, result)
            }));
        });
    }

    /// Snapshot load outcome from the cache.
    pub(crate) fn handle_loaded(
        &mut self,
        rid: &str,
        result: Result<Arc<ResourceView>, ResError>,
    ) {
        let (refs, tracker_ids) = {
            let Some(node) = self.subs.get_mut(rid) else {
                return;
            };
            if node.state != NodeState::Loading || !node.snapshot_pending {
                return;
            }
            node.snapshot_pending = false;
            match result {
                Ok(view) => {
                    let refs = view.snapshot().collect_refs();
                    node.view = Some(view);
                    (refs, node.trackers.clone())
                }
                Err(err) => {
                    node.err.get_or_insert(err);
                    (Vec::new(), Vec::new())
                }
            }
        };

        // Per-occurrence reference accounting; each first occurrence
        // adds an indirect reference on (or creates) the child node.
        for child in refs {
            let first = self
                .subs
                .get_mut(rid)
                .map(|n| n.inc_ref(&child))
                .unwrap_or(false);
            if first {
                self.reference_node(&child, false, None);
            }
            for &tid in &tracker_ids {
                self.attach_tracker(tid, &child);
            }
        }

        self.maybe_finish_node(rid);
    }

    /// Access check outcome for a loading node.
    pub(crate) fn handle_access(
        &mut self,
        rid: &str,
        result: Result<AccessResult, ResError>,
    ) {
        {
            let Some(node) = self.subs.get_mut(rid) else {
                return;
            };
            if !node.access_pending {
                return;
            }
            node.access_pending = false;
            match result {
                Ok(access) => {
                    node.access = Some(access);
                }
                Err(err) => {
                    node.err.get_or_insert(err);
                }
            }
        }
        self.maybe_finish_node(rid);
    }

    /// Move a node out of Loading once both its snapshot and access
    /// have resolved, and notify its trackers.
    pub(crate) fn maybe_finish_node(&mut self, rid: &str) {
        let tracker_ids = {
            let Some(node) = self.subs.get_mut(rid) else {
                return;
            };
            if node.state != NodeState::Loading
                || node.snapshot_pending
                || node.access_pending
            {
                return;
            }

            let granted = node.access.as_ref().map(|a| a.get).unwrap_or(false);
            if node.err.is_some() {
                node.state = NodeState::Error;
            } else if !granted {
                node.err = Some(ResError::access_denied());
                node.state = NodeState::Error;
            } else {
                node.state = NodeState::Ready;
            }
            std::mem::take(&mut node.trackers)
        };

        self.release_trackers(&tracker_ids);
        self.flush_events(rid);
    }

    /// Decrement pending counts and complete any trackers that reach
    /// zero.
    pub(crate) fn release_trackers(&mut self, tracker_ids: &[u64]) {
        let mut completed = Vec::new();
        for tid in tracker_ids {
            if let Some(tracker) = self.trackers.get_mut(tid) {
                tracker.pending = tracker.pending.saturating_sub(1);
                if tracker.pending == 0 {
                    completed.push(*tid);
                }
            }
        }
        for tid in completed {
            self.complete_tracker(tid);
        }
    }

    /// Attach a tracker to a node and everything reachable from it.
    /// Terminates on cycles through the tracker's visited set.
    pub(crate) fn attach_tracker(&mut self, tid: u64, rid: &str) {
        let Some(tracker) = self.trackers.get_mut(&tid) else {
            return;
        };
        if !tracker.rids.insert(rid.to_string()) {
            return;
        }
        let Some(node) = self.subs.get_mut(rid) else {
            return;
        };
        if node.state == NodeState::Loading {
            tracker.pending += 1;
            node.trackers.push(tid);
        }
        let children = node.refs.clone();
        for child in children {
            self.attach_tracker(tid, &child);
        }
    }

    pub(crate) fn new_tracker(&mut self, goal: TrackerGoal) -> u64 {
        let tid = self.next_tracker;
        self.next_tracker += 1;
        self.trackers.insert(
            tid,
            LoadTracker {
                pending: 0,
                rids: HashSet::new(),
                goal,
            },
        );
        tid
    }

    pub(crate) fn try_complete_tracker(&mut self, tid: u64) {
        if let Some(tracker) = self.trackers.get(&tid) {
            if tracker.pending == 0 {
                self.complete_tracker(tid);
            }
        }
    }

    pub(crate) fn complete_tracker(&mut self, tid: u64) {
        let Some(tracker) = self.trackers.remove(&tid) else {
            return;
        };
        match tracker.goal {
            TrackerGoal::Subscribe { id, root } => {
                let root_err = match self.subs.get(&root) {
                    Some(node) if node.state == NodeState::Error => Some(
                        node.err
                            .clone()
                            .unwrap_or_else(ResError::access_denied),
                    ),
                    Some(_) => None,
                    None => Some(ResError::internal_error("Subscription lost")),
                };
                match root_err {
                    Some(err) => {
                        // A directly requested resource that cannot be
                        // read fails the whole request.
                        self.respond_err(&id, err);
                        self.unreference_direct(&root);
                    }
                    None => {
                        let composite = self.assemble(&root, false);
                        self.respond(&id, composite);
                    }
                }
            }
            TrackerGoal::New { id, root } => {
                let composite = self.assemble(&root, true);
                let rollback = !matches!(
                    self.subs.get(&root),
                    Some(node) if node.state == NodeState::Ready
                );
                self.respond(&id, composite);
                if rollback {
                    self.unreference_direct(&root);
                }
            }
            TrackerGoal::FlushEvent { rid, event_id } => {
                if let Some(node) = self.subs.get_mut(&rid) {
                    for pending in node.event_queue.iter_mut() {
                        if pending.id == event_id {
                            pending.blocked = false;
                        }
                    }
                }
                self.flush_events(&rid);
            }
        }
    }

    fn unreference_direct(&mut self, rid: &str) {
        if let Some(node) = self.subs.get_mut(rid) {
            node.direct = node.direct.saturating_sub(1);
        }
        self.try_delete(rid);
    }

    /// Build the composite response for everything reachable from a
    /// root node.
    pub(crate) fn assemble(&self, root: &str, with_rid: bool) -> serde_json::Value {
        let mut models = serde_json::Map::new();
        let mut collections = serde_json::Map::new();
        let mut errors = serde_json::Map::new();
        self.collect_resources(&[root.to_string()], &mut models, &mut collections, &mut errors);

        let mut out = serde_json::Map::new();
        if with_rid {
            out.insert(
                "rid".to_string(),
                serde_json::Value::String(root.to_string()),
            );
        }
        if !models.is_empty() {
            out.insert("models".to_string(), serde_json::Value::Object(models));
        }
        if !collections.is_empty() {
            out.insert(
                "collections".to_string(),
                serde_json::Value::Object(collections),
            );
        }
        if !errors.is_empty() {
            out.insert("errors".to_string(), serde_json::Value::Object(errors));
        }
        serde_json::Value::Object(out)
    }

    /// Walk the graph from the given roots, sorting each reachable
    /// node's data into the models/collections/errors maps.
    pub(crate) fn collect_resources(
        &self,
        roots: &[String],
        models: &mut serde_json::Map<String, serde_json::Value>,
        collections: &mut serde_json::Map<String, serde_json::Value>,
        errors: &mut serde_json::Map<String, serde_json::Value>,
    ) {
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = roots.to_vec();

        while let Some(rid) = stack.pop() {
            if !visited.insert(rid.clone()) {
                continue;
            }
            let Some(node) = self.subs.get(&rid) else {
                errors.insert(
                    rid,
                    ResError::internal_error("Resource not loaded").to_json(),
                );
                continue;
            };
            match node.state {
                NodeState::Ready => {
                    let Some(snapshot) = node.view.as_ref().map(|v| v.snapshot()) else {
                        errors.insert(
                            rid,
                            ResError::internal_error("Resource not loaded").to_json(),
                        );
                        continue;
                    };
                    match &snapshot {
                        crate::value::Resource::Model(_) => {
                            models.insert(rid.clone(), snapshot.to_json());
                        }
                        crate::value::Resource::Collection(_) => {
                            collections.insert(rid.clone(), snapshot.to_json());
                        }
                        crate::value::Resource::Error(err) => {
                            errors.insert(rid.clone(), err.to_json());
                        }
                    }
                    for child in &node.refs {
                        stack.push(child.clone());
                    }
                }
                NodeState::Error => {
                    let err = node
                        .err
                        .clone()
                        .unwrap_or_else(ResError::access_denied);
                    errors.insert(rid, err.to_json());
                }
                NodeState::Loading | NodeState::Disposed => {
                    debug!("{}: assembling unfinished node", rid);
                    errors.insert(
                        rid,
                        ResError::internal_error("Resource not loaded").to_json(),
                    );
                }
            }
        }
    }
}
