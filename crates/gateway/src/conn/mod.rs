//! Per-connection state and request dispatch.
//!
//! Each WebSocket connection owns a `Conn` driven by a single task
//! draining a channel of closures; this lane serializes every mutation
//! of the subscription graph and every frame written to the socket.
//! Cache workers never call into connection state directly, they post
//! onto the lane.

pub mod gc;
pub mod registry;
pub mod sub;

use crate::cache::Cache;
use crate::codec::AccessResult;
use crate::error::ResError;
use crate::pattern::is_valid_rid;
use crate::protocol::{self, ClientRequest, PROTOCOL_VERSION};
use bus_client::BusSubscription;
use metrics::counter;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sub::{LoadTracker, NodeState, PendingEvent, SubNode, TrackerGoal};

pub use registry::ConnRegistry;

/// Work posted onto a connection's lane.
pub type ConnTask = Box<dyn FnOnce(&mut Conn) + Send>;

/// Handle to a running connection.
#[derive(Clone)]
pub struct ConnHandle {
    cid: String,
    tx: mpsc::UnboundedSender<ConnTask>,
}

impl ConnHandle {
    /// Connection ID.
    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// Post a raw request frame received from the socket.
    pub fn post_frame(&self, text: String) {
        let _ = self.tx.send(Box::new(move |conn| conn.handle_frame(&text)));
    }

    /// Shut the connection down, disposing all its subscriptions.
    pub fn close(&self) {
        let _ = self.tx.send(Box::new(|conn| conn.closed = true));
    }
}

/// Per-connection state. Owned by the connection's lane task.
pub struct Conn {
    cid: String,
    cache: Arc<Cache>,
    token: Option<serde_json::Value>,
    subs: HashMap<String, SubNode>,
    trackers: HashMap<u64, LoadTracker>,
    next_tracker: u64,
    next_event: u64,
    tx: mpsc::UnboundedSender<ConnTask>,
    out: mpsc::UnboundedSender<String>,
    token_sub: Option<BusSubscription>,
    closed: bool,
}

impl Conn {
    /// Spawn a connection lane. Frames go in through the returned
    /// handle; serialized response and event frames come out on `out`.
    pub fn spawn(cache: Arc<Cache>, out: mpsc::UnboundedSender<String>) -> ConnHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<ConnTask>();
        let cid = Uuid::new_v4().simple().to_string();

        // Token events rotate the connection token.
        let token_tx = tx.clone();
        let token_sub = cache
            .bus()
            .subscribe(
                &format!("conn.{}.token", cid),
                Arc::new(move |_subject: &str, payload: &[u8]| {
                    let token = serde_json::from_slice::<serde_json::Value>(payload)
                        .ok()
                        .and_then(|v| v.get("token").cloned());
                    let _ = token_tx.send(Box::new(move |conn| conn.set_token(token)));
                }),
            )
            .ok();

        let mut conn = Conn {
            cid: cid.clone(),
            cache,
            token: None,
            subs: HashMap::new(),
            trackers: HashMap::new(),
            next_tracker: 1,
            next_event: 1,
            tx: tx.clone(),
            out,
            token_sub,
            closed: false,
        };

        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task(&mut conn);
                if conn.closed {
                    break;
                }
            }
            conn.dispose_all();
        });

        info!("Connection {} opened", cid);
        ConnHandle { cid, tx }
    }

    /// Connection ID.
    pub fn cid(&self) -> &str {
        &self.cid
    }

    // ------------------------------------------------------------------
    // Request dispatch
    // ------------------------------------------------------------------

    fn handle_frame(&mut self, text: &str) {
        let req: ClientRequest = match serde_json::from_str(text) {
            Ok(req) => req,
            Err(_) => {
                self.respond_err(&None, ResError::invalid_request("Invalid request"));
                return;
            }
        };
        counter!("gateway_requests_total").increment(1);
        self.handle_request(req.id, &req.method, req.params);
    }

    fn handle_request(
        &mut self,
        id: Option<serde_json::Value>,
        method: &str,
        params: Option<serde_json::Value>,
    ) {
        if method == "version" {
            self.handle_version(id, params);
            return;
        }

        let Some((action, rest)) = method.split_once('.') else {
            self.respond_err(&id, ResError::invalid_request("Invalid method"));
            return;
        };

        match action {
            "subscribe" => self.client_subscribe(id, rest),
            "unsubscribe" => self.client_unsubscribe(id, rest),
            "new" => self.client_new(id, rest, params),
            "call" | "auth" => match rest.rsplit_once('.') {
                Some((rid, method_name))
                    if is_valid_rid(rid) && is_valid_method(method_name) =>
                {
                    if action == "call" {
                        self.client_call(id, rid, method_name, params);
                    } else {
                        self.client_auth(id, rid, method_name, params);
                    }
                }
                _ => self.respond_err(&id, ResError::invalid_request("Invalid method")),
            },
            _ => self.respond_err(&id, ResError::invalid_request("Invalid method")),
        }
    }

    fn handle_version(
        &mut self,
        id: Option<serde_json::Value>,
        params: Option<serde_json::Value>,
    ) {
        if let Some(params) = &params {
            let protocol = params.get("protocol").and_then(|v| v.as_str());
            match protocol {
                Some(p) if protocol::is_valid_protocol(p) => {}
                _ => {
                    self.respond_err(
                        &id,
                        ResError::invalid_params("Invalid protocol version"),
                    );
                    return;
                }
            }
        }
        self.respond(&id, json!({ "protocol": PROTOCOL_VERSION }));
    }

    fn client_subscribe(&mut self, id: Option<serde_json::Value>, rid: &str) {
        if !is_valid_rid(rid) {
            self.respond_err(&id, ResError::invalid_request("Invalid resource ID"));
            return;
        }
        debug!("{}: subscribe {}", self.cid, rid);
        counter!("gateway_subscriptions_total").increment(1);

        let tid = self.new_tracker(TrackerGoal::Subscribe {
            id,
            root: rid.to_string(),
        });
        self.reference_node(rid, true, Some(tid));
        self.try_complete_tracker(tid);
    }

    fn client_unsubscribe(&mut self, id: Option<serde_json::Value>, rid: &str) {
        debug!("{}: unsubscribe {}", self.cid, rid);
        match self.subs.get_mut(rid) {
            Some(node) if node.direct > 0 => {
                node.direct -= 1;
                self.try_delete(rid);
                self.respond(&id, serde_json::Value::Null);
            }
            _ => self.respond_err(&id, ResError::no_subscription()),
        }
    }

    fn client_call(
        &mut self,
        id: Option<serde_json::Value>,
        rid: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) {
        // Access cached on the graph node is reused; otherwise a
        // one-shot access check is issued without creating a node.
        match self.subs.get(rid).and_then(|n| n.access.clone()) {
            Some(access) => self.dispatch_call(id, rid, method, params, &access),
            None => {
                let tx = self.tx.clone();
                let rid_owned = rid.to_string();
                let method_owned = method.to_string();
                self.cache
                    .access(rid, &self.cid, self.token.clone(), move |result| {
                        let _ = tx.send(Box::new(move |conn: &mut Conn| match result {
                            Ok(access) => conn.dispatch_call(
                                id,
                                &rid_owned,
                                &method_owned,
                                params,
                                &access,
                            ),
                            Err(err) => conn.respond_err(&id, err),
                        }));
                    });
            }
        }
    }

    fn dispatch_call(
        &mut self,
        id: Option<serde_json::Value>,
        rid: &str,
        method: &str,
        params: Option<serde_json::Value>,
        access: &AccessResult,
    ) {
        if !access.can_call(method) {
            self.respond_err(&id, ResError::access_denied());
            return;
        }
        let tx = self.tx.clone();
        self.cache.call(
            rid,
            method,
            &self.cid,
            self.token.clone(),
            params,
            move |result| {
                let _ = tx.send(Box::new(move |conn: &mut Conn| match result {
                    Ok(value) => conn.respond(&id, value),
                    Err(err) => conn.respond_err(&id, err),
                }));
            },
        );
    }

    fn client_new(
        &mut self,
        id: Option<serde_json::Value>,
        rid: &str,
        params: Option<serde_json::Value>,
    ) {
        if !is_valid_rid(rid) {
            self.respond_err(&id, ResError::invalid_request("Invalid resource ID"));
            return;
        }

        match self.subs.get(rid).and_then(|n| n.access.clone()) {
            Some(access) => self.dispatch_new(id, rid, params, &access),
            None => {
                let tx = self.tx.clone();
                let rid_owned = rid.to_string();
                self.cache
                    .access(rid, &self.cid, self.token.clone(), move |result| {
                        let _ = tx.send(Box::new(move |conn: &mut Conn| match result {
                            Ok(access) => conn.dispatch_new(id, &rid_owned, params, &access),
                            Err(err) => conn.respond_err(&id, err),
                        }));
                    });
            }
        }
    }

    fn dispatch_new(
        &mut self,
        id: Option<serde_json::Value>,
        rid: &str,
        params: Option<serde_json::Value>,
        access: &AccessResult,
    ) {
        if !access.can_call("new") {
            self.respond_err(&id, ResError::access_denied());
            return;
        }
        let tx = self.tx.clone();
        self.cache.call_new(
            rid,
            &self.cid,
            self.token.clone(),
            params,
            move |result| {
                let _ = tx.send(Box::new(move |conn: &mut Conn| match result {
                    Ok(new_rid) => {
                        // Subscribe the client to the created resource
                        // and respond with its composite once loaded.
                        let tid = conn.new_tracker(TrackerGoal::New {
                            id,
                            root: new_rid.clone(),
                        });
                        conn.reference_node(&new_rid, true, Some(tid));
                        conn.try_complete_tracker(tid);
                    }
                    Err(err) => conn.respond_err(&id, err),
                }));
            },
        );
    }

    fn client_auth(
        &mut self,
        id: Option<serde_json::Value>,
        rid: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) {
        let tx = self.tx.clone();
        self.cache.auth(
            rid,
            method,
            &self.cid,
            self.token.clone(),
            params,
            move |result| {
                let _ = tx.send(Box::new(move |conn: &mut Conn| match result {
                    Ok(value) => conn.respond(&id, value),
                    Err(err) => conn.respond_err(&id, err),
                }));
            },
        );
    }

    // ------------------------------------------------------------------
    // Event fan-out
    // ------------------------------------------------------------------

    /// A mutation event crossed over from the cache worker. Events
    /// introducing new resource references hold until those resources
    /// are transitively loaded, so the client never sees an event
    /// referencing an unknown resource.
    pub(crate) fn handle_event(&mut self, rid: &str, ev: crate::cache::ResourceEvent) {
        if !self.subs.contains_key(rid) {
            return;
        }

        // Per-occurrence reference deltas carried by the event.
        let mut incs: Vec<String> = Vec::new();
        let mut decs: Vec<String> = Vec::new();
        match ev.kind.as_str() {
            "change" => {
                for value in ev.changed.values() {
                    if let Some(r) = value.ref_rid() {
                        incs.push(r.to_string());
                    }
                }
                for value in ev.old_values.values() {
                    if let Some(r) = value.ref_rid() {
                        decs.push(r.to_string());
                    }
                }
            }
            "add" => {
                if let Some(r) = ev.value.as_ref().and_then(|v| v.ref_rid()) {
                    incs.push(r.to_string());
                }
            }
            "remove" => {
                if let Some(r) = ev.value.as_ref().and_then(|v| v.ref_rid()) {
                    decs.push(r.to_string());
                }
            }
            _ => {}
        }

        let mut added: Vec<String> = Vec::new();
        for child in incs {
            let first = self
                .subs
                .get_mut(rid)
                .map(|n| n.inc_ref(&child))
                .unwrap_or(false);
            if first {
                self.reference_node(&child, false, None);
                added.push(child);
            }
        }

        let mut removed: Vec<String> = Vec::new();
        for child in decs {
            let gone = self
                .subs
                .get_mut(rid)
                .map(|n| n.dec_ref(&child))
                .unwrap_or(false);
            if gone {
                if let Some(node) = self.subs.get_mut(&child) {
                    node.indirect = node.indirect.saturating_sub(1);
                }
                removed.push(child);
            }
        }

        let blocked = added
            .iter()
            .any(|r| matches!(self.subs.get(r), Some(n) if n.state == NodeState::Loading));

        let event_id = self.next_event;
        self.next_event += 1;

        if let Some(node) = self.subs.get_mut(rid) {
            node.event_queue.push_back(PendingEvent {
                id: event_id,
                ev,
                added: added.clone(),
                removed,
                blocked,
            });
        }

        if blocked {
            let tid = self.new_tracker(TrackerGoal::FlushEvent {
                rid: rid.to_string(),
                event_id,
            });
            for child in &added {
                self.attach_tracker(tid, child);
            }
            self.try_complete_tracker(tid);
        } else {
            self.flush_events(rid);
        }
    }

    /// Deliver queued events in order. Stops at the first held event,
    /// and entirely while the node itself has not finished loading.
    pub(crate) fn flush_events(&mut self, rid: &str) {
        loop {
            let pending = {
                let Some(node) = self.subs.get_mut(rid) else {
                    return;
                };
                if node.state != NodeState::Ready {
                    return;
                }
                if !matches!(node.event_queue.front(), Some(front) if !front.blocked) {
                    return;
                }
                let Some(pending) = node.event_queue.pop_front() else {
                    return;
                };
                pending
            };

            let data = self.event_data(&pending);
            self.send_event(rid, &pending.ev.kind, data);
            for child in &pending.removed {
                self.try_delete(child);
            }
        }
    }

    /// Build the event payload delivered to the client, embedding the
    /// data of resources the event newly references.
    fn event_data(&self, pending: &PendingEvent) -> serde_json::Value {
        let ev = &pending.ev;
        let mut data = match ev.kind.as_str() {
            "change" => {
                let map: serde_json::Map<String, serde_json::Value> = ev
                    .changed
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                serde_json::Value::Object(map)
            }
            "add" => {
                let value = ev
                    .value
                    .as_ref()
                    .map(|v| v.to_json())
                    .unwrap_or(serde_json::Value::Null);
                json!({ "idx": ev.idx, "value": value })
            }
            "remove" => json!({ "idx": ev.idx }),
            _ => return ev.payload.clone(),
        };

        if !pending.added.is_empty() {
            let mut models = serde_json::Map::new();
            let mut collections = serde_json::Map::new();
            let mut errors = serde_json::Map::new();
            self.collect_resources(&pending.added, &mut models, &mut collections, &mut errors);

            if let Some(obj) = data.as_object_mut() {
                if !models.is_empty() {
                    obj.insert("models".to_string(), serde_json::Value::Object(models));
                }
                if !collections.is_empty() {
                    obj.insert(
                        "collections".to_string(),
                        serde_json::Value::Object(collections),
                    );
                }
                if !errors.is_empty() {
                    obj.insert("errors".to_string(), serde_json::Value::Object(errors));
                }
            }
        }

        data
    }

    // ------------------------------------------------------------------
    // Access re-evaluation
    // ------------------------------------------------------------------

    /// The cache signalled that access to a resource must be
    /// re-evaluated. Cached results are invalidated; directly
    /// subscribed resources are re-checked at once.
    pub(crate) fn handle_reaccess(&mut self, rid: &str) {
        let direct = {
            let Some(node) = self.subs.get_mut(rid) else {
                return;
            };
            node.access = None;
            node.direct > 0
        };
        if direct {
            self.recheck_access(rid);
        }
    }

    fn recheck_access(&mut self, rid: &str) {
        let tx = self.tx.clone();
        let rid_owned = rid.to_string();
        self.cache
            .access(rid, &self.cid, self.token.clone(), move |result| {
                let _ = tx.send(Box::new(move |conn: &mut Conn| {
                    conn.handle_access_recheck(&rid_owned, result)
                }));
            });
    }

    fn handle_access_recheck(
        &mut self,
        rid: &str,
        result: Result<AccessResult, ResError>,
    ) {
        if !self.subs.contains_key(rid) {
            return;
        }
        match result {
            Ok(access) if access.get => {
                if let Some(node) = self.subs.get_mut(rid) {
                    node.access = Some(access);
                }
            }
            Ok(_) => self.revoke(rid, ResError::access_denied()),
            Err(err) => self.revoke(rid, err),
        }
    }

    /// Read access was revoked: notify the client and drop the
    /// subscription.
    fn revoke(&mut self, rid: &str, err: ResError) {
        warn!("{}: access revoked for {}", self.cid, rid);
        self.send_event(rid, "unsubscribe", json!({ "reason": err.to_json() }));
        if let Some(node) = self.subs.get_mut(rid) {
            node.direct = 0;
        }
        self.try_delete(rid);
    }

    /// Token rotation via a `conn.<cid>.token` event. Invalidates every
    /// cached access result and re-checks direct subscriptions.
    pub(crate) fn set_token(&mut self, token: Option<serde_json::Value>) {
        debug!("{}: token rotated", self.cid);
        self.token = token;
        let mut direct_rids: Vec<String> = Vec::new();
        for (rid, node) in self.subs.iter_mut() {
            node.access = None;
            if node.direct > 0 {
                direct_rids.push(rid.clone());
            }
        }
        for rid in direct_rids {
            self.recheck_access(&rid);
        }
    }

    // ------------------------------------------------------------------
    // Output and teardown
    // ------------------------------------------------------------------

    pub(crate) fn respond(&mut self, id: &Option<serde_json::Value>, result: serde_json::Value) {
        let _ = self.out.send(protocol::result_frame(id, &result));
    }

    pub(crate) fn respond_err(&mut self, id: &Option<serde_json::Value>, err: ResError) {
        let _ = self.out.send(protocol::error_frame(id, &err));
    }

    pub(crate) fn send_event(&mut self, rid: &str, kind: &str, data: serde_json::Value) {
        counter!("gateway_events_sent_total").increment(1);
        let _ = self.out.send(protocol::event_frame(rid, kind, &data));
    }

    /// Dispose every subscription node, releasing one cache count per
    /// node. Runs when the connection lane shuts down.
    fn dispose_all(&mut self) {
        let rids: Vec<String> = self.subs.keys().cloned().collect();
        for rid in rids {
            if let Some(node) = self.subs.remove(&rid) {
                self.cache.unsubscribe(&rid, node.subscriber_id());
            }
        }
        self.trackers.clear();
        if let Some(sub) = self.token_sub.take() {
            sub.unsubscribe();
        }
        info!("Connection {} closed", self.cid);
    }
}

fn is_valid_method(method: &str) -> bool {
    !method.is_empty()
        && !method.contains('*')
        && !method.contains('>')
        && !method.contains('?')
}
