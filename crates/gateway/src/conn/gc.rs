//! Subscription graph garbage collection.
//!
//! `try_delete` reclaims a node once its direct count reaches zero,
//! unless it is still referenced from outside the candidate deletion
//! region. Two passes over the graph: the first subtracts the
//! references that originate inside the region, the second marks nodes
//! Keep or Delete, with Keep propagating downward so cycles anchored
//! outside the region survive while cycles entirely inside it collapse.

use crate::conn::sub::SubNode;
use crate::conn::Conn;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GcState {
    None,
    Root,
    Delete,
    Keep,
}

struct GcRef {
    indirect: i64,
    state: GcState,
}

impl Conn {
    /// Reclaim the node and everything only reachable through it, if
    /// no external reference keeps it alive.
    pub(crate) fn try_delete(&mut self, rid: &str) {
        let root_indirect = match self.subs.get(rid) {
            Some(node) if node.direct == 0 => node.indirect as i64,
            _ => return,
        };

        let mut refs: HashMap<String, GcRef> = HashMap::new();
        refs.insert(
            rid.to_string(),
            GcRef {
                indirect: root_indirect,
                state: GcState::None,
            },
        );

        // Subtract the references originating inside the candidate
        // region.
        countdown(&self.subs, &mut refs, rid, GcState::Root);

        let residual = refs.get(rid).map(|r| r.indirect).unwrap_or(0);
        if residual > 0 {
            debug!("{}: kept, external references remain ({})", rid, residual);
            return;
        }

        // Mark survivors and casualties.
        mark(&self.subs, &mut refs, rid, GcState::Delete);

        let delete: Vec<String> = refs
            .iter()
            .filter(|(_, r)| r.state == GcState::Delete)
            .map(|(rid, _)| rid.clone())
            .collect();
        for rid in &delete {
            self.dispose_node(rid);
        }

        #[cfg(debug_assertions)]
        self.assert_direct_anchor();
    }

    /// Remove a node from the graph and release its cache count. The
    /// node's outgoing edges no longer exist, so each surviving child
    /// loses one indirect reference. Any tracker still waiting on the
    /// node is released.
    pub(crate) fn dispose_node(&mut self, rid: &str) {
        let Some(node) = self.subs.remove(rid) else {
            return;
        };
        debug!("{}: disposed", rid);
        self.cache.unsubscribe(rid, node.subscriber_id());
        for child in &node.refs {
            if let Some(child_node) = self.subs.get_mut(child) {
                child_node.indirect = child_node.indirect.saturating_sub(1);
            }
        }
        self.release_trackers(&node.trackers);
    }

    /// Every node surviving a sweep must be reachable from a direct
    /// subscription.
    #[cfg(debug_assertions)]
    fn assert_direct_anchor(&self) {
        if self.subs.is_empty() {
            return;
        }
        debug_assert!(
            self.subs.values().any(|n| n.direct > 0),
            "no direct subscriptions remain after sweep"
        );
    }
}

/// First pass. Walks the region reachable from the root (stopping at
/// directly subscribed nodes), adding each visited node to the scratch
/// map with one reference subtracted per visiting edge.
fn countdown(
    subs: &HashMap<String, SubNode>,
    refs: &mut HashMap<String, GcRef>,
    rid: &str,
    state: GcState,
) {
    let Some(node) = subs.get(rid) else { return };
    if node.direct > 0 {
        return;
    }

    if state != GcState::Root {
        if let Some(r) = refs.get_mut(rid) {
            r.indirect -= 1;
            return;
        }
        refs.insert(
            rid.to_string(),
            GcRef {
                indirect: node.indirect as i64 - 1,
                state: GcState::None,
            },
        );
    }

    for child in &node.refs {
        countdown(subs, refs, child, GcState::None);
    }
}

/// Second pass. A node with residual external references, or reached
/// through a kept node, is marked Keep; Keep propagates downward.
/// Everything else in the region is marked Delete. A Delete mark is
/// overturned when a later Keep path reaches the node.
fn mark(
    subs: &HashMap<String, SubNode>,
    refs: &mut HashMap<String, GcRef>,
    rid: &str,
    state: GcState,
) {
    let Some(node) = subs.get(rid) else { return };
    if node.direct > 0 {
        return;
    }

    let next = {
        let Some(r) = refs.get_mut(rid) else { return };
        if r.state == GcState::Keep {
            return;
        }
        if r.indirect > 0 || state == GcState::Keep {
            r.state = GcState::Keep;
            GcState::Keep
        } else if r.state == GcState::Delete {
            return;
        } else {
            r.state = GcState::Delete;
            GcState::Delete
        }
    };

    for child in &node.refs {
        mark(subs, refs, child, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, CacheConfig};
    use crate::conn::sub::{ConnSubscriber, NodeState};
    use bus_client::{Bus, BusSubscription, EventHandler, ResponseHandler};
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Bus that accepts everything and answers nothing.
    struct NullBus;

    impl Bus for NullBus {
        fn subscribe(
            &self,
            _subject: &str,
            _handler: EventHandler,
        ) -> bus_client::Result<BusSubscription> {
            Ok(BusSubscription::new(|| {}))
        }

        fn request(
            &self,
            _subject: &str,
            _payload: Bytes,
            _timeout: Duration,
            _handler: ResponseHandler,
        ) {
        }
    }

    fn test_conn() -> Conn {
        let cache = Cache::new(Arc::new(NullBus), CacheConfig::default());
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (tx, _rx) = mpsc::unbounded_channel();
        Conn {
            cid: "test".to_string(),
            cache,
            token: None,
            subs: HashMap::new(),
            trackers: HashMap::new(),
            next_tracker: 1,
            next_event: 1,
            tx,
            out: out_tx,
            token_sub: None,
            closed: false,
        }
    }

    fn add_node(conn: &mut Conn, rid: &str, direct: u32, indirect: u32, refs: &[&str]) {
        let subscriber = Arc::new(ConnSubscriber::new(
            conn.cid.clone(),
            rid,
            conn.tx.clone(),
        ));
        let mut node = SubNode::new(subscriber, false);
        node.direct = direct;
        node.indirect = indirect;
        node.state = NodeState::Ready;
        node.snapshot_pending = false;
        node.access_pending = false;
        for child in refs {
            node.inc_ref(child);
        }
        conn.subs.insert(rid.to_string(), node);
    }

    fn rids(conn: &Conn) -> HashSet<String> {
        conn.subs.keys().cloned().collect()
    }

    #[tokio::test]
    async fn test_chain_collapses() {
        let mut conn = test_conn();
        add_node(&mut conn, "a", 0, 0, &["b"]);
        add_node(&mut conn, "b", 0, 1, &["c"]);
        add_node(&mut conn, "c", 0, 1, &[]);

        conn.try_delete("a");
        assert!(conn.subs.is_empty());
    }

    #[tokio::test]
    async fn test_direct_root_kept() {
        let mut conn = test_conn();
        add_node(&mut conn, "a", 1, 0, &["b"]);
        add_node(&mut conn, "b", 0, 1, &[]);

        conn.try_delete("a");
        assert_eq!(rids(&conn), HashSet::from(["a".to_string(), "b".to_string()]));
    }

    #[tokio::test]
    async fn test_internal_cycle_collapses() {
        // A -> B -> C -> B; unsubscribing A leaves the cycle reachable
        // from nothing.
        let mut conn = test_conn();
        add_node(&mut conn, "a", 0, 0, &["b"]);
        add_node(&mut conn, "b", 0, 2, &["c"]);
        add_node(&mut conn, "c", 0, 1, &["b"]);

        conn.try_delete("a");
        assert!(conn.subs.is_empty());
    }

    #[tokio::test]
    async fn test_external_anchor_keeps_cycle() {
        // A -> B -> C -> B plus D (direct) -> C. C has an external
        // anchor, which keeps B through Keep propagation; A alone is
        // reclaimed.
        let mut conn = test_conn();
        add_node(&mut conn, "a", 0, 0, &["b"]);
        add_node(&mut conn, "b", 0, 2, &["c"]);
        add_node(&mut conn, "c", 0, 2, &["b"]);
        add_node(&mut conn, "d", 1, 0, &["c"]);

        conn.try_delete("a");
        assert_eq!(
            rids(&conn),
            HashSet::from(["b".to_string(), "c".to_string(), "d".to_string()])
        );
    }

    #[tokio::test]
    async fn test_externally_referenced_root_aborts() {
        // B (direct) -> A: A still has an external reference, so the
        // sweep aborts without touching the graph.
        let mut conn = test_conn();
        add_node(&mut conn, "a", 0, 1, &[]);
        add_node(&mut conn, "b", 1, 0, &["a"]);

        conn.try_delete("a");
        assert_eq!(rids(&conn), HashSet::from(["a".to_string(), "b".to_string()]));
    }

    #[tokio::test]
    async fn test_self_cycle_collapses() {
        let mut conn = test_conn();
        add_node(&mut conn, "a", 0, 1, &["a"]);

        conn.try_delete("a");
        assert!(conn.subs.is_empty());
    }

    #[tokio::test]
    async fn test_disposal_releases_child_references() {
        // P -> C and D (direct) -> C. Disposing P must drop its edge
        // from C's indirect count, so a later sweep can still reclaim
        // C once D lets go.
        let mut conn = test_conn();
        add_node(&mut conn, "p", 0, 0, &["c"]);
        add_node(&mut conn, "c", 0, 2, &[]);
        add_node(&mut conn, "d", 1, 0, &["c"]);

        conn.try_delete("p");
        assert_eq!(
            rids(&conn),
            HashSet::from(["c".to_string(), "d".to_string()])
        );
        assert_eq!(conn.subs.get("c").unwrap().indirect, 1);

        let d = conn.subs.get_mut("d").unwrap();
        d.direct = 0;
        conn.try_delete("d");
        assert!(conn.subs.is_empty());
    }

    #[tokio::test]
    async fn test_diamond_partial_keep() {
        // root -> x -> y and z (direct) -> y: y survives, x goes.
        let mut conn = test_conn();
        add_node(&mut conn, "root", 0, 0, &["x"]);
        add_node(&mut conn, "x", 0, 1, &["y"]);
        add_node(&mut conn, "y", 0, 2, &[]);
        add_node(&mut conn, "z", 1, 0, &["y"]);

        conn.try_delete("root");
        assert_eq!(rids(&conn), HashSet::from(["y".to_string(), "z".to_string()]));
    }
}
