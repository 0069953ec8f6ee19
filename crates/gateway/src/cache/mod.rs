//! Process-wide resource cache.
//!
//! Maintains one event subscription per distinct resource ID, shared by
//! every connection. A pool of workers drains a bounded channel of
//! subscriptions with pending tasks; a subscription is published to the
//! channel at most once, so all tasks for one resource run serially
//! while different resources run in parallel. Idle subscriptions
//! (count zero) are evicted after a delay.
//!
//! The registry mutex guards the subscription map, reference counts,
//! eviction scheduling, and backend subscription attachment. It is
//! never held across a bus call or a callback invocation.

pub mod event_sub;
pub mod timer_queue;
pub mod view;

use crate::codec::{self, AccessResult};
use crate::error::{GatewayError, ResError, Result};
use crate::pattern::{rid_name, Pattern};
use bus_client::{Bus, BusSubscription, EventHandler};
use bytes::Bytes;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub use event_sub::{CacheState, EventSubscription};
pub use view::{ResourceEvent, ResourceView};

use event_sub::SubTask;

/// Capacity of the worker input channel.
const WORKER_INPUT_CAPACITY: usize = 100;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of worker tasks draining subscription queues.
    pub workers: usize,
    /// Delay before an idle subscription is evicted.
    pub unsubscribe_delay: Duration,
    /// Timeout for access and get requests.
    pub request_timeout: Duration,
    /// Timeout for call and auth requests.
    pub call_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            unsubscribe_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(3),
            call_timeout: Duration::from_secs(3),
        }
    }
}

/// Subscriber interface implemented by per-connection graph nodes.
///
/// Callbacks are invoked from cache workers and must not block; they
/// hand work to the subscriber's own connection lane.
pub trait Subscriber: Send + Sync {
    /// Unique subscriber identity.
    fn sub_id(&self) -> u64;
    /// Owning connection ID.
    fn cid(&self) -> &str;
    /// Subscribed resource ID, including any query part.
    fn resource_name(&self) -> &str;
    /// Query part of the resource ID, or empty.
    fn resource_query(&self) -> &str;
    /// Initial load outcome. Errors release the subscriber's count.
    fn loaded(&self, result: std::result::Result<Arc<ResourceView>, ResError>);
    /// A mutation event, delivered after `loaded`.
    fn event(&self, event: &ResourceEvent);
    /// Access must be re-evaluated for this resource.
    fn reaccess(&self);
}

/// Process-wide resource cache.
pub struct Cache {
    bus: Arc<dyn Bus>,
    cfg: CacheConfig,
    registry: Mutex<HashMap<String, Arc<EventSubscription>>>,
    worker_tx: Mutex<Option<mpsc::Sender<Arc<EventSubscription>>>>,
    evictions: timer_queue::TimerQueue<Arc<EventSubscription>>,
    system_sub: Mutex<Option<BusSubscription>>,
}

impl Cache {
    /// Create the cache and spawn its worker pool. Must be called
    /// within a tokio runtime.
    pub fn new(bus: Arc<dyn Bus>, cfg: CacheConfig) -> Arc<Self> {
        let (worker_tx, worker_rx) = mpsc::channel(WORKER_INPUT_CAPACITY);

        let cache = Arc::new_cyclic(|weak: &Weak<Cache>| {
            let weak = weak.clone();
            let evictions =
                timer_queue::TimerQueue::new(cfg.unsubscribe_delay, move |sub| {
                    if let Some(cache) = weak.upgrade() {
                        cache.evict(sub);
                    }
                });
            Cache {
                bus,
                cfg,
                registry: Mutex::new(HashMap::new()),
                worker_tx: Mutex::new(Some(worker_tx)),
                evictions,
                system_sub: Mutex::new(None),
            }
        });

        let worker_rx = Arc::new(tokio::sync::Mutex::new(worker_rx));
        for _ in 0..cache.cfg.workers.max(1) {
            let rx = worker_rx.clone();
            tokio::spawn(async move {
                loop {
                    let sub = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match sub {
                        Some(sub) => sub.process_queue(),
                        None => break,
                    }
                }
            });
        }

        cache
    }

    /// Subscribe to global system events. The bus must be connected.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let handler: EventHandler = Arc::new(move |subject: &str, payload: &[u8]| {
            let Some(cache) = weak.upgrade() else { return };
            match subject.strip_prefix("system.") {
                Some("reset") => cache.handle_system_reset(payload),
                _ => debug!("Ignoring system event '{}'", subject),
            }
        });
        let sub = self.bus.subscribe("system.*", handler)?;
        *self.system_sub.lock().unwrap() = Some(sub);
        info!("Cache started ({} workers)", self.cfg.workers.max(1));
        Ok(())
    }

    /// Close the worker input and clear the eviction timer. Pending
    /// tasks enqueued afterwards run inline on their callers.
    pub fn stop(&self) {
        self.worker_tx.lock().unwrap().take();
        self.evictions.clear();
        if let Some(sub) = self.system_sub.lock().unwrap().take() {
            sub.unsubscribe();
        }
        info!("Cache stopped");
    }

    pub(crate) fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    pub(crate) fn worker_input(&self) -> Option<mpsc::Sender<Arc<EventSubscription>>> {
        self.worker_tx.lock().unwrap().clone()
    }

    /// Number of resident event subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Look up a resident event subscription.
    pub fn get(&self, rid: &str) -> Option<Arc<EventSubscription>> {
        self.registry.lock().unwrap().get(rid).cloned()
    }

    /// Subscribe a graph node to its resource, creating the event
    /// subscription and the backend subscription on first use.
    pub fn subscribe(self: &Arc<Self>, sub: Arc<dyn Subscriber>) {
        match self.get_subscription(sub.resource_name(), true) {
            Ok(event_sub) => event_sub.add_subscriber(sub),
            Err(err) => sub.loaded(Err(err.into())),
        }
    }

    /// Detach a subscriber from its resource, releasing its count.
    pub fn unsubscribe(&self, rid: &str, sub_id: u64) {
        let event_sub = self.registry.lock().unwrap().get(rid).cloned();
        if let Some(event_sub) = event_sub {
            event_sub.enqueue(SubTask::RemoveSubscriber(sub_id));
        }
    }

    /// One-shot access check for a resource. The callback runs inside
    /// the resource's queue, so it observes a snapshot consistent with
    /// event application.
    pub fn access(
        self: &Arc<Self>,
        rid: &str,
        cid: &str,
        token: Option<serde_json::Value>,
        cb: impl FnOnce(std::result::Result<AccessResult, ResError>) + Send + 'static,
    ) {
        let payload = codec::request_payload(cid, token.as_ref(), crate::pattern::rid_query(rid), None);
        let subject = format!("access.{}", rid_name(rid));
        self.send_request(rid, subject, payload, self.cfg.request_timeout, move |result| {
            cb(result.and_then(codec::decode_access))
        });
    }

    /// Method call on a resource.
    pub fn call(
        self: &Arc<Self>,
        rid: &str,
        method: &str,
        cid: &str,
        token: Option<serde_json::Value>,
        params: Option<serde_json::Value>,
        cb: impl FnOnce(std::result::Result<serde_json::Value, ResError>) + Send + 'static,
    ) {
        let payload =
            codec::request_payload(cid, token.as_ref(), crate::pattern::rid_query(rid), params.as_ref());
        let subject = format!("call.{}.{}", rid_name(rid), method);
        self.send_request(rid, subject, payload, self.cfg.call_timeout, cb);
    }

    /// `new` call on a collection resource, decoding the created
    /// resource ID from the response.
    pub fn call_new(
        self: &Arc<Self>,
        rid: &str,
        cid: &str,
        token: Option<serde_json::Value>,
        params: Option<serde_json::Value>,
        cb: impl FnOnce(std::result::Result<String, ResError>) + Send + 'static,
    ) {
        let payload =
            codec::request_payload(cid, token.as_ref(), crate::pattern::rid_query(rid), params.as_ref());
        let subject = format!("call.{}.new", rid_name(rid));
        self.send_request(rid, subject, payload, self.cfg.call_timeout, move |result| {
            cb(result.and_then(codec::decode_new))
        });
    }

    /// Auth method call on a resource.
    pub fn auth(
        self: &Arc<Self>,
        rid: &str,
        method: &str,
        cid: &str,
        token: Option<serde_json::Value>,
        params: Option<serde_json::Value>,
        cb: impl FnOnce(std::result::Result<serde_json::Value, ResError>) + Send + 'static,
    ) {
        let payload =
            codec::request_payload(cid, token.as_ref(), crate::pattern::rid_query(rid), params.as_ref());
        let subject = format!("auth.{}.{}", rid_name(rid), method);
        self.send_request(rid, subject, payload, self.cfg.request_timeout, cb);
    }

    /// Issue a one-shot bus request. The event subscription record is
    /// kept alive for the duration via its count, without provoking a
    /// backend subscribe; the callback is enqueued on the resource's
    /// queue and decodes the response envelope.
    fn send_request(
        self: &Arc<Self>,
        rid: &str,
        subject: String,
        payload: Bytes,
        timeout: Duration,
        cb: impl FnOnce(std::result::Result<serde_json::Value, ResError>) + Send + 'static,
    ) {
        let event_sub = match self.get_subscription(rid, false) {
            Ok(sub) => sub,
            Err(err) => {
                cb(Err(ResError::from(err)));
                return;
            }
        };

        let weak = Arc::downgrade(self);
        let enqueue_target = event_sub.clone();
        self.bus.request(
            &subject,
            payload,
            timeout,
            Box::new(move |result| {
                let inner_sub = enqueue_target.clone();
                enqueue_target.enqueue(SubTask::Callback(Box::new(move || {
                    cb(result
                        .map_err(ResError::from)
                        .and_then(|data| codec::decode_response(&data)));
                    if let Some(cache) = weak.upgrade() {
                        cache.remove_count(&inner_sub, 1);
                    }
                })));
            }),
        );
    }

    /// Find or create the event subscription for a resource, adding a
    /// count. With `subscribe` set, a backend subscription is attached
    /// if none exists yet; one-shot requests pass `false` and keep the
    /// record alive without subscribing.
    fn get_subscription(
        self: &Arc<Self>,
        rid: &str,
        subscribe: bool,
    ) -> std::result::Result<Arc<EventSubscription>, GatewayError> {
        let mut registry = self.registry.lock().unwrap();

        let (event_sub, created) = match registry.get(rid) {
            Some(sub) => {
                if sub.add_count() == 0 {
                    // Revived before the idle eviction fired.
                    self.evictions.cancel(rid);
                }
                (sub.clone(), false)
            }
            None => {
                let sub = EventSubscription::new(rid, Arc::downgrade(self));
                registry.insert(rid.to_string(), sub.clone());
                gauge!("cache_event_subscriptions").set(registry.len() as f64);
                (sub, true)
            }
        };

        if subscribe && !event_sub.has_backend_sub() {
            let target = event_sub.clone();
            let handler: EventHandler = Arc::new(move |subject: &str, payload: &[u8]| {
                target.enqueue_event(subject, payload)
            });
            let subject = format!("event.{}.>", event_sub.subject_name());
            match self.bus.subscribe(&subject, handler) {
                Ok(backend_sub) => event_sub.set_backend_sub(backend_sub),
                Err(err) => {
                    if event_sub.dec_count(1) == 0 && created {
                        registry.remove(rid);
                        gauge!("cache_event_subscriptions").set(registry.len() as f64);
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(event_sub)
    }

    /// Release counts on an event subscription; on zero the record is
    /// scheduled for idle eviction.
    pub(crate) fn remove_count(&self, event_sub: &Arc<EventSubscription>, n: u64) {
        let registry = self.registry.lock().unwrap();
        if event_sub.dec_count(n) == 0 {
            self.evictions
                .schedule(event_sub.name().to_string(), event_sub.clone());
        }
        drop(registry);
    }

    /// Idle eviction timer fired; re-verify the count under the lock
    /// before unsubscribing and dropping the record.
    fn evict(&self, event_sub: Arc<EventSubscription>) {
        let backend_sub = {
            let mut registry = self.registry.lock().unwrap();
            if event_sub.count() != 0 {
                return;
            }
            let sub = event_sub.take_backend_sub();
            registry.remove(event_sub.name());
            gauge!("cache_event_subscriptions").set(registry.len() as f64);
            sub
        };

        debug!("{}: evicted after idle delay", event_sub.name());
        counter!("cache_evictions_total").increment(1);
        if let Some(sub) = backend_sub {
            sub.unsubscribe();
        }
    }

    /// `system.reset`: refetch matching resources, then re-evaluate
    /// matching access.
    fn handle_system_reset(&self, payload: &[u8]) {
        let reset = match codec::decode_system_reset(payload) {
            Ok(reset) => reset,
            Err(err) => {
                error!("Error decoding system reset: {}", err);
                return;
            }
        };

        info!(
            "System reset ({} resource patterns, {} access patterns)",
            reset.resources.len(),
            reset.access.len()
        );

        for sub in self.collect_matches(&reset.resources) {
            sub.enqueue(SubTask::ResetResource);
        }
        for sub in self.collect_matches(&reset.access) {
            sub.enqueue(SubTask::ResetAccess);
        }
    }

    /// Resident subscriptions whose name matches any of the patterns.
    /// Collected under the lock, enqueued outside it.
    fn collect_matches(&self, raw_patterns: &[String]) -> Vec<Arc<EventSubscription>> {
        if raw_patterns.is_empty() {
            return Vec::new();
        }

        let patterns: Vec<Pattern> = raw_patterns
            .iter()
            .map(|p| Pattern::parse(p))
            .filter(Pattern::is_valid)
            .collect();
        if patterns.is_empty() {
            return Vec::new();
        }

        let registry = self.registry.lock().unwrap();
        registry
            .values()
            .filter(|sub| patterns.iter().any(|p| p.matches(sub.subject_name())))
            .cloned()
            .collect()
    }
}
