//! Per-resource event subscription record.
//!
//! One record exists per distinct resource ID, process-wide. Every
//! mutation of its observable state runs inside a task pulled from its
//! queue by exactly one cache worker at a time; this serializes all
//! state transitions for one resource while different resources run in
//! parallel.

use crate::cache::view::{ResourceEvent, ResourceView};
use crate::cache::{Cache, Subscriber};
use crate::codec;
use crate::error::ResError;
use crate::pattern::{rid_name, rid_query};
use bus_client::{BusError, BusSubscription};
use bytes::Bytes;
use metrics::counter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, warn};

/// Load state of an event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No snapshot and no fetch in flight.
    Unset,
    /// Initial `get` request in flight; bus events are buffered.
    Loading,
    /// Snapshot present; events apply directly.
    Loaded,
    /// Last fetch failed; the next subscriber retries.
    Error,
    /// System reset in progress; bus events are buffered until the
    /// fresh snapshot arrives.
    Reset,
}

/// Deferred work executed on the subscription's single worker slot.
pub(crate) enum SubTask {
    /// Bus event, kind parsed from the subject suffix.
    Event { kind: String, payload: Bytes },
    /// Attach a subscriber, loading the resource if needed.
    AddSubscriber(Arc<dyn Subscriber>),
    /// Detach a subscriber by its ID, releasing its count.
    RemoveSubscriber(u64),
    /// Response to the initial `get` request.
    GetResponse(Result<Bytes, BusError>),
    /// Response to a reset refetch.
    ResetResponse(Result<Bytes, BusError>),
    /// System reset matched this resource.
    ResetResource,
    /// System reset matched this resource's access.
    ResetAccess,
    /// One-shot request callback, serialized with event application.
    Callback(Box<dyn FnOnce() + Send>),
}

struct Lane {
    queue: VecDeque<SubTask>,
    queued: bool,
}

struct WorkState {
    state: CacheState,
    view: Option<Arc<ResourceView>>,
    parked: Vec<Arc<dyn Subscriber>>,
    subscribers: Vec<Arc<dyn Subscriber>>,
    buffered: Vec<(String, Bytes)>,
}

/// Process-wide record for one resource ID.
pub struct EventSubscription {
    name: String,
    subject_name: String,
    query: String,
    cache: Weak<Cache>,
    count: AtomicU64,
    backend_sub: Mutex<Option<BusSubscription>>,
    lane: Mutex<Lane>,
    work: Mutex<WorkState>,
}

impl EventSubscription {
    /// Create a record with an initial count of one.
    pub(crate) fn new(rid: &str, cache: Weak<Cache>) -> Arc<Self> {
        Arc::new(Self {
            name: rid.to_string(),
            subject_name: rid_name(rid).to_string(),
            query: rid_query(rid).to_string(),
            cache,
            count: AtomicU64::new(1),
            backend_sub: Mutex::new(None),
            lane: Mutex::new(Lane {
                queue: VecDeque::new(),
                queued: false,
            }),
            work: Mutex::new(WorkState {
                state: CacheState::Unset,
                view: None,
                parked: Vec::new(),
                subscribers: Vec::new(),
                buffered: Vec::new(),
            }),
        })
    }

    /// Full resource ID, including any query part.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resource ID name part, used in bus subjects.
    pub fn subject_name(&self) -> &str {
        &self.subject_name
    }

    /// Current reference count.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Whether a backend subscription is attached.
    pub fn has_backend_sub(&self) -> bool {
        self.backend_sub.lock().unwrap().is_some()
    }

    // Count changes only happen under the cache registry lock.

    pub(crate) fn add_count(&self) -> u64 {
        self.count.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn dec_count(&self, n: u64) -> u64 {
        let prev = self.count.fetch_sub(n, Ordering::SeqCst);
        debug_assert!(prev >= n, "{}: count underflow", self.name);
        prev - n
    }

    pub(crate) fn set_backend_sub(&self, sub: BusSubscription) {
        *self.backend_sub.lock().unwrap() = Some(sub);
    }

    pub(crate) fn take_backend_sub(&self) -> Option<BusSubscription> {
        self.backend_sub.lock().unwrap().take()
    }

    /// Append a task and publish the subscription to the cache worker
    /// input if it is not already queued. On a saturated or closed
    /// input the queue is drained inline; the `queued` flag keeps the
    /// single-writer property either way.
    pub(crate) fn enqueue(self: &Arc<Self>, task: SubTask) {
        {
            let mut lane = self.lane.lock().unwrap();
            lane.queue.push_back(task);
            if lane.queued {
                return;
            }
            lane.queued = true;
        }

        let sender = self.cache.upgrade().and_then(|c| c.worker_input());
        match sender {
            Some(tx) => {
                if let Err(err) = tx.try_send(self.clone()) {
                    warn!(
                        "{}: worker input unavailable, processing inline",
                        self.name
                    );
                    err.into_inner().process_queue();
                }
            }
            None => self.process_queue(),
        }
    }

    /// Bus event entry point. The kind is the subject suffix after
    /// `event.<rid>.`.
    pub(crate) fn enqueue_event(self: &Arc<Self>, subject: &str, payload: &[u8]) {
        let prefix_len = "event.".len() + self.subject_name.len() + 1;
        if subject.len() <= prefix_len || !subject.starts_with("event.") {
            warn!("{}: malformed event subject '{}'", self.name, subject);
            return;
        }
        let kind = subject[prefix_len..].to_string();
        self.enqueue(SubTask::Event {
            kind,
            payload: Bytes::copy_from_slice(payload),
        });
    }

    /// Attach a subscriber.
    pub(crate) fn add_subscriber(self: &Arc<Self>, sub: Arc<dyn Subscriber>) {
        self.enqueue(SubTask::AddSubscriber(sub));
    }

    /// Drain the task queue. Called by one cache worker at a time. A
    /// panicking task is logged and dropped; the subscription remains
    /// usable.
    pub(crate) fn process_queue(self: &Arc<Self>) {
        loop {
            let task = {
                let mut lane = self.lane.lock().unwrap();
                match lane.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        lane.queued = false;
                        return;
                    }
                }
            };
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.run_task(task)));
            if outcome.is_err() {
                error!("{}: task panicked, dropping it", self.name);
            }
        }
    }

    fn run_task(self: &Arc<Self>, task: SubTask) {
        match task {
            SubTask::AddSubscriber(sub) => self.task_add_subscriber(sub),
            SubTask::RemoveSubscriber(id) => self.task_remove_subscriber(id),
            SubTask::Event { kind, payload } => self.task_event(&kind, payload),
            SubTask::GetResponse(result) => self.task_get_response(result),
            SubTask::ResetResponse(result) => self.task_reset_response(result),
            SubTask::ResetResource => self.task_reset_resource(),
            SubTask::ResetAccess => self.task_reset_access(),
            SubTask::Callback(cb) => cb(),
        }
    }

    fn task_add_subscriber(self: &Arc<Self>, sub: Arc<dyn Subscriber>) {
        let mut work = self.work.lock().unwrap();
        match work.state {
            CacheState::Loaded => {
                let Some(view) = work.view.clone() else { return };
                work.subscribers.push(sub.clone());
                drop(work);
                sub.loaded(Ok(view));
            }
            CacheState::Loading | CacheState::Reset => {
                work.parked.push(sub);
            }
            CacheState::Unset | CacheState::Error => {
                work.state = CacheState::Loading;
                work.view = None;
                work.parked.push(sub);
                drop(work);
                self.send_get(false);
            }
        }
    }

    fn task_remove_subscriber(self: &Arc<Self>, id: u64) {
        let found = {
            let mut work = self.work.lock().unwrap();
            let before = work.subscribers.len() + work.parked.len();
            work.subscribers.retain(|s| s.sub_id() != id);
            work.parked.retain(|s| s.sub_id() != id);
            before != work.subscribers.len() + work.parked.len()
        };
        // The count for a subscriber that already failed its load has
        // been released on the error path.
        if found {
            if let Some(cache) = self.cache.upgrade() {
                cache.remove_count(self, 1);
            }
        }
    }

    fn task_event(self: &Arc<Self>, kind: &str, payload: Bytes) {
        let mut work = self.work.lock().unwrap();
        match work.state {
            CacheState::Loading | CacheState::Reset => {
                work.buffered.push((kind.to_string(), payload));
            }
            CacheState::Loaded => {
                drop(work);
                self.apply_and_deliver(kind, &payload);
            }
            CacheState::Unset | CacheState::Error => {
                debug!("{}: dropping {} event without snapshot", self.name, kind);
            }
        }
    }

    /// Apply one event against the loaded snapshot and fan it out.
    fn apply_and_deliver(self: &Arc<Self>, kind: &str, payload: &[u8]) {
        if kind == "reaccess" {
            self.task_reset_access();
            return;
        }

        let parsed: serde_json::Value = if payload.is_empty() {
            serde_json::Value::Null
        } else {
            match serde_json::from_slice(payload) {
                Ok(v) => v,
                Err(e) => {
                    warn!("{}: malformed {} event payload: {}", self.name, kind, e);
                    return;
                }
            }
        };

        let event = match kind {
            "change" | "add" | "remove" => {
                let view = {
                    let work = self.work.lock().unwrap();
                    work.view.clone()
                };
                let Some(view) = view else { return };
                match view.apply_event(kind, &parsed) {
                    Some(ev) => ev,
                    None => {
                        warn!("{}: dropping unapplicable {} event", self.name, kind);
                        return;
                    }
                }
            }
            _ => ResourceEvent::custom(kind, parsed),
        };

        counter!("cache_events_total").increment(1);
        self.deliver(&event);
    }

    fn deliver(&self, event: &ResourceEvent) {
        let subscribers = {
            let work = self.work.lock().unwrap();
            work.subscribers.clone()
        };
        for sub in subscribers {
            sub.event(event);
        }
    }

    fn task_get_response(self: &Arc<Self>, result: Result<Bytes, BusError>) {
        let decoded = result
            .map_err(ResError::from)
            .and_then(|data| codec::decode_response(&data))
            .and_then(codec::decode_get);

        match decoded {
            Ok(resource) => {
                let (view, parked) = {
                    let mut work = self.work.lock().unwrap();
                    let view = ResourceView::new(self.name.clone(), resource);
                    work.state = CacheState::Loaded;
                    work.view = Some(view.clone());
                    // Buffered events arrived before the fetch was
                    // answered; the snapshot supersedes them.
                    work.buffered.clear();
                    let parked: Vec<_> = work.parked.drain(..).collect();
                    work.subscribers.extend(parked.iter().cloned());
                    (view, parked)
                };
                for sub in parked {
                    sub.loaded(Ok(view.clone()));
                }
            }
            Err(err) => {
                let parked = {
                    let mut work = self.work.lock().unwrap();
                    work.state = CacheState::Error;
                    work.view = None;
                    work.buffered.clear();
                    work.parked.drain(..).collect::<Vec<_>>()
                };
                debug!("{}: load failed: {}", self.name, err);
                let cache = self.cache.upgrade();
                for sub in parked {
                    sub.loaded(Err(err.clone()));
                    if let Some(cache) = &cache {
                        cache.remove_count(self, 1);
                    }
                }
            }
        }
    }

    fn task_reset_resource(self: &Arc<Self>) {
        let mut work = self.work.lock().unwrap();
        if work.state != CacheState::Loaded {
            return;
        }
        work.state = CacheState::Reset;
        drop(work);
        counter!("cache_resets_total").increment(1);
        self.send_get(true);
    }

    fn task_reset_response(self: &Arc<Self>, result: Result<Bytes, BusError>) {
        let decoded = result
            .map_err(ResError::from)
            .and_then(|data| codec::decode_response(&data))
            .and_then(codec::decode_get);

        let (events, buffered) = {
            let mut work = self.work.lock().unwrap();
            if work.state != CacheState::Reset {
                return;
            }
            work.state = CacheState::Loaded;
            let buffered: Vec<_> = work.buffered.drain(..).collect();
            let events = match (&decoded, &work.view) {
                (Ok(resource), Some(view)) => view.reset_diff(resource.clone()),
                _ => Vec::new(),
            };
            (events, buffered)
        };

        if let Err(err) = decoded {
            error!("{}: reset refetch failed: {}", self.name, err);
        }

        // Synthesized diff events first, then the events buffered while
        // the refetch was in flight, keeping one ordered stream.
        for ev in &events {
            self.deliver(ev);
        }
        for (kind, payload) in buffered {
            self.apply_and_deliver(&kind, &payload);
        }
    }

    fn task_reset_access(self: &Arc<Self>) {
        let subscribers = {
            let work = self.work.lock().unwrap();
            work.subscribers.clone()
        };
        for sub in subscribers {
            sub.reaccess();
        }
    }

    /// Issue a `get.<rid>` request; the response lands back on this
    /// queue.
    fn send_get(self: &Arc<Self>, reset: bool) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let subject = format!("get.{}", self.subject_name);
        let payload = codec::get_payload(&self.query);
        let this = self.clone();
        cache.bus().request(
            &subject,
            payload,
            cache.config().request_timeout,
            Box::new(move |result| {
                let task = if reset {
                    SubTask::ResetResponse(result)
                } else {
                    SubTask::GetResponse(result)
                };
                this.enqueue(task);
            }),
        );
    }
}
