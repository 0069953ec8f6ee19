#![allow(dead_code)]

//! Test harness: a scripted bus and client helpers.
//!
//! The mock bus records subscriptions, queues outgoing requests for the
//! test to inspect and answer, and lets the test inject events. The
//! test client drives a connection lane directly and reads the frames
//! it would have written to its socket.

use bus_client::{Bus, BusError, BusSubscription, EventHandler, ResponseHandler};
use bytes::Bytes;
use gateway::{Cache, CacheConfig, Conn, ConnHandle, Pattern};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Notify;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

struct MockSub {
    id: u64,
    pattern: Pattern,
    handler: EventHandler,
}

/// A request captured by the mock bus, waiting for the test to answer.
pub struct PendingRequest {
    pub subject: String,
    pub payload: serde_json::Value,
    handler: Option<ResponseHandler>,
}

impl PendingRequest {
    pub fn assert_subject(self, subject: &str) -> Self {
        assert_eq!(self.subject, subject, "unexpected request subject");
        self
    }

    /// Assert a top-level payload field.
    pub fn assert_payload(self, key: &str, expected: serde_json::Value) -> Self {
        assert_eq!(
            self.payload
                .get(key)
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            expected,
            "unexpected '{}' in {} payload",
            key,
            self.subject
        );
        self
    }

    pub fn respond_success(mut self, result: serde_json::Value) {
        let handler = self.handler.take().unwrap();
        handler(Ok(Bytes::from(json!({ "result": result }).to_string())));
    }

    pub fn respond_error(mut self, code: &str, message: &str) {
        let handler = self.handler.take().unwrap();
        handler(Ok(Bytes::from(
            json!({ "error": { "code": code, "message": message } }).to_string(),
        )));
    }

    pub fn timeout(mut self) {
        let handler = self.handler.take().unwrap();
        handler(Err(BusError::Timeout));
    }
}

struct MockState {
    subs: Vec<MockSub>,
    requests: VecDeque<PendingRequest>,
}

struct MockInner {
    state: Mutex<MockState>,
    notify: Notify,
    next_id: AtomicU64,
}

/// Scripted in-memory bus.
#[derive(Clone)]
pub struct MockBus {
    inner: Arc<MockInner>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState {
                    subs: Vec::new(),
                    requests: VecDeque::new(),
                }),
                notify: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Wait for the next captured request.
    pub async fn get_request(&self) -> PendingRequest {
        tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                if let Some(req) = self.inner.state.lock().unwrap().requests.pop_front() {
                    return req;
                }
                // notify_one permits are sticky, so a push racing this
                // check is not lost.
                self.inner.notify.notified().await;
            }
        })
        .await
        .expect("timed out waiting for a bus request")
    }

    /// Wait for `n` concurrently issued requests.
    pub async fn get_requests(&self, n: usize) -> Requests {
        let mut reqs = Vec::with_capacity(n);
        for _ in 0..n {
            reqs.push(self.get_request().await);
        }
        Requests(reqs)
    }

    /// Assert that no request is pending after in-flight work settles.
    pub async fn assert_no_request(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = self.inner.state.lock().unwrap();
        assert!(
            state.requests.is_empty(),
            "unexpected pending request: {}",
            state
                .requests
                .front()
                .map(|r| r.subject.as_str())
                .unwrap_or("")
        );
    }

    /// Inject an event on a subject, delivering it to every matching
    /// subscription.
    pub fn event(&self, subject: &str, payload: serde_json::Value) {
        let handlers: Vec<EventHandler> = {
            let state = self.inner.state.lock().unwrap();
            state
                .subs
                .iter()
                .filter(|s| s.pattern.matches(subject))
                .map(|s| s.handler.clone())
                .collect()
        };
        let data = payload.to_string();
        for handler in handlers {
            handler(subject, data.as_bytes());
        }
    }

    /// Whether any live subscription was made on the exact subject.
    pub fn has_subscription(&self, subject: &str) -> bool {
        self.subscription_count(subject) > 0
    }

    /// Number of live subscriptions made on the exact subject.
    pub fn subscription_count(&self, subject: &str) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .subs
            .iter()
            .filter(|s| s.pattern.to_string() == subject)
            .count()
    }
}

impl Bus for MockBus {
    fn subscribe(
        &self,
        subject: &str,
        handler: EventHandler,
    ) -> bus_client::Result<BusSubscription> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.state.lock().unwrap().subs.push(MockSub {
            id,
            pattern: Pattern::parse(subject),
            handler,
        });

        let inner = self.inner.clone();
        Ok(BusSubscription::new(move || {
            inner.state.lock().unwrap().subs.retain(|s| s.id != id);
        }))
    }

    fn request(&self, subject: &str, payload: Bytes, _timeout: Duration, handler: ResponseHandler) {
        let payload: serde_json::Value = if payload.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&payload).expect("request payload is JSON")
        };
        self.inner
            .state
            .lock()
            .unwrap()
            .requests
            .push_back(PendingRequest {
                subject: subject.to_string(),
                payload,
                handler: Some(handler),
            });
        self.inner.notify.notify_one();
    }
}

/// A batch of concurrently issued requests, taken by subject.
pub struct Requests(Vec<PendingRequest>);

impl Requests {
    pub fn take(&mut self, subject: &str) -> PendingRequest {
        let idx = self
            .0
            .iter()
            .position(|r| r.subject == subject)
            .unwrap_or_else(|| panic!("no pending request on '{}'", subject));
        self.0.remove(idx)
    }
}

/// A gateway wired to a mock bus.
pub struct Session {
    pub bus: MockBus,
    pub cache: Arc<Cache>,
}

impl Session {
    pub fn start() -> Self {
        Self::start_with(CacheConfig::default())
    }

    pub fn start_with(cfg: CacheConfig) -> Self {
        let bus = MockBus::new();
        let cache = Cache::new(Arc::new(bus.clone()), cfg);
        cache.start().expect("cache start");
        Self { bus, cache }
    }

    /// Open a client connection and run the version handshake.
    pub async fn connect(&self) -> TestClient {
        let mut client = self.connect_without_version().await;
        let id = client.request("version", Some(json!({ "protocol": "1.999.999" })));
        let result = client.get_result(id).await;
        assert_eq!(result, json!({ "protocol": gateway::PROTOCOL_VERSION }));
        client
    }

    /// Open a client connection without a handshake.
    pub async fn connect_without_version(&self) -> TestClient {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handle = Conn::spawn(self.cache.clone(), out_tx);
        TestClient {
            handle,
            out: out_rx,
            next_id: 1,
        }
    }
}

/// Client side of one connection.
pub struct TestClient {
    pub handle: ConnHandle,
    out: mpsc::UnboundedReceiver<String>,
    next_id: u64,
}

impl TestClient {
    /// Send a request frame, returning its ID.
    pub fn request(&mut self, method: &str, params: Option<serde_json::Value>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let mut frame = json!({ "id": id, "method": method });
        if let Some(params) = params {
            frame["params"] = params;
        }
        self.handle.post_frame(frame.to_string());
        id
    }

    /// Read the next frame written to the socket.
    pub async fn get_frame(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(RECV_TIMEOUT, self.out.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("connection closed");
        serde_json::from_str(&text).expect("frame is JSON")
    }

    /// Read the next frame and require it to be the response to `id`.
    pub async fn get_response(&mut self, id: u64) -> Result<serde_json::Value, serde_json::Value> {
        let frame = self.get_frame().await;
        assert_eq!(
            frame.get("id"),
            Some(&json!(id)),
            "expected response to {}, got {}",
            id,
            frame
        );
        match frame.get("error") {
            Some(err) => Err(err.clone()),
            None => Ok(frame
                .get("result")
                .cloned()
                .unwrap_or(serde_json::Value::Null)),
        }
    }

    /// Read the next frame as a successful response to `id`.
    pub async fn get_result(&mut self, id: u64) -> serde_json::Value {
        match self.get_response(id).await {
            Ok(result) => result,
            Err(err) => panic!("request {} failed: {}", id, err),
        }
    }

    /// Read the next frame as an error response to `id`, returning its
    /// code.
    pub async fn get_error_code(&mut self, id: u64) -> String {
        match self.get_response(id).await {
            Ok(result) => panic!("request {} unexpectedly succeeded: {}", id, result),
            Err(err) => err["code"].as_str().expect("error code").to_string(),
        }
    }

    /// Read the next frame and require it to be the given event.
    pub async fn assert_event(&mut self, rid: &str, kind: &str) -> serde_json::Value {
        let frame = self.get_frame().await;
        assert_eq!(
            frame.get("event").and_then(|e| e.as_str()),
            Some(format!("{}.{}", rid, kind).as_str()),
            "unexpected frame {}",
            frame
        );
        frame.get("data").cloned().unwrap_or(serde_json::Value::Null)
    }
}

/// Run the standard subscribe flow for a model resource: respond to the
/// access and get requests and consume the client response.
pub async fn subscribe_model(
    session: &Session,
    client: &mut TestClient,
    rid: &str,
    model: serde_json::Value,
) {
    let id = client.request(&format!("subscribe.{}", rid), None);
    let mut reqs = session.bus.get_requests(2).await;
    reqs.take(&format!("access.{}", rid))
        .respond_success(json!({ "get": true, "call": "*" }));
    reqs.take(&format!("get.{}", rid))
        .respond_success(json!({ "model": model }));
    let result = client.get_result(id).await;
    assert_eq!(result["models"][rid], model);
}
