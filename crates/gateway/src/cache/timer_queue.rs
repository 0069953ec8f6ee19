//! Monotonic delay queue driving idle eviction.
//!
//! Entries share one constant delay, so insertion order equals deadline
//! order and the queue stays a plain deque. A single task drives the
//! callbacks; entries may be cancelled by key before firing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Entry<T> {
    key: String,
    deadline: Instant,
    value: T,
}

struct State<T> {
    entries: VecDeque<Entry<T>>,
    cleared: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// Delay queue with a fixed per-entry delay.
pub struct TimerQueue<T: Send + 'static> {
    delay: Duration,
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> TimerQueue<T> {
    /// Create the queue and spawn its driver task. Must be called
    /// within a tokio runtime.
    pub fn new(delay: Duration, callback: impl Fn(T) + Send + Sync + 'static) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                cleared: false,
            }),
            notify: Notify::new(),
        });

        let driver = inner.clone();
        tokio::spawn(async move {
            loop {
                let next = {
                    let state = driver.state.lock().unwrap();
                    if state.cleared {
                        return;
                    }
                    state.entries.front().map(|e| e.deadline)
                };

                match next {
                    None => driver.notify.notified().await,
                    Some(deadline) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {
                                let fired = {
                                    let mut state = driver.state.lock().unwrap();
                                    match state.entries.front() {
                                        Some(e) if e.deadline <= Instant::now() => {
                                            state.entries.pop_front()
                                        }
                                        _ => None,
                                    }
                                };
                                if let Some(entry) = fired {
                                    callback(entry.value);
                                }
                            }
                            _ = driver.notify.notified() => {}
                        }
                    }
                }
            }
        });

        Self { delay, inner }
    }

    /// Schedule a value to fire after the queue delay. Any prior entry
    /// with the same key is replaced.
    pub fn schedule(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.entries.retain(|e| e.key != key);
            state.entries.push_back(Entry {
                key,
                deadline: Instant::now() + self.delay,
                value,
            });
        }
        self.inner.notify.notify_one();
    }

    /// Cancel a pending entry. Returns whether one was removed.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().unwrap();
            let before = state.entries.len();
            state.entries.retain(|e| e.key != key);
            before != state.entries.len()
        };
        if removed {
            self.inner.notify.notify_one();
        }
        removed
    }

    /// Drop all pending entries and stop the driver task.
    pub fn clear(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.entries.clear();
            state.cleared = true;
        }
        self.inner.notify.notify_one();
    }
}

impl<T: Send + 'static> Drop for TimerQueue<T> {
    fn drop(&mut self) {
        self.clear();
    }
}
