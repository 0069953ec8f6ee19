//! NATS implementation of the [`Bus`] trait.
//!
//! Subscriptions and requests are driven by spawned tasks so the trait
//! surface stays synchronous and callback-based; callers are free to hold
//! their own locks around `subscribe` and `request`.

use crate::{Bus, BusError, BusSubscription, EventHandler, ResponseHandler, Result};
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Bus client backed by a NATS Core connection.
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    handle: Handle,
}

impl NatsBus {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        Ok(Self {
            client,
            handle: Handle::current(),
        })
    }

    /// Get the underlying NATS client.
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

impl Bus for NatsBus {
    fn subscribe(&self, subject: &str, handler: EventHandler) -> Result<BusSubscription> {
        let client = self.client.clone();
        let subject = subject.to_string();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        self.handle.spawn(async move {
            let mut sub = match client.subscribe(subject.clone()).await {
                Ok(sub) => sub,
                Err(e) => {
                    error!("Failed to subscribe to '{}': {}", subject, e);
                    return;
                }
            };
            debug!("Subscribed to '{}'", subject);

            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        let _ = sub.unsubscribe().await;
                        debug!("Unsubscribed from '{}'", subject);
                        break;
                    }
                    msg = sub.next() => {
                        match msg {
                            Some(msg) => handler(msg.subject.as_str(), &msg.payload),
                            None => {
                                debug!("Subscription to '{}' ended", subject);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(BusSubscription::new(move || {
            let _ = cancel_tx.send(());
        }))
    }

    fn request(&self, subject: &str, payload: Bytes, timeout: Duration, handler: ResponseHandler) {
        let client = self.client.clone();
        let subject = subject.to_string();

        self.handle.spawn(async move {
            let result = match tokio::time::timeout(timeout, client.request(subject, payload)).await
            {
                Err(_) => Err(BusError::Timeout),
                Ok(Err(e)) => match e.kind() {
                    async_nats::RequestErrorKind::TimedOut => Err(BusError::Timeout),
                    async_nats::RequestErrorKind::NoResponders => Err(BusError::NoResponders),
                    async_nats::RequestErrorKind::Other => Err(BusError::Request(e.to_string())),
                },
                Ok(Ok(msg)) => Ok(msg.payload),
            };
            handler(result);
        });
    }
}
