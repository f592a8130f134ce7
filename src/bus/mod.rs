//! Bus Adapter - MQTT Connection Owner
//!
//! ## Responsibilities
//!
//! - Sole owner of the broker connection; everything publishes through here
//! - Receive loop: topic + payload into the codec, events into the store
//! - Send loop: drains the bounded outbound queue in submission order
//! - Reconnect with exponential backoff, resubscribing on every session
//!
//! Outbound publishes buffer while disconnected up to a cap, then drop the
//! oldest with a counter. `BusUnavailable` surfaces to callers only when the
//! connection is down *and* the buffer is saturated.

use crate::codec::CodecRegistry;
use crate::error::{Error, Result};
use crate::state_store::StateStore;
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};

const RECONNECT_INITIAL: Duration = Duration::from_millis(200);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct BusOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keepalive: Duration,
    pub outbound_cap: usize,
}

/// One queued publish
#[derive(Debug, Clone)]
struct OutboundPublish {
    topic: String,
    payload: Vec<u8>,
}

/// Bounded outbound buffer with drop-oldest overflow
struct OutboundQueue {
    inner: Mutex<VecDeque<OutboundPublish>>,
    notify: Notify,
    cap: usize,
    connected: AtomicBool,
    dropped: AtomicU64,
}

impl OutboundQueue {
    fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap)),
            notify: Notify::new(),
            cap,
            connected: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, publish: OutboundPublish) -> Result<()> {
        let connected = self.connected.load(Ordering::Relaxed);
        let mut queue = self.inner.lock().expect("outbound queue lock");
        if queue.len() >= self.cap {
            if !connected {
                return Err(Error::BusUnavailable(
                    "broker disconnected and outbound buffer full".to_string(),
                ));
            }
            queue.pop_front();
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped_total = n, "Outbound buffer full, dropped oldest publish");
        }
        queue.push_back(publish);
        drop(queue);
        self.notify.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<OutboundPublish> {
        self.inner.lock().expect("outbound queue lock").pop_front()
    }

    fn push_front(&self, publish: OutboundPublish) {
        self.inner
            .lock()
            .expect("outbound queue lock")
            .push_front(publish);
    }
}

/// Cloneable handle for components that publish
#[derive(Clone)]
pub struct BusHandle {
    queue: Arc<OutboundQueue>,
}

impl BusHandle {
    /// Enqueue a publish; returns once the outbound buffer accepted it
    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.queue.push(OutboundPublish {
            topic: topic.into(),
            payload: payload.into(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.queue.connected.load(Ordering::Relaxed)
    }

    /// Publishes dropped to overflow since boot
    pub fn dropped_publishes(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

/// Bus adapter instance
pub struct BusAdapter {
    registry: Arc<CodecRegistry>,
    store: Arc<StateStore>,
    options: BusOptions,
    queue: Arc<OutboundQueue>,
    decode_errors: AtomicU64,
}

impl BusAdapter {
    pub fn new(
        registry: Arc<CodecRegistry>,
        store: Arc<StateStore>,
        options: BusOptions,
    ) -> (Arc<Self>, BusHandle) {
        let queue = Arc::new(OutboundQueue::new(options.outbound_cap));
        let adapter = Arc::new(Self {
            registry,
            store,
            options,
            queue: queue.clone(),
            decode_errors: AtomicU64::new(0),
        });
        (adapter, BusHandle { queue })
    }

    /// Decode failures observed since boot
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Run the connection until shutdown; the supervisor restarts this on a
    /// fatal exit while the store and persistence keep running.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut mqtt_options = MqttOptions::new(
            self.options.client_id.clone(),
            self.options.host.clone(),
            self.options.port,
        );
        mqtt_options.set_keep_alive(self.options.keepalive);
        if let (Some(user), Some(pass)) = (&self.options.username, &self.options.password) {
            mqtt_options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 64);

        let sender = tokio::spawn(run_send_loop(
            client.clone(),
            self.queue.clone(),
            shutdown.clone(),
        ));

        let mut backoff = RECONNECT_INITIAL;
        loop {
            tokio::select! {
                polled = event_loop.poll() => match polled {
                    Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                        backoff = RECONNECT_INITIAL;
                        self.queue.connected.store(true, Ordering::Relaxed);
                        self.queue.notify.notify_one();
                        tracing::info!(
                            host = %self.options.host,
                            port = self.options.port,
                            "Connected to broker"
                        );
                        self.resubscribe(&client).await;
                    }
                    Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                        self.handle_publish(&publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if self.queue.connected.swap(false, Ordering::Relaxed) {
                            tracing::warn!(error = %e, "Broker connection lost");
                        } else {
                            tracing::debug!(error = %e, "Broker connect attempt failed");
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown.changed() => break,
                        }
                        backoff = (backoff * 2).min(RECONNECT_CAP);
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        self.queue.connected.store(false, Ordering::Relaxed);
        let _ = client.disconnect().await;
        sender.abort();
        tracing::info!("Bus adapter stopped");
    }

    async fn resubscribe(&self, client: &AsyncClient) {
        for pattern in self.registry.subscriptions() {
            if let Err(e) = client.subscribe(pattern, QoS::AtMostOnce).await {
                tracing::error!(pattern = %pattern, error = %e, "Subscribe failed");
                return;
            }
        }
        tracing::info!(
            patterns = self.registry.subscriptions().len(),
            "Subscriptions established"
        );
    }

    async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        match self.registry.decode(topic, payload) {
            Ok(Some(event)) => {
                let changes = self.store.apply(&event).await;
                if !changes.is_empty() {
                    tracing::debug!(
                        topic = %topic,
                        device_id = %event.device_id(),
                        changes = changes.len(),
                        "Applied bus event"
                    );
                }
            }
            Ok(None) => {
                tracing::trace!(topic = %topic, "Ignoring topic outside home/");
            }
            Err(e) => {
                let n = self.decode_errors.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(topic = %topic, error = %e, decode_errors = n, "Decode failed");
            }
        }
    }
}

/// Drain the outbound queue while connected, in submission order
async fn run_send_loop(
    client: AsyncClient,
    queue: Arc<OutboundQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if !queue.connected.load(Ordering::Relaxed) {
            tokio::select! {
                _ = queue.notify.notified() => continue,
                _ = shutdown.changed() => return,
            }
        }
        match queue.pop() {
            Some(publish) => {
                if let Err(e) = client
                    .publish(
                        publish.topic.clone(),
                        QoS::AtMostOnce,
                        false,
                        publish.payload.clone(),
                    )
                    .await
                {
                    tracing::warn!(topic = %publish.topic, error = %e, "Publish failed, requeueing");
                    queue.push_front(publish);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
            None => {
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(n: usize) -> OutboundPublish {
        OutboundPublish {
            topic: format!("home/system/device-{n}/ping"),
            payload: b"{}".to_vec(),
        }
    }

    #[test]
    fn disconnected_full_queue_refuses() {
        let queue = OutboundQueue::new(2);
        queue.push(publish(0)).unwrap();
        queue.push(publish(1)).unwrap();
        let err = queue.push(publish(2)).unwrap_err();
        assert!(matches!(err, Error::BusUnavailable(_)));
    }

    #[test]
    fn connected_full_queue_drops_oldest() {
        let queue = OutboundQueue::new(2);
        queue.connected.store(true, Ordering::Relaxed);
        queue.push(publish(0)).unwrap();
        queue.push(publish(1)).unwrap();
        queue.push(publish(2)).unwrap();
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 1);
        let first = queue.pop().unwrap();
        assert_eq!(first.topic, "home/system/device-1/ping");
    }

    #[test]
    fn queue_preserves_submission_order() {
        let queue = OutboundQueue::new(8);
        for n in 0..3 {
            queue.push(publish(n)).unwrap();
        }
        for n in 0..3 {
            assert_eq!(queue.pop().unwrap().topic, publish(n).topic);
        }
        assert!(queue.pop().is_none());
    }
}
