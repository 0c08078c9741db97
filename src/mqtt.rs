//! MQTT client wrapper
//!
//! Components register their subscriptions in an explicit table and receive
//! matching messages on their own channel; the table is re-subscribed on every
//! broker (re)connection. Numeric publications go through a per-topic rate
//! limiter.

use crate::config::MqttConfig;
use crate::error::{PvError, Result};
use crate::logging::{ErrorRateLimiter, StructuredLogger, get_logger};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod ratelimit;
pub mod settings;

pub use ratelimit::RateLimiter;
pub use settings::Setting;

/// One received or published message
#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl MqttMessage {
    pub fn new(topic: &str, payload: impl Into<Vec<u8>>, retain: bool) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.into(),
            retain,
        }
    }

    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok().map(str::trim)
    }

    /// Payload as a number; `None` for empty or non-numeric payloads
    pub fn number(&self) -> Option<f64> {
        self.text()?.parse::<f64>().ok().filter(|v| v.is_finite())
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Topic filter matching with `+` (one level) and `#` (all remaining levels)
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut p = pattern.split('/');
    let mut t = topic.split('/');
    loop {
        match (p.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscription {
    pattern: String,
    tx: mpsc::Sender<MqttMessage>,
}

/// Explicit (pattern -> channel) subscription table
#[derive(Default)]
pub struct SubscriptionTable {
    subs: Vec<Subscription>,
}

impl SubscriptionTable {
    pub fn add(&mut self, pattern: &str, tx: mpsc::Sender<MqttMessage>) {
        self.subs.push(Subscription {
            pattern: pattern.to_string(),
            tx,
        });
    }

    /// Distinct patterns, for re-subscription
    pub fn patterns(&self) -> Vec<String> {
        let mut v: Vec<String> = self.subs.iter().map(|s| s.pattern.clone()).collect();
        v.sort();
        v.dedup();
        v
    }

    /// Deliver to every matching subscriber; returns the number of deliveries
    ///
    /// Closed channels are dropped from the table. A full channel loses the
    /// message for that subscriber only.
    pub fn dispatch(&mut self, msg: &MqttMessage) -> usize {
        self.subs.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for s in &self.subs {
            if topic_matches(&s.pattern, &msg.topic) && s.tx.try_send(msg.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

enum Sink {
    Broker(AsyncClient),
    Memory(Mutex<Vec<MqttMessage>>),
}

struct Inner {
    sink: Sink,
    subs: Mutex<SubscriptionTable>,
    limiter: Mutex<RateLimiter>,
    /// Publications lost because the request queue was full or closed
    dropped: AtomicU64,
    publish_errors: Mutex<ErrorRateLimiter>,
    logger: StructuredLogger,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared MQTT handle; cheap to clone
#[derive(Clone)]
pub struct Mqtt {
    inner: Arc<Inner>,
}

impl Mqtt {
    /// Create a broker client; the returned event loop must be driven by
    /// [`Mqtt::run_event_loop`]
    pub fn connect(cfg: &MqttConfig, role: &str) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(format!("{}-{}", cfg.client_id, role), &cfg.host, cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_s.max(1)));
        if !cfg.user.is_empty() {
            options.set_credentials(cfg.user.clone(), cfg.password.clone());
        }
        let (client, eventloop) = AsyncClient::new(options, 256);
        (Self::with_sink(Sink::Broker(client), cfg), eventloop)
    }

    /// Handle that records publications in memory instead of talking to a broker
    pub fn memory(cfg: &MqttConfig) -> Self {
        Self::with_sink(Sink::Memory(Mutex::new(Vec::new())), cfg)
    }

    fn with_sink(sink: Sink, cfg: &MqttConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                subs: Mutex::new(SubscriptionTable::default()),
                limiter: Mutex::new(RateLimiter::new(&cfg.rate_limits)),
                dropped: AtomicU64::new(0),
                publish_errors: Mutex::new(ErrorRateLimiter::new(3)),
                logger: get_logger("mqtt"),
            }),
        }
    }

    /// Messages published so far (memory handles only)
    pub fn published(&self) -> Vec<MqttMessage> {
        match &self.inner.sink {
            Sink::Memory(log) => lock(log).clone(),
            Sink::Broker(_) => Vec::new(),
        }
    }

    /// Last payload published on `topic` (memory handles only)
    pub fn last_published(&self, topic: &str) -> Option<MqttMessage> {
        self.published().into_iter().rev().find(|m| m.topic == topic)
    }

    /// Register a subscription and get its channel
    pub fn subscribe(&self, pattern: &str, capacity: usize) -> mpsc::Receiver<MqttMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        lock(&self.inner.subs).add(pattern, tx);
        if let Sink::Broker(client) = &self.inner.sink
            && let Err(e) = client.try_subscribe(pattern, QoS::AtMostOnce)
        {
            // Picked up again on the next ConnAck
            self.inner
                .logger
                .debug(&format!("Deferred subscription to {}: {}", pattern, e));
        }
        rx
    }

    /// Several patterns delivered on one channel
    pub fn subscribe_all(&self, patterns: &[&str], capacity: usize) -> mpsc::Receiver<MqttMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        for pattern in patterns {
            lock(&self.inner.subs).add(pattern, tx.clone());
            if let Sink::Broker(client) = &self.inner.sink
                && let Err(e) = client.try_subscribe(*pattern, QoS::AtMostOnce)
            {
                self.inner
                    .logger
                    .debug(&format!("Deferred subscription to {}: {}", pattern, e));
            }
        }
        rx
    }

    /// Route an incoming message to the subscribers
    pub fn dispatch(&self, msg: &MqttMessage) -> usize {
        lock(&self.inner.subs).dispatch(msg)
    }

    /// Publications dropped while the broker queue was full
    pub fn dropped_publications(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Publish bytes as-is
    ///
    /// Never waits for the broker: while the connection is down and the
    /// request queue is full, the message is dropped and counted.
    pub async fn publish_raw(&self, topic: &str, payload: impl Into<Vec<u8>>, retain: bool) {
        let payload = payload.into();
        match &self.inner.sink {
            Sink::Broker(client) => {
                let mut errors = lock(&self.inner.publish_errors);
                match client.try_publish(topic, QoS::AtMostOnce, retain, payload) {
                    Ok(()) => errors.success(&self.inner.logger),
                    Err(e) => {
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        errors.failure(&self.inner.logger, &format!("Publish to {} dropped: {}", topic, e));
                    }
                }
            }
            Sink::Memory(log) => lock(log).push(MqttMessage::new(topic, payload, retain)),
        }
    }

    pub async fn publish_text(&self, topic: &str, text: &str) {
        self.publish_raw(topic, text.as_bytes().to_vec(), false).await
    }

    pub async fn publish_retained(&self, topic: &str, text: &str) {
        self.publish_raw(topic, text.as_bytes().to_vec(), true).await
    }

    pub async fn publish_json(&self, topic: &str, value: &serde_json::Value) {
        self.publish_raw(topic, value.to_string().into_bytes(), false)
            .await
    }

    /// Publish a number through the rate limiter
    pub async fn publish_value(&self, topic: &str, value: f64) {
        let out = lock(&self.inner.limiter).offer(topic, value, Instant::now());
        if let Some(v) = out {
            self.publish_raw(topic, format_number(v).into_bytes(), false)
                .await;
        }
    }

    /// Publish a flag as 0/1 through the rate limiter
    pub async fn publish_flag(&self, topic: &str, flag: bool) {
        self.publish_value(topic, if flag { 1.0 } else { 0.0 }).await
    }

    /// Release values whose rate-limit period has elapsed
    pub async fn flush_due(&self) {
        let due = lock(&self.inner.limiter).due(Instant::now());
        for (topic, v) in due {
            self.publish_raw(&topic, format_number(v).into_bytes(), false)
                .await;
        }
    }

    /// Periodically release rate-limited values until cancelled
    pub async fn run_flusher(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.flush_due().await,
            }
        }
        self.flush_due().await;
    }

    /// Drive the broker connection until cancelled
    pub async fn run_event_loop(self, mut eventloop: EventLoop, cancel: CancellationToken) {
        self.inner.logger.info("MQTT event loop started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.inner.logger.info("Connected, resubscribing");
                    let patterns = lock(&self.inner.subs).patterns();
                    if let Sink::Broker(client) = &self.inner.sink {
                        for p in patterns {
                            // This loop drains the request queue, so it must not wait on it
                            if let Err(e) = client.try_subscribe(p.clone(), QoS::AtMostOnce) {
                                self.inner
                                    .logger
                                    .warn(&format!("Subscribe {} failed: {}", p, e));
                            }
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let msg = MqttMessage::new(&p.topic, p.payload.to_vec(), p.retain);
                    self.dispatch(&msg);
                }
                Ok(_) => {}
                Err(e) => {
                    self.inner
                        .logger
                        .warn(&format!("Connection error: {}, reconnecting", e));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        self.inner.logger.info("MQTT event loop stopped");
    }

    /// Flush pending values and disconnect
    pub async fn disconnect(&self) -> Result<()> {
        self.flush_due().await;
        if let Sink::Broker(client) = &self.inner.sink {
            client
                .try_disconnect()
                .map_err(|e| PvError::mqtt(format!("Disconnect failed: {}", e)))?;
        }
        Ok(())
    }
}

/// Compact decimal rendering: at most three decimals, no trailing zeros
pub fn format_number(v: f64) -> String {
    if !v.is_finite() {
        return String::new();
    }
    let r = (v * 1000.0).round() / 1000.0;
    if r == 0.0 {
        return "0".to_string();
    }
    format!("{}", r)
}
