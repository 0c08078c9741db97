//! Battery <-> inverters CAN relay
//!
//! Battery frames are decoded, adjusted per inverter and retransmitted on
//! every inverter bus. Inverter frames are queued and echoed back to the
//! battery once per tick so its watchdog stays satisfied.

use super::bus::{CanBus, SocketCanBus};
use super::frames::{BmsFrame, RawFrame};
use crate::config::CanConfig;
use crate::error::{PvError, Result};
use crate::logging::{ErrorRateLimiter, StructuredLogger, get_logger, get_logger_for};
use crate::mqtt::Mqtt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Inverter battery currents older than this fall back to an even split
pub const CURRENT_MAX_AGE: Duration = Duration::from_secs(10);

/// One MQTT publication produced while processing a frame
#[derive(Debug, Clone, PartialEq)]
pub enum Publication {
    Value(String, f64),
    Flag(String, bool),
    Text(String, String),
}

/// What to do with one battery frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Frame per inverter, in configuration order
    pub forward: Vec<RawFrame>,
    pub publish: Vec<Publication>,
}

fn bms(topic: &str) -> String {
    format!("pv/bms/{}", topic)
}

/// Frame policy, free of I/O
pub struct BridgeCore {
    inverters: Vec<String>,
    /// User limits in 0.1 A
    user_charge: i32,
    user_discharge: i32,
    currents: HashMap<String, (f64, Instant)>,
}

impl BridgeCore {
    pub fn new(cfg: &CanConfig) -> Self {
        Self {
            inverters: cfg.inverters.iter().map(|i| i.name.clone()).collect(),
            user_charge: (cfg.max_charge_current_a * 10.0).floor() as i32,
            user_discharge: (cfg.max_discharge_current_a * 10.0).floor() as i32,
            currents: HashMap::new(),
        }
    }

    /// Take new user current limits; inverter names stay as opened
    pub fn reconfigure(&mut self, cfg: &CanConfig) {
        self.user_charge = (cfg.max_charge_current_a * 10.0).floor() as i32;
        self.user_discharge = (cfg.max_discharge_current_a * 10.0).floor() as i32;
    }

    pub fn inverter_count(&self) -> usize {
        self.inverters.len()
    }

    /// Battery current an inverter reports for itself (A, positive charging)
    pub fn set_inverter_current(&mut self, inverter: &str, amps: f64, now: Instant) {
        if self.inverters.iter().any(|n| n == inverter) {
            self.currents.insert(inverter.to_string(), (amps, now));
        }
    }

    fn inverter_current(&self, inverter: &str, now: Instant) -> Option<f64> {
        self.currents
            .get(inverter)
            .filter(|(_, at)| now.saturating_duration_since(*at) <= CURRENT_MAX_AGE)
            .map(|(a, _)| *a)
    }

    pub fn process_battery(&self, frame: &RawFrame, now: Instant) -> Result<Outcome> {
        let decoded = BmsFrame::decode(frame)?;
        let n = self.inverters.len().max(1);
        let mut out = Outcome::default();
        match decoded {
            BmsFrame::Limits(limits) => {
                let charge = (limits.charge_current as i32).min(self.user_charge).max(0);
                let discharge = (limits.discharge_current as i32).min(self.user_discharge).max(0);
                out.publish.extend([
                    Publication::Value(bms("max_charge_current"), charge as f64 * 0.1),
                    Publication::Value(bms("max_discharge_current"), discharge as f64 * 0.1),
                    Publication::Value(bms("charge_voltage"), limits.charge_voltage_v()),
                    Publication::Value(bms("discharge_voltage"), limits.discharge_voltage_v()),
                ]);
                let mut shared = limits.clone();
                // Integer division keeps the sum at or below the clamped limit
                shared.charge_current = (charge / n as i32) as i16;
                shared.discharge_current = (discharge / n as i32) as i16;
                let f = BmsFrame::Limits(shared).encode();
                out.forward = vec![f; self.inverters.len()];
            }
            BmsFrame::Soc(soc) => {
                out.publish.extend([
                    Publication::Value(bms("soc"), soc.soc as f64),
                    Publication::Value(bms("soh"), soc.soh as f64),
                ]);
                out.forward = vec![frame.clone(); self.inverters.len()];
            }
            BmsFrame::Measurements(m) => {
                out.publish.extend([
                    Publication::Value(bms("voltage"), m.voltage_v()),
                    Publication::Value(bms("current"), m.current_a()),
                    Publication::Value(bms("power"), m.voltage_v() * m.current_a()),
                    Publication::Value(bms("temperature"), m.temperature_c()),
                ]);
                let even = m.current_a() / n as f64;
                out.forward = self
                    .inverters
                    .iter()
                    .map(|name| {
                        let mut own = m.clone();
                        own.set_current_a(self.inverter_current(name, now).unwrap_or(even));
                        BmsFrame::Measurements(own).encode()
                    })
                    .collect();
            }
            BmsFrame::Flags(flags) => {
                for (name, on) in flags.flags() {
                    out.publish.push(Publication::Flag(bms(name), on));
                }
                out.forward = vec![frame.clone(); self.inverters.len()];
            }
            BmsFrame::Errors(errors) => {
                out.publish.push(Publication::Value(bms("protection"), errors.protection() as f64));
                out.publish.push(Publication::Value(bms("alarm"), errors.alarm() as f64));
                for (name, on) in errors.flags() {
                    out.publish.push(Publication::Flag(bms(name), on));
                }
                out.forward = vec![frame.clone(); self.inverters.len()];
            }
            f @ BmsFrame::Manufacturer(_) => {
                if let Some(name) = f.manufacturer_name() {
                    out.publish.push(Publication::Text(bms("manufacturer"), name));
                }
                out.forward = vec![frame.clone(); self.inverters.len()];
            }
            BmsFrame::Reply(_) => {
                out.forward = vec![frame.clone(); self.inverters.len()];
            }
        }
        Ok(out)
    }
}

/// Bounded queue of inverter frames waiting to be echoed
#[derive(Debug)]
pub struct EchoQueue {
    capacity: usize,
    frames: VecDeque<RawFrame>,
    dropped: u64,
    echoed: u64,
}

impl EchoQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            frames: VecDeque::with_capacity(capacity),
            dropped: 0,
            echoed: 0,
        }
    }

    /// Append, dropping the oldest frame when full
    pub fn push(&mut self, frame: RawFrame) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
            self.dropped += 1;
        }
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Empty the queue; each distinct (id, data) once, in arrival order
    pub fn drain_unique(&mut self) -> Vec<RawFrame> {
        let mut seen = HashSet::new();
        let out: Vec<RawFrame> = self
            .frames
            .drain(..)
            .filter(|f| seen.insert(f.clone()))
            .collect();
        self.echoed += out.len() as u64;
        out
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn echoed(&self) -> u64 {
        self.echoed
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Shared {
    battery: Arc<dyn CanBus>,
    inverters: Vec<Arc<dyn CanBus>>,
    core: Mutex<BridgeCore>,
    echo: Mutex<EchoQueue>,
    mqtt: Mqtt,
    echo_period: Duration,
    reconnect_delay: Duration,
}

/// Reload seam of a running bridge
#[derive(Clone)]
pub struct BridgeControl(Arc<Shared>);

impl BridgeControl {
    pub fn reconfigure(&self, cfg: &CanConfig) {
        lock(&self.0.core).reconfigure(cfg);
    }
}

pub struct CanBridge {
    shared: Arc<Shared>,
    currents: tokio::sync::mpsc::Receiver<crate::mqtt::MqttMessage>,
    logger: StructuredLogger,
}

impl CanBridge {
    /// Inverter buses must be in the order of `cfg.inverters`
    pub fn new(
        cfg: &CanConfig,
        battery: Arc<dyn CanBus>,
        inverters: Vec<Arc<dyn CanBus>>,
        mqtt: Mqtt,
    ) -> Self {
        let currents = mqtt.subscribe("pv/+/battery_current", 32);
        Self {
            shared: Arc::new(Shared {
                battery,
                inverters,
                core: Mutex::new(BridgeCore::new(cfg)),
                echo: Mutex::new(EchoQueue::new(cfg.echo_capacity)),
                mqtt,
                echo_period: Duration::from_millis(cfg.echo_period_ms),
                reconnect_delay: Duration::from_secs(cfg.reconnect_delay_s),
            }),
            currents,
            logger: get_logger("canbridge"),
        }
    }

    /// Open the SocketCAN interfaces named in the configuration
    pub fn open(cfg: &CanConfig, mqtt: Mqtt) -> Result<Self> {
        let battery: Arc<dyn CanBus> = Arc::new(SocketCanBus::open(&cfg.battery_interface)?);
        let inverters = cfg
            .inverters
            .iter()
            .map(|i| SocketCanBus::open(&i.interface).map(|b| Arc::new(b) as Arc<dyn CanBus>))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(cfg, battery, inverters, mqtt))
    }

    /// Handle for applying configuration reloads while running
    pub fn control(&self) -> BridgeControl {
        BridgeControl(self.shared.clone())
    }

    /// Relay until cancelled; a failing bus never stops the others
    pub async fn run(self, cancel: CancellationToken) {
        self.logger.info(&format!(
            "Relaying {} to {} inverter bus(es)",
            self.shared.battery.name(),
            self.shared.inverters.len()
        ));
        let mut tasks = JoinSet::new();
        tasks.spawn(battery_loop(self.shared.clone(), cancel.clone()));
        for i in 0..self.shared.inverters.len() {
            tasks.spawn(inverter_loop(self.shared.clone(), i, cancel.clone()));
        }
        tasks.spawn(echo_loop(self.shared.clone(), cancel.clone()));
        tasks.spawn(current_loop(self.shared.clone(), self.currents, cancel.clone()));
        while tasks.join_next().await.is_some() {}
        self.logger.info("CAN bridge stopped");
    }
}

async fn reconnect(bus: &Arc<dyn CanBus>, delay: Duration, cancel: &CancellationToken, logger: &StructuredLogger) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }
    match bus.reset().await {
        Ok(()) => logger.info("Reconnected"),
        Err(e) => logger.warn(&format!("Reconnect failed: {}", e)),
    }
}

async fn publish(mqtt: &Mqtt, publications: Vec<Publication>) {
    for p in publications {
        match p {
            Publication::Value(t, v) => mqtt.publish_value(&t, v).await,
            Publication::Flag(t, on) => mqtt.publish_flag(&t, on).await,
            Publication::Text(t, s) => mqtt.publish_text(&t, &s).await,
        }
    }
}

async fn battery_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let logger = get_logger_for("canbridge", shared.battery.name());
    let mut errors = ErrorRateLimiter::new(3);
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = shared.battery.recv() => r,
        };
        let frame = match received {
            Ok(f) => f,
            // Remote, error or extended frame: the bus itself is fine
            Err(e @ PvError::Protocol { .. }) => {
                logger.debug(&format!("Ignored frame: {}", e));
                continue;
            }
            Err(e) => {
                errors.failure(&logger, &e.to_string());
                reconnect(&shared.battery, shared.reconnect_delay, &cancel, &logger).await;
                continue;
            }
        };
        let outcome = lock(&shared.core).process_battery(&frame, Instant::now());
        match outcome {
            Ok(outcome) => {
                errors.success(&logger);
                // Inverters first; telemetry must never delay the relay
                for (bus, f) in shared.inverters.iter().zip(outcome.forward.iter()) {
                    if let Err(e) = bus.send(f).await {
                        logger.debug(&format!("Forward to {} failed: {}", bus.name(), e));
                    }
                }
                publish(&shared.mqtt, outcome.publish).await;
            }
            // Malformed or unknown frame: drop it
            Err(e) => logger.debug(&format!("Dropped frame {:#x}: {}", frame.id, e)),
        }
    }
}

async fn inverter_loop(shared: Arc<Shared>, index: usize, cancel: CancellationToken) {
    let bus = shared.inverters[index].clone();
    let logger = get_logger_for("canbridge", bus.name());
    let mut errors = ErrorRateLimiter::new(3);
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = bus.recv() => r,
        };
        match received {
            Ok(frame) => {
                errors.success(&logger);
                lock(&shared.echo).push(frame);
            }
            Err(e @ PvError::Protocol { .. }) => {
                logger.debug(&format!("Ignored frame: {}", e));
            }
            Err(e) => {
                errors.failure(&logger, &e.to_string());
                reconnect(&bus, shared.reconnect_delay, &cancel, &logger).await;
            }
        }
    }
}

async fn echo_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let logger = get_logger_for("canbridge", "echo");
    let mut tick = tokio::time::interval(shared.echo_period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        let (frames, dropped, echoed) = {
            let mut q = lock(&shared.echo);
            let frames = q.drain_unique();
            (frames, q.dropped(), q.echoed())
        };
        for f in &frames {
            if let Err(e) = shared.battery.send(f).await {
                logger.debug(&format!("Echo of {:#x} failed: {}", f.id, e));
            }
        }
        shared.mqtt.publish_value(&bms("echo_sent"), echoed as f64).await;
        shared.mqtt.publish_value(&bms("echo_dropped"), dropped as f64).await;
    }
}

async fn current_loop(
    shared: Arc<Shared>,
    mut rx: tokio::sync::mpsc::Receiver<crate::mqtt::MqttMessage>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            m = rx.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };
        // pv/<inverter>/battery_current
        let Some(inverter) = msg.topic.split('/').nth(1) else {
            continue;
        };
        if let Some(amps) = msg.number() {
            lock(&shared.core).set_inverter_current(inverter, amps, Instant::now());
        }
    }
}
