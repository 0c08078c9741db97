//! Surplus power router
//!
//! Once per second the router takes the latest aggregator snapshot, computes
//! the excess power and lets the routable devices bid for it in priority
//! order:
//!
//! 1. release: every device adds the power it could give back,
//! 2. take: every device, highest priority first, takes what it will use and
//!    may queue one change (switch a plug, set an EVSE current).
//!
//! Queued changes only commit once a confirmation counter has filled up, or
//! right away while a hair-trigger window is open. A device that reports a
//! wait reason (settling plug, EVSE command in flight) defers the commit.

use crate::aggregator::PowerSnapshot;
use crate::config::{RouterProfile, SharedConfig};
use crate::error::{PvError, Result};
use crate::logging::{ErrorRateLimiter, StructuredLogger, get_logger};
use crate::mqtt::{Mqtt, MqttMessage, Setting};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::fmt;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub mod average;
pub mod battery;
pub mod evse;
pub mod piecewise;
pub mod plug;

pub use average::MovingAverage;
pub use battery::BatteryDevice;
pub use evse::{EvseController, EvseLink, EvseState};
pub use piecewise::Piecewise;
pub use plug::PlugDevice;

pub const ITERATION_PERIOD: Duration = Duration::from_secs(1);
pub const ACTIVE_CONFIG_COMMAND: &str = "cmnd/pv/router/active_config";
pub const ACTIVE_CONFIG_STATE: &str = "pv/router/active_config";

/// A change a device wants; executed by the router after confirmation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// Plug on/off
    Switch(bool),
    /// EVSE current limit (A), resuming if paused
    SetCurrent(f64),
    /// EVSE limit to zero
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Change {
    /// Index into the router's device list
    pub device: usize,
    pub action: Action,
}

/// Why a device wants routing changes deferred this cycle
#[derive(Debug, Clone, PartialEq)]
pub struct WaitReason {
    pub device: String,
    pub reason: String,
}

impl WaitReason {
    pub fn new(device: &str, reason: &str) -> Self {
        Self {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.device, self.reason)
    }
}

/// Per-iteration allocation state handed to each device
#[derive(Debug, Clone)]
pub struct RouterCtx {
    pub now: Instant,
    /// Power still to be distributed
    pub power: f64,
    pub soc: f64,
    /// Charge power the inverters can still put into the battery
    pub battery_max_charge: f64,
    /// Sum of the battery reservations for this iteration
    pub battery_reserved: f64,
    pub changes: Vec<Change>,
    device: usize,
}

impl RouterCtx {
    pub fn new(now: Instant, power: f64, soc: f64, battery_max_charge: f64) -> Self {
        Self {
            now,
            power,
            soc,
            battery_max_charge,
            battery_reserved: 0.0,
            changes: Vec::new(),
            device: 0,
        }
    }

    /// Queue a change for the device currently taking power
    pub fn queue(&mut self, action: Action) {
        self.changes.push(Change {
            device: self.device,
            action,
        });
    }
}

/// Anything the router can hand power to
#[async_trait]
pub trait RoutableDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Higher goes first
    fn priority(&self) -> i32;

    fn is_online(&self) -> bool;

    /// Pick up the tuning of a newly activated profile
    fn reload_config(&mut self, profile: &RouterProfile);

    /// Refresh internal state; a wait reason defers this cycle's commit
    async fn run(&mut self, now: Instant, snapshot: &PowerSnapshot) -> Option<WaitReason>;

    /// Power the device consumes right now
    fn get_power(&self) -> f64;

    /// Power the device would give back if it were switched off
    fn get_releaseable_power(&self) -> f64;

    /// Take power from `ctx.power`, optionally queueing one change; returns
    /// the power the device will use after the change
    fn take_power(&mut self, ctx: &mut RouterCtx) -> f64;

    async fn commit(&mut self, action: Action, now: Instant) -> Result<()>;

    /// Power added to the raw excess before allocation
    fn excess_contribution(&self) -> f64 {
        0.0
    }

    /// Charge power held back for the battery at this SoC
    fn reserved_power(&self, _soc: f64, _max_charge: f64) -> f64 {
        0.0
    }

    /// Handle a telemetry or settings message; true if consumed
    async fn on_message(&mut self, _msg: &MqttMessage, _now: Instant) -> bool {
        false
    }

    /// Hair-trigger window requested by the last commit, if any
    fn take_hair_trigger(&mut self) -> Option<Duration> {
        None
    }

    async fn publish(&mut self);

    async fn shutdown(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    /// No fresh snapshot
    NoData,
    Idle,
    Waiting,
    Confirming,
    Committed,
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouterState::NoData => "no_data",
            RouterState::Idle => "idle",
            RouterState::Waiting => "waiting",
            RouterState::Confirming => "confirming",
            RouterState::Committed => "committed",
        };
        f.write_str(s)
    }
}

/// Outcome of one iteration
#[derive(Debug, Clone, PartialEq)]
pub struct Iteration {
    pub state: RouterState,
    pub excess: f64,
    /// Power left after the take phase
    pub remaining: f64,
    pub queued: Vec<Change>,
    pub committed: usize,
    pub waiting: Vec<WaitReason>,
}

impl Iteration {
    fn no_data() -> Self {
        Self {
            state: RouterState::NoData,
            excess: 0.0,
            remaining: 0.0,
            queued: Vec::new(),
            committed: 0,
            waiting: Vec::new(),
        }
    }
}

pub struct Router {
    config: SharedConfig,
    generation: u64,
    active: Setting<String>,
    profile: RouterProfile,
    export_target: Piecewise,
    snapshot_topic: String,
    max_age: Duration,
    devices: Vec<Box<dyn RoutableDevice>>,
    snapshot: Option<(PowerSnapshot, Instant)>,
    confirm: f64,
    last_tick: Option<Instant>,
    hair_trigger_until: Option<Instant>,
    state: RouterState,
    published_state: Option<RouterState>,
    excess: f64,
    remaining: f64,
    snapshot_errors: ErrorRateLimiter,
    mqtt: Mqtt,
    logger: StructuredLogger,
}

impl Router {
    pub fn new(config: SharedConfig, mqtt: Mqtt, devices: Vec<Box<dyn RoutableDevice>>) -> Result<Self> {
        let cfg = config.current();
        let profile = cfg.router_profile().cloned().ok_or_else(|| {
            PvError::config(format!("no router configuration named {}", cfg.router.active))
        })?;
        let mut router = Self {
            generation: config.generation(),
            active: Setting::new(
                "active_config",
                cfg.router.active.clone(),
                ACTIVE_CONFIG_COMMAND,
                ACTIVE_CONFIG_STATE,
            ),
            export_target: Piecewise::new(&profile.export_target),
            profile: profile.clone(),
            snapshot_topic: cfg.aggregator.snapshot_topic.clone(),
            max_age: Duration::from_secs_f64(cfg.router.snapshot_max_age_s.max(0.0)),
            devices,
            snapshot: None,
            confirm: 0.0,
            last_tick: None,
            hair_trigger_until: None,
            state: RouterState::NoData,
            published_state: None,
            excess: 0.0,
            remaining: 0.0,
            snapshot_errors: ErrorRateLimiter::new(3),
            mqtt,
            logger: get_logger("router"),
            config,
        };
        router.apply_profile(profile);
        Ok(router)
    }

    /// Router with the configured plugs, the battery and an optional EVSE
    pub fn from_config(config: SharedConfig, mqtt: Mqtt, evse: Option<Box<dyn EvseLink>>) -> Result<Self> {
        let cfg = config.current();
        let profile = cfg.router_profile().cloned().ok_or_else(|| {
            PvError::config(format!("no router configuration named {}", cfg.router.active))
        })?;
        let mut devices: Vec<Box<dyn RoutableDevice>> = Vec::new();
        if let Some(link) = evse {
            devices.push(Box::new(EvseController::new("evse", link, &profile, mqtt.clone())));
        }
        devices.push(Box::new(BatteryDevice::new(&profile, mqtt.clone())));
        for plug in &cfg.router.plugs {
            let p = profile.plugs.get(&plug.id).cloned().unwrap_or_default();
            devices.push(Box::new(PlugDevice::new(plug, &p, mqtt.clone())));
        }
        Self::new(config, mqtt, devices)
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    pub fn active_config(&self) -> String {
        self.active.get()
    }

    /// Device names in allocation order
    pub fn device_names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name().to_string()).collect()
    }

    pub fn device_power(&self, name: &str) -> Option<f64> {
        self.devices
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.get_power())
    }

    fn apply_profile(&mut self, profile: RouterProfile) {
        self.export_target = Piecewise::new(&profile.export_target);
        for d in self.devices.iter_mut() {
            d.reload_config(&profile);
        }
        // Stable: equal priorities keep their configured order
        self.devices.sort_by_key(|d| Reverse(d.priority()));
        self.profile = profile;
        self.confirm = 0.0;
    }

    /// Switch to another named configuration
    pub async fn select_config(&mut self, name: &str) -> Result<()> {
        let cfg = self.config.current();
        let profile = cfg
            .router
            .configs
            .get(name.trim())
            .cloned()
            .ok_or_else(|| PvError::setting("active_config", format!("unknown configuration {:?}", name)))?;
        self.active.apply(name)?;
        self.logger
            .info(&format!("Active configuration: {}", self.active.get()));
        self.apply_profile(profile);
        self.mqtt
            .publish_retained(ACTIVE_CONFIG_STATE, &self.active.payload())
            .await;
        Ok(())
    }

    /// Pick up a swapped configuration at the iteration boundary
    fn check_reload(&mut self) {
        let generation = self.config.generation();
        if generation == self.generation {
            return;
        }
        self.generation = generation;
        let cfg = self.config.current();
        // A user selection survives the reload while it still exists
        let name = if cfg.router.configs.contains_key(&self.active.get()) {
            self.active.get()
        } else {
            cfg.router.active.clone()
        };
        let Some(profile) = cfg.router.configs.get(&name).cloned() else {
            self.logger
                .warn(&format!("Reloaded configuration has no profile {}", name));
            return;
        };
        let _ = self.active.set(name);
        self.snapshot_topic = cfg.aggregator.snapshot_topic.clone();
        self.max_age = Duration::from_secs_f64(cfg.router.snapshot_max_age_s.max(0.0));
        self.logger.info(&format!(
            "Configuration generation {} applied ({})",
            generation,
            self.active.get()
        ));
        self.apply_profile(profile);
    }

    pub fn accept_snapshot(&mut self, snapshot: PowerSnapshot, now: Instant) {
        self.snapshot = Some((snapshot, now));
    }

    fn fresh_snapshot(&self, now: Instant) -> Option<PowerSnapshot> {
        let (s, at) = self.snapshot.as_ref()?;
        (now.saturating_duration_since(*at) <= self.max_age).then(|| s.clone())
    }

    /// Route one incoming message: snapshot, router setting or device topic
    pub async fn handle_message(&mut self, msg: &MqttMessage, now: Instant) {
        if msg.topic == self.snapshot_topic {
            match serde_json::from_slice::<PowerSnapshot>(&msg.payload) {
                Ok(s) => {
                    self.snapshot_errors.success(&self.logger);
                    self.accept_snapshot(s, now);
                }
                Err(e) => {
                    self.snapshot_errors
                        .failure(&self.logger, &format!("Bad snapshot: {}", e));
                }
            }
            return;
        }
        if msg.topic == ACTIVE_CONFIG_COMMAND {
            if let Some(name) = msg.text()
                && let Err(e) = self.select_config(name).await
            {
                self.logger.warn(&e.to_string());
            }
            return;
        }
        for d in self.devices.iter_mut() {
            if d.on_message(msg, now).await {
                return;
            }
        }
    }

    /// One allocation round
    pub async fn iterate(&mut self, now: Instant) -> Iteration {
        self.check_reload();
        let dt = self
            .last_tick
            .map_or(0.0, |t| now.saturating_duration_since(t).as_secs_f64());
        self.last_tick = Some(now);

        let Some(snapshot) = self.fresh_snapshot(now) else {
            self.confirm = 0.0;
            self.state = RouterState::NoData;
            self.publish().await;
            return Iteration::no_data();
        };

        let mut waiting = Vec::new();
        for d in self.devices.iter_mut() {
            if let Some(w) = d.run(now, &snapshot).await {
                waiting.push(w);
            }
        }

        let soc = snapshot.soc.unwrap_or(0.0);
        let max_charge = snapshot.battery_max_charge_power;
        let proxy: f64 = self.devices.iter().map(|d| d.excess_contribution()).sum();
        let excess =
            self.profile.offset_w - snapshot.meter_power_tweaked + proxy - self.export_target.eval(soc);

        let mut ctx = RouterCtx::new(now, excess, soc, max_charge);
        ctx.battery_reserved = self
            .devices
            .iter()
            .map(|d| d.reserved_power(soc, max_charge))
            .sum();
        for d in &self.devices {
            ctx.power += d.get_releaseable_power();
        }
        for (i, d) in self.devices.iter_mut().enumerate() {
            ctx.device = i;
            let taken = d.take_power(&mut ctx);
            ctx.power -= taken;
        }
        self.excess = excess;
        self.remaining = ctx.power;
        let queued = std::mem::take(&mut ctx.changes);

        let hair_trigger = self.hair_trigger_until.is_some_and(|t| now < t);
        let commit = if queued.is_empty() {
            self.confirm = 0.0;
            self.state = if waiting.is_empty() {
                RouterState::Idle
            } else {
                RouterState::Waiting
            };
            false
        } else if hair_trigger {
            true
        } else if !waiting.is_empty() {
            self.state = RouterState::Waiting;
            false
        } else {
            self.confirm += dt;
            self.state = RouterState::Confirming;
            self.confirm >= self.profile.confirm_s
        };

        let mut committed = 0;
        if commit {
            self.confirm = 0.0;
            committed = self.commit(&queued, now).await;
            self.state = RouterState::Committed;
        }
        self.publish().await;

        Iteration {
            state: self.state,
            excess,
            remaining: self.remaining,
            queued,
            committed,
            waiting,
        }
    }

    async fn commit(&mut self, changes: &[Change], now: Instant) -> usize {
        let mut done = 0;
        for change in changes {
            let Some(d) = self.devices.get_mut(change.device) else {
                continue;
            };
            match d.commit(change.action, now).await {
                Ok(()) => done += 1,
                Err(e) => self
                    .logger
                    .warn(&format!("{}: {:?} failed: {}", d.name(), change.action, e)),
            }
        }
        for d in self.devices.iter_mut() {
            if let Some(window) = d.take_hair_trigger() {
                let until = now + window;
                self.hair_trigger_until = Some(self.hair_trigger_until.map_or(until, |t| t.max(until)));
            }
        }
        done
    }

    async fn publish(&mut self) {
        if self.published_state != Some(self.state) {
            self.mqtt
                .publish_retained("pv/router/state", &self.state.to_string())
                .await;
            self.published_state = Some(self.state);
        }
        if self.state == RouterState::NoData {
            return;
        }
        self.mqtt.publish_value("pv/router/excess", self.excess).await;
        self.mqtt
            .publish_value("pv/router/remaining", self.remaining)
            .await;
        for d in self.devices.iter_mut() {
            d.publish().await;
        }
    }

    /// Topics the router listens to
    pub fn topics(&self) -> Vec<String> {
        vec![
            self.snapshot_topic.clone(),
            "tele/plugs/+/SENSOR".to_string(),
            "tele/plugs/+/LWT".to_string(),
            "stat/plugs/+/POWER".to_string(),
            "cmnd/pv/router/#".to_string(),
        ]
    }

    /// Iterate once per second until cancelled, then pause the devices
    pub async fn run(mut self, cancel: CancellationToken) {
        let topics = self.topics();
        let patterns: Vec<&str> = topics.iter().map(String::as_str).collect();
        let mut messages = self.mqtt.subscribe_all(&patterns, 64);
        self.mqtt
            .publish_retained(ACTIVE_CONFIG_STATE, &self.active.payload())
            .await;
        self.logger.info(&format!(
            "Router started with {} devices: {}",
            self.devices.len(),
            self.device_names().join(", ")
        ));

        let mut tick = tokio::time::interval(ITERATION_PERIOD);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(msg) = messages.recv() => self.handle_message(&msg, Instant::now()).await,
                _ = tick.tick() => {
                    self.iterate(Instant::now()).await;
                }
            }
        }
        self.shutdown().await;
    }

    pub async fn shutdown(&mut self) {
        for d in self.devices.iter_mut() {
            d.shutdown().await;
        }
        self.logger.info("Router stopped");
    }
}
