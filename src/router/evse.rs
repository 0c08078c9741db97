//! Adaptive EVSE current-limit controller
//!
//! The only actuator is the EVSE current limit (6..=32 A, 0 pauses). A state
//! machine tracks the socket and the car; a PI-style loop turns the power the
//! router offers into a current limit, and a set of cooldowns keeps the car
//! from being flooded with commands. While the force-charge energy floor has
//! not been reached, the controller charges at a minimum current regardless
//! of excess.

use super::piecewise::Piecewise;
use super::{Action, RoutableDevice, RouterCtx, WaitReason};
use crate::aggregator::PowerSnapshot;
use crate::config::{EvseProfile, RouterProfile};
use crate::devices::evse::{EvseDevice, EvseStatus, SOCKET_PLUGGED};
use crate::error::Result;
use crate::logging::{ErrorRateLimiter, StructuredLogger, get_logger_for};
use crate::mqtt::{Mqtt, MqttMessage, Setting};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Used when the EVSE meter reports no voltage
pub const NOMINAL_VOLTAGE: f64 = 230.0;
/// Stop-charge ceiling after an unplug
pub const DEFAULT_STOP_CHARGE_KWH: u32 = 100;
pub const MAX_SESSION_KWH: u32 = 200;
const MAX_TICK: f64 = 10.0;

/// The EVSE as seen by the controller
#[async_trait]
pub trait EvseLink: Send + Sync {
    async fn poll(&mut self) -> Result<EvseStatus>;

    /// Write the current limit; 0 pauses
    async fn set_current_limit(&mut self, amps: f64) -> Result<()>;
}

#[async_trait]
impl EvseLink for EvseDevice {
    async fn poll(&mut self) -> Result<EvseStatus> {
        EvseDevice::poll(self).await
    }

    async fn set_current_limit(&mut self, amps: f64) -> Result<()> {
        EvseDevice::set_current_limit(self, amps).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvseState {
    Unplugged,
    Plugged,
    ChargeStarted,
    Charging,
    Finishing,
    Finished,
}

impl EvseState {
    pub fn is_charging(self) -> bool {
        matches!(
            self,
            EvseState::ChargeStarted | EvseState::Charging | EvseState::Finishing
        )
    }
}

impl fmt::Display for EvseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvseState::Unplugged => "UNPLUGGED",
            EvseState::Plugged => "PLUGGED",
            EvseState::ChargeStarted => "CHARGE_STARTED",
            EvseState::Charging => "CHARGING",
            EvseState::Finishing => "FINISHING",
            EvseState::Finished => "FINISHED",
        };
        f.write_str(s)
    }
}

fn seconds_since(t: Option<Instant>, now: Instant) -> f64 {
    t.map_or(f64::INFINITY, |t| now.saturating_duration_since(t).as_secs_f64())
}

fn round_amps(a: f64) -> f64 {
    (a * 10.0).round() / 10.0
}

pub struct EvseController {
    name: String,
    profile: EvseProfile,
    high_priority: Piecewise,
    link: Box<dyn EvseLink>,
    mqtt: Mqtt,
    logger: StructuredLogger,
    errors: ErrorRateLimiter,

    status: EvseStatus,
    state: EvseState,
    published_state: Option<EvseState>,
    plugged_since: Option<Instant>,
    unplugged_since: Option<Instant>,
    below_threshold_since: Option<Instant>,

    start_counter: f64,
    stop_counter: f64,
    integrator: f64,
    current_limit: f64,

    soft_start: Option<Instant>,
    last_command: Option<Instant>,
    last_small_command: Option<Instant>,
    last_down: Option<Instant>,
    last_write: Option<Instant>,
    hold_until: Option<Instant>,
    commanded_power: f64,
    history: VecDeque<f64>,
    last_run: Option<Instant>,
    now: Option<Instant>,
    dt: f64,
    hair_trigger: bool,

    force_charge_until_kwh: Setting<u32>,
    stop_charge_after_kwh: Setting<u32>,
    force_charge_minimum_a: Setting<f64>,
    settings_dirty: bool,
}

impl EvseController {
    pub fn new(name: &str, link: Box<dyn EvseLink>, profile: &RouterProfile, mqtt: Mqtt) -> Self {
        let setting = |key: &str| {
            (
                format!("cmnd/pv/router/evse/{}", key),
                format!("pv/router/evse/{}", key),
            )
        };
        let (force_cmd, force_state) = setting("force_charge_until_kwh");
        let (stop_cmd, stop_state) = setting("stop_charge_after_kwh");
        let (min_cmd, min_state) = setting("force_charge_minimum_a");
        Self {
            name: name.to_string(),
            profile: profile.evse.clone(),
            high_priority: Piecewise::new(&profile.evse.high_priority_power),
            link,
            mqtt,
            logger: get_logger_for("router", name),
            errors: ErrorRateLimiter::new(3),
            status: EvseStatus::default(),
            state: EvseState::Unplugged,
            published_state: None,
            plugged_since: None,
            unplugged_since: None,
            below_threshold_since: None,
            start_counter: 0.0,
            stop_counter: 0.0,
            integrator: 0.0,
            current_limit: 0.0,
            soft_start: None,
            last_command: None,
            last_small_command: None,
            last_down: None,
            last_write: None,
            hold_until: None,
            commanded_power: 0.0,
            history: VecDeque::new(),
            last_run: None,
            now: None,
            dt: 0.0,
            hair_trigger: false,
            force_charge_until_kwh: Setting::new("force_charge_until_kwh", 0, &force_cmd, &force_state)
                .with_range(0, MAX_SESSION_KWH),
            stop_charge_after_kwh: Setting::new(
                "stop_charge_after_kwh",
                DEFAULT_STOP_CHARGE_KWH,
                &stop_cmd,
                &stop_state,
            )
            .with_range(0, MAX_SESSION_KWH),
            force_charge_minimum_a: Setting::new(
                "force_charge_minimum_a",
                profile.evse.force_charge_minimum_a,
                &min_cmd,
                &min_state,
            )
            .with_range(6.0, 32.0),
            settings_dirty: true,
        }
    }

    pub fn state(&self) -> EvseState {
        self.state
    }

    pub fn current_limit(&self) -> f64 {
        self.current_limit
    }

    pub fn status(&self) -> &EvseStatus {
        &self.status
    }

    pub fn force_charge_until_kwh(&self) -> u32 {
        self.force_charge_until_kwh.get()
    }

    pub fn stop_charge_after_kwh(&self) -> u32 {
        self.stop_charge_after_kwh.get()
    }

    fn enter(&mut self, state: EvseState) {
        if state != self.state {
            self.logger
                .info(&format!("{} -> {}", self.state, state));
            self.state = state;
        }
    }

    fn reset_counters(&mut self) {
        self.start_counter = 0.0;
        self.stop_counter = 0.0;
        self.integrator = 0.0;
    }

    fn forced(&self) -> bool {
        self.status.energy < f64::from(self.force_charge_until_kwh.get())
    }

    fn voltage(&self) -> f64 {
        if self.status.voltage > 100.0 {
            self.status.voltage
        } else {
            NOMINAL_VOLTAGE
        }
    }

    fn hold_active(&self) -> bool {
        match (self.hold_until, self.now) {
            (Some(until), Some(now)) => now < until,
            _ => false,
        }
    }

    /// Allowed current range right now
    ///
    /// The lower bound is `i_start`, raised to the force-charge minimum below
    /// the energy floor; the upper bound ramps from `i_start` to `i_max`
    /// during soft start and caps the lower one.
    pub fn bounds(&self, now: Instant) -> (f64, f64) {
        let p = &self.profile;
        let min = if self.forced() {
            p.i_start_a.max(self.force_charge_minimum_a.get())
        } else {
            p.i_start_a
        };
        let max = match self.soft_start {
            Some(t) if p.soft_start_s > 0.0 => {
                let f = (seconds_since(Some(t), now) / p.soft_start_s).clamp(0.0, 1.0);
                p.i_start_a + (p.i_max_a - p.i_start_a) * f
            }
            _ => p.i_max_a,
        };
        (min.min(max), max)
    }

    fn is_stable(&self) -> bool {
        let max = self.history.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = self.history.iter().cloned().fold(f64::INFINITY, f64::min);
        self.history.len() < 2 || max - min < self.profile.stability_threshold_w
    }

    fn may_command(&self, now: Instant, delta: f64) -> bool {
        let p = &self.profile;
        if delta.abs() < p.small_current_step_a
            && seconds_since(self.last_small_command, now) < p.command_interval_small_s
        {
            return false;
        }
        if delta > 0.0 && seconds_since(self.last_down, now) < p.up_inhibit_s {
            return false;
        }
        if seconds_since(self.last_command, now) < p.command_interval_s {
            return false;
        }
        self.is_stable()
    }

    fn track_socket(&mut self, now: Instant) {
        if self.status.socket_state == SOCKET_PLUGGED {
            self.unplugged_since = None;
            let since = *self.plugged_since.get_or_insert(now);
            if self.state == EvseState::Unplugged
                && seconds_since(Some(since), now) >= self.profile.plug_detect_s
            {
                self.enter(EvseState::Plugged);
            }
            return;
        }
        self.plugged_since = None;
        let since = *self.unplugged_since.get_or_insert(now);
        if self.state != EvseState::Unplugged
            && seconds_since(Some(since), now) >= self.profile.unplug_timeout_s
        {
            self.enter(EvseState::Unplugged);
            self.reset_counters();
            self.soft_start = None;
            self.below_threshold_since = None;
            // Session settings do not survive the car leaving
            let _ = self.force_charge_until_kwh.set(0);
            let _ = self.stop_charge_after_kwh.set(DEFAULT_STOP_CHARGE_KWH);
            self.settings_dirty = true;
        }
    }

    fn track_charge(&mut self, now: Instant) {
        let threshold = self.profile.charge_detect_threshold_w;
        let power = self.status.power;
        match self.state {
            EvseState::ChargeStarted if power > threshold => self.enter(EvseState::Charging),
            EvseState::Charging => {
                if power < threshold {
                    let since = *self.below_threshold_since.get_or_insert(now);
                    if seconds_since(Some(since), now) >= self.profile.end_of_charge_timeout_s {
                        self.enter(EvseState::Finishing);
                    }
                } else {
                    self.below_threshold_since = None;
                }
            }
            EvseState::Finishing if power > threshold => {
                self.below_threshold_since = None;
                self.enter(EvseState::Charging);
            }
            _ => {}
        }
        if self.state.is_charging()
            && self.status.energy >= f64::from(self.stop_charge_after_kwh.get())
        {
            self.logger.info(&format!(
                "Stop-charge energy reached ({:.1} kWh)",
                self.status.energy
            ));
            self.enter(EvseState::Finished);
        }
    }

    async fn keepalive(&mut self, now: Instant) {
        if seconds_since(self.last_write, now) < self.profile.keepalive_s {
            return;
        }
        match self.link.set_current_limit(self.current_limit).await {
            Ok(()) => self.last_write = Some(now),
            Err(e) => self
                .logger
                .warn(&format!("Current limit keep-alive failed: {}", e)),
        }
    }

    fn take_while_paused(&mut self, ctx: &mut RouterCtx, avail: f64, voltage: f64) -> f64 {
        let p = &self.profile;
        if self.forced() {
            self.start_counter = p.start_counter_max;
        } else if avail >= p.start_excess_threshold_w {
            self.start_counter = (self.start_counter + self.dt).min(p.start_counter_max);
        } else {
            self.start_counter = (self.start_counter - self.dt).max(0.0);
        }
        if self.start_counter < p.start_counter_max {
            return 0.0;
        }
        // Soft start restarts on resume, so the first step is always i_start
        let amps = p.i_start_a;
        ctx.queue(Action::SetCurrent(amps));
        amps * voltage
    }

    fn take_while_charging(&mut self, ctx: &mut RouterCtx, avail: f64, voltage: f64) -> f64 {
        let now = ctx.now;
        let p = self.profile.clone();
        let (lo, hi) = self.bounds(now);

        let error = avail - self.get_power();
        self.integrator =
            (self.integrator + error * p.control_gain_i * self.dt).clamp(-p.integrator_max_w, p.integrator_max_w);
        let wanted = (avail + self.integrator) * p.control_gain_p / voltage;

        if wanted < lo && !self.forced() {
            self.stop_counter = (self.stop_counter - self.dt).max(-p.stop_counter_max);
        } else {
            self.stop_counter = (self.stop_counter + self.dt).min(p.stop_counter_max);
        }
        if self.stop_counter <= -p.stop_counter_max {
            ctx.queue(Action::Pause);
            return 0.0;
        }

        let target = round_amps(wanted).clamp(lo, hi);
        let delta = target - self.current_limit;
        if delta.abs() < 0.05 || !self.may_command(now, delta) {
            return self.get_power();
        }
        ctx.queue(Action::SetCurrent(target));
        target * voltage
    }

    async fn apply_setting(&mut self, msg: &MqttMessage) -> bool {
        let Some(text) = msg.text() else {
            return false;
        };
        let topic = msg.topic.as_str();
        let result = if topic == self.force_charge_until_kwh.command_topic() {
            self.force_charge_until_kwh.apply(text).map(|force| {
                if force > self.stop_charge_after_kwh.get() {
                    let _ = self.stop_charge_after_kwh.set(force);
                }
            })
        } else if topic == self.stop_charge_after_kwh.command_topic() {
            self.stop_charge_after_kwh.apply(text).map(|stop| {
                if stop < self.force_charge_until_kwh.get() {
                    let _ = self.force_charge_until_kwh.set(stop);
                }
                if self.state == EvseState::Finished {
                    self.enter(EvseState::Plugged);
                }
            })
        } else if topic == self.force_charge_minimum_a.command_topic() {
            self.force_charge_minimum_a.apply(text).map(|_| ())
        } else {
            return false;
        };
        match result {
            Ok(()) => {
                self.settings_dirty = true;
                self.publish_settings().await;
            }
            Err(e) => self.logger.warn(&e.to_string()),
        }
        true
    }

    async fn publish_settings(&mut self) {
        for (topic, payload) in [
            (
                self.force_charge_until_kwh.state_topic().to_string(),
                self.force_charge_until_kwh.payload(),
            ),
            (
                self.stop_charge_after_kwh.state_topic().to_string(),
                self.stop_charge_after_kwh.payload(),
            ),
            (
                self.force_charge_minimum_a.state_topic().to_string(),
                self.force_charge_minimum_a.payload(),
            ),
        ] {
            self.mqtt.publish_retained(&topic, &payload).await;
        }
        self.settings_dirty = false;
    }
}

#[async_trait]
impl RoutableDevice for EvseController {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.profile.priority
    }

    fn is_online(&self) -> bool {
        self.status.online
    }

    fn reload_config(&mut self, profile: &RouterProfile) {
        self.profile = profile.evse.clone();
        self.high_priority = Piecewise::new(&profile.evse.high_priority_power);
        while self.history.len() > self.profile.stability_window.max(1) {
            self.history.pop_front();
        }
    }

    async fn run(&mut self, now: Instant, _snapshot: &PowerSnapshot) -> Option<WaitReason> {
        self.dt = seconds_since(self.last_run, now).min(MAX_TICK);
        if self.last_run.is_none() {
            self.dt = 0.0;
        }
        self.last_run = Some(now);
        self.now = Some(now);

        match self.link.poll().await {
            Ok(status) => {
                self.errors.success(&self.logger);
                self.status = status;
            }
            Err(e) => {
                self.errors.failure(&self.logger, &e.to_string());
                self.status.online = false;
            }
        }
        if !self.status.online {
            return None;
        }

        self.history.push_back(self.status.power);
        while self.history.len() > self.profile.stability_window.max(1) {
            self.history.pop_front();
        }
        self.track_socket(now);
        self.track_charge(now);
        self.keepalive(now).await;

        if self.hold_active() {
            return Some(WaitReason::new(&self.name, "current limit settling"));
        }
        None
    }

    /// Measured car power, or the commanded power while the car ramps up
    fn get_power(&self) -> f64 {
        if !self.status.online {
            return 0.0;
        }
        if self.hold_active() {
            return self.commanded_power.max(self.status.power);
        }
        self.status.power
    }

    fn get_releaseable_power(&self) -> f64 {
        if self.profile.enabled { self.get_power() } else { 0.0 }
    }

    fn take_power(&mut self, ctx: &mut RouterCtx) -> f64 {
        if !self.status.online {
            return 0.0;
        }
        if !self.profile.enabled || matches!(self.state, EvseState::Unplugged | EvseState::Finished) {
            if self.current_limit > 0.0 {
                ctx.queue(Action::Pause);
            }
            return 0.0;
        }
        let voltage = self.voltage();
        // The EVSE may only eat into the battery reservation up to the
        // high-priority allowance
        let battery_share = (ctx.battery_reserved - self.high_priority.eval(ctx.soc)).max(0.0);
        let avail = ctx.power - battery_share;
        if self.current_limit <= 0.0 {
            self.take_while_paused(ctx, avail, voltage)
        } else {
            self.take_while_charging(ctx, avail, voltage)
        }
    }

    async fn commit(&mut self, action: Action, now: Instant) -> Result<()> {
        let amps = match action {
            Action::Pause => 0.0,
            Action::SetCurrent(a) => a,
            Action::Switch(_) => return Ok(()),
        };
        self.link.set_current_limit(amps).await?;
        let previous = self.current_limit;
        self.current_limit = amps;
        self.last_write = Some(now);

        if amps <= 0.0 {
            self.logger.info("Charge paused");
            self.reset_counters();
            self.soft_start = None;
            self.hold_until = None;
            self.commanded_power = 0.0;
            if self.state.is_charging() {
                self.enter(EvseState::Plugged);
            }
            self.hair_trigger = previous > 0.0;
            return Ok(());
        }

        if previous <= 0.0 {
            self.logger
                .info(&format!("Charge resumed at {:.1} A", amps));
            self.reset_counters();
            self.soft_start = Some(now);
            if self.state == EvseState::Plugged {
                self.enter(EvseState::ChargeStarted);
            }
            self.hair_trigger = true;
        } else {
            let delta = amps - previous;
            if delta.abs() < self.profile.small_current_step_a {
                self.last_small_command = Some(now);
            }
            if delta < 0.0 {
                self.last_down = Some(now);
            }
        }
        self.last_command = Some(now);
        self.commanded_power = amps * self.voltage();
        self.hold_until = Some(now + Duration::from_secs_f64(self.profile.power_report_hold_s.max(0.0)));
        Ok(())
    }

    async fn on_message(&mut self, msg: &MqttMessage, _now: Instant) -> bool {
        self.apply_setting(msg).await
    }

    fn take_hair_trigger(&mut self) -> Option<Duration> {
        if std::mem::take(&mut self.hair_trigger) {
            Some(Duration::from_secs_f64(self.profile.hair_trigger_s.max(0.0)))
        } else {
            None
        }
    }

    async fn publish(&mut self) {
        if self.settings_dirty {
            self.publish_settings().await;
        }
        if self.published_state != Some(self.state) {
            self.mqtt
                .publish_retained("pv/router/evse/state", &self.state.to_string())
                .await;
            self.published_state = Some(self.state);
        }
        let values = [
            ("current_limit", self.current_limit),
            ("power", self.get_power()),
            ("energy", self.status.energy),
            ("start_counter", self.start_counter),
            ("stop_counter", self.stop_counter),
            ("integrator", self.integrator),
        ];
        for (key, v) in values {
            self.mqtt
                .publish_value(&format!("pv/router/evse/{}", key), v)
                .await;
        }
        self.mqtt
            .publish_flag("pv/router/evse/online", self.status.online)
            .await;
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.link.set_current_limit(0.0).await {
            self.logger
                .error(&format!("Could not pause the EVSE on shutdown: {}", e));
            return;
        }
        self.current_limit = 0.0;
        self.logger.info("EVSE paused for shutdown");
    }
}
