//! Hybrid inverter driver (Solis S5-EH1P style register map)
//!
//! Owns the inverter and its grid-port meter, which share one RS-485 segment.

use super::local_meter::LocalMeter;
use crate::config::{FakeMeterClass, InverterConfig};
use crate::error::{PvError, Result};
use crate::logging::{ErrorRateLimiter, StructuredLogger, get_logger_for};
use crate::modbus::{FunctionCode, RegisterDescriptor, SlaveDevice, WireType};
use crate::mqtt::{Mqtt, MqttMessage};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Clock drift tolerated before the RTC is rewritten
pub const CLOCK_ADJUST_THRESHOLD_S: i64 = 2;
/// Larger drift means the host clock is probably wrong
pub const CLOCK_REFUSE_THRESHOLD_S: i64 = 4000;

pub const POWER_ON: f64 = 0xBE as f64;
pub const POWER_OFF: f64 = 0xDE as f64;

const FAULT_BITS: &[&str] = &[
    "no_grid",
    "grid_overvoltage",
    "grid_undervoltage",
    "grid_overfrequency",
    "grid_underfrequency",
    "grid_impedance",
    "grid_frequency_fluctuation",
    "grid_current_fluctuation",
];

pub fn register_table() -> Vec<RegisterDescriptor> {
    let input = RegisterDescriptor::input;
    let holding = RegisterDescriptor::holding;
    vec![
        input("energy_total", 33029, WireType::U32).unit("kWh"),
        input("energy_today", 33035, WireType::U16).scaled(0.1, 1).unit("kWh"),
        input("mppt1_voltage", 33049, WireType::U16).scaled(0.1, 1).unit("V"),
        input("mppt1_current", 33050, WireType::U16).scaled(0.1, 1).unit("A"),
        input("mppt2_voltage", 33051, WireType::U16).scaled(0.1, 1).unit("V"),
        input("mppt2_current", 33052, WireType::U16).scaled(0.1, 1).unit("A"),
        input("pv_power", 33057, WireType::U32).unit("W"),
        input("inverter_temperature", 33093, WireType::I16).scaled(0.1, 1).unit("°C"),
        input("grid_frequency", 33094, WireType::U16).scaled(0.01, 2).unit("Hz"),
        input("fault_1", 33116, WireType::U16).bitfield(FAULT_BITS),
        input("operating_status", 33121, WireType::U16),
        input("battery_voltage", 33133, WireType::U16).scaled(0.1, 1).unit("V"),
        input("battery_current", 33134, WireType::U16).scaled(0.1, 1).unit("A"),
        input("battery_direction", 33135, WireType::U16),
        input("bms_soc", 33139, WireType::U16).unit("%"),
        input("bms_soh", 33140, WireType::U16).unit("%"),
        input("battery_max_charge_current", 33206, WireType::U16).scaled(0.1, 1).unit("A"),
        input("battery_max_discharge_current", 33207, WireType::U16).scaled(0.1, 1).unit("A"),
        holding("rtc_year", 43000, WireType::U16),
        holding("rtc_month", 43001, WireType::U16),
        holding("rtc_day", 43002, WireType::U16),
        holding("rtc_hour", 43003, WireType::U16),
        holding("rtc_minute", 43004, WireType::U16),
        holding("rtc_second", 43005, WireType::U16),
        holding("power_on_off", 43007, WireType::U16),
        holding("meter_type", 43073, WireType::U16),
        holding("storage_mode", 43110, WireType::U16),
    ]
}

const FAST: &[&str] = &[
    "mppt1_voltage",
    "mppt1_current",
    "mppt2_voltage",
    "mppt2_current",
    "pv_power",
    "battery_voltage",
    "battery_current",
    "battery_direction",
    "bms_soc",
];

const SLOW: [&[&str]; 3] = [
    &["battery_max_charge_current", "battery_max_discharge_current", "bms_soh"],
    &["energy_total", "energy_today", "inverter_temperature", "grid_frequency"],
    &["fault_1", "operating_status", "power_on_off", "storage_mode"],
];

const RTC: [&str; 6] = [
    "rtc_year",
    "rtc_month",
    "rtc_day",
    "rtc_hour",
    "rtc_minute",
    "rtc_second",
];

/// Meter type register value matching a fake meter class
pub fn meter_type_for(class: FakeMeterClass, configured: u16) -> u16 {
    if configured != 0 {
        return configured;
    }
    class.meter_type_code()
}

/// Outcome of the startup clock check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockAction {
    InSync,
    Adjusted { drift_s: i64 },
    Refused { drift_s: i64 },
}

/// One MPPT string
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Mppt {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

/// Inverter and grid-port state after one poll cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct InverterReading {
    pub name: String,
    /// Modbus link to the inverter is up
    pub online: bool,
    /// Not explicitly powered off
    pub powered_on: bool,
    pub offgrid: bool,
    pub pv_power: f64,
    pub mppt: [Mppt; 2],
    pub battery_voltage: f64,
    /// Positive while charging
    pub battery_current: f64,
    /// Positive while charging
    pub battery_power: f64,
    pub battery_max_charge_current: f64,
    pub soc: Option<f64>,
    /// Grid-port meter active power
    pub grid_port_power: f64,
    pub grid_port_online: bool,
    pub cycle: u64,
    #[serde(skip)]
    pub timestamp: Option<Instant>,
}

impl InverterReading {
    /// PV plus grid-port power
    pub fn input_power(&self) -> f64 {
        self.pv_power + self.grid_port_power
    }
}

/// Register access command received over MQTT
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterCommand {
    pub addr: Option<u16>,
    pub key: Option<String>,
    pub value: Option<f64>,
}

pub struct InverterDriver {
    name: String,
    inverter: SlaveDevice,
    meter: LocalMeter,
    meter_type: u16,
    mqtt: Mqtt,
    interval: Duration,
    phase: usize,
    cycle: u64,
    tx: watch::Sender<Arc<InverterReading>>,
    logger: StructuredLogger,
}

impl InverterDriver {
    pub fn new(cfg: &InverterConfig, inverter: SlaveDevice, meter: LocalMeter, mqtt: Mqtt) -> Self {
        let (tx, _) = watch::channel(Arc::new(InverterReading {
            name: cfg.name.clone(),
            ..Default::default()
        }));
        Self {
            name: cfg.name.clone(),
            inverter,
            meter,
            meter_type: meter_type_for(cfg.fake_meter.meter_class, cfg.meter_type_value),
            mqtt,
            interval: Duration::from_millis(cfg.poll_interval_ms),
            phase: 0,
            cycle: 0,
            tx,
            logger: get_logger_for("inverter", &cfg.name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-cycle event carrying the latest reading
    pub fn subscribe(&self) -> watch::Receiver<Arc<InverterReading>> {
        self.tx.subscribe()
    }

    pub fn inverter(&self) -> &SlaveDevice {
        &self.inverter
    }

    /// Compare the inverter RTC with `host` and rewrite it on drift
    pub async fn adjust_clock(&mut self, host: NaiveDateTime) -> Result<ClockAction> {
        self.inverter.read(&RTC).await?;
        let v = |n: &str| self.inverter.value(n).unwrap_or(0.0) as u32;
        let inverter_time = NaiveDate::from_ymd_opt(2000 + v("rtc_year") as i32, v("rtc_month"), v("rtc_day"))
            .and_then(|d| d.and_hms_opt(v("rtc_hour"), v("rtc_minute"), v("rtc_second")));
        let drift_s = match inverter_time {
            Some(t) => (host - t).num_seconds(),
            // Garbage in the RTC: treat as out of sync but correctable
            None => CLOCK_ADJUST_THRESHOLD_S + 1,
        };
        if drift_s.abs() <= CLOCK_ADJUST_THRESHOLD_S {
            return Ok(ClockAction::InSync);
        }
        if drift_s.abs() > CLOCK_REFUSE_THRESHOLD_S {
            self.logger.warn(&format!(
                "Inverter clock differs by {} s, host clock suspect; not adjusting",
                drift_s
            ));
            return Ok(ClockAction::Refused { drift_s });
        }
        let values = [
            ("rtc_year", (host.year() - 2000) as f64),
            ("rtc_month", host.month() as f64),
            ("rtc_day", host.day() as f64),
            ("rtc_hour", host.hour() as f64),
            ("rtc_minute", host.minute() as f64),
            ("rtc_second", host.second() as f64),
        ];
        self.inverter.write(&values).await?;
        self.logger
            .info(&format!("Adjusted inverter clock by {} s", drift_s));
        Ok(ClockAction::Adjusted { drift_s })
    }

    /// Point the inverter at the fake meter class we serve
    pub async fn configure_meter_type(&mut self) -> Result<bool> {
        self.inverter.read(&["meter_type"]).await?;
        let changed = self
            .inverter
            .write_if_changed("meter_type", self.meter_type as f64)
            .await?;
        if changed {
            self.logger
                .info(&format!("Meter type set to {:#06x}", self.meter_type));
        }
        Ok(changed)
    }

    pub async fn startup(&mut self) {
        let host = chrono::Local::now().naive_local();
        if let Err(e) = self.adjust_clock(host).await {
            self.logger.warn(&format!("Clock check failed: {}", e));
        }
        if let Err(e) = self.configure_meter_type().await {
            self.logger.warn(&format!("Meter type configuration failed: {}", e));
        }
    }

    /// One cycle: fast set plus one rotating slow set, then the grid-port meter
    pub async fn poll_once(&mut self) -> Result<Arc<InverterReading>> {
        let mut names: Vec<&str> = FAST.to_vec();
        names.extend_from_slice(SLOW[self.phase]);
        self.phase = (self.phase + 1) % SLOW.len();
        let inverter_result = self.inverter.read(&names).await;

        let powered_on = self.powered_on();
        // Grid-port meter errors are absorbed; the reading carries the flag
        if let Err(e) = self.meter.poll(self.inverter.is_online() && powered_on).await {
            self.logger.debug(&format!("Grid-port meter: {}", e));
        }

        self.cycle += 1;
        let reading = Arc::new(self.build_reading());
        self.tx.send_replace(reading.clone());
        self.publish(&reading).await;
        inverter_result.map(|_| reading)
    }

    fn powered_on(&self) -> bool {
        self.inverter.value("power_on_off") != Some(POWER_OFF)
    }

    fn build_reading(&self) -> InverterReading {
        let v = |n: &str| self.inverter.value(n).unwrap_or(0.0);
        let direction_sign = if v("battery_direction") == 0.0 { 1.0 } else { -1.0 };
        let battery_current = v("battery_current") * direction_sign;
        let battery_voltage = v("battery_voltage");
        let mppt = |i: usize| {
            let voltage = v(&format!("mppt{}_voltage", i));
            let current = v(&format!("mppt{}_current", i));
            Mppt {
                voltage,
                current,
                power: voltage * current,
            }
        };
        InverterReading {
            name: self.name.clone(),
            online: self.inverter.is_online(),
            powered_on: self.powered_on(),
            offgrid: self.meter.is_offgrid(),
            pv_power: v("pv_power"),
            mppt: [mppt(1), mppt(2)],
            battery_voltage,
            battery_current,
            battery_power: battery_current * battery_voltage,
            battery_max_charge_current: v("battery_max_charge_current"),
            soc: self.inverter.value("bms_soc"),
            grid_port_power: self.meter.active_power().unwrap_or(0.0),
            grid_port_online: self.meter.device().is_online(),
            cycle: self.cycle,
            timestamp: self.inverter.last_transaction(),
        }
    }

    async fn publish(&self, r: &InverterReading) {
        let m = &self.mqtt;
        let t = |s: &str| format!("pv/{}/{}", self.name, s);
        m.publish_flag(&t("online"), r.online).await;
        if !r.online {
            return;
        }
        m.publish_value(&t("pv_power"), r.pv_power).await;
        for (i, s) in r.mppt.iter().enumerate() {
            m.publish_value(&t(&format!("mppt{}_power", i + 1)), s.power).await;
            m.publish_value(&t(&format!("mppt{}_voltage", i + 1)), s.voltage).await;
        }
        m.publish_value(&t("battery_voltage"), r.battery_voltage).await;
        m.publish_value(&t("battery_current"), r.battery_current).await;
        m.publish_value(&t("battery_power"), r.battery_power).await;
        m.publish_value(&t("battery_max_charge_current"), r.battery_max_charge_current)
            .await;
        m.publish_value(&t("meter/active_power"), r.grid_port_power).await;
        m.publish_flag(&t("offgrid"), r.offgrid).await;
        for reg in self.inverter.registers() {
            if matches!(reg.name(), "inverter_temperature" | "energy_today" | "energy_total")
                && let Some(v) = reg.display_value()
            {
                m.publish_value(&t(reg.name()), v).await;
            }
        }
    }

    /// Handle `cmnd/pv/<inv>/read_register` and `.../write_register`
    pub async fn handle_command(&mut self, msg: &MqttMessage) -> Result<serde_json::Value> {
        let cmd: RegisterCommand = serde_json::from_slice(&msg.payload)?;
        let write = msg.topic.ends_with("/write_register");
        if !write && !msg.topic.ends_with("/read_register") {
            return Err(PvError::protocol(format!("unknown command {}", msg.topic)));
        }

        let known = match (&cmd.key, cmd.addr) {
            (Some(k), _) => Some(
                self.inverter
                    .register(k)
                    .map(|r| r.name())
                    .ok_or_else(|| PvError::generic(format!("no register named {}", k)))?,
            ),
            (None, Some(a)) => self.inverter.register_at(a).map(|r| r.name()),
            (None, None) => return Err(PvError::protocol("command needs addr or key")),
        };

        match (write, known) {
            (false, Some(name)) => {
                self.inverter.read(&[name]).await?;
                let r = self
                    .inverter
                    .register(name)
                    .ok_or_else(|| PvError::generic("register vanished"))?;
                Ok(serde_json::json!({
                    "key": name,
                    "addr": r.desc.address,
                    "value": r.value(),
                    "raw": r.raw(),
                }))
            }
            (false, None) => {
                let addr = cmd.addr.unwrap_or_default();
                let function = if addr >= 40000 {
                    FunctionCode::Holding
                } else {
                    FunctionCode::Input
                };
                let raw = self.inverter.read_raw(function, addr, 1).await?;
                Ok(serde_json::json!({ "addr": addr, "raw": raw }))
            }
            (true, known) => {
                let value = cmd
                    .value
                    .ok_or_else(|| PvError::setting("value", "write needs a value"))?;
                match known {
                    Some(name) => self.inverter.write(&[(name, value)]).await?,
                    None => {
                        let addr = cmd.addr.unwrap_or_default();
                        if !(0.0..=65535.0).contains(&value) {
                            return Err(PvError::setting("value", "raw word out of range"));
                        }
                        self.inverter.write_raw(addr, &[value as u16]).await?
                    }
                }
                self.logger
                    .info(&format!("Register write {:?} = {}", cmd.key.or(known.map(String::from)), value));
                Ok(serde_json::json!({ "addr": cmd.addr, "value": value, "written": true }))
            }
        }
    }

    /// Poll until cancelled, serving register commands between cycles
    pub async fn run(mut self, mut commands: mpsc::Receiver<MqttMessage>, cancel: CancellationToken) {
        self.startup().await;
        let mut errors = ErrorRateLimiter::new(3);
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    match self.poll_once().await {
                        Ok(_) => errors.success(&self.logger),
                        Err(e) => {
                            errors.failure(&self.logger, &format!("Poll failed: {}", e));
                        }
                    }
                }
                Some(msg) = commands.recv() => {
                    let reply = match self.handle_command(&msg).await {
                        Ok(v) => v,
                        Err(e) => serde_json::json!({ "error": e.to_string() }),
                    };
                    self.mqtt
                        .publish_json(&format!("pv/{}/register_reply", self.name), &reply)
                        .await;
                }
            }
        }
        self.logger.info("Inverter driver stopped");
    }
}
