//! Power aggregation
//!
//! Runs once per main-meter power event: combines meter and inverter
//! readings into a [`PowerSnapshot`], feeds the fake meters and publishes
//! the snapshot for the router.

use crate::config::AggregatorConfig;
use crate::devices::{InverterReading, MeterReading};
use crate::error::Result;
use crate::fake_meter::{FakeMeterHandle, FakeMeterValues};
use crate::logging::{ErrorRateLimiter, StructuredLogger, get_logger};
use crate::mqtt::{Mqtt, MqttMessage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// A BMS SoC older than this is ignored in favour of the inverters' view
pub const BMS_SOC_MAX_AGE: Duration = Duration::from_secs(300);

/// Per-inverter share of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InverterPower {
    pub name: String,
    pub online: bool,
    pub pv_power: f64,
    pub grid_port_power: f64,
    pub input_power: f64,
    pub battery_power: f64,
    /// Active power handed to this inverter's fake meter
    pub fake_meter_power: Option<f64>,
}

/// Everything derived from one completed meter cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerSnapshot {
    pub meter_power: f64,
    pub meter_power_tweaked: f64,
    pub house_power: f64,
    pub total_pv_power: f64,
    pub total_battery_power: f64,
    pub total_grid_port_power: f64,
    pub total_input_power: f64,
    pub battery_max_charge_power: f64,
    pub soc: Option<f64>,
    pub voltage: [f64; 3],
    pub current: [f64; 3],
    pub frequency: f64,
    pub meter_online: bool,
    pub inverters: Vec<InverterPower>,
    /// Wall clock of the meter transaction (ms since the epoch)
    pub timestamp_ms: i64,
}

impl PowerSnapshot {
    pub fn online_inverters(&self) -> usize {
        self.inverters.iter().filter(|i| i.online).count()
    }
}

/// Online if the Modbus link is healthy and the inverter is running
/// on-grid, or if it polled its fake meter recently
pub fn inverter_online(r: &InverterReading, last_query: Option<Instant>, now: Instant, alive: Duration) -> bool {
    let via_modbus = r.online && r.powered_on && !r.offgrid;
    let via_meter_port = last_query.is_some_and(|q| now.saturating_duration_since(q) <= alive);
    via_modbus || via_meter_port
}

/// SoC-linked bias applied while the battery charges strongly
pub fn tweak(meter_power: f64, soc: f64, battery_power: f64, cfg: &AggregatorConfig) -> f64 {
    if battery_power > cfg.soc_bias_threshold_w {
        meter_power + soc * battery_power * cfg.soc_bias_coefficient
    } else {
        meter_power
    }
}

/// Active power served to one online inverter
pub fn fake_meter_power(tweaked: f64, online: usize, input: f64, total_input: f64, gain: f64) -> f64 {
    if online == 1 {
        tweaked
    } else {
        tweaked / 2.0 + gain * (input - total_input / 2.0)
    }
}

/// Inputs of one inverter for [`compute`]
pub struct InverterSample<'a> {
    pub reading: &'a InverterReading,
    pub online: bool,
}

/// Combine one meter cycle with the latest inverter readings
pub fn compute(meter: &MeterReading, inverters: &[InverterSample<'_>], soc: Option<f64>, cfg: &AggregatorConfig) -> PowerSnapshot {
    let sum = |f: fn(&InverterReading) -> f64| inverters.iter().map(|i| f(i.reading)).sum::<f64>();
    let total_pv_power = sum(|r| r.pv_power);
    let total_battery_power = sum(|r| r.battery_power);
    let total_grid_port_power = sum(|r| r.grid_port_power);
    let total_input_power = total_pv_power + total_grid_port_power;
    let battery_max_charge_power = sum(|r| r.battery_max_charge_current * r.battery_voltage);

    let meter_power = meter.total_power;
    let meter_power_tweaked = tweak(meter_power, soc.unwrap_or(0.0), total_battery_power, cfg);
    let online = inverters.iter().filter(|i| i.online).count();

    let per_inverter = inverters
        .iter()
        .map(|i| {
            let input_power = i.reading.input_power();
            InverterPower {
                name: i.reading.name.clone(),
                online: i.online,
                pv_power: i.reading.pv_power,
                grid_port_power: i.reading.grid_port_power,
                input_power,
                battery_power: i.reading.battery_power,
                fake_meter_power: i.online.then(|| {
                    fake_meter_power(meter_power_tweaked, online, input_power, total_input_power, cfg.balance_gain)
                }),
            }
        })
        .collect();

    PowerSnapshot {
        meter_power,
        meter_power_tweaked,
        house_power: meter_power - total_grid_port_power,
        total_pv_power,
        total_battery_power,
        total_grid_port_power,
        total_input_power,
        battery_max_charge_power,
        soc,
        voltage: meter.voltage,
        current: meter.current,
        frequency: meter.frequency,
        meter_online: meter.online,
        inverters: per_inverter,
        timestamp_ms: wall_clock_ms(meter.timestamp),
    }
}

/// Map a monotonic timestamp onto the wall clock
fn wall_clock_ms(at: Option<Instant>) -> i64 {
    let now_ms = chrono::Utc::now().timestamp_millis();
    match at {
        Some(t) => now_ms - Instant::now().saturating_duration_since(t).as_millis() as i64,
        None => now_ms,
    }
}

/// Source of one inverter's readings and its fake meter
#[derive(Clone)]
pub struct InverterFeed {
    pub readings: watch::Receiver<Arc<InverterReading>>,
    pub fake_meter: FakeMeterHandle,
}

pub struct Aggregator {
    cfg: AggregatorConfig,
    meter: watch::Receiver<Arc<MeterReading>>,
    inverters: Vec<InverterFeed>,
    mqtt: Mqtt,
    bms_soc: Option<(f64, Instant)>,
    tx: watch::Sender<Arc<PowerSnapshot>>,
    logger: StructuredLogger,
}

impl Aggregator {
    pub fn new(
        cfg: &AggregatorConfig,
        meter: watch::Receiver<Arc<MeterReading>>,
        inverters: Vec<InverterFeed>,
        mqtt: Mqtt,
    ) -> Self {
        let (tx, _) = watch::channel(Arc::new(PowerSnapshot::default()));
        Self {
            cfg: cfg.clone(),
            meter,
            inverters,
            mqtt,
            bms_soc: None,
            tx,
            logger: get_logger("aggregator"),
        }
    }

    /// Snapshot stream; each value is one complete cycle
    pub fn subscribe(&self) -> watch::Receiver<Arc<PowerSnapshot>> {
        self.tx.subscribe()
    }

    pub fn on_bms_soc(&mut self, msg: &MqttMessage, now: Instant) {
        if let Some(soc) = msg.number().filter(|s| (0.0..=100.0).contains(s)) {
            self.bms_soc = Some((soc, now));
        }
    }

    fn soc(&self, readings: &[Arc<InverterReading>], now: Instant) -> Option<f64> {
        if let Some((soc, at)) = self.bms_soc
            && now.saturating_duration_since(at) <= BMS_SOC_MAX_AGE
        {
            return Some(soc);
        }
        let known: Vec<f64> = readings.iter().filter(|r| r.online).filter_map(|r| r.soc).collect();
        (!known.is_empty()).then(|| known.iter().sum::<f64>() / known.len() as f64)
    }

    /// One aggregation cycle against the current meter reading
    pub async fn step(&mut self, now: Instant) -> Result<Arc<PowerSnapshot>> {
        let meter = self.meter.borrow_and_update().clone();
        let readings: Vec<Arc<InverterReading>> =
            self.inverters.iter().map(|f| f.readings.borrow().clone()).collect();
        let online: Vec<bool> = readings
            .iter()
            .zip(&self.inverters)
            .map(|(r, f)| {
                let last_query = f.fake_meter.lock().last_query();
                inverter_online(r, last_query, now, Duration::from_secs_f64(self.cfg.fake_meter_alive_s))
            })
            .collect();
        let samples: Vec<InverterSample<'_>> = readings
            .iter()
            .zip(&online)
            .map(|(r, &online)| InverterSample { reading: r, online })
            .collect();
        let soc = self.soc(&readings, now);
        let snapshot = Arc::new(compute(&meter, &samples, soc, &self.cfg));

        for (feed, share) in self.inverters.iter().zip(&snapshot.inverters) {
            let mut fake = feed.fake_meter.lock();
            match share.fake_meter_power {
                Some(power) => {
                    let values = FakeMeterValues {
                        active_power: power,
                        voltage: meter.voltage[0],
                        current: meter.current[0],
                        apparent_power: meter.apparent_power,
                        reactive_power: meter.reactive_power,
                        power_factor: meter.power_factor,
                        frequency: meter.frequency,
                        import_energy: meter.import_energy,
                        export_energy: meter.export_energy,
                    };
                    if let Err(e) = fake.update(&values, meter.timestamp, meter.online) {
                        self.logger
                            .warn(&format!("Fake meter {} update failed: {}", share.name, e));
                    }
                }
                None => fake.set_offline(),
            }
        }

        self.tx.send_replace(snapshot.clone());
        self.publish(&snapshot).await;
        Ok(snapshot)
    }

    async fn publish(&self, s: &PowerSnapshot) {
        let m = &self.mqtt;
        m.publish_value("pv/total_pv_power", s.total_pv_power).await;
        m.publish_value("pv/total_battery_power", s.total_battery_power).await;
        m.publish_value("pv/total_grid_port_power", s.total_grid_port_power).await;
        m.publish_value("pv/total_input_power", s.total_input_power).await;
        m.publish_value("pv/battery_max_charge_power", s.battery_max_charge_power).await;
        m.publish_value("pv/meter/house_power", s.house_power).await;
        for i in &s.inverters {
            if let Some(p) = i.fake_meter_power {
                m.publish_value(&format!("pv/{}/fakemeter/active_power", i.name), p).await;
            }
        }
        match serde_json::to_value(s) {
            Ok(v) => m.publish_json(&self.cfg.snapshot_topic, &v).await,
            Err(e) => self.logger.error(&format!("Snapshot serialization failed: {}", e)),
        }
    }

    /// Aggregate on every meter power event until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut soc_rx: mpsc::Receiver<MqttMessage> = self.mqtt.subscribe("pv/bms/soc", 8);
        let mut errors = ErrorRateLimiter::new(3);
        self.logger.info(&format!(
            "Aggregating {} inverter(s)",
            self.inverters.len()
        ));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = self.meter.changed() => {
                    if changed.is_err() {
                        self.logger.warn("Meter poller went away");
                        break;
                    }
                    match self.step(Instant::now()).await {
                        Ok(_) => errors.success(&self.logger),
                        Err(e) => {
                            errors.failure(&self.logger, &format!("Aggregation failed: {}", e));
                        }
                    }
                }
                Some(msg) = soc_rx.recv() => self.on_bms_soc(&msg, Instant::now()),
            }
        }
        self.logger.info("Aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inverter(name: &str, pv: f64, grid_port: f64) -> InverterReading {
        InverterReading {
            name: name.to_string(),
            online: true,
            powered_on: true,
            pv_power: pv,
            grid_port_power: grid_port,
            ..Default::default()
        }
    }

    #[test]
    fn test_tweak_only_above_threshold() {
        let cfg = AggregatorConfig::default();
        assert_eq!(tweak(-1000.0, 50.0, 200.0, &cfg), -1000.0);
        assert!((tweak(-1000.0, 50.0, 2000.0, &cfg) - -990.0).abs() < 1e-9);
    }

    #[test]
    fn test_balance_between_two_inverters() {
        let cfg = AggregatorConfig::default();
        let meter = MeterReading {
            online: true,
            total_power: -2000.0,
            ..Default::default()
        };
        let a = inverter("solis1", 300.0, 0.0);
        let b = inverter("solis2", 0.0, -300.0);
        let s = compute(
            &meter,
            &[
                InverterSample { reading: &a, online: true },
                InverterSample { reading: &b, online: true },
            ],
            Some(50.0),
            &cfg,
        );
        assert_eq!(s.total_input_power, s.total_pv_power + s.total_grid_port_power);
        assert_eq!(s.house_power, -1700.0);
        let p: Vec<f64> = s.inverters.iter().filter_map(|i| i.fake_meter_power).collect();
        assert!((p[0] - -985.0).abs() < 1e-9);
        assert!((p[1] - -1015.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_online_inverter_gets_full_power() {
        let cfg = AggregatorConfig::default();
        let meter = MeterReading {
            online: true,
            total_power: -2000.0,
            ..Default::default()
        };
        let a = inverter("solis1", 1000.0, 0.0);
        let b = inverter("solis2", 0.0, 0.0);
        let s = compute(
            &meter,
            &[
                InverterSample { reading: &a, online: true },
                InverterSample { reading: &b, online: false },
            ],
            None,
            &cfg,
        );
        assert_eq!(s.inverters[0].fake_meter_power, Some(-2000.0));
        assert_eq!(s.inverters[1].fake_meter_power, None);
        assert_eq!(s.online_inverters(), 1);
    }

    #[test]
    fn test_online_via_meter_port() {
        let now = Instant::now();
        let alive = Duration::from_secs(5);
        let mut r = inverter("solis1", 0.0, 0.0);
        assert!(inverter_online(&r, None, now, alive));
        r.offgrid = true;
        assert!(!inverter_online(&r, None, now, alive));
        assert!(inverter_online(&r, Some(now - Duration::from_secs(4)), now, alive));
        r.online = false;
        r.offgrid = false;
        assert!(!inverter_online(&r, Some(now - Duration::from_secs(6)), now, alive));
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let s = PowerSnapshot {
            meter_power: -1.5,
            soc: Some(80.0),
            inverters: vec![InverterPower {
                name: "solis1".into(),
                online: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        let back: PowerSnapshot = serde_json::from_str(&serde_json::to_string(&s).unwrap()).unwrap();
        assert_eq!(back, s);
    }
}
