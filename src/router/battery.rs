//! Battery charge reservation

use super::average::MovingAverage;
use super::piecewise::Piecewise;
use super::{Action, RoutableDevice, RouterCtx, WaitReason};
use crate::aggregator::PowerSnapshot;
use crate::config::{BatteryProfile, RouterProfile};
use crate::error::Result;
use crate::mqtt::Mqtt;
use async_trait::async_trait;
use std::time::{Duration, Instant};

/// Reserves charge power for the battery as a function of SoC
///
/// The battery is never switched; it only shapes the excess (its charge
/// power is added back while it is actually moving power) and keeps a slice
/// of it away from lower-priority loads.
pub struct BatteryDevice {
    profile: BatteryProfile,
    reserve: Piecewise,
    active: MovingAverage,
    full: MovingAverage,
    power: f64,
    soc: Option<f64>,
    reserved: f64,
    taken: f64,
    mqtt: Mqtt,
}

impl BatteryDevice {
    pub fn new(profile: &RouterProfile, mqtt: Mqtt) -> Self {
        let window = Duration::from_secs_f64(profile.battery.average_window_s.max(0.0));
        Self {
            profile: profile.battery.clone(),
            reserve: Piecewise::new(&profile.battery.reserve),
            active: MovingAverage::new(window),
            full: MovingAverage::new(window),
            power: 0.0,
            soc: None,
            reserved: 0.0,
            taken: 0.0,
            mqtt,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.mean().unwrap_or(0.0) >= 0.5
    }

    pub fn is_full(&self) -> bool {
        self.full.mean().unwrap_or(0.0) >= 0.5
    }
}

#[async_trait]
impl RoutableDevice for BatteryDevice {
    fn name(&self) -> &str {
        "battery"
    }

    fn priority(&self) -> i32 {
        self.profile.priority
    }

    fn is_online(&self) -> bool {
        self.soc.is_some()
    }

    fn reload_config(&mut self, profile: &RouterProfile) {
        self.profile = profile.battery.clone();
        self.reserve = Piecewise::new(&profile.battery.reserve);
        let window = Duration::from_secs_f64(profile.battery.average_window_s.max(0.0));
        self.active.set_window(window);
        self.full.set_window(window);
    }

    async fn run(&mut self, now: Instant, snapshot: &PowerSnapshot) -> Option<WaitReason> {
        self.power = snapshot.total_battery_power;
        self.soc = snapshot.soc;
        let moving = self.power.abs() > self.profile.active_threshold_w;
        self.active.push(now, if moving { 1.0 } else { 0.0 });
        let full = self.soc.is_some_and(|s| s >= self.profile.full_soc);
        self.full.push(now, if full { 1.0 } else { 0.0 });
        None
    }

    /// Battery power proxy; zero while the battery idles so noise stays out
    fn get_power(&self) -> f64 {
        if self.is_active() { self.power } else { 0.0 }
    }

    fn get_releaseable_power(&self) -> f64 {
        0.0
    }

    fn excess_contribution(&self) -> f64 {
        self.get_power()
    }

    fn reserved_power(&self, soc: f64, max_charge: f64) -> f64 {
        if self.is_full() {
            return 0.0;
        }
        self.reserve.eval(soc).min(max_charge).max(0.0)
    }

    fn take_power(&mut self, ctx: &mut RouterCtx) -> f64 {
        self.reserved = self.reserved_power(ctx.soc, ctx.battery_max_charge);
        self.taken = self.reserved.min(ctx.power.max(0.0));
        self.taken
    }

    async fn commit(&mut self, _action: Action, _now: Instant) -> Result<()> {
        Ok(())
    }

    async fn publish(&mut self) {
        self.mqtt
            .publish_value("pv/router/battery/reserved", self.reserved)
            .await;
        self.mqtt
            .publish_value("pv/router/battery/taken", self.taken)
            .await;
        self.mqtt
            .publish_flag("pv/router/battery/active", self.is_active())
            .await;
        self.mqtt
            .publish_flag("pv/router/battery/full", self.is_full())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConfig;

    fn snapshot(battery_power: f64, soc: f64) -> PowerSnapshot {
        PowerSnapshot {
            total_battery_power: battery_power,
            soc: Some(soc),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reservation_follows_soc_and_headroom() {
        let mut b = BatteryDevice::new(&RouterProfile::default(), Mqtt::memory(&MqttConfig::default()));
        let t0 = Instant::now();
        b.run(t0, &snapshot(1500.0, 50.0)).await;

        let mut ctx = RouterCtx::new(t0, 5000.0, 50.0, 4000.0);
        assert_eq!(b.take_power(&mut ctx), 2000.0);
        // Charge headroom caps the reservation
        let mut ctx = RouterCtx::new(t0, 5000.0, 50.0, 800.0);
        assert_eq!(b.take_power(&mut ctx), 800.0);
        // Never more than what is left
        let mut ctx = RouterCtx::new(t0, 300.0, 50.0, 4000.0);
        assert_eq!(b.take_power(&mut ctx), 300.0);
        assert!(ctx.changes.is_empty());
    }

    #[tokio::test]
    async fn test_idle_battery_proxy_is_zero() {
        let mut b = BatteryDevice::new(&RouterProfile::default(), Mqtt::memory(&MqttConfig::default()));
        let t0 = Instant::now();
        for i in 0..5 {
            b.run(t0 + Duration::from_secs(i), &snapshot(40.0, 60.0)).await;
        }
        assert!(!b.is_active());
        assert_eq!(b.excess_contribution(), 0.0);

        for i in 5..30 {
            b.run(t0 + Duration::from_secs(i), &snapshot(1200.0, 60.0)).await;
        }
        assert!(b.is_active());
        assert_eq!(b.excess_contribution(), 1200.0);
    }

    #[tokio::test]
    async fn test_full_battery_reserves_nothing() {
        let mut b = BatteryDevice::new(&RouterProfile::default(), Mqtt::memory(&MqttConfig::default()));
        let t0 = Instant::now();
        for i in 0..10 {
            b.run(t0 + Duration::from_secs(i), &snapshot(0.0, 99.0)).await;
        }
        assert!(b.is_full());
        assert_eq!(b.reserved_power(99.0, 3000.0), 0.0);
    }
}
