//! Tasmota smart plug as a routable on/off load

use super::{Action, RoutableDevice, RouterCtx, WaitReason};
use crate::aggregator::PowerSnapshot;
use crate::config::{PlugConfig, PlugProfile, RouterProfile};
use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger_for};
use crate::mqtt::{Mqtt, MqttMessage};
use async_trait::async_trait;
use std::time::Instant;

pub struct PlugDevice {
    id: String,
    label: String,
    profile: PlugProfile,
    mqtt: Mqtt,
    logger: StructuredLogger,
    online: bool,
    is_on: bool,
    /// Last `ENERGY.Power` telemetry; cleared on every switch
    measured: Option<f64>,
    last_switch: Option<Instant>,
    now: Option<Instant>,
}

fn seconds_since(t: Option<Instant>, now: Instant) -> f64 {
    t.map_or(f64::INFINITY, |t| now.saturating_duration_since(t).as_secs_f64())
}

impl PlugDevice {
    pub fn new(plug: &PlugConfig, profile: &PlugProfile, mqtt: Mqtt) -> Self {
        Self {
            id: plug.id.clone(),
            label: if plug.name.is_empty() {
                plug.id.clone()
            } else {
                plug.name.clone()
            },
            profile: profile.clone(),
            mqtt,
            logger: get_logger_for("router", &plug.id),
            online: true,
            is_on: false,
            measured: None,
            last_switch: None,
            now: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn command_topic(&self) -> String {
        format!("cmnd/plugs/{}/Power", self.id)
    }

    /// Power drawn while on: telemetry when known, nominal otherwise
    fn draw(&self) -> f64 {
        if !self.is_on {
            return 0.0;
        }
        self.measured.unwrap_or(self.profile.power_w).max(0.0)
    }

    fn min_on_elapsed(&self, now: Instant) -> bool {
        seconds_since(self.last_switch, now) >= self.profile.min_on_time_s
    }

    fn min_off_elapsed(&self, now: Instant) -> bool {
        seconds_since(self.last_switch, now) >= self.profile.min_off_time_s
    }

    fn releasable(&self) -> bool {
        let Some(now) = self.now else {
            return false;
        };
        self.online && self.profile.enabled && self.is_on && self.min_on_elapsed(now)
    }

    fn observe_switch(&mut self, on: bool, now: Instant) {
        if on != self.is_on {
            self.logger
                .info(&format!("{} switched {} outside the router", self.label, if on { "on" } else { "off" }));
            self.is_on = on;
            self.last_switch = Some(now);
            self.measured = None;
        }
    }
}

#[async_trait]
impl RoutableDevice for PlugDevice {
    fn name(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> i32 {
        self.profile.priority
    }

    fn is_online(&self) -> bool {
        self.online
    }

    fn reload_config(&mut self, profile: &RouterProfile) {
        match profile.plugs.get(&self.id) {
            Some(p) => self.profile = p.clone(),
            None => {
                self.logger.warn("No profile for this plug, disabling it");
                self.profile.enabled = false;
            }
        }
    }

    async fn run(&mut self, now: Instant, _snapshot: &PowerSnapshot) -> Option<WaitReason> {
        self.now = Some(now);
        if seconds_since(self.last_switch, now) < self.profile.settle_time_s {
            return Some(WaitReason::new(&self.id, "settling after switch"));
        }
        None
    }

    fn get_power(&self) -> f64 {
        self.draw()
    }

    fn get_releaseable_power(&self) -> f64 {
        if self.releasable() { self.draw() } else { 0.0 }
    }

    fn take_power(&mut self, ctx: &mut RouterCtx) -> f64 {
        let now = ctx.now;
        if !self.online {
            return 0.0;
        }
        if !self.profile.enabled {
            if self.is_on && self.min_on_elapsed(now) {
                ctx.queue(Action::Switch(false));
            }
            return 0.0;
        }
        if self.is_on {
            // Held power was never released, so it is not taken again either
            if !self.min_on_elapsed(now) {
                return 0.0;
            }
            let draw = self.draw();
            if ctx.power >= draw - self.profile.hysteresis_w {
                return draw;
            }
            ctx.queue(Action::Switch(false));
            return 0.0;
        }
        if !self.min_off_elapsed(now) {
            return 0.0;
        }
        // The hysteresis band lies below the nominal draw
        if ctx.power >= self.profile.power_w {
            ctx.queue(Action::Switch(true));
            return self.profile.power_w;
        }
        0.0
    }

    async fn commit(&mut self, action: Action, now: Instant) -> Result<()> {
        let Action::Switch(on) = action else {
            return Ok(());
        };
        let payload = if on { "ON" } else { "OFF" };
        self.logger
            .info(&format!("Switching {} {}", self.label, payload));
        self.mqtt
            .publish_text(&self.command_topic(), payload)
            .await;
        self.is_on = on;
        self.last_switch = Some(now);
        self.measured = None;
        Ok(())
    }

    async fn on_message(&mut self, msg: &MqttMessage, now: Instant) -> bool {
        let mut levels = msg.topic.split('/');
        let (Some(kind), Some("plugs"), Some(id), Some(leaf), None) =
            (levels.next(), levels.next(), levels.next(), levels.next(), levels.next())
        else {
            return false;
        };
        if id != self.id {
            return false;
        }
        match (kind, leaf) {
            ("tele", "SENSOR") => {
                let power = msg
                    .json()
                    .ok()
                    .and_then(|v| v["ENERGY"]["Power"].as_f64());
                if let Some(p) = power {
                    self.measured = Some(p);
                    self.online = true;
                }
            }
            ("tele", "LWT") => {
                let online = msg.text() == Some("Online");
                if online != self.online {
                    self.logger
                        .info(if online { "Plug online" } else { "Plug offline" });
                }
                self.online = online;
            }
            ("stat", "POWER") => match msg.text() {
                Some("ON") => self.observe_switch(true, now),
                Some("OFF") => self.observe_switch(false, now),
                _ => {}
            },
            _ => return false,
        }
        true
    }

    async fn publish(&mut self) {
        let base = format!("pv/router/plugs/{}", self.id);
        self.mqtt
            .publish_flag(&format!("{}/on", base), self.is_on)
            .await;
        self.mqtt
            .publish_flag(&format!("{}/online", base), self.online)
            .await;
        self.mqtt
            .publish_value(&format!("{}/power", base), self.draw())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConfig;
    use std::time::Duration;

    fn plug(power_w: f64) -> (PlugDevice, Mqtt) {
        let mqtt = Mqtt::memory(&MqttConfig::default());
        let cfg = PlugConfig {
            id: "plug1".to_string(),
            name: "Water heater".to_string(),
        };
        let profile = PlugProfile {
            power_w,
            ..Default::default()
        };
        (PlugDevice::new(&cfg, &profile, mqtt.clone()), mqtt)
    }

    #[tokio::test]
    async fn test_switches_on_at_nominal_power() {
        let (mut p, mqtt) = plug(1000.0);
        let t0 = Instant::now();
        p.run(t0, &PowerSnapshot::default()).await;

        let mut ctx = RouterCtx::new(t0, 999.0, 50.0, 0.0);
        assert_eq!(p.take_power(&mut ctx), 0.0);
        assert!(ctx.changes.is_empty());

        let mut ctx = RouterCtx::new(t0, 1000.0, 50.0, 0.0);
        assert_eq!(p.take_power(&mut ctx), 1000.0);
        assert_eq!(ctx.changes.len(), 1);
        p.commit(ctx.changes[0].action, t0).await.unwrap();
        assert!(p.is_on());
        assert_eq!(
            mqtt.last_published("cmnd/plugs/plug1/Power").unwrap().payload,
            b"ON"
        );
    }

    #[tokio::test]
    async fn test_min_on_time_blocks_switch_off() {
        let (mut p, _mqtt) = plug(1000.0);
        let t0 = Instant::now();
        p.commit(Action::Switch(true), t0).await.unwrap();

        let t1 = t0 + Duration::from_secs(30);
        assert!(p.run(t1, &PowerSnapshot::default()).await.is_none());
        assert_eq!(p.get_releaseable_power(), 0.0);
        let mut ctx = RouterCtx::new(t1, -500.0, 50.0, 0.0);
        assert_eq!(p.take_power(&mut ctx), 0.0);
        assert!(ctx.changes.is_empty());

        let t2 = t0 + Duration::from_secs(61);
        p.run(t2, &PowerSnapshot::default()).await;
        assert_eq!(p.get_releaseable_power(), 1000.0);
        let mut ctx = RouterCtx::new(t2, 500.0, 50.0, 0.0);
        assert_eq!(p.take_power(&mut ctx), 0.0);
        assert_eq!(ctx.changes[0].action, Action::Switch(false));
    }

    #[tokio::test]
    async fn test_stays_on_within_hysteresis_below_draw() {
        let (mut p, _mqtt) = plug(1000.0);
        let t0 = Instant::now();
        p.commit(Action::Switch(true), t0).await.unwrap();
        let t1 = t0 + Duration::from_secs(61);
        p.run(t1, &PowerSnapshot::default()).await;

        // Available power already includes the released draw
        let mut ctx = RouterCtx::new(t1, 950.0, 50.0, 0.0);
        assert_eq!(p.take_power(&mut ctx), 1000.0);
        assert!(ctx.changes.is_empty());

        let mut ctx = RouterCtx::new(t1, 949.0, 50.0, 0.0);
        assert_eq!(p.take_power(&mut ctx), 0.0);
        assert_eq!(ctx.changes[0].action, Action::Switch(false));
    }

    #[tokio::test]
    async fn test_settle_wait_and_telemetry() {
        let (mut p, _mqtt) = plug(1000.0);
        let t0 = Instant::now();
        p.commit(Action::Switch(true), t0).await.unwrap();
        let wait = p.run(t0 + Duration::from_secs(2), &PowerSnapshot::default()).await;
        assert_eq!(wait.unwrap().device, "plug1");

        let sensor = MqttMessage::new(
            "tele/plugs/plug1/SENSOR",
            r#"{"ENERGY":{"Power":870}}"#,
            false,
        );
        assert!(p.on_message(&sensor, t0).await);
        assert_eq!(p.get_power(), 870.0);

        let other = MqttMessage::new("tele/plugs/plug2/SENSOR", "{}", false);
        assert!(!p.on_message(&other, t0).await);

        let lwt = MqttMessage::new("tele/plugs/plug1/LWT", "Offline", true);
        assert!(p.on_message(&lwt, t0).await);
        assert!(!p.is_online());
        let mut ctx = RouterCtx::new(t0 + Duration::from_secs(100), 5000.0, 50.0, 0.0);
        assert_eq!(p.take_power(&mut ctx), 0.0);
        assert!(ctx.changes.is_empty());
    }

    #[tokio::test]
    async fn test_manual_switch_is_tracked() {
        let (mut p, _mqtt) = plug(1000.0);
        let t0 = Instant::now();
        let stat = MqttMessage::new("stat/plugs/plug1/POWER", "ON", false);
        p.on_message(&stat, t0).await;
        assert!(p.is_on());
        // A manual switch restarts the minimum on time
        p.run(t0 + Duration::from_secs(10), &PowerSnapshot::default()).await;
        assert_eq!(p.get_releaseable_power(), 0.0);
    }
}
