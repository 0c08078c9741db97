//! Main three-phase smartmeter (Eastron SDM630 style)

use crate::error::Result;
use crate::logging::{ErrorRateLimiter, StructuredLogger, get_logger_for};
use crate::modbus::{RegisterDescriptor, SlaveDevice, WireType};
use crate::mqtt::Mqtt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Input registers, all IEEE754 floats
pub fn register_table() -> Vec<RegisterDescriptor> {
    let f = |name, addr, unit| RegisterDescriptor::input(name, addr, WireType::F32).unit(unit);
    vec![
        f("voltage_1", 0x0000, "V"),
        f("voltage_2", 0x0002, "V"),
        f("voltage_3", 0x0004, "V"),
        f("current_1", 0x0006, "A"),
        f("current_2", 0x0008, "A"),
        f("current_3", 0x000A, "A"),
        f("power_1", 0x000C, "W"),
        f("power_2", 0x000E, "W"),
        f("power_3", 0x0010, "W"),
        f("total_power", 0x0034, "W"),
        f("total_apparent_power", 0x0038, "VA"),
        f("total_reactive_power", 0x003C, "var"),
        f("total_power_factor", 0x003E, ""),
        f("frequency", 0x0046, "Hz"),
        f("import_energy", 0x0048, "kWh"),
        f("export_energy", 0x004A, "kWh"),
        f("thd_voltage_1", 0x00EA, "%"),
        f("thd_voltage_2", 0x00EC, "%"),
        f("thd_voltage_3", 0x00EE, "%"),
        f("thd_current_1", 0x00F0, "%"),
        f("thd_current_2", 0x00F2, "%"),
        f("thd_current_3", 0x00F4, "%"),
    ]
}

/// Register sets read in turn; `total_power` is added to every one
const ROTATION: [&[&str]; 4] = [
    &["voltage_1", "voltage_2", "voltage_3"],
    &["current_1", "current_2", "current_3"],
    &["power_1", "power_2", "power_3", "frequency"],
    &[
        "total_apparent_power",
        "total_reactive_power",
        "total_power_factor",
        "import_energy",
        "export_energy",
        "thd_voltage_1",
        "thd_voltage_2",
        "thd_voltage_3",
        "thd_current_1",
        "thd_current_2",
        "thd_current_3",
    ],
];

/// Values of the main meter after one completed poll cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct MeterReading {
    pub online: bool,
    /// Completed cycles
    pub cycle: u64,
    /// Completed full rotations
    pub rotations: u64,
    /// Monotonic time of the transaction that produced `total_power`
    #[serde(skip)]
    pub timestamp: Option<Instant>,
    pub total_power: f64,
    pub voltage: [f64; 3],
    pub current: [f64; 3],
    pub power: [f64; 3],
    pub apparent_power: f64,
    pub reactive_power: f64,
    pub power_factor: f64,
    pub frequency: f64,
    pub import_energy: f64,
    pub export_energy: f64,
}

/// Drives the main meter and announces each completed cycle
pub struct MeterPoller {
    device: SlaveDevice,
    mqtt: Mqtt,
    interval: Duration,
    phase: usize,
    cycle: u64,
    rotations: u64,
    tx: watch::Sender<Arc<MeterReading>>,
    rotation_tx: watch::Sender<u64>,
    logger: StructuredLogger,
}

impl MeterPoller {
    pub fn new(device: SlaveDevice, mqtt: Mqtt, interval: Duration) -> Self {
        let (tx, _) = watch::channel(Arc::new(MeterReading::default()));
        let (rotation_tx, _) = watch::channel(0);
        let logger = get_logger_for("meter", device.name());
        Self {
            device,
            mqtt,
            interval,
            phase: 0,
            cycle: 0,
            rotations: 0,
            tx,
            rotation_tx,
            logger,
        }
    }

    /// Power-ready event: changes after every successful `total_power` read
    pub fn subscribe(&self) -> watch::Receiver<Arc<MeterReading>> {
        self.tx.subscribe()
    }

    /// Changes after every full rotation of the register sets
    pub fn subscribe_rotation(&self) -> watch::Receiver<u64> {
        self.rotation_tx.subscribe()
    }

    pub fn device(&self) -> &SlaveDevice {
        &self.device
    }

    /// Read `total_power` plus the next rotating set
    pub async fn poll_once(&mut self) -> Result<Arc<MeterReading>> {
        let mut names: Vec<&str> = vec!["total_power"];
        names.extend_from_slice(ROTATION[self.phase]);
        if let Err(e) = self.device.read(&names).await {
            if self.tx.borrow().online {
                self.tx.send_modify(|r| {
                    let mut next = (**r).clone();
                    next.online = false;
                    *r = Arc::new(next);
                });
            }
            return Err(e);
        }

        self.cycle += 1;
        self.phase = (self.phase + 1) % ROTATION.len();
        let rotated = self.phase == 0;
        if rotated {
            self.rotations += 1;
        }
        let reading = Arc::new(self.build_reading());
        self.tx.send_replace(reading.clone());
        if rotated {
            self.rotation_tx.send_replace(self.rotations);
            self.publish_rotation(&reading).await;
        }
        Ok(reading)
    }

    fn build_reading(&self) -> MeterReading {
        let v = |n: &str| self.device.value(n).unwrap_or(0.0);
        MeterReading {
            online: self.device.is_online(),
            cycle: self.cycle,
            rotations: self.rotations,
            timestamp: self.device.last_transaction(),
            total_power: v("total_power"),
            voltage: [v("voltage_1"), v("voltage_2"), v("voltage_3")],
            current: [v("current_1"), v("current_2"), v("current_3")],
            power: [v("power_1"), v("power_2"), v("power_3")],
            apparent_power: v("total_apparent_power"),
            reactive_power: v("total_reactive_power"),
            power_factor: v("total_power_factor"),
            frequency: v("frequency"),
            import_energy: v("import_energy"),
            export_energy: v("export_energy"),
        }
    }

    async fn publish_rotation(&self, r: &MeterReading) {
        let m = &self.mqtt;
        m.publish_value("pv/meter/total_power", r.total_power).await;
        for i in 0..3 {
            let p = i + 1;
            m.publish_value(&format!("pv/meter/voltage_{}", p), r.voltage[i]).await;
            m.publish_value(&format!("pv/meter/current_{}", p), r.current[i]).await;
            m.publish_value(&format!("pv/meter/power_{}", p), r.power[i]).await;
        }
        m.publish_value("pv/meter/frequency", r.frequency).await;
        m.publish_value("pv/meter/import_energy", r.import_energy).await;
        m.publish_value("pv/meter/export_energy", r.export_energy).await;
        for reg in self.device.registers() {
            if reg.name().starts_with("thd_")
                && let Some(v) = reg.display_value()
            {
                m.publish_value(&format!("pv/meter/{}", reg.name()), v).await;
            }
        }
    }

    /// Poll until cancelled; failures are absorbed and retried next cycle
    pub async fn run(mut self, cancel: CancellationToken) {
        self.logger.info(&format!(
            "Polling every {} ms",
            self.interval.as_millis()
        ));
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
            }
        }
        self.logger.info("Meter poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConfig;
    use crate::modbus::transport::MemoryTransport;
    use crate::modbus::{FunctionCode, RetryPolicy, encode_32bit_float};

    fn poller(bus: Arc<MemoryTransport>) -> MeterPoller {
        let device =
            SlaveDevice::new("main_meter", 1, bus, register_table(), RetryPolicy::default()).unwrap();
        MeterPoller::new(device, Mqtt::memory(&MqttConfig::default()), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_total_power_every_cycle_and_rotation_event() {
        let bus = Arc::new(MemoryTransport::new());
        bus.set_words(1, FunctionCode::Input, 0x34, &encode_32bit_float(-2000.0));
        bus.set_words(1, FunctionCode::Input, 0x00, &encode_32bit_float(231.0));
        let mut p = poller(bus);
        let mut power_rx = p.subscribe();
        let rotation_rx = p.subscribe_rotation();

        for cycle in 1..=4u64 {
            let r = p.poll_once().await.unwrap();
            assert_eq!(r.total_power, -2000.0);
            assert_eq!(r.cycle, cycle);
            assert!(power_rx.has_changed().unwrap());
            power_rx.borrow_and_update();
        }
        assert_eq!(*rotation_rx.borrow(), 1);
        assert_eq!(p.subscribe().borrow().voltage[0], 231.0);
        assert!(
            p.mqtt
                .published()
                .iter()
                .any(|m| m.topic == "pv/meter/voltage_1")
        );
    }

    #[tokio::test]
    async fn test_failure_marks_reading_offline() {
        let bus = Arc::new(MemoryTransport::new());
        let mut p = poller(bus.clone());
        p.poll_once().await.unwrap();
        assert!(p.subscribe().borrow().online);
        bus.set_dead(1, true);
        assert!(p.poll_once().await.is_err());
        assert!(!p.subscribe().borrow().online);
    }

    #[tokio::test]
    async fn test_run_keeps_polling_through_failed_cycles() {
        let bus = Arc::new(MemoryTransport::new());
        bus.set_words(1, FunctionCode::Input, 0x34, &encode_32bit_float(-750.0));
        bus.set_dead(1, true);
        let policy = RetryPolicy {
            retries: 0,
            retry_wait: Duration::ZERO,
            ..Default::default()
        };
        let device = SlaveDevice::new("main_meter", 1, bus.clone(), register_table(), policy).unwrap();
        let p = MeterPoller::new(device, Mqtt::memory(&MqttConfig::default()), Duration::from_millis(10));
        let mut rx = p.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(p.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!rx.borrow().online);
        bus.set_dead(1, false);
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|r| r.online))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow().total_power, -750.0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_rotation_sets_exist_in_table() {
        let table = register_table();
        for set in ROTATION {
            for name in set {
                assert!(table.iter().any(|d| d.name == *name), "{}", name);
            }
        }
    }
}
