use pvctl::can::frames::{ID_LIMITS, ID_MEASUREMENTS, ID_REPLY, ID_SOC};
use pvctl::can::{BmsFrame, CanBridge, CanBus, MemoryBus, RawFrame};
use pvctl::config::{CanConfig, MqttConfig};
use pvctl::mqtt::{Mqtt, MqttMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Rig {
    battery: Arc<MemoryBus>,
    inverters: Vec<Arc<MemoryBus>>,
    mqtt: Mqtt,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

fn rig(cfg: CanConfig) -> Rig {
    let mqtt = Mqtt::memory(&MqttConfig::default());
    let battery = Arc::new(MemoryBus::new("can_bat"));
    let inverters = vec![Arc::new(MemoryBus::new("can_1")), Arc::new(MemoryBus::new("can_2"))];
    let bridge = CanBridge::new(
        &cfg,
        battery.clone(),
        inverters.iter().map(|b| b.clone() as Arc<dyn CanBus>).collect(),
        mqtt.clone(),
    );
    let cancel = CancellationToken::new();
    let task = tokio::spawn(bridge.run(cancel.clone()));
    Rig {
        battery,
        inverters,
        mqtt,
        cancel,
        task,
    }
}

impl Rig {
    async fn stop(self) {
        self.cancel.cancel();
        self.task.await.unwrap();
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn limits(charge: i16, discharge: i16) -> RawFrame {
    let mut d = Vec::new();
    d.extend_from_slice(&552u16.to_le_bytes());
    d.extend_from_slice(&charge.to_le_bytes());
    d.extend_from_slice(&discharge.to_le_bytes());
    d.extend_from_slice(&480u16.to_le_bytes());
    RawFrame::new(ID_LIMITS, &d).unwrap()
}

#[tokio::test]
async fn battery_limits_are_shared_between_inverters() {
    let rig = rig(CanConfig {
        max_charge_current_a: 30.0,
        ..Default::default()
    });
    rig.battery.inject(limits(500, 1000));
    settle().await;

    for bus in &rig.inverters {
        let sent = bus.sent();
        assert_eq!(sent.len(), 1);
        let BmsFrame::Limits(l) = BmsFrame::decode(&sent[0]).unwrap() else {
            panic!("not a limits frame");
        };
        assert_eq!(l.charge_current_a(), 15.0);
        assert_eq!(l.discharge_current_a(), 50.0);
    }
    let published = rig.mqtt.last_published("pv/bms/max_charge_current").unwrap();
    assert_eq!(published.text(), Some("30"));
    rig.stop().await;
}

#[tokio::test]
async fn soc_frames_are_relayed_verbatim() {
    let rig = rig(CanConfig::default());
    let soc = RawFrame::new(ID_SOC, &[87, 0, 99, 0]).unwrap();
    rig.battery.inject(soc.clone());
    // Unknown identifiers are dropped
    rig.battery.inject(RawFrame::new(0x123, &[1, 2, 3]).unwrap());
    settle().await;

    for bus in &rig.inverters {
        assert_eq!(bus.sent(), vec![soc.clone()]);
    }
    assert_eq!(rig.mqtt.last_published("pv/bms/soc").unwrap().text(), Some("87"));
    rig.stop().await;
}

#[tokio::test]
async fn inverter_replies_are_echoed_once_per_period() {
    let rig = rig(CanConfig {
        echo_period_ms: 50,
        ..Default::default()
    });
    let reply = RawFrame::new(ID_REPLY, &[0x52, 0x45, 0x50]).unwrap();
    rig.inverters[0].inject(reply.clone());
    rig.inverters[1].inject(reply.clone());
    settle().await;

    let echoed = rig.battery.sent();
    assert_eq!(echoed, vec![reply]);
    rig.stop().await;
}

#[tokio::test]
async fn reported_inverter_current_replaces_the_even_split() {
    let rig = rig(CanConfig::default());
    rig.mqtt
        .dispatch(&MqttMessage::new("pv/solis2/battery_current", "4.5", false));
    settle().await;

    let mut d = Vec::new();
    d.extend_from_slice(&5300i16.to_le_bytes());
    d.extend_from_slice(&300i16.to_le_bytes());
    d.extend_from_slice(&250i16.to_le_bytes());
    rig.battery
        .inject(RawFrame::new(ID_MEASUREMENTS, &d).unwrap());
    settle().await;

    let current = |bus: &MemoryBus| match BmsFrame::decode(&bus.sent()[0]).unwrap() {
        BmsFrame::Measurements(m) => m.current_a(),
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(current(&rig.inverters[0]), 15.0);
    assert_eq!(current(&rig.inverters[1]), 4.5);
    rig.stop().await;
}

#[tokio::test]
async fn failing_inverter_bus_does_not_stop_the_battery() {
    let rig = rig(CanConfig {
        reconnect_delay_s: 0,
        ..Default::default()
    });
    rig.inverters[1].fail_recv(1);
    rig.inverters[0].fail_send(1);
    rig.battery.inject(limits(100, 100));
    rig.battery.inject(limits(100, 100));
    settle().await;

    assert_eq!(rig.inverters[0].sent().len(), 1);
    assert_eq!(rig.inverters[1].sent().len(), 2);
    assert_eq!(rig.inverters[1].resets(), 1);
    rig.stop().await;
}

#[tokio::test]
async fn error_frames_are_skipped_without_reconnecting() {
    // A reconnect would hold the relay for the full delay
    let rig = rig(CanConfig {
        reconnect_delay_s: 5,
        ..Default::default()
    });
    let soc = RawFrame::new(ID_SOC, &[87, 0, 99, 0]).unwrap();
    rig.battery.inject_error_frame();
    rig.battery.inject(soc.clone());
    rig.inverters[0].inject_error_frame();
    settle().await;

    for bus in &rig.inverters {
        assert_eq!(bus.sent(), vec![soc.clone()]);
    }
    assert_eq!(rig.battery.resets(), 0);
    assert_eq!(rig.inverters[0].resets(), 0);
    rig.stop().await;
}
