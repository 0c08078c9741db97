//! Meter cycle through the aggregator into the fake meters and the router

use pvctl::aggregator::{Aggregator, InverterFeed, PowerSnapshot};
use pvctl::config::{Config, FakeMeterConfig, FakeMeterPortConfig, MqttConfig};
use pvctl::devices::{InverterReading, MeterReading};
use pvctl::fake_meter::{FakeMeter, FakeMeterHandle};
use pvctl::mqtt::Mqtt;
use pvctl::router::{Router, RouterState};
use pvctl::SharedConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_modbus::prelude::*;

struct Plant {
    meter: watch::Sender<Arc<MeterReading>>,
    _inverters: Vec<watch::Sender<Arc<InverterReading>>>,
    fake_meters: Vec<FakeMeterHandle>,
    aggregator: Aggregator,
}

fn meter(total_power: f64, at: Instant) -> Arc<MeterReading> {
    Arc::new(MeterReading {
        online: true,
        total_power,
        voltage: [230.0; 3],
        frequency: 50.0,
        timestamp: Some(at),
        ..Default::default()
    })
}

fn inverter(name: &str, pv: f64, grid_port: f64) -> InverterReading {
    InverterReading {
        name: name.to_string(),
        online: true,
        powered_on: true,
        pv_power: pv,
        grid_port_power: grid_port,
        soc: Some(100.0),
        ..Default::default()
    }
}

fn plant(cfg: &Config, mqtt: &Mqtt, readings: Vec<InverterReading>, t0: Instant) -> Plant {
    let (meter_tx, meter_rx) = watch::channel(meter(0.0, t0));
    let mut senders = Vec::new();
    let mut feeds = Vec::new();
    let mut fake_meters = Vec::new();
    for r in readings {
        let handle = FakeMeterHandle::new(
            FakeMeter::new(&r.name, &FakeMeterPortConfig::default(), &FakeMeterConfig::default()).unwrap(),
        );
        let (tx, rx) = watch::channel(Arc::new(r));
        senders.push(tx);
        feeds.push(InverterFeed {
            readings: rx,
            fake_meter: handle.clone(),
        });
        fake_meters.push(handle);
    }
    Plant {
        meter: meter_tx,
        _inverters: senders,
        fake_meters,
        aggregator: Aggregator::new(&cfg.aggregator, meter_rx, feeds, mqtt.clone()),
    }
}

fn served_power(handle: &FakeMeterHandle, now: Instant) -> Option<Vec<u16>> {
    match handle
        .lock()
        .handle(&Request::ReadHoldingRegisters(0x0002, 2), now)
        .unwrap()
    {
        Some(Response::ReadHoldingRegisters(words)) => Some(words),
        Some(other) => panic!("unexpected {:?}", other),
        None => None,
    }
}

#[tokio::test]
async fn export_is_routed_to_both_plugs() {
    let mut cfg = Config::default();
    cfg.router.evse = None;
    // Two ~1 kW loads; the default export target keeps 50 W at full SoC
    let profile = cfg.router.configs.get_mut("default").unwrap();
    for p in profile.plugs.values_mut() {
        p.power_w = 975.0;
        p.settle_time_s = 0.0;
    }
    let mqtt = Mqtt::memory(&MqttConfig::default());
    let t0 = Instant::now();
    let at = |s: u64| t0 + Duration::from_secs(s);
    let mut plant = plant(
        &cfg,
        &mqtt,
        vec![inverter("solis1", 1500.0, 0.0), inverter("solis2", 1500.0, 0.0)],
        t0,
    );
    let snapshot_topic = cfg.aggregator.snapshot_topic.clone();
    let mut router = Router::from_config(SharedConfig::new(cfg), mqtt.clone(), None).unwrap();

    let mut last = None;
    for s in 0..=2 {
        plant.meter.send_replace(meter(-2000.0, at(s)));
        let snapshot = plant.aggregator.step(at(s)).await.unwrap();
        for fm in &plant.fake_meters {
            assert_eq!(fm.lock().value("active_power"), Some(-1000.0));
        }
        assert_eq!(snapshot.online_inverters(), 2);

        let msg = mqtt.last_published(&snapshot_topic).unwrap();
        router.handle_message(&msg, at(s)).await;
        last = Some(router.iterate(at(s)).await);
    }
    let it = last.unwrap();
    assert_eq!(it.committed, 2);
    assert_eq!(it.excess, 1950.0);
    assert_eq!(it.remaining, 0.0);

    let switched: Vec<String> = mqtt
        .published()
        .into_iter()
        .filter(|m| m.topic.starts_with("cmnd/plugs/") && m.payload == b"ON")
        .map(|m| m.topic)
        .collect();
    assert_eq!(switched, ["cmnd/plugs/plug1/Power", "cmnd/plugs/plug2/Power"]);

    // Both loads now draw; the meter settles near zero and nothing else moves
    plant.meter.send_replace(meter(-200.0, at(3)));
    plant.aggregator.step(at(3)).await.unwrap();
    router.handle_message(&mqtt.last_published(&snapshot_topic).unwrap(), at(3)).await;
    let it = router.iterate(at(3)).await;
    assert!(it.queued.is_empty());
    assert_eq!(it.state, RouterState::Idle);
    assert_eq!(router.device_power("plug1"), Some(975.0));
}

#[tokio::test]
async fn unbalanced_inverters_are_steered_apart() {
    let cfg = Config::default();
    let mqtt = Mqtt::memory(&MqttConfig::default());
    let t0 = Instant::now();
    let mut plant = plant(
        &cfg,
        &mqtt,
        vec![inverter("solis1", 300.0, 0.0), inverter("solis2", 0.0, -300.0)],
        t0,
    );
    plant.meter.send_replace(meter(-2000.0, t0));
    let snapshot: Arc<PowerSnapshot> = plant.aggregator.step(t0).await.unwrap();

    assert_eq!(
        snapshot.total_input_power,
        snapshot.total_pv_power + snapshot.total_grid_port_power
    );
    assert_eq!(plant.fake_meters[0].lock().value("active_power"), Some(-985.0));
    assert_eq!(plant.fake_meters[1].lock().value("active_power"), Some(-1015.0));
}

#[tokio::test]
async fn stale_data_is_zeroed_then_refused() {
    let cfg = Config::default();
    let mqtt = Mqtt::memory(&MqttConfig::default());
    let t0 = Instant::now();
    let mut plant = plant(&cfg, &mqtt, vec![inverter("solis1", 1500.0, 0.0)], t0);
    plant.meter.send_replace(meter(-1000.0, t0));
    plant.aggregator.step(t0).await.unwrap();
    let fm = plant.fake_meters[0].clone();

    // -1000 W as a high-word-first I32
    assert_eq!(
        served_power(&fm, t0 + Duration::from_millis(500)),
        Some(vec![0xFFFF, 0xFC18])
    );
    // The aggregator hangs: past the ignore threshold power reads zero
    assert_eq!(served_power(&fm, t0 + Duration::from_secs(2)), Some(vec![0, 0]));
    assert_eq!(served_power(&fm, t0 + Duration::from_secs(5)), Some(vec![0, 0]));
    // Past the abort threshold the inverter gets no answer at all
    assert_eq!(served_power(&fm, t0 + Duration::from_secs(7)), None);
    assert!(!fm.lock().is_online());
    assert_eq!(fm.lock().stats().stale_errors, 2);
}
