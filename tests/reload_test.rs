//! Deploy-style reloads through the supervisor loop

use pvctl::config::{Config, MqttConfig};
use pvctl::mqtt::{Mqtt, MqttMessage};
use pvctl::router::Router;
use pvctl::supervisor::Supervisor;
use pvctl::SharedConfig;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;

fn stamp(path: &Path, secs: u64) {
    let f = File::options().write(true).open(path).unwrap();
    f.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

fn base_config() -> Config {
    let mut cfg = Config::default();
    cfg.router.evse = None;
    cfg.supervisor.poll_interval_ms = 10;
    let mut holiday = cfg.router_profile().unwrap().clone();
    holiday.offset_w = -100.0;
    cfg.router.configs.insert("holiday".to_string(), holiday);
    cfg
}

async fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn deploy_reloads_and_keeps_the_user_selection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pvctl.yaml");
    let sentinel = dir.path().join("pvctl.reload");
    let cfg = base_config();
    cfg.save_to_file(&path).unwrap();
    std::fs::write(&sentinel, b"").unwrap();
    stamp(&path, 1_000);
    stamp(&sentinel, 1_000);

    let shared = SharedConfig::new(cfg.clone());
    let mqtt = Mqtt::memory(&MqttConfig::default());
    let mut router = Router::from_config(shared.clone(), mqtt.clone(), None).unwrap();
    let t0 = Instant::now();
    router
        .handle_message(
            &MqttMessage::new("cmnd/pv/router/active_config", "holiday", false),
            t0,
        )
        .await;
    assert_eq!(router.active_config(), "holiday");

    let mut supervisor = Supervisor::new(shared.clone(), &path);
    let reloads = Arc::new(AtomicUsize::new(0));
    let r = reloads.clone();
    supervisor.on_reload(move |cfg| {
        assert_eq!(cfg.router.configs["holiday"].offset_w, -250.0);
        r.fetch_add(1, Ordering::SeqCst);
    });
    let cancel = CancellationToken::new();
    let task = tokio::spawn(supervisor.run(cancel.clone()));

    let mut next = cfg.clone();
    next.router.configs.get_mut("holiday").unwrap().offset_w = -250.0;
    next.save_to_file(&path).unwrap();
    stamp(&path, 2_000);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Nothing happens until the sentinel moves
    assert_eq!(shared.generation(), 0);

    stamp(&sentinel, 3_000);
    wait_for(|| shared.generation() == 1).await;
    assert_eq!(reloads.load(Ordering::SeqCst), 1);

    // The router picks the new generation up at its next iteration
    router.iterate(t0 + Duration::from_secs(1)).await;
    assert_eq!(router.active_config(), "holiday");

    // A broken deploy keeps the running generation
    std::fs::write(&path, "router: [broken").unwrap();
    stamp(&path, 4_000);
    stamp(&sentinel, 5_000);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(shared.generation(), 1);
    assert_eq!(reloads.load(Ordering::SeqCst), 1);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn removed_profile_falls_back_to_the_configured_one() {
    let cfg = base_config();
    let shared = SharedConfig::new(cfg.clone());
    let mqtt = Mqtt::memory(&MqttConfig::default());
    let mut router = Router::from_config(shared.clone(), mqtt.clone(), None).unwrap();
    router.select_config("holiday").await.unwrap();
    assert!(router.select_config("winter").await.is_err());
    assert_eq!(router.active_config(), "holiday");

    let mut next = cfg;
    next.router.configs.remove("holiday");
    shared.swap(next);
    router.iterate(Instant::now()).await;
    assert_eq!(router.active_config(), "default");
}
