use pvctl::config::{Config, FakeMeterClass, PlugConfig};
use std::fs;

#[test]
fn save_and_load_yaml_roundtrip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("pvctl.yaml");

    let mut cfg = Config::default();
    cfg.mqtt.host = "10.0.0.5".to_string();
    cfg.inverters[1].name = "garage".to_string();
    cfg.router.active = "default".to_string();
    cfg.logging.file = path.with_extension("log").to_string_lossy().to_string();

    cfg.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();

    assert_eq!(loaded.mqtt.host, "10.0.0.5");
    assert_eq!(loaded.inverters[1].name, "garage");
    assert_eq!(loaded.logging.file, cfg.logging.file);
    assert_eq!(
        loaded.router_profile().unwrap().export_target,
        cfg.router_profile().unwrap().export_target
    );
    assert!(loaded.validate().is_ok());
}

#[test]
fn partial_file_takes_defaults() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(
        tmp.path(),
        "mqtt:\n  host: broker.lan\nfake_meter:\n  max_age_ignore_s: 2.0\n  max_age_abort_s: 8.0\n",
    )
    .unwrap();
    let cfg = Config::from_file(tmp.path()).unwrap();
    assert_eq!(cfg.mqtt.host, "broker.lan");
    assert_eq!(cfg.mqtt.port, 1883);
    assert_eq!(cfg.fake_meter.max_age_abort_s, 8.0);
    assert_eq!(cfg.inverters.len(), 2);
    assert!(cfg.validate().is_ok());
}

#[test]
fn config_validation_errors() {
    let mut cfg = Config::default();
    cfg.mqtt.host.clear();
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.modbus.max_regs_in_command = 126;
    assert!(cfg.validate().is_err());

    // Abort must come after ignore
    cfg = Config::default();
    cfg.fake_meter.max_age_abort_s = cfg.fake_meter.max_age_ignore_s;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.inverters[1].name = cfg.inverters[0].name.clone();
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.inverters[0].local_meter_unit_id = cfg.inverters[0].unit_id;
    assert!(cfg.validate().is_err());

    // Meter type register must select the layout the fake meter serves
    cfg = Config::default();
    cfg.inverters[0].meter_type_value = FakeMeterClass::EastronSdm120.meter_type_code();
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("meter_type_value"));
    cfg.inverters[0].fake_meter.meter_class = FakeMeterClass::EastronSdm120;
    assert!(cfg.validate().is_ok());

    cfg = Config::default();
    cfg.can.echo_capacity = 0;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.router.active = "holiday".to_string();
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.router.plugs.push(PlugConfig {
        id: "heater".to_string(),
        name: "Heater".to_string(),
    });
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.router.configs.get_mut("default").unwrap().export_target = vec![[50.0, 0.0], [10.0, 0.0]];
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("strictly increasing"));

    cfg = Config::default();
    cfg.router.configs.get_mut("default").unwrap().evse.i_start_a = 4.0;
    assert!(cfg.validate().is_err());
}

#[test]
fn from_file_with_invalid_yaml_fails() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), b"bad: [unclosed").unwrap();
    let err = Config::from_file(tmp.path()).unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("Invalid YAML"));
}

#[test]
fn locate_prefers_the_explicit_path() {
    let path = Config::locate(Some("/tmp/elsewhere.yaml")).unwrap();
    assert_eq!(path.to_str(), Some("/tmp/elsewhere.yaml"));
    assert!(Config::load(Some("/nonexistent/pvctl.yaml")).is_err());
}
