use pvctl::error::PvError;

#[test]
fn error_constructors_group_1() {
    assert!(matches!(PvError::config("x"), PvError::Config { .. }));
    assert!(matches!(PvError::transport("x"), PvError::Transport { .. }));
    assert!(matches!(PvError::protocol("x"), PvError::Protocol { .. }));
    assert!(matches!(PvError::stale("x"), PvError::StaleData { .. }));
}

#[test]
fn error_constructors_group_2() {
    assert!(matches!(
        PvError::setting("f", "m"),
        PvError::SettingViolation { .. }
    ));
    assert!(matches!(
        PvError::validation("f", "m"),
        PvError::Validation { .. }
    ));
    assert!(matches!(PvError::mqtt("x"), PvError::Mqtt { .. }));
    assert!(matches!(PvError::io("x"), PvError::Io { .. }));
}

#[test]
fn error_constructors_group_3() {
    assert!(matches!(PvError::timeout("x"), PvError::Timeout { .. }));
    assert!(matches!(PvError::cancelled("x"), PvError::Cancelled { .. }));
    assert!(matches!(PvError::generic("x"), PvError::Generic { .. }));
}

#[test]
fn conversions_keep_the_kind() {
    let io: PvError = std::io::Error::other("disk").into();
    assert!(matches!(io, PvError::Io { .. }));

    let json: PvError = serde_json::from_str::<u32>("nope").unwrap_err().into();
    assert!(matches!(json, PvError::Serialization { .. }));

    let exception: PvError = tokio_modbus::ExceptionCode::IllegalDataAddress.into();
    assert!(matches!(exception, PvError::Protocol { .. }));
    assert!(exception.is_retryable());
}

#[test]
fn display_messages() {
    let e = PvError::setting("force_charge_until_kwh", "out of range");
    let s = format!("{}", e);
    assert!(s.contains("Setting rejected"));
    assert!(s.contains("force_charge_until_kwh"));
}
