use super::*;

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/var/log/pvctl".to_string(),
            backup_count: 7,
            console_output: true,
            file_output: false,
            json_format: false,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "pvctl".to_string(),
            user: String::new(),
            password: String::new(),
            keep_alive_s: 10,
            rate_limits: vec![
                RateLimitRule {
                    prefix: "pv/".to_string(),
                    period_s: 10.0,
                    margin: 50.0,
                    mode: RateLimitMode::Average,
                },
                RateLimitRule {
                    prefix: "pv/meter/".to_string(),
                    period_s: 5.0,
                    margin: 100.0,
                    mode: RateLimitMode::Average,
                },
                RateLimitRule {
                    prefix: "pv/bms/".to_string(),
                    period_s: 60.0,
                    margin: 1.0,
                    mode: RateLimitMode::Latest,
                },
                RateLimitRule {
                    prefix: "pv/router/".to_string(),
                    period_s: 5.0,
                    margin: 100.0,
                    mode: RateLimitMode::Latest,
                },
            ],
        }
    }
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            retry_wait_ms: 50,
            rate_limit_errors: 3,
            max_regs_in_command: 40,
            max_bits_in_command: 200,
            max_hole_size: None,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baudrate: 9600,
            parity: "N".to_string(),
            stop_bits: 1,
            timeout_ms: 1000,
        }
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig {
                port: "/dev/ttyUSB_main_meter".to_string(),
                baudrate: 19200,
                timeout_ms: 500,
                ..Default::default()
            },
            unit_id: 1,
            poll_interval_ms: 100,
        }
    }
}

impl Default for FakeMeterPortConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig {
                port: "/dev/ttyUSB_fake_meter".to_string(),
                ..Default::default()
            },
            unit_id: 1,
            meter_class: FakeMeterClass::AcrelAcr10r,
        }
    }
}

impl Default for InverterConfig {
    fn default() -> Self {
        Self {
            name: "solis1".to_string(),
            serial: SerialConfig {
                port: "/dev/ttyUSB_solis1".to_string(),
                ..Default::default()
            },
            unit_id: 1,
            local_meter_unit_id: 2,
            poll_interval_ms: 200,
            meter_type_value: 0,
            fake_meter: FakeMeterPortConfig::default(),
        }
    }
}

impl Default for FakeMeterConfig {
    fn default() -> Self {
        Self {
            max_age_ignore_s: 1.0,
            max_age_abort_s: 5.0,
            refuse_all: false,
            stats_period_s: 60,
        }
    }
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            battery_interface: "can_bat".to_string(),
            inverters: vec![
                CanInverterConfig {
                    name: "solis1".to_string(),
                    interface: "can_1".to_string(),
                },
                CanInverterConfig {
                    name: "solis2".to_string(),
                    interface: "can_2".to_string(),
                },
            ],
            echo_period_ms: 1000,
            echo_capacity: 4,
            max_charge_current_a: 100.0,
            max_discharge_current_a: 200.0,
            reconnect_delay_s: 5,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            soc_bias_coefficient: 1e-4,
            soc_bias_threshold_w: 200.0,
            fake_meter_alive_s: 5.0,
            balance_gain: 0.05,
            snapshot_topic: "nolog/pv/event/power".to_string(),
        }
    }
}

impl Default for PlugProfile {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 10,
            power_w: 1000.0,
            hysteresis_w: 50.0,
            min_on_time_s: 60.0,
            min_off_time_s: 60.0,
            settle_time_s: 5.0,
        }
    }
}

impl Default for BatteryProfile {
    fn default() -> Self {
        Self {
            priority: 50,
            reserve: vec![[0.0, 3000.0], [50.0, 2000.0], [90.0, 500.0], [100.0, 0.0]],
            active_threshold_w: 100.0,
            average_window_s: 20.0,
            full_soc: 98.0,
        }
    }
}

impl Default for EvseProfile {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 100,
            high_priority_power: vec![[0.0, 0.0], [80.0, 0.0], [100.0, 3000.0]],
            start_excess_threshold_w: 1400.0,
            start_counter_max: 60.0,
            stop_counter_max: 60.0,
            integrator_max_w: 160.0,
            control_gain_p: 1.0,
            control_gain_i: 0.1,
            i_start_a: 6.0,
            i_max_a: 30.0,
            soft_start_s: 10.0,
            charge_detect_threshold_w: 900.0,
            end_of_charge_timeout_s: 600.0,
            unplug_timeout_s: 10.0,
            plug_detect_s: 3.0,
            small_current_step_a: 1.0,
            command_interval_s: 1.0,
            command_interval_small_s: 10.0,
            up_inhibit_s: 5.0,
            power_report_hold_s: 6.0,
            keepalive_s: 10.0,
            stability_threshold_w: 250.0,
            stability_window: 5,
            force_charge_minimum_a: 10.0,
            hair_trigger_s: 3.0,
        }
    }
}

impl Default for RouterProfile {
    fn default() -> Self {
        let mut plugs = BTreeMap::new();
        plugs.insert(
            "plug1".to_string(),
            PlugProfile {
                priority: 20,
                ..Default::default()
            },
        );
        plugs.insert(
            "plug2".to_string(),
            PlugProfile {
                priority: 10,
                ..Default::default()
            },
        );
        Self {
            offset_w: 0.0,
            export_target: vec![[0.0, 0.0], [90.0, 0.0], [100.0, 50.0]],
            confirm_s: 1.5,
            battery: BatteryProfile::default(),
            evse: EvseProfile::default(),
            plugs,
        }
    }
}

impl Default for EvseConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig {
                port: "/dev/ttyUSB_evse".to_string(),
                ..Default::default()
            },
            unit_id: 1,
            meter_unit_id: 3,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        let mut configs = BTreeMap::new();
        configs.insert("default".to_string(), RouterProfile::default());
        Self {
            active: "default".to_string(),
            configs,
            plugs: vec![
                PlugConfig {
                    id: "plug1".to_string(),
                    name: "Water heater".to_string(),
                },
                PlugConfig {
                    id: "plug2".to_string(),
                    name: "Dehumidifier".to_string(),
                },
            ],
            evse: Some(EvseConfig::default()),
            snapshot_max_age_s: 5.0,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            watch: vec!["pvctl.yaml".to_string()],
            sentinel: "pvctl.reload".to_string(),
            poll_interval_ms: 1000,
            restart_backoff_s: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let second = InverterConfig {
            name: "solis2".to_string(),
            serial: SerialConfig {
                port: "/dev/ttyUSB_solis2".to_string(),
                ..Default::default()
            },
            fake_meter: FakeMeterPortConfig {
                serial: SerialConfig {
                    port: "/dev/ttyUSB_fake_meter2".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        };
        Self {
            logging: LoggingConfig::default(),
            mqtt: MqttConfig::default(),
            modbus: ModbusConfig::default(),
            meter: MeterConfig::default(),
            inverters: vec![InverterConfig::default(), second],
            fake_meter: FakeMeterConfig::default(),
            can: CanConfig::default(),
            aggregator: AggregatorConfig::default(),
            router: RouterConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}
