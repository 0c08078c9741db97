//! Configuration management for pvctl
//!
//! This module handles loading and validating the YAML configuration. The
//! loaded configuration is treated as immutable; a reload produces a new
//! [`Config`] which is swapped in whole (see [`SharedConfig`]).

use crate::error::{PvError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

mod defaults;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// MQTT broker connection and per-topic rate limits
    pub mqtt: MqttConfig,

    /// Shared Modbus client policy (retries, chunking)
    pub modbus: ModbusConfig,

    /// Main three-phase smartmeter
    pub meter: MeterConfig,

    /// Hybrid inverters, each with a local grid-port meter and a fake meter port
    pub inverters: Vec<InverterConfig>,

    /// Freshness thresholds of the fake meter servers
    pub fake_meter: FakeMeterConfig,

    /// Battery <-> inverter CAN relay
    pub can: CanConfig,

    /// Power aggregation tuning
    pub aggregator: AggregatorConfig,

    /// Surplus router
    pub router: RouterConfig,

    /// Hot-reload supervisor
    pub supervisor: SupervisorConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-only level override
    pub console_level: Option<String>,

    /// Optional file-only level override
    pub file_level: Option<String>,

    /// Directory (or file path whose parent is used) for rotated logs
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to write log files at all
    pub file_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// Publication mode of a rate-limited topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitMode {
    /// Publish the most recent value once per period
    Latest,
    /// Publish the mean of the values seen during the period
    Average,
}

/// Rate limit of one topic prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Topic prefix this rule applies to (longest prefix wins)
    pub prefix: String,
    /// Minimum period between periodic publications
    pub period_s: f64,
    /// A change larger than this publishes immediately
    pub margin: f64,
    /// Periodic publication mode
    pub mode: RateLimitMode,
}

/// MQTT broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Client id; the process role is appended
    pub client_id: String,
    pub user: String,
    pub password: String,
    pub keep_alive_s: u64,
    /// Per-topic-prefix rate limits
    pub rate_limits: Vec<RateLimitRule>,
}

/// Modbus client policy shared by all client-side devices
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    /// Retries after the first failed attempt
    pub retries: u32,
    /// Wait between retries; the bus is released meanwhile
    pub retry_wait_ms: u64,
    /// Failures logged per device before further errors are suppressed
    pub rate_limit_errors: u32,
    /// Widest word-register request
    pub max_regs_in_command: u16,
    /// Widest coil/discrete request
    pub max_bits_in_command: u16,
    /// Largest tolerated gap inside a read chunk; `None` = half the width
    pub max_hole_size: Option<u16>,
}

/// Serial line parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, e.g. /dev/ttyUSB0
    pub port: String,
    pub baudrate: u32,
    /// N, E or O
    pub parity: String,
    pub stop_bits: u8,
    /// Per-transaction timeout
    pub timeout_ms: u64,
}

/// Main three-phase meter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub serial: SerialConfig,
    pub unit_id: u8,
    pub poll_interval_ms: u64,
}

/// Register layout served by a fake meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FakeMeterClass {
    /// Eastron SDM120 style, IEEE754 floats in input registers
    EastronSdm120,
    /// Acrel ACR10R style, scaled integers in holding registers
    AcrelAcr10r,
}

impl FakeMeterClass {
    /// Inverter meter type register value selecting this layout
    pub fn meter_type_code(self) -> u16 {
        match self {
            FakeMeterClass::AcrelAcr10r => 0x0101,
            FakeMeterClass::EastronSdm120 => 0x0201,
        }
    }
}

/// Fake meter serial port of one inverter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeMeterPortConfig {
    pub serial: SerialConfig,
    /// Unit address the inverter polls; others are ignored
    pub unit_id: u8,
    pub meter_class: FakeMeterClass,
}

/// One hybrid inverter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InverterConfig {
    /// Short name used in MQTT topics (pv/<name>/...)
    pub name: String,
    pub serial: SerialConfig,
    pub unit_id: u8,
    /// Unit id of the grid-port meter on the same RS-485 segment
    pub local_meter_unit_id: u8,
    pub poll_interval_ms: u64,
    /// Meter type/placement register value; 0 derives it from the fake meter class
    pub meter_type_value: u16,
    pub fake_meter: FakeMeterPortConfig,
}

/// Freshness contract of the fake meters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeMeterConfig {
    /// Above this age the served active power is forced to zero
    pub max_age_ignore_s: f64,
    /// Above this age requests are refused entirely
    pub max_age_abort_s: f64,
    /// Maintenance switch: refuse every request
    pub refuse_all: bool,
    /// Period of the request statistics publication
    pub stats_period_s: u64,
}

/// One inverter CAN interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanInverterConfig {
    /// Inverter name, matching `inverters[].name`
    pub name: String,
    /// SocketCAN interface, e.g. can1
    pub interface: String,
}

/// Battery <-> inverter CAN relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    pub battery_interface: String,
    pub inverters: Vec<CanInverterConfig>,
    /// Echo tick for inverter replies towards the battery
    pub echo_period_ms: u64,
    /// Bounded echo queue length; oldest dropped
    pub echo_capacity: usize,
    /// User charge current limit (A)
    pub max_charge_current_a: f64,
    /// User discharge current limit (A)
    pub max_discharge_current_a: f64,
    /// Pause before reopening a failed interface
    pub reconnect_delay_s: u64,
}

/// Power aggregation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Coefficient of the SoC-linked meter bias
    pub soc_bias_coefficient: f64,
    /// Battery charge power above which the bias applies
    pub soc_bias_threshold_w: f64,
    /// Inverter counts as online if its fake meter was queried this recently
    pub fake_meter_alive_s: f64,
    /// Self-balancing gain between two online inverters
    pub balance_gain: f64,
    /// Topic of the compact snapshot consumed by the router
    pub snapshot_topic: String,
}

/// Per-plug router tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlugProfile {
    pub enabled: bool,
    pub priority: i32,
    /// Expected draw when switched on
    pub power_w: f64,
    pub hysteresis_w: f64,
    pub min_on_time_s: f64,
    pub min_off_time_s: f64,
    /// Wait after a switch before the next decision
    pub settle_time_s: f64,
}

/// Battery reservation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryProfile {
    pub priority: i32,
    /// Piecewise-linear SoC (%) -> reserved charge power (W)
    pub reserve: Vec<[f64; 2]>,
    /// |battery power| above this counts as "moving power"
    pub active_threshold_w: f64,
    /// Moving average window for activity and fullness detection
    pub average_window_s: f64,
    /// SoC at or above which the battery counts as full
    pub full_soc: f64,
}

/// EVSE controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvseProfile {
    pub enabled: bool,
    pub priority: i32,
    /// Piecewise-linear SoC (%) -> power the EVSE may take ahead of the battery
    pub high_priority_power: Vec<[f64; 2]>,
    pub start_excess_threshold_w: f64,
    /// Fill level of the start counter that authorizes resume
    pub start_counter_max: f64,
    /// Depth of the stop counter (runs -max..max)
    pub stop_counter_max: f64,
    pub integrator_max_w: f64,
    pub control_gain_p: f64,
    pub control_gain_i: f64,
    pub i_start_a: f64,
    pub i_max_a: f64,
    pub soft_start_s: f64,
    pub charge_detect_threshold_w: f64,
    pub end_of_charge_timeout_s: f64,
    pub unplug_timeout_s: f64,
    pub plug_detect_s: f64,
    pub small_current_step_a: f64,
    pub command_interval_s: f64,
    pub command_interval_small_s: f64,
    pub up_inhibit_s: f64,
    pub power_report_hold_s: f64,
    pub keepalive_s: f64,
    pub stability_threshold_w: f64,
    pub stability_window: usize,
    /// Default force-charge minimum current
    pub force_charge_minimum_a: f64,
    pub hair_trigger_s: f64,
}

/// One named router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterProfile {
    /// Constant added to the excess
    pub offset_w: f64,
    /// Piecewise-linear SoC (%) -> export target (W)
    pub export_target: Vec<[f64; 2]>,
    /// Confirmation time before queued changes commit
    pub confirm_s: f64,
    pub battery: BatteryProfile,
    pub evse: EvseProfile,
    /// Per-plug tuning keyed by plug id
    pub plugs: BTreeMap<String, PlugProfile>,
}

/// A smart plug the router may switch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlugConfig {
    /// Tasmota topic id (cmnd/plugs/<id>/Power)
    pub id: String,
    /// Friendly name
    #[serde(default)]
    pub name: String,
}

/// EVSE and its meter on a dedicated RS-485 segment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvseConfig {
    pub serial: SerialConfig,
    pub unit_id: u8,
    pub meter_unit_id: u8,
}

/// Surplus router
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Name of the active entry in `configs`
    pub active: String,
    pub configs: BTreeMap<String, RouterProfile>,
    pub plugs: Vec<PlugConfig>,
    pub evse: Option<EvseConfig>,
    /// Snapshot older than this is ignored
    pub snapshot_max_age_s: f64,
}

/// Hot-reload supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Files whose modification triggers a reload
    pub watch: Vec<String>,
    /// Touched last by the deploy step; must change too
    pub sentinel: String,
    pub poll_interval_ms: u64,
    /// Wait before restarting a task that failed
    pub restart_backoff_s: u64,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PvError::config(format!("Cannot read {}: {}", path.as_ref().display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| PvError::config(format!("Invalid YAML: {}", e)))?;
        Ok(config)
    }

    /// Resolve the configuration path: explicit argument first, then defaults
    pub fn locate(explicit: Option<&str>) -> Option<PathBuf> {
        if let Some(p) = explicit {
            return Some(PathBuf::from(p));
        }
        ["pvctl.yaml", "/etc/pvctl/config.yaml"]
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    /// Load and validate configuration
    pub fn load(explicit: Option<&str>) -> Result<Self> {
        let path = Self::locate(explicit)
            .ok_or_else(|| PvError::config("No configuration file found"))?;
        let config = Self::from_file(&path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Active router profile
    pub fn router_profile(&self) -> Option<&RouterProfile> {
        self.router.configs.get(&self.router.active)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.is_empty() {
            return Err(PvError::validation("mqtt.host", "must not be empty"));
        }

        if self.modbus.max_regs_in_command == 0 || self.modbus.max_regs_in_command > 125 {
            return Err(PvError::validation(
                "modbus.max_regs_in_command",
                "must be within 1..=125",
            ));
        }
        if self.modbus.max_bits_in_command == 0 || self.modbus.max_bits_in_command > 2000 {
            return Err(PvError::validation(
                "modbus.max_bits_in_command",
                "must be within 1..=2000",
            ));
        }

        if self.fake_meter.max_age_ignore_s <= 0.0
            || self.fake_meter.max_age_abort_s <= self.fake_meter.max_age_ignore_s
        {
            return Err(PvError::validation(
                "fake_meter.max_age_abort_s",
                "must be greater than max_age_ignore_s > 0",
            ));
        }

        let mut names = std::collections::HashSet::new();
        for (i, inv) in self.inverters.iter().enumerate() {
            if inv.name.is_empty() {
                return Err(PvError::validation(
                    format!("inverters[{}].name", i),
                    "must not be empty".to_string(),
                ));
            }
            if !names.insert(inv.name.as_str()) {
                return Err(PvError::validation(
                    format!("inverters[{}].name", i),
                    format!("duplicate inverter name {}", inv.name),
                ));
            }
            if inv.unit_id == inv.local_meter_unit_id {
                return Err(PvError::validation(
                    format!("inverters[{}].local_meter_unit_id", i),
                    "must differ from the inverter unit id".to_string(),
                ));
            }
            if inv.meter_type_value != 0
                && inv.meter_type_value != inv.fake_meter.meter_class.meter_type_code()
            {
                return Err(PvError::validation(
                    format!("inverters[{}].meter_type_value", i),
                    format!(
                        "{:#06x} does not match fake meter class {:?} ({:#06x})",
                        inv.meter_type_value,
                        inv.fake_meter.meter_class,
                        inv.fake_meter.meter_class.meter_type_code()
                    ),
                ));
            }
            if inv.poll_interval_ms == 0 {
                return Err(PvError::validation(
                    format!("inverters[{}].poll_interval_ms", i),
                    "must be greater than 0".to_string(),
                ));
            }
        }

        if self.meter.poll_interval_ms == 0 {
            return Err(PvError::validation(
                "meter.poll_interval_ms",
                "must be greater than 0",
            ));
        }

        if self.can.echo_capacity == 0 {
            return Err(PvError::validation("can.echo_capacity", "must be at least 1"));
        }
        if self.can.max_charge_current_a < 0.0 || self.can.max_discharge_current_a < 0.0 {
            return Err(PvError::validation(
                "can.max_charge_current_a",
                "current limits must not be negative",
            ));
        }

        let profile = self.router_profile().ok_or_else(|| {
            PvError::validation(
                "router.active",
                format!("no configuration named {}", self.router.active),
            )
        })?;
        for (name, p) in &self.router.configs {
            validate_table(&format!("router.configs.{}.export_target", name), &p.export_target)?;
            validate_table(&format!("router.configs.{}.battery.reserve", name), &p.battery.reserve)?;
            validate_table(
                &format!("router.configs.{}.evse.high_priority_power", name),
                &p.evse.high_priority_power,
            )?;
            if p.evse.i_start_a < 6.0 || p.evse.i_max_a > 32.0 || p.evse.i_start_a > p.evse.i_max_a {
                return Err(PvError::validation(
                    format!("router.configs.{}.evse", name),
                    "current bounds must satisfy 6 <= i_start_a <= i_max_a <= 32".to_string(),
                ));
            }
        }
        for plug in &self.router.plugs {
            if !profile.plugs.contains_key(&plug.id) {
                return Err(PvError::validation(
                    format!("router.configs.{}.plugs", self.router.active),
                    format!("missing profile for plug {}", plug.id),
                ));
            }
        }

        Ok(())
    }
}

fn validate_table(field: &str, table: &[[f64; 2]]) -> Result<()> {
    if table.is_empty() {
        return Err(PvError::validation(field, "table must not be empty"));
    }
    if table.windows(2).any(|w| w[1][0] <= w[0][0]) {
        return Err(PvError::validation(
            field,
            "x values must be strictly increasing",
        ));
    }
    Ok(())
}

/// Versioned, atomically swappable configuration
///
/// Readers clone the inner `Arc` and keep using that version until their next
/// iteration boundary.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<(u64, Arc<Config>)>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new((0, Arc::new(config)))),
        }
    }

    /// Current configuration
    pub fn current(&self) -> Arc<Config> {
        match self.inner.read() {
            Ok(guard) => guard.1.clone(),
            Err(poisoned) => poisoned.into_inner().1.clone(),
        }
    }

    /// Generation number; increases on every swap
    pub fn generation(&self) -> u64 {
        match self.inner.read() {
            Ok(guard) => guard.0,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Replace the configuration, returning the new generation
    pub fn swap(&self, config: Config) -> u64 {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.0 += 1;
        guard.1 = Arc::new(config);
        guard.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.inverters.len(), 2);
        assert_eq!(config.can.echo_capacity, 4);
        assert!(config.router_profile().is_some());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.mqtt.host = String::new();
        assert!(config.validate().is_err());

        config = Config::default();
        config.fake_meter.max_age_abort_s = config.fake_meter.max_age_ignore_s;
        assert!(config.validate().is_err());

        config = Config::default();
        config.router.active = "missing".to_string();
        assert!(config.validate().is_err());

        config = Config::default();
        config.inverters[1].name = config.inverters[0].name.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_table_must_increase() {
        assert!(validate_table("t", &[[0.0, 1.0], [10.0, 2.0]]).is_ok());
        assert!(validate_table("t", &[[10.0, 1.0], [10.0, 2.0]]).is_err());
        assert!(validate_table("t", &[]).is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.mqtt.port, deserialized.mqtt.port);
        assert_eq!(config.router.active, deserialized.router.active);
        assert!(deserialized.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "mqtt:\n  host: broker.lan\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.modbus.retries, 2);
    }

    #[test]
    fn test_shared_config_swap() {
        let shared = SharedConfig::new(Config::default());
        assert_eq!(shared.generation(), 0);
        let mut next = Config::default();
        next.router.active = "summer".to_string();
        assert_eq!(shared.swap(next), 1);
        assert_eq!(shared.current().router.active, "summer");
    }
}
