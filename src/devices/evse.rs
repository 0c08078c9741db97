//! EVSE (ABB Terra AC style) and its dedicated meter

use super::local_meter::LocalMeter;
use crate::error::{PvError, Result};
use crate::logging::{StructuredLogger, get_logger_for};
use crate::modbus::{RegisterDescriptor, SlaveDevice, WireType};
use serde::Serialize;
use std::time::Instant;

/// Socket state when a cable is plugged in and locked
pub const SOCKET_PLUGGED: u32 = 0x111;
/// Lowest non-zero current the wire accepts
pub const WIRE_MIN_CURRENT_A: f64 = 6.0;
pub const WIRE_MAX_CURRENT_A: f64 = 32.0;

pub fn register_table() -> Vec<RegisterDescriptor> {
    let holding = RegisterDescriptor::holding;
    vec![
        holding("error_code", 0x4006, WireType::U32),
        holding("socket_state", 0x400A, WireType::U32),
        holding("charging_state", 0x400C, WireType::U16),
        holding("current_limit", 0x400E, WireType::U32).scaled(0.001, 1).unit("A"),
        holding("charging_current", 0x4010, WireType::U32).scaled(0.001, 1).unit("A"),
        holding("active_power", 0x401C, WireType::U32).unit("W"),
        holding("energy", 0x401E, WireType::U32).unit("Wh"),
        holding("set_current_limit", 0x4100, WireType::U32).scaled(0.001, 3).unit("A"),
    ]
}

const STATUS: &[&str] = &[
    "error_code",
    "socket_state",
    "charging_state",
    "current_limit",
    "charging_current",
    "active_power",
    "energy",
];

/// EVSE state after one poll
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvseStatus {
    pub online: bool,
    pub socket_state: u32,
    pub charging_state: u16,
    pub error_code: u32,
    /// Limit the EVSE reports as applied
    pub current_limit: f64,
    pub charging_current: f64,
    /// Car power from the dedicated meter, EVSE register as fallback
    pub power: f64,
    pub voltage: f64,
    /// Session energy (kWh)
    pub energy: f64,
    pub meter_online: bool,
    #[serde(skip)]
    pub timestamp: Option<Instant>,
}

impl EvseStatus {
    pub fn is_plugged(&self) -> bool {
        self.online && self.socket_state == SOCKET_PLUGGED
    }
}

pub struct EvseDevice {
    evse: SlaveDevice,
    meter: LocalMeter,
    logger: StructuredLogger,
}

impl EvseDevice {
    pub fn new(evse: SlaveDevice, meter: LocalMeter) -> Self {
        let logger = get_logger_for("evse", evse.name());
        Self {
            evse: evse.force_multiple_registers(),
            meter,
            logger,
        }
    }

    pub fn device(&self) -> &SlaveDevice {
        &self.evse
    }

    /// Read EVSE status and the meter; meter errors do not fail the poll
    pub async fn poll(&mut self) -> Result<EvseStatus> {
        let result = self.evse.read(STATUS).await;
        if let Err(e) = self.meter.poll(false).await {
            self.logger.debug(&format!("EVSE meter poll failed: {}", e));
        }
        result.map(|_| self.status())
    }

    pub fn status(&self) -> EvseStatus {
        let v = |n: &str| self.evse.value(n).unwrap_or(0.0);
        let meter_online = self.meter.device().is_online();
        let power = match self.meter.active_power() {
            Some(p) if meter_online => p.abs(),
            _ => v("active_power"),
        };
        EvseStatus {
            online: self.evse.is_online(),
            socket_state: v("socket_state") as u32,
            charging_state: v("charging_state") as u16,
            error_code: v("error_code") as u32,
            current_limit: v("current_limit"),
            charging_current: v("charging_current"),
            power,
            voltage: self.meter.value("voltage").unwrap_or(0.0),
            energy: v("energy") / 1000.0,
            meter_online,
            timestamp: self.evse.last_transaction(),
        }
    }

    /// Command a current limit; 0 pauses, otherwise within 6..=32 A
    pub async fn set_current_limit(&mut self, amps: f64) -> Result<()> {
        if amps != 0.0 && !(WIRE_MIN_CURRENT_A..=WIRE_MAX_CURRENT_A).contains(&amps) {
            return Err(PvError::setting(
                "set_current_limit",
                format!("{} A outside 6..=32 A", amps),
            ));
        }
        self.evse.write(&[("set_current_limit", amps)]).await
    }

    pub async fn pause(&mut self) -> Result<()> {
        self.logger.info("Pausing charge");
        self.set_current_limit(0.0).await
    }
}
