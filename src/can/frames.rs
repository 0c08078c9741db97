//! Pylontech-style battery CAN frames
//!
//! Multi-byte fields are little-endian. Every class keeps the bytes it does
//! not interpret so re-encoding reproduces the wire frame exactly.

use crate::error::{PvError, Result};
use serde::Serialize;

pub const ID_LIMITS: u16 = 0x351;
pub const ID_SOC: u16 = 0x355;
pub const ID_MEASUREMENTS: u16 = 0x356;
pub const ID_ERRORS: u16 = 0x359;
pub const ID_FLAGS: u16 = 0x35C;
pub const ID_MANUFACTURER: u16 = 0x35E;
/// Inverter reply / heartbeat
pub const ID_REPLY: u16 = 0x305;

/// One classic CAN frame with an 11-bit id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawFrame {
    pub id: u16,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(id: u16, data: &[u8]) -> Result<Self> {
        if id > 0x7FF {
            return Err(PvError::protocol(format!("CAN id {:#x} is not 11-bit", id)));
        }
        if data.len() > 8 {
            return Err(PvError::protocol(format!(
                "CAN frame {:#x} carries {} bytes",
                id,
                data.len()
            )));
        }
        Ok(Self {
            id,
            data: data.to_vec(),
        })
    }
}

/// A named bit inside a frame
#[derive(Debug, Clone, Copy)]
pub struct BitDef {
    pub byte: usize,
    pub bit: u8,
    pub name: &'static str,
}

const fn bit(byte: usize, bit: u8, name: &'static str) -> BitDef {
    BitDef { byte, bit, name }
}

pub const PROTECTION_BITS: &[BitDef] = &[
    bit(0, 1, "protection_overvoltage"),
    bit(0, 2, "protection_undervoltage"),
    bit(0, 3, "protection_overtemperature"),
    bit(0, 4, "protection_undertemperature"),
    bit(0, 7, "protection_discharge_overcurrent"),
    bit(1, 0, "protection_charge_overcurrent"),
    bit(1, 3, "protection_system_error"),
];

pub const ALARM_BITS: &[BitDef] = &[
    bit(2, 1, "alarm_high_voltage"),
    bit(2, 2, "alarm_low_voltage"),
    bit(2, 3, "alarm_high_temperature"),
    bit(2, 4, "alarm_low_temperature"),
    bit(2, 7, "alarm_discharge_high_current"),
    bit(3, 0, "alarm_charge_high_current"),
    bit(3, 3, "alarm_internal_communication"),
];

pub const FLAG_BITS: &[BitDef] = &[
    bit(0, 7, "charge_enable"),
    bit(0, 6, "discharge_enable"),
    bit(0, 5, "force_charge_1"),
    bit(0, 4, "force_charge_2"),
    bit(0, 3, "full_charge_request"),
];

/// Flat view of named bits; bytes beyond the frame read as zero
pub fn decode_bits(data: &[u8], defs: &[BitDef]) -> Vec<(&'static str, bool)> {
    defs.iter()
        .map(|d| {
            let byte = data.get(d.byte).copied().unwrap_or(0);
            (d.name, byte & (1 << d.bit) != 0)
        })
        .collect()
}

fn need(id: u16, data: &[u8], len: usize) -> Result<()> {
    if data.len() < len {
        return Err(PvError::protocol(format!(
            "CAN frame {:#x}: expected at least {} bytes, got {}",
            id,
            len,
            data.len()
        )));
    }
    Ok(())
}

fn u16_at(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn i16_at(data: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([data[at], data[at + 1]])
}

/// Charge/discharge limits (0x351)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Limits {
    /// 0.1 V
    pub charge_voltage: u16,
    /// 0.1 A
    pub charge_current: i16,
    /// 0.1 A
    pub discharge_current: i16,
    /// 0.1 V
    pub discharge_voltage: u16,
    pub tail: Vec<u8>,
}

impl Limits {
    pub fn charge_current_a(&self) -> f64 {
        self.charge_current as f64 * 0.1
    }

    pub fn discharge_current_a(&self) -> f64 {
        self.discharge_current as f64 * 0.1
    }

    pub fn charge_voltage_v(&self) -> f64 {
        self.charge_voltage as f64 * 0.1
    }

    pub fn discharge_voltage_v(&self) -> f64 {
        self.discharge_voltage as f64 * 0.1
    }
}

/// State of charge and health (0x355)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Soc {
    pub soc: u16,
    pub soh: u16,
    pub tail: Vec<u8>,
}

/// Battery voltage, current, temperature (0x356)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurements {
    /// 0.01 V
    pub voltage: i16,
    /// 0.1 A, positive while charging
    pub current: i16,
    /// 0.1 °C
    pub temperature: i16,
    pub tail: Vec<u8>,
}

impl Measurements {
    pub fn voltage_v(&self) -> f64 {
        self.voltage as f64 * 0.01
    }

    pub fn current_a(&self) -> f64 {
        self.current as f64 * 0.1
    }

    pub fn temperature_c(&self) -> f64 {
        self.temperature as f64 * 0.1
    }

    /// Replace the current, saturating at the field range
    pub fn set_current_a(&mut self, amps: f64) {
        let raw = (amps * 10.0).round();
        self.current = raw.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    }
}

/// Protection and alarm bitfields (0x359)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Errors {
    pub bytes: Vec<u8>,
}

impl Errors {
    pub fn protection(&self) -> u16 {
        u16_at(&self.bytes, 0)
    }

    pub fn alarm(&self) -> u16 {
        u16_at(&self.bytes, 2)
    }

    pub fn flags(&self) -> Vec<(&'static str, bool)> {
        let mut flags = decode_bits(&self.bytes, PROTECTION_BITS);
        flags.extend(decode_bits(&self.bytes, ALARM_BITS));
        flags
    }
}

/// Request flags (0x35C)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flags {
    pub bits: u8,
    pub tail: Vec<u8>,
}

impl Flags {
    pub fn flags(&self) -> Vec<(&'static str, bool)> {
        decode_bits(&[self.bits], FLAG_BITS)
    }
}

/// Decoded battery or inverter frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BmsFrame {
    Limits(Limits),
    Soc(Soc),
    Measurements(Measurements),
    Errors(Errors),
    Flags(Flags),
    /// ASCII manufacturer name (0x35E)
    Manufacturer(Vec<u8>),
    /// Inverter-origin reply, opaque
    Reply(Vec<u8>),
}

impl BmsFrame {
    pub fn decode(frame: &RawFrame) -> Result<Self> {
        let d = frame.data.as_slice();
        let id = frame.id;
        Ok(match id {
            ID_LIMITS => {
                need(id, d, 8)?;
                BmsFrame::Limits(Limits {
                    charge_voltage: u16_at(d, 0),
                    charge_current: i16_at(d, 2),
                    discharge_current: i16_at(d, 4),
                    discharge_voltage: u16_at(d, 6),
                    tail: d[8..].to_vec(),
                })
            }
            ID_SOC => {
                need(id, d, 4)?;
                BmsFrame::Soc(Soc {
                    soc: u16_at(d, 0),
                    soh: u16_at(d, 2),
                    tail: d[4..].to_vec(),
                })
            }
            ID_MEASUREMENTS => {
                need(id, d, 6)?;
                BmsFrame::Measurements(Measurements {
                    voltage: i16_at(d, 0),
                    current: i16_at(d, 2),
                    temperature: i16_at(d, 4),
                    tail: d[6..].to_vec(),
                })
            }
            ID_ERRORS => {
                need(id, d, 4)?;
                BmsFrame::Errors(Errors { bytes: d.to_vec() })
            }
            ID_FLAGS => {
                need(id, d, 1)?;
                BmsFrame::Flags(Flags {
                    bits: d[0],
                    tail: d[1..].to_vec(),
                })
            }
            ID_MANUFACTURER => BmsFrame::Manufacturer(d.to_vec()),
            ID_REPLY => BmsFrame::Reply(d.to_vec()),
            other => {
                return Err(PvError::protocol(format!("unknown CAN id {:#x}", other)));
            }
        })
    }

    pub fn id(&self) -> u16 {
        match self {
            BmsFrame::Limits(_) => ID_LIMITS,
            BmsFrame::Soc(_) => ID_SOC,
            BmsFrame::Measurements(_) => ID_MEASUREMENTS,
            BmsFrame::Errors(_) => ID_ERRORS,
            BmsFrame::Flags(_) => ID_FLAGS,
            BmsFrame::Manufacturer(_) => ID_MANUFACTURER,
            BmsFrame::Reply(_) => ID_REPLY,
        }
    }

    pub fn encode(&self) -> RawFrame {
        let mut data = Vec::with_capacity(8);
        match self {
            BmsFrame::Limits(l) => {
                data.extend_from_slice(&l.charge_voltage.to_le_bytes());
                data.extend_from_slice(&l.charge_current.to_le_bytes());
                data.extend_from_slice(&l.discharge_current.to_le_bytes());
                data.extend_from_slice(&l.discharge_voltage.to_le_bytes());
                data.extend_from_slice(&l.tail);
            }
            BmsFrame::Soc(s) => {
                data.extend_from_slice(&s.soc.to_le_bytes());
                data.extend_from_slice(&s.soh.to_le_bytes());
                data.extend_from_slice(&s.tail);
            }
            BmsFrame::Measurements(m) => {
                data.extend_from_slice(&m.voltage.to_le_bytes());
                data.extend_from_slice(&m.current.to_le_bytes());
                data.extend_from_slice(&m.temperature.to_le_bytes());
                data.extend_from_slice(&m.tail);
            }
            BmsFrame::Errors(e) => data.extend_from_slice(&e.bytes),
            BmsFrame::Flags(f) => {
                data.push(f.bits);
                data.extend_from_slice(&f.tail);
            }
            BmsFrame::Manufacturer(b) | BmsFrame::Reply(b) => data.extend_from_slice(b),
        }
        RawFrame { id: self.id(), data }
    }

    /// Manufacturer name with padding stripped
    pub fn manufacturer_name(&self) -> Option<String> {
        match self {
            BmsFrame::Manufacturer(b) => Some(
                String::from_utf8_lossy(b)
                    .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                    .to_string(),
            ),
            _ => None,
        }
    }
}
