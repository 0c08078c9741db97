//! Client-side device drivers
//!
//! Each driver owns one [`SlaveDevice`](crate::modbus::SlaveDevice) per
//! physical unit and publishes its readings through a `watch` channel.

pub mod evse;
pub mod inverter;
pub mod local_meter;
pub mod meter;

pub use evse::{EvseDevice, EvseStatus};
pub use inverter::{ClockAction, InverterDriver, InverterReading};
pub use local_meter::LocalMeter;
pub use meter::{MeterPoller, MeterReading};
