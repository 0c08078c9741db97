//! # pvctl - PV surplus controller
//!
//! Controls a small PV installation with a shared battery: it impersonates
//! the grid meter towards each hybrid inverter so they share the battery
//! load, relays the battery BMS traffic to both inverters over CAN, and
//! routes excess solar power to an EV charger and smart plugs.
//!
//! ## Features
//!
//! - **Bulk Modbus RTU**: register tables read in as few requests as possible
//! - **Fake Smartmeter**: RS-485 slave answering each inverter's meter queries
//! - **CAN Relay**: battery to inverter relay with user-imposed current limits
//! - **Surplus Routing**: priority-ordered plugs, battery reservation and an
//!   adaptive EVSE current controller
//! - **MQTT**: rate-limited telemetry and typed user settings
//! - **Hot Reload**: configuration swaps without closing serial ports
//!
//! ## Architecture
//!
//! - `config`: Configuration loading, validation and the shared snapshot
//! - `logging`: Structured logging and tracing
//! - `modbus`: Register abstraction, chunk planner and RTU client
//! - `devices`: Main meter, inverter, local meter and EVSE drivers
//! - `fake_meter`: Smartmeter impersonation served to the inverters
//! - `can`: BMS frame codec and the battery/inverter relay
//! - `aggregator`: Power balancing and the published snapshot
//! - `router`: Excess routing to plugs, battery and EVSE
//! - `mqtt`: Broker client, subscriptions, rate limiter and settings
//! - `supervisor`: Hot reload and task restart
//! - `app`: Process roles and component wiring

pub mod aggregator;
pub mod app;
pub mod can;
pub mod config;
pub mod devices;
pub mod error;
pub mod fake_meter;
pub mod logging;
pub mod modbus;
pub mod mqtt;
pub mod router;
pub mod supervisor;

// Re-export commonly used types
pub use config::{Config, SharedConfig};
pub use error::{PvError, Result};
pub use router::Router;
