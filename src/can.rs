//! Shared-battery CAN relay
//!
//! One battery BMS feeds two inverters. [`frames`] holds the wire codecs,
//! [`bus`] the interface seam and [`bridge`] the forwarding policy.

pub mod bridge;
pub mod bus;
pub mod frames;

pub use bridge::{BridgeControl, BridgeCore, CanBridge, EchoQueue, Outcome, Publication};
pub use bus::{CanBus, MemoryBus, SocketCanBus};
pub use frames::{BmsFrame, RawFrame};
