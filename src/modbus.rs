//! Modbus RTU plumbing for pvctl
//!
//! Registers are declared once per device class ([`register`]), grouped into
//! as few transactions as possible ([`chunk`]) and moved over a shared serial
//! transport ([`transport`]) by a [`device::SlaveDevice`]. The server side
//! ([`server`]) holds the register image served by the fake meters.

pub mod chunk;
pub mod device;
pub mod register;
pub mod server;
pub mod transport;

pub use chunk::{Chunk, Span, plan_chunks};
pub use device::{RetryPolicy, SlaveDevice};
pub use register::{
    FunctionCode, Register, RegisterDescriptor, ValueKind, WireType, WordOrder,
};
pub use server::LocalServer;
pub use transport::{ModbusTransport, RtuTransport};

/// Encode 32-bit float to two 16-bit registers (big-endian)
pub fn encode_32bit_float(value: f32) -> [u16; 2] {
    let bits = value.to_bits();
    [(bits >> 16) as u16, (bits & 0xFFFF) as u16]
}
