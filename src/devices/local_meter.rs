//! Single-phase meter on an inverter grid port (Eastron SDM120 style)
//!
//! Also used for the EVSE meter.

use crate::error::{PvError, Result};
use crate::modbus::{RegisterDescriptor, SlaveDevice, WireType};

/// Consecutive timeouts after which a running inverter is considered offgrid
pub const OFFGRID_TIMEOUTS: u32 = 10;

/// One full read every this many cycles; the others read power only
const FULL_READ_EVERY: u64 = 10;

pub fn register_table() -> Vec<RegisterDescriptor> {
    let f = |name, addr, unit| RegisterDescriptor::input(name, addr, WireType::F32).unit(unit);
    vec![
        f("voltage", 0x0000, "V"),
        f("current", 0x0006, "A"),
        f("active_power", 0x000C, "W"),
        f("apparent_power", 0x0012, "VA"),
        f("reactive_power", 0x0018, "var"),
        f("power_factor", 0x001E, ""),
        f("frequency", 0x0046, "Hz"),
        f("import_energy", 0x0048, "kWh"),
        f("export_energy", 0x004A, "kWh"),
    ]
}

const FULL: &[&str] = &[
    "voltage",
    "current",
    "active_power",
    "apparent_power",
    "reactive_power",
    "power_factor",
    "frequency",
    "import_energy",
    "export_energy",
];

/// Fast-path poller: cheap power reads with an occasional full read
pub struct LocalMeter {
    device: SlaveDevice,
    cycle: u64,
    timeouts: u32,
    offgrid: bool,
}

impl LocalMeter {
    pub fn new(device: SlaveDevice) -> Self {
        Self {
            device,
            cycle: 0,
            timeouts: 0,
            offgrid: false,
        }
    }

    pub fn device(&self) -> &SlaveDevice {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut SlaveDevice {
        &mut self.device
    }

    pub fn active_power(&self) -> Option<f64> {
        self.device.value("active_power")
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.device.value(name)
    }

    /// Set when the meter stopped answering while the inverter was running
    pub fn is_offgrid(&self) -> bool {
        self.offgrid
    }

    /// One poll cycle
    ///
    /// While `inverter_on`, [`OFFGRID_TIMEOUTS`] consecutive timeouts force
    /// `active_power` to zero.
    pub async fn poll(&mut self, inverter_on: bool) -> Result<()> {
        let full = self.cycle % FULL_READ_EVERY == 0;
        self.cycle += 1;
        let names: &[&str] = if full { FULL } else { &["active_power"] };
        match self.device.read(names).await {
            Ok(()) => {
                self.timeouts = 0;
                self.offgrid = false;
                Ok(())
            }
            Err(e) => {
                if matches!(e, PvError::Timeout { .. }) {
                    self.timeouts = self.timeouts.saturating_add(1);
                } else {
                    self.timeouts = 0;
                }
                if inverter_on && self.timeouts >= OFFGRID_TIMEOUTS {
                    self.offgrid = true;
                    self.device.force_value("active_power", Some(0.0))?;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::transport::MemoryTransport;
    use crate::modbus::{FunctionCode, RetryPolicy, encode_32bit_float};
    use std::sync::Arc;
    use std::time::Duration;

    fn meter(bus: Arc<MemoryTransport>) -> LocalMeter {
        let policy = RetryPolicy {
            retries: 0,
            retry_wait: Duration::ZERO,
            ..Default::default()
        };
        LocalMeter::new(SlaveDevice::new("grid_port", 2, bus, register_table(), policy).unwrap())
    }

    #[tokio::test]
    async fn test_power_only_between_full_reads() {
        let bus = Arc::new(MemoryTransport::new());
        bus.set_words(2, FunctionCode::Input, 0x0C, &encode_32bit_float(-950.0));
        let mut m = meter(bus.clone());
        m.poll(true).await.unwrap();
        m.poll(true).await.unwrap();
        let tx = bus.transactions();
        // first: full read spans several chunks; second: one 2-word read
        assert_eq!(tx.last().map(|t| (t.address, t.count)), Some((0x0C, 2)));
        assert_eq!(m.active_power(), Some(-950.0));
    }

    #[tokio::test]
    async fn test_offgrid_after_consecutive_timeouts() {
        let bus = Arc::new(MemoryTransport::new());
        bus.set_words(2, FunctionCode::Input, 0x0C, &encode_32bit_float(-950.0));
        let mut m = meter(bus.clone());
        m.poll(true).await.unwrap();
        bus.set_dead(2, true);
        for _ in 0..OFFGRID_TIMEOUTS - 1 {
            assert!(m.poll(true).await.is_err());
        }
        assert!(!m.is_offgrid());
        assert_eq!(m.active_power(), Some(-950.0));
        assert!(m.poll(true).await.is_err());
        assert!(m.is_offgrid());
        assert_eq!(m.active_power(), Some(0.0));
        bus.set_dead(2, false);
        m.poll(true).await.unwrap();
        assert!(!m.is_offgrid());
    }

    #[tokio::test]
    async fn test_no_offgrid_while_inverter_off() {
        let bus = Arc::new(MemoryTransport::new());
        bus.set_dead(2, true);
        let mut m = meter(bus);
        for _ in 0..OFFGRID_TIMEOUTS + 2 {
            let _ = m.poll(false).await;
        }
        assert!(!m.is_offgrid());
    }
}
