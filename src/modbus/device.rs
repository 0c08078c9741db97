//! Client-side device: a register table behind one unit address

use super::chunk::{Chunk, Span, plan_chunks};
use super::register::{FunctionCode, Register, RegisterDescriptor, validate_table};
use super::transport::ModbusTransport;
use crate::config::{ModbusConfig, SerialConfig};
use crate::error::{PvError, Result};
use crate::logging::{ErrorRateLimiter, StructuredLogger, get_logger_for};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Retry, timeout and chunking policy of one device
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub retry_wait: Duration,
    pub timeout: Duration,
    pub max_regs: u16,
    pub max_bits: u16,
    pub max_hole: Option<u16>,
    pub rate_limit_errors: u32,
}

impl RetryPolicy {
    pub fn from_config(modbus: &ModbusConfig, serial: &SerialConfig) -> Self {
        Self {
            retries: modbus.retries,
            retry_wait: Duration::from_millis(modbus.retry_wait_ms),
            timeout: Duration::from_millis(serial.timeout_ms),
            max_regs: modbus.max_regs_in_command,
            max_bits: modbus.max_bits_in_command,
            max_hole: modbus.max_hole_size,
            rate_limit_errors: modbus.rate_limit_errors,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ModbusConfig::default(), &SerialConfig::default())
    }
}

/// A remote Modbus slave we poll as client
pub struct SlaveDevice {
    name: String,
    unit_id: u8,
    transport: Arc<dyn ModbusTransport>,
    registers: Vec<Register>,
    index: HashMap<&'static str, usize>,
    policy: RetryPolicy,
    force_multiple_registers: bool,
    online: bool,
    last_transaction: Option<Instant>,
    last_duration: Duration,
    errors: ErrorRateLimiter,
    logger: StructuredLogger,
    plans: HashMap<Vec<usize>, Vec<Chunk>>,
}

impl SlaveDevice {
    pub fn new(
        name: &str,
        unit_id: u8,
        transport: Arc<dyn ModbusTransport>,
        table: Vec<RegisterDescriptor>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        validate_table(&table)?;
        let registers: Vec<Register> = table.into_iter().map(Register::new).collect();
        let index = registers
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name(), i))
            .collect();
        Ok(Self {
            name: name.to_string(),
            unit_id,
            transport,
            registers,
            index,
            errors: ErrorRateLimiter::new(policy.rate_limit_errors),
            policy,
            force_multiple_registers: false,
            online: false,
            last_transaction: None,
            last_duration: Duration::ZERO,
            logger: get_logger_for("modbus", name),
            plans: HashMap::new(),
        })
    }

    /// Always use function 16 (some devices reject function 6)
    pub fn force_multiple_registers(mut self) -> Self {
        self.force_multiple_registers = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Monotonic time of the last successful transaction
    pub fn last_transaction(&self) -> Option<Instant> {
        self.last_transaction
    }

    pub fn last_duration(&self) -> Duration {
        self.last_duration
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.errors.consecutive_failures()
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    pub fn register(&self, name: &str) -> Option<&Register> {
        self.index.get(name).map(|&i| &self.registers[i])
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.register(name).and_then(|r| r.value())
    }

    /// Find a register by wire address (any table)
    pub fn register_at(&self, address: u16) -> Option<&Register> {
        self.registers.iter().find(|r| r.desc.address == address)
    }

    /// Override a cached value without bus traffic
    pub fn force_value(&mut self, name: &str, value: Option<f64>) -> Result<()> {
        let i = self.lookup(name)?;
        self.registers[i].set_value(value);
        Ok(())
    }

    pub fn mark_offline(&mut self) {
        self.online = false;
    }

    fn lookup(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| PvError::generic(format!("{}: no register named {}", self.name, name)))
    }

    fn lookup_all(&self, names: &[&str]) -> Result<Vec<usize>> {
        names.iter().map(|n| self.lookup(n)).collect()
    }

    /// Chunk plan for reading the given registers; cached per register set
    pub fn read_plan(&mut self, names: &[&str]) -> Result<Vec<Chunk>> {
        let idx = self.lookup_all(names)?;
        Ok(self.plan_for(&idx))
    }

    fn plan_for(&mut self, idx: &[usize]) -> Vec<Chunk> {
        if let Some(plan) = self.plans.get(idx) {
            return plan.clone();
        }
        let spans: Vec<Span> = idx
            .iter()
            .map(|&i| {
                let d = &self.registers[i].desc;
                Span {
                    function: d.function,
                    address: d.address,
                    count: d.span(),
                }
            })
            .collect();
        let plan = plan_chunks(
            &spans,
            self.policy.max_regs,
            self.policy.max_bits,
            self.policy.max_hole,
        );
        self.plans.insert(idx.to_vec(), plan.clone());
        plan
    }

    /// Read every register of the table
    pub async fn read_all(&mut self) -> Result<()> {
        let idx: Vec<usize> = (0..self.registers.len()).collect();
        self.read_indices(&idx).await
    }

    /// Read the named registers
    ///
    /// Values become visible together once every chunk has been received; a
    /// failed chunk leaves all values untouched.
    pub async fn read(&mut self, names: &[&str]) -> Result<()> {
        let idx = self.lookup_all(names)?;
        self.read_indices(&idx).await
    }

    async fn read_indices(&mut self, idx: &[usize]) -> Result<()> {
        let plan = self.plan_for(idx);
        let mut received = Vec::with_capacity(plan.len());
        for chunk in &plan {
            let (unit, f, start, count, t) = (
                self.unit_id,
                chunk.function,
                chunk.start,
                chunk.count,
                self.policy.timeout,
            );
            let label = format!("read {}+{}", start, count);
            let words = self
                .transact(&label, move |tr| async move { tr.read(unit, f, start, count, t).await })
                .await?;
            if words.len() < count as usize {
                let e = PvError::protocol(format!(
                    "{}: short response, {} of {} words",
                    self.name,
                    words.len(),
                    count
                ));
                return Err(self.fail(e));
            }
            received.push(words);
        }

        let now = Instant::now();
        for (chunk, words) in plan.iter().zip(received) {
            for &member in &chunk.members {
                let reg = &mut self.registers[idx[member]];
                let offset = (reg.desc.address - chunk.start) as usize;
                if let Err(e) = reg.set_raw(&words[offset..], now) {
                    self.logger.warn(&format!("decode {}: {}", reg.name(), e));
                }
            }
        }
        self.succeed();
        Ok(())
    }

    /// Write the given values; registers not named are never touched
    pub async fn write(&mut self, values: &[(&str, f64)]) -> Result<()> {
        let mut idx = Vec::with_capacity(values.len());
        let mut encoded = Vec::with_capacity(values.len());
        let mut spans = Vec::with_capacity(values.len());
        for (name, v) in values {
            let i = self.lookup(name)?;
            let d = &self.registers[i].desc;
            if !d.function.is_writable() {
                return Err(PvError::validation(d.name, "register is read-only"));
            }
            encoded.push(d.encode(*v)?);
            spans.push(Span {
                function: d.function,
                address: d.address,
                count: d.span(),
            });
            idx.push(i);
        }
        let plan = plan_chunks(&spans, self.policy.max_regs, self.policy.max_bits, Some(0));

        for chunk in &plan {
            let mut words = vec![0u16; chunk.count as usize];
            for &m in &chunk.members {
                let offset = (spans[m].address - chunk.start) as usize;
                words[offset..offset + encoded[m].len()].copy_from_slice(&encoded[m]);
            }
            let (unit, start, t, force) = (
                self.unit_id,
                chunk.start,
                self.policy.timeout,
                self.force_multiple_registers,
            );
            let label = format!("write {}+{}", start, chunk.count);
            if chunk.function == FunctionCode::Coil {
                let bits: Vec<bool> = words.iter().map(|&w| w != 0).collect();
                self.transact(&label, move |tr| {
                    let bits = bits.clone();
                    async move { tr.write_coils(unit, start, &bits, force, t).await }
                })
                .await?;
            } else {
                self.transact(&label, move |tr| {
                    let words = words.clone();
                    async move { tr.write_registers(unit, start, &words, force, t).await }
                })
                .await?;
            }
            for &m in &chunk.members {
                let (_, v) = values[m];
                self.registers[idx[m]].set_written(v, encoded[m].clone());
            }
        }
        self.succeed();
        Ok(())
    }

    /// Write only if the cached value differs; returns whether a write happened
    pub async fn write_if_changed(&mut self, name: &str, value: f64) -> Result<bool> {
        let i = self.lookup(name)?;
        let reg = &self.registers[i];
        let unchanged = if reg.raw().is_empty() {
            reg.value() == Some(value)
        } else {
            reg.desc.encode(value)? == reg.raw()
        };
        if unchanged {
            return Ok(false);
        }
        self.write(&[(name, value)]).await?;
        Ok(true)
    }

    /// Read words outside the register table (diagnostics)
    pub async fn read_raw(
        &mut self,
        function: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let (unit, t) = (self.unit_id, self.policy.timeout);
        let words = self
            .transact("raw read", move |tr| async move {
                tr.read(unit, function, address, count, t).await
            })
            .await?;
        self.succeed();
        Ok(words)
    }

    /// Write holding registers outside the register table (diagnostics)
    pub async fn write_raw(&mut self, address: u16, words: &[u16]) -> Result<()> {
        let (unit, t, force) = (self.unit_id, self.policy.timeout, self.force_multiple_registers);
        let end = address as u32 + words.len() as u32;
        let words = words.to_vec();
        self.transact("raw write", move |tr| {
            let words = words.clone();
            async move { tr.write_registers(unit, address, &words, force, t).await }
        })
        .await?;
        // Cached values may be stale now
        for reg in &mut self.registers {
            if reg.desc.function == FunctionCode::Holding
                && (reg.desc.address as u32) < end
                && reg.desc.end() > address as u32
            {
                reg.set_value(None);
            }
        }
        self.succeed();
        Ok(())
    }

    async fn transact<T, F, Fut>(&mut self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(Arc<dyn ModbusTransport>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            match op(self.transport.clone()).await {
                Ok(v) => {
                    self.last_duration = started.elapsed();
                    self.last_transaction = Some(Instant::now());
                    return Ok(v);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.retries => {
                    attempt += 1;
                    self.logger
                        .debug(&format!("{} failed ({}), retry {}", label, e, attempt));
                    // The transport lock is not held here
                    sleep(self.policy.retry_wait).await;
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn succeed(&mut self) {
        self.online = true;
        self.errors.success(&self.logger);
    }

    fn fail(&mut self, e: PvError) -> PvError {
        self.online = false;
        let message = format!("{} on {}: {}", self.name, self.transport.name(), e);
        self.errors.failure(&self.logger, &message);
        match e {
            PvError::Timeout { .. } | PvError::Transport { .. } => e,
            other => PvError::transport(format!("{}: {}", self.name, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::register::WireType;
    use crate::modbus::transport::MemoryTransport;

    fn device(bus: Arc<MemoryTransport>) -> SlaveDevice {
        let table = vec![
            RegisterDescriptor::input("voltage", 0x00, WireType::F32),
            RegisterDescriptor::input("current", 0x06, WireType::F32),
            RegisterDescriptor::input("power", 0x0C, WireType::F32),
            RegisterDescriptor::holding("limit", 0x10, WireType::U16),
            RegisterDescriptor::holding("mode", 0x11, WireType::U16),
            RegisterDescriptor::holding("other", 0x13, WireType::U16),
            RegisterDescriptor::coil("relay", 0),
        ];
        let policy = RetryPolicy {
            retry_wait: Duration::from_millis(1),
            ..Default::default()
        };
        SlaveDevice::new("dev", 5, bus, table, policy).unwrap()
    }

    #[tokio::test]
    async fn test_read_decodes_and_marks_online() {
        let bus = Arc::new(MemoryTransport::new());
        bus.set_words(5, FunctionCode::Input, 0x00, &crate::modbus::encode_32bit_float(230.0));
        bus.set_words(5, FunctionCode::Input, 0x0C, &crate::modbus::encode_32bit_float(-1500.0));
        let mut dev = device(bus.clone());
        dev.read(&["voltage", "current", "power"]).await.unwrap();
        assert!(dev.is_online());
        assert_eq!(dev.value("voltage"), Some(230.0));
        assert_eq!(dev.value("power"), Some(-1500.0));
        assert_eq!(bus.transactions().len(), 1);
        assert!(dev.last_transaction().is_some());
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let bus = Arc::new(MemoryTransport::new());
        let mut dev = device(bus.clone());
        bus.fail_next(2);
        dev.read(&["voltage"]).await.unwrap();
        assert_eq!(bus.transactions().len(), 3);
    }

    #[tokio::test]
    async fn test_final_failure_goes_offline_and_keeps_values() {
        let bus = Arc::new(MemoryTransport::new());
        bus.set_words(5, FunctionCode::Input, 0x00, &crate::modbus::encode_32bit_float(230.0));
        let mut dev = device(bus.clone());
        dev.read(&["voltage"]).await.unwrap();
        bus.set_dead(5, true);
        let err = dev.read(&["voltage"]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!dev.is_online());
        assert_eq!(dev.value("voltage"), Some(230.0));
        assert_eq!(dev.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_write_never_fills_holes() {
        let bus = Arc::new(MemoryTransport::new());
        bus.set_words(5, FunctionCode::Holding, 0x12, &[0xBEEF]);
        let mut dev = device(bus.clone());
        dev.write(&[("limit", 16.0), ("mode", 1.0), ("other", 2.0)])
            .await
            .unwrap();
        let tx = bus.transactions();
        assert_eq!(tx.len(), 2);
        assert_eq!((tx[0].code, tx[0].address, tx[0].count), (16, 0x10, 2));
        assert_eq!((tx[1].code, tx[1].address, tx[1].count), (6, 0x13, 1));
        assert_eq!(bus.word(5, FunctionCode::Holding, 0x12), 0xBEEF);
        assert_eq!(dev.value("limit"), Some(16.0));
    }

    #[tokio::test]
    async fn test_write_if_changed_is_idempotent() {
        let bus = Arc::new(MemoryTransport::new());
        let mut dev = device(bus.clone());
        assert!(dev.write_if_changed("limit", 10.0).await.unwrap());
        bus.clear_log();
        assert!(!dev.write_if_changed("limit", 10.0).await.unwrap());
        assert!(bus.transactions().is_empty());
        assert!(dev.write_if_changed("limit", 11.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_coil_and_read_only_writes() {
        let bus = Arc::new(MemoryTransport::new());
        let mut dev = device(bus.clone());
        dev.write(&[("relay", 1.0)]).await.unwrap();
        assert_eq!(bus.transactions()[0].code, 5);
        assert!(dev.write(&[("voltage", 1.0)]).await.is_err());
        let mut forced = device(bus.clone()).force_multiple_registers();
        bus.clear_log();
        forced.write(&[("limit", 6.0)]).await.unwrap();
        assert_eq!(bus.transactions()[0].code, 16);
    }

    #[tokio::test]
    async fn test_plan_cached() {
        let bus = Arc::new(MemoryTransport::new());
        let mut dev = device(bus);
        let a = dev.read_plan(&["voltage", "power"]).unwrap();
        let b = dev.read_plan(&["voltage", "power"]).unwrap();
        assert_eq!(a, b);
        assert!(dev.read_plan(&["nope"]).is_err());
    }
}
