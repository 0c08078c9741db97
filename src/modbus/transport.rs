//! Serial transports shared by the devices of one RS-485 segment

use super::register::FunctionCode;
use crate::config::SerialConfig;
use crate::error::{PvError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_serial::{DataBits, Parity, SerialPortBuilder, SerialStream, StopBits};

/// One Modbus master on one serial segment
///
/// Implementations serialize transactions internally; the lock is held for a
/// single request/response exchange only.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Port name for logs
    fn name(&self) -> &str;

    /// Read `count` words (or bits, as 0/1 words) from one table
    async fn read(
        &self,
        unit: u8,
        function: FunctionCode,
        address: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>>;

    /// Write holding registers; a single word uses function 6 unless forced
    async fn write_registers(
        &self,
        unit: u8,
        address: u16,
        words: &[u16],
        force_multiple: bool,
        timeout: Duration,
    ) -> Result<()>;

    /// Write coils; a single bit uses function 5 unless forced
    async fn write_coils(
        &self,
        unit: u8,
        address: u16,
        bits: &[bool],
        force_multiple: bool,
        timeout: Duration,
    ) -> Result<()>;
}

/// Serial port builder for the given line parameters
pub fn serial_builder(cfg: &SerialConfig) -> Result<SerialPortBuilder> {
    let parity = match cfg.parity.to_uppercase().as_str() {
        "N" | "NONE" => Parity::None,
        "E" | "EVEN" => Parity::Even,
        "O" | "ODD" => Parity::Odd,
        other => {
            return Err(PvError::config(format!(
                "{}: unknown parity {}",
                cfg.port, other
            )));
        }
    };
    let stop_bits = match cfg.stop_bits {
        1 => StopBits::One,
        2 => StopBits::Two,
        other => {
            return Err(PvError::config(format!(
                "{}: unsupported stop bits {}",
                cfg.port, other
            )));
        }
    };
    Ok(tokio_serial::new(&cfg.port, cfg.baudrate)
        .data_bits(DataBits::Eight)
        .parity(parity)
        .stop_bits(stop_bits)
        .timeout(Duration::from_millis(cfg.timeout_ms)))
}

/// Modbus RTU master over a tokio-serial port
pub struct RtuTransport {
    port: String,
    ctx: Mutex<Context>,
}

impl RtuTransport {
    /// Open the serial port; failure at startup is fatal for the caller
    pub fn open(cfg: &SerialConfig) -> Result<Self> {
        let builder = serial_builder(cfg)?;
        let stream = SerialStream::open(&builder)
            .map_err(|e| PvError::transport(format!("Cannot open {}: {}", cfg.port, e)))?;
        let ctx = tokio_modbus::client::rtu::attach_slave(stream, Slave(1));
        Ok(Self {
            port: cfg.port.clone(),
            ctx: Mutex::new(ctx),
        })
    }
}

async fn finish<T, F>(port: &str, label: &str, limit: Duration, request: F) -> Result<T>
where
    F: Future<Output = tokio_modbus::Result<T>>,
{
    match timeout(limit, request).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(code))) => Err(PvError::protocol(format!(
            "{}: {} answered with exception {:?}",
            port, label, code
        ))),
        Ok(Err(e)) => Err(PvError::transport(format!("{}: {} failed: {}", port, label, e))),
        Err(_) => Err(PvError::timeout(format!(
            "{}: {} timed out after {} ms",
            port,
            label,
            limit.as_millis()
        ))),
    }
}

#[async_trait]
impl ModbusTransport for RtuTransport {
    fn name(&self) -> &str {
        &self.port
    }

    async fn read(
        &self,
        unit: u8,
        function: FunctionCode,
        address: u16,
        count: u16,
        limit: Duration,
    ) -> Result<Vec<u16>> {
        let mut ctx = self.ctx.lock().await;
        ctx.set_slave(Slave(unit));
        let label = format!("read fc{} {}+{} on unit {}", function.read_code(), address, count, unit);
        match function {
            FunctionCode::Holding => {
                finish(&self.port, &label, limit, ctx.read_holding_registers(address, count)).await
            }
            FunctionCode::Input => {
                finish(&self.port, &label, limit, ctx.read_input_registers(address, count)).await
            }
            FunctionCode::Coil => {
                let bits = finish(&self.port, &label, limit, ctx.read_coils(address, count)).await?;
                Ok(bits.into_iter().map(u16::from).collect())
            }
            FunctionCode::DiscreteInput => {
                let bits =
                    finish(&self.port, &label, limit, ctx.read_discrete_inputs(address, count)).await?;
                Ok(bits.into_iter().map(u16::from).collect())
            }
        }
    }

    async fn write_registers(
        &self,
        unit: u8,
        address: u16,
        words: &[u16],
        force_multiple: bool,
        limit: Duration,
    ) -> Result<()> {
        let mut ctx = self.ctx.lock().await;
        ctx.set_slave(Slave(unit));
        if words.len() == 1 && !force_multiple {
            let label = format!("write fc6 {} on unit {}", address, unit);
            finish(&self.port, &label, limit, ctx.write_single_register(address, words[0])).await
        } else {
            let label = format!("write fc16 {}+{} on unit {}", address, words.len(), unit);
            finish(&self.port, &label, limit, ctx.write_multiple_registers(address, words)).await
        }
    }

    async fn write_coils(
        &self,
        unit: u8,
        address: u16,
        bits: &[bool],
        force_multiple: bool,
        limit: Duration,
    ) -> Result<()> {
        let mut ctx = self.ctx.lock().await;
        ctx.set_slave(Slave(unit));
        if bits.len() == 1 && !force_multiple {
            let label = format!("write fc5 {} on unit {}", address, unit);
            finish(&self.port, &label, limit, ctx.write_single_coil(address, bits[0])).await
        } else {
            let label = format!("write fc15 {}+{} on unit {}", address, bits.len(), unit);
            finish(&self.port, &label, limit, ctx.write_multiple_coils(address, bits)).await
        }
    }
}

/// Request seen by a [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub unit: u8,
    /// Modbus function code number (1-6, 15, 16)
    pub code: u8,
    pub address: u16,
    pub count: u16,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<(u8, FunctionCode, u16), u16>,
    log: Vec<Transaction>,
    dead_units: HashSet<u8>,
    fail_next: u32,
}

/// In-memory slaves on a simulated segment
///
/// Unset addresses read as zero. Units marked dead time out, and
/// [`MemoryTransport::fail_next`] injects transient timeouts.
#[derive(Default)]
pub struct MemoryTransport {
    state: StdMutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Preload words starting at `address`
    pub fn set_words(&self, unit: u8, function: FunctionCode, address: u16, words: &[u16]) {
        let mut s = self.state();
        for (i, w) in words.iter().enumerate() {
            s.tables.insert((unit, function, address.wrapping_add(i as u16)), *w);
        }
    }

    pub fn word(&self, unit: u8, function: FunctionCode, address: u16) -> u16 {
        self.state()
            .tables
            .get(&(unit, function, address))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_dead(&self, unit: u8, dead: bool) {
        let mut s = self.state();
        if dead {
            s.dead_units.insert(unit);
        } else {
            s.dead_units.remove(&unit);
        }
    }

    /// Make the next `n` transactions time out
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state().log.clone()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    fn begin(&self, tx: Transaction) -> Result<()> {
        let mut s = self.state();
        let unit = tx.unit;
        s.log.push(tx);
        if s.fail_next > 0 {
            s.fail_next -= 1;
            return Err(PvError::timeout(format!("memory: unit {} injected timeout", unit)));
        }
        if s.dead_units.contains(&unit) {
            return Err(PvError::timeout(format!("memory: unit {} does not answer", unit)));
        }
        Ok(())
    }
}

#[async_trait]
impl ModbusTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(
        &self,
        unit: u8,
        function: FunctionCode,
        address: u16,
        count: u16,
        _timeout: Duration,
    ) -> Result<Vec<u16>> {
        self.begin(Transaction {
            unit,
            code: function.read_code(),
            address,
            count,
        })?;
        Ok((0..count)
            .map(|i| self.word(unit, function, address.wrapping_add(i)))
            .collect())
    }

    async fn write_registers(
        &self,
        unit: u8,
        address: u16,
        words: &[u16],
        force_multiple: bool,
        _timeout: Duration,
    ) -> Result<()> {
        let code = if words.len() == 1 && !force_multiple { 6 } else { 16 };
        self.begin(Transaction {
            unit,
            code,
            address,
            count: words.len() as u16,
        })?;
        self.set_words(unit, FunctionCode::Holding, address, words);
        Ok(())
    }

    async fn write_coils(
        &self,
        unit: u8,
        address: u16,
        bits: &[bool],
        force_multiple: bool,
        _timeout: Duration,
    ) -> Result<()> {
        let code = if bits.len() == 1 && !force_multiple { 5 } else { 15 };
        self.begin(Transaction {
            unit,
            code,
            address,
            count: bits.len() as u16,
        })?;
        let words: Vec<u16> = bits.iter().map(|&b| u16::from(b)).collect();
        self.set_words(unit, FunctionCode::Coil, address, &words);
        Ok(())
    }
}
