//! Server-side register image (we are the slave)

use super::register::{Register, RegisterDescriptor, WireType, validate_table};
use crate::error::{PvError, Result};
use std::collections::{BTreeMap, HashMap};
use tokio_modbus::{ExceptionCode, Request, Response};

/// Register values served to a remote master
///
/// Holding and input registers are aliased onto one address space.
#[derive(Debug, Clone)]
pub struct LocalServer {
    unit_id: u8,
    registers: Vec<Register>,
    index: HashMap<&'static str, usize>,
    image: BTreeMap<u16, u16>,
}

impl LocalServer {
    pub fn new(unit_id: u8, table: Vec<RegisterDescriptor>) -> Result<Self> {
        validate_table(&table)?;
        let mut aliased = table.clone();
        for d in &mut aliased {
            d.function = super::register::FunctionCode::Holding;
        }
        // Aliasing must not make two registers collide
        validate_table(&aliased)?;
        let registers: Vec<Register> = table.into_iter().map(Register::new).collect();
        let index = registers
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name(), i))
            .collect();
        let mut server = Self {
            unit_id,
            registers,
            index,
            image: BTreeMap::new(),
        };
        for i in 0..server.registers.len() {
            let d = server.registers[i].desc.clone();
            server.store(&d, &vec![0; d.span() as usize]);
        }
        Ok(server)
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.index
            .get(name)
            .and_then(|&i| self.registers[i].value())
    }

    pub fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Update one served value; `None` serves NaN (floats) or zero
    pub fn set(&mut self, name: &str, value: Option<f64>) -> Result<()> {
        self.set_all(&[(name, value)])
    }

    /// Update several values at once; nothing changes if any fails to encode
    pub fn set_all(&mut self, values: &[(&str, Option<f64>)]) -> Result<()> {
        let mut staged = Vec::with_capacity(values.len());
        for &(name, value) in values {
            let i = *self
                .index
                .get(name)
                .ok_or_else(|| PvError::generic(format!("no served register named {}", name)))?;
            let desc = &self.registers[i].desc;
            let words = match value {
                Some(v) => desc.encode(v)?,
                None if desc.wire == WireType::F32 => super::encode_32bit_float(f32::NAN).to_vec(),
                None => vec![0; desc.span() as usize],
            };
            staged.push((i, value, words));
        }
        for (i, value, words) in staged {
            let desc = self.registers[i].desc.clone();
            self.store(&desc, &words);
            self.registers[i].set_value(value);
        }
        Ok(())
    }

    fn store(&mut self, desc: &RegisterDescriptor, words: &[u16]) {
        for (k, w) in words.iter().enumerate() {
            self.image.insert(desc.address + k as u16, *w);
        }
    }

    /// Words at `address..address+count`, with some registers overridden
    ///
    /// Gaps inside the served range read as zero. A range that touches no
    /// served register is an illegal address.
    pub fn read_words(
        &self,
        address: u16,
        count: u16,
        overrides: &[(&str, f64)],
    ) -> std::result::Result<Vec<u16>, ExceptionCode> {
        if count == 0 || count > 125 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let end = address as u32 + count as u32;
        if end > 0x1_0000 {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let mut words: Vec<u16> = (address as u32..end)
            .map(|a| self.image.get(&(a as u16)).copied().unwrap_or(0))
            .collect();
        let touched = self.image.range(address..=((end - 1) as u16)).next().is_some();
        if !touched {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        for (name, v) in overrides {
            let Some(&i) = self.index.get(name) else {
                continue;
            };
            let d = &self.registers[i].desc;
            let Ok(enc) = d.encode(*v) else {
                continue;
            };
            for (k, w) in enc.iter().enumerate() {
                let a = d.address as u32 + k as u32;
                if a >= address as u32 && a < end {
                    words[(a - address as u32) as usize] = *w;
                }
            }
        }
        Ok(words)
    }

    /// Answer one request from the image
    ///
    /// Function codes 3 and 4 read the same datastore; every write is refused.
    pub fn answer(
        &self,
        request: &Request<'_>,
        overrides: &[(&str, f64)],
    ) -> std::result::Result<Response, ExceptionCode> {
        match request {
            Request::ReadHoldingRegisters(addr, cnt) => self
                .read_words(*addr, *cnt, overrides)
                .map(Response::ReadHoldingRegisters),
            Request::ReadInputRegisters(addr, cnt) => self
                .read_words(*addr, *cnt, overrides)
                .map(Response::ReadInputRegisters),
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }
}
