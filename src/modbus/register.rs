//! Declarative register descriptors and live register instances

use crate::error::{PvError, Result};
use std::time::Instant;

/// Modbus data table a register lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FunctionCode {
    Coil,
    DiscreteInput,
    Holding,
    Input,
}

impl FunctionCode {
    /// Bit tables (coils, discrete inputs) are addressed per bit
    pub fn is_bit(self) -> bool {
        matches!(self, FunctionCode::Coil | FunctionCode::DiscreteInput)
    }

    /// Function code used to read this table
    pub fn read_code(self) -> u8 {
        match self {
            FunctionCode::Coil => 1,
            FunctionCode::DiscreteInput => 2,
            FunctionCode::Holding => 3,
            FunctionCode::Input => 4,
        }
    }

    pub fn is_writable(self) -> bool {
        matches!(self, FunctionCode::Coil | FunctionCode::Holding)
    }
}

/// Encoding of a register on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Bool,
    U16,
    I16,
    U32,
    I32,
    U64,
    F32,
    /// 16 named flags in one word
    Bitfield16,
}

impl WireType {
    /// Span in words (or bits for [`WireType::Bool`])
    pub fn words(self) -> u16 {
        match self {
            WireType::Bool | WireType::U16 | WireType::I16 | WireType::Bitfield16 => 1,
            WireType::U32 | WireType::I32 | WireType::F32 => 2,
            WireType::U64 => 4,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, WireType::I16 | WireType::I32 | WireType::F32)
    }
}

/// User-facing type of a decoded value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Bitfield,
}

/// Word order of multi-word values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordOrder {
    /// Most significant word at the lowest address
    HighFirst,
    LowFirst,
}

/// Immutable metadata of one device register
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDescriptor {
    pub name: &'static str,
    pub function: FunctionCode,
    pub address: u16,
    pub wire: WireType,
    pub kind: ValueKind,
    /// value = raw * scale
    pub scale: f64,
    pub unit: &'static str,
    pub decimals: u8,
    pub word_order: WordOrder,
    /// Swap the two bytes of every word
    pub byte_swap: bool,
    /// Flag names of a bitfield, index = bit number; empty names are unused bits
    pub bits: &'static [&'static str],
}

impl RegisterDescriptor {
    fn base(name: &'static str, function: FunctionCode, address: u16, wire: WireType) -> Self {
        let kind = match wire {
            WireType::Bool => ValueKind::Bool,
            WireType::F32 => ValueKind::Float,
            WireType::Bitfield16 => ValueKind::Bitfield,
            _ => ValueKind::Int,
        };
        Self {
            name,
            function,
            address,
            wire,
            kind,
            scale: 1.0,
            unit: "",
            decimals: 0,
            word_order: WordOrder::HighFirst,
            byte_swap: false,
            bits: &[],
        }
    }

    pub fn input(name: &'static str, address: u16, wire: WireType) -> Self {
        Self::base(name, FunctionCode::Input, address, wire)
    }

    pub fn holding(name: &'static str, address: u16, wire: WireType) -> Self {
        Self::base(name, FunctionCode::Holding, address, wire)
    }

    pub fn coil(name: &'static str, address: u16) -> Self {
        Self::base(name, FunctionCode::Coil, address, WireType::Bool)
    }

    pub fn discrete(name: &'static str, address: u16) -> Self {
        Self::base(name, FunctionCode::DiscreteInput, address, WireType::Bool)
    }

    /// Scaled integer: decoded as a float with the given scale
    pub fn scaled(mut self, scale: f64, decimals: u8) -> Self {
        self.scale = scale;
        self.decimals = decimals;
        self.kind = ValueKind::Float;
        self
    }

    pub fn unit(mut self, unit: &'static str) -> Self {
        self.unit = unit;
        if self.kind == ValueKind::Float && self.decimals == 0 && self.wire == WireType::F32 {
            self.decimals = 2;
        }
        self
    }

    pub fn word_order(mut self, order: WordOrder) -> Self {
        self.word_order = order;
        self
    }

    pub fn byte_swapped(mut self) -> Self {
        self.byte_swap = true;
        self
    }

    /// Integer with unit scale -1 (sign inverted)
    pub fn negated(mut self) -> Self {
        self.scale = -self.scale;
        self
    }

    pub fn bitfield(mut self, bits: &'static [&'static str]) -> Self {
        self.wire = WireType::Bitfield16;
        self.kind = ValueKind::Bitfield;
        self.bits = bits;
        self
    }

    /// Span in words (bits for bit tables)
    pub fn span(&self) -> u16 {
        self.wire.words()
    }

    /// First address past the register
    pub fn end(&self) -> u32 {
        self.address as u32 + self.span() as u32
    }

    /// Consistency of the scale/type/table combination
    pub fn validate(&self) -> Result<()> {
        if self.function.is_bit() != (self.wire == WireType::Bool) {
            return Err(PvError::validation(
                self.name,
                "bit tables hold exactly the bool wire type",
            ));
        }
        if self.kind == ValueKind::Int && self.scale != 1.0 && self.scale != -1.0 {
            return Err(PvError::validation(
                self.name,
                "integer registers require scale 1 or -1",
            ));
        }
        if self.kind == ValueKind::Bitfield && self.wire != WireType::Bitfield16 {
            return Err(PvError::validation(self.name, "bitfield must be 16 bits wide"));
        }
        if self.bits.len() > 16 {
            return Err(PvError::validation(self.name, "more than 16 flag names"));
        }
        if self.scale == 0.0 || !self.scale.is_finite() {
            return Err(PvError::validation(self.name, "scale must be finite and non-zero"));
        }
        if self.end() > 0x1_0000 {
            return Err(PvError::validation(self.name, "register runs past address 0xFFFF"));
        }
        Ok(())
    }

    fn order_words(&self, words: &[u16]) -> Vec<u16> {
        let mut w: Vec<u16> = words
            .iter()
            .map(|&x| if self.byte_swap { x.swap_bytes() } else { x })
            .collect();
        if self.word_order == WordOrder::LowFirst {
            w.reverse();
        }
        w
    }

    /// Decode wire words into the user value; `None` for an absent value (NaN)
    pub fn decode(&self, words: &[u16]) -> Result<Option<f64>> {
        let n = self.span() as usize;
        if words.len() < n {
            return Err(PvError::protocol(format!(
                "{}: expected {} words, got {}",
                self.name,
                n,
                words.len()
            )));
        }
        let w = self.order_words(&words[..n]);
        let raw: u64 = w.iter().fold(0u64, |acc, &x| (acc << 16) | x as u64);
        let value = match self.wire {
            WireType::Bool => return Ok(Some(if raw != 0 { 1.0 } else { 0.0 })),
            WireType::U16 | WireType::Bitfield16 | WireType::U32 | WireType::U64 => raw as f64,
            WireType::I16 => raw as u16 as i16 as f64,
            WireType::I32 => raw as u32 as i32 as f64,
            WireType::F32 => {
                let f = f32::from_bits(raw as u32);
                if f.is_nan() {
                    return Ok(None);
                }
                f as f64
            }
        };
        Ok(Some(value * self.scale))
    }

    /// Encode a user value into wire words
    pub fn encode(&self, value: f64) -> Result<Vec<u16>> {
        if !value.is_finite() {
            return Err(PvError::protocol(format!(
                "{}: cannot encode non-finite value",
                self.name
            )));
        }
        let raw_f = value / self.scale;
        let raw: u64 = match self.wire {
            WireType::Bool => (value != 0.0) as u64,
            WireType::F32 => (raw_f as f32).to_bits() as u64,
            WireType::U16 | WireType::Bitfield16 => self.check_range(raw_f, 0.0, u16::MAX as f64)? as u64,
            WireType::U32 => self.check_range(raw_f, 0.0, u32::MAX as f64)? as u64,
            WireType::U64 => self.check_range(raw_f, 0.0, u64::MAX as f64)? as u64,
            WireType::I16 => {
                self.check_range(raw_f, i16::MIN as f64, i16::MAX as f64)? as i64 as i16 as u16 as u64
            }
            WireType::I32 => {
                self.check_range(raw_f, i32::MIN as f64, i32::MAX as f64)? as i64 as i32 as u32 as u64
            }
        };
        let n = self.span() as usize;
        let mut words: Vec<u16> = (0..n)
            .rev()
            .map(|i| ((raw >> (16 * i)) & 0xFFFF) as u16)
            .collect();
        if self.word_order == WordOrder::LowFirst {
            words.reverse();
        }
        if self.byte_swap {
            for w in &mut words {
                *w = w.swap_bytes();
            }
        }
        Ok(words)
    }

    fn check_range(&self, raw: f64, min: f64, max: f64) -> Result<f64> {
        let r = raw.round();
        if r < min || r > max {
            return Err(PvError::protocol(format!(
                "{}: raw value {} out of range {}..={}",
                self.name, r, min, max
            )));
        }
        Ok(r)
    }

    /// Named flags of a decoded bitfield value
    pub fn flags(&self, value: f64) -> Vec<(&'static str, bool)> {
        let raw = value as u64;
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, name)| !name.is_empty())
            .map(|(i, name)| (*name, raw & (1 << i) != 0))
            .collect()
    }
}

/// Reject overlapping spans inside one device class
pub fn validate_table(table: &[RegisterDescriptor]) -> Result<()> {
    let mut sorted: Vec<&RegisterDescriptor> = table.iter().collect();
    for d in &sorted {
        d.validate()?;
    }
    sorted.sort_by_key(|d| (d.function, d.address));
    for pair in sorted.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if a.function == b.function && a.end() > b.address as u32 {
            return Err(PvError::validation(
                b.name,
                format!("overlaps register {}", a.name),
            ));
        }
    }
    let mut names: Vec<&str> = table.iter().map(|d| d.name).collect();
    names.sort_unstable();
    if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
        return Err(PvError::validation(dup[0], "duplicate register name"));
    }
    Ok(())
}

/// Descriptor plus its current value
#[derive(Debug, Clone)]
pub struct Register {
    pub desc: RegisterDescriptor,
    value: Option<f64>,
    raw: Vec<u16>,
    last_read: Option<Instant>,
}

impl Register {
    pub fn new(desc: RegisterDescriptor) -> Self {
        Self {
            desc,
            value: None,
            raw: Vec::new(),
            last_read: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.desc.name
    }

    /// Post-scale value; `None` before the first read or when absent on the wire
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn raw(&self) -> &[u16] {
        &self.raw
    }

    pub fn last_read(&self) -> Option<Instant> {
        self.last_read
    }

    /// Value rounded to the descriptor precision, for publication
    pub fn display_value(&self) -> Option<f64> {
        self.value.map(|v| {
            let p = 10f64.powi(self.desc.decimals as i32);
            (v * p).round() / p
        })
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        let v = self.value?;
        self.desc
            .flags(v)
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, b)| b)
    }

    /// Store freshly read wire words
    pub(crate) fn set_raw(&mut self, words: &[u16], at: Instant) -> Result<()> {
        let value = self.desc.decode(words)?;
        self.raw = words[..self.desc.span() as usize].to_vec();
        self.value = value;
        self.last_read = Some(at);
        Ok(())
    }

    /// Store a value after it was written successfully
    pub(crate) fn set_written(&mut self, value: f64, words: Vec<u16>) {
        self.value = Some(value);
        self.raw = words;
    }

    /// Override the cached value without any bus traffic
    pub(crate) fn set_value(&mut self, value: Option<f64>) {
        if value.is_none() {
            self.raw.clear();
        }
        self.value = value;
    }
}
