//! Typed user settings received over MQTT

use crate::error::{PvError, Result};
use std::fmt::Display;
use std::str::FromStr;

/// A user-settable value with a command topic and a retained state topic
///
/// Rejected payloads keep the previous value.
#[derive(Debug, Clone)]
pub struct Setting<T> {
    name: &'static str,
    value: T,
    min: Option<T>,
    max: Option<T>,
    command_topic: String,
    state_topic: String,
}

impl<T> Setting<T>
where
    T: FromStr + PartialOrd + Clone + Display,
{
    pub fn new(name: &'static str, value: T, command_topic: &str, state_topic: &str) -> Self {
        Self {
            name,
            value,
            min: None,
            max: None,
            command_topic: command_topic.to_string(),
            state_topic: state_topic.to_string(),
        }
    }

    pub fn with_range(mut self, min: T, max: T) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> T {
        self.value.clone()
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    pub fn state_topic(&self) -> &str {
        &self.state_topic
    }

    /// Set from code; range-checked like a payload
    pub fn set(&mut self, value: T) -> Result<T> {
        self.check(&value)?;
        self.value = value;
        Ok(self.value.clone())
    }

    /// Decode and range-check a payload
    pub fn apply(&mut self, payload: &str) -> Result<T> {
        let value = payload
            .trim()
            .parse::<T>()
            .map_err(|_| PvError::setting(self.name, format!("cannot parse {:?}", payload)))?;
        self.set(value)
    }

    fn check(&self, value: &T) -> Result<()> {
        if let Some(min) = &self.min
            && value < min
        {
            return Err(PvError::setting(
                self.name,
                format!("{} is below minimum {}", value, min),
            ));
        }
        if let Some(max) = &self.max
            && value > max
        {
            return Err(PvError::setting(
                self.name,
                format!("{} is above maximum {}", value, max),
            ));
        }
        Ok(())
    }

    /// Payload for the state topic
    pub fn payload(&self) -> String {
        self.value.to_string()
    }
}
