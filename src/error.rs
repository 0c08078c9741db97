//! Error types and handling for pvctl
//!
//! Every recoverable failure in the controller maps onto one of these kinds.
//! Components absorb transport, protocol and stale-data errors locally; only
//! configuration errors are allowed to terminate a process.

use thiserror::Error;

/// Result type alias for pvctl operations
pub type Result<T> = std::result::Result<T, PvError>;

/// Main error type for pvctl
#[derive(Debug, Error)]
pub enum PvError {
    /// Invalid configuration at startup (fatal)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// I/O failure on Modbus or CAN after retries
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Modbus exception response, malformed CAN frame, unknown id
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Fake meter data older than the ignore threshold
    #[error("Stale data: {message}")]
    StaleData { message: String },

    /// User-supplied MQTT setting failed type or range check
    #[error("Setting rejected: {field} - {message}")]
    SettingViolation { field: String, message: String },

    /// Configuration validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// MQTT client errors
    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Task cancelled by the supervisor or by shutdown
    #[error("Cancelled: {message}")]
    Cancelled { message: String },

    /// Anything else
    #[error("Error: {message}")]
    Generic { message: String },
}

impl PvError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        PvError::Config {
            message: message.into(),
        }
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        PvError::Transport {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        PvError::Protocol {
            message: message.into(),
        }
    }

    /// Create a new stale data error
    pub fn stale<S: Into<String>>(message: S) -> Self {
        PvError::StaleData {
            message: message.into(),
        }
    }

    /// Create a new rejected-setting error
    pub fn setting<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        PvError::SettingViolation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        PvError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new MQTT error
    pub fn mqtt<S: Into<String>>(message: S) -> Self {
        PvError::Mqtt {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        PvError::Io {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        PvError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        PvError::Cancelled {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        PvError::Generic {
            message: message.into(),
        }
    }

    /// Errors that a retry may cure (timeouts, bus I/O, exception replies)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PvError::Transport { .. } | PvError::Timeout { .. } | PvError::Protocol { .. }
        )
    }

    /// Errors that must stop the process at startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, PvError::Config { .. } | PvError::Validation { .. })
    }
}

impl From<std::io::Error> for PvError {
    fn from(err: std::io::Error) -> Self {
        PvError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for PvError {
    fn from(err: serde_yaml::Error) -> Self {
        PvError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PvError {
    fn from(err: serde_json::Error) -> Self {
        PvError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<tokio_modbus::Error> for PvError {
    fn from(err: tokio_modbus::Error) -> Self {
        PvError::transport(err.to_string())
    }
}

impl From<tokio_modbus::ExceptionCode> for PvError {
    fn from(code: tokio_modbus::ExceptionCode) -> Self {
        PvError::protocol(format!("Modbus exception: {:?}", code))
    }
}

impl From<rumqttc::ClientError> for PvError {
    fn from(err: rumqttc::ClientError) -> Self {
        PvError::mqtt(err.to_string())
    }
}

impl From<tokio_serial::Error> for PvError {
    fn from(err: tokio_serial::Error) -> Self {
        PvError::transport(err.to_string())
    }
}
