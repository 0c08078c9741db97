use tracing::{debug, error, info, trace, warn};

/// Context information for log messages
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component name (e.g., "aggregator", "canbridge", "router")
    pub component: String,
    /// Device name for per-device loggers (e.g., "solis1", "main_meter")
    pub device: Option<String>,
    /// Additional context fields
    pub extra_fields: std::collections::BTreeMap<String, String>,
}

impl LogContext {
    /// Create a new log context
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            device: None,
            extra_fields: std::collections::BTreeMap::new(),
        }
    }

    /// Set device name
    pub fn with_device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }

    /// Add extra field
    pub fn with_field(mut self, key: &str, value: String) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }
}

/// Structured logger with context
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    pub(crate) context: LogContext,
}

impl StructuredLogger {
    /// Create a new structured logger with context
    pub fn new(context: LogContext) -> Self {
        Self { context }
    }

    pub fn info(&self, message: &str) {
        let fields = self.format_fields();
        info!(%fields, "{}", message);
    }
    pub fn warn(&self, message: &str) {
        let fields = self.format_fields();
        warn!(%fields, "{}", message);
    }
    pub fn error(&self, message: &str) {
        let fields = self.format_fields();
        error!(%fields, "{}", message);
    }
    pub fn debug(&self, message: &str) {
        let fields = self.format_fields();
        debug!(%fields, "{}", message);
    }
    pub fn trace(&self, message: &str) {
        let fields = self.format_fields();
        trace!(%fields, "{}", message);
    }

    /// Format context fields for logging
    fn format_fields(&self) -> String {
        let mut fields = vec![format!("component={}", self.context.component)];
        if let Some(ref device) = self.context.device {
            fields.push(format!("device={}", device));
        }
        for (key, value) in &self.context.extra_fields {
            fields.push(format!("{}={}", key, value));
        }
        fields.join(",")
    }
}

/// Create a logger for a specific component
pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component))
}

/// Create a logger for one device of a component
pub fn get_logger_for(component: &str, device: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component).with_device(device))
}

/// Decaying log level for repeated device failures
///
/// The first failure after a success is logged at INFO (online -> offline),
/// the next `limit` at WARN, then the rest are suppressed until a success
/// resets the counter.
#[derive(Debug, Clone)]
pub struct ErrorRateLimiter {
    limit: u32,
    consecutive: u32,
}

impl ErrorRateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }

    /// Record a failure; returns whether it was logged
    pub fn failure(&mut self, logger: &StructuredLogger, message: &str) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        match self.consecutive {
            1 => {
                logger.info(&format!("Going offline: {}", message));
                true
            }
            n if n <= self.limit + 1 => {
                logger.warn(message);
                if n == self.limit + 1 {
                    logger.warn("Further errors suppressed until the device answers again");
                }
                true
            }
            _ => {
                logger.trace(message);
                false
            }
        }
    }

    /// Record a success; logs the recovery if failures were pending
    pub fn success(&mut self, logger: &StructuredLogger) {
        if self.consecutive > 0 {
            logger.info(&format!(
                "Back online after {} failed transactions",
                self.consecutive
            ));
        }
        self.consecutive = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_context() {
        let context = LogContext::new("test")
            .with_device("solis1")
            .with_field("key", "value".to_string());

        assert_eq!(context.component, "test");
        assert_eq!(context.device, Some("solis1".to_string()));
        assert_eq!(context.extra_fields.get("key"), Some(&"value".to_string()));
    }

    #[test]
    fn test_get_logger() {
        let logger = get_logger("test_component");
        assert_eq!(logger.context.component, "test_component");
        let logger = get_logger_for("modbus", "main_meter");
        assert_eq!(logger.context.device.as_deref(), Some("main_meter"));
    }

    #[test]
    fn test_error_rate_limiter_decays_and_resets() {
        let logger = get_logger("test");
        let mut rl = ErrorRateLimiter::new(2);
        assert!(rl.failure(&logger, "timeout"));
        assert!(rl.failure(&logger, "timeout"));
        assert!(rl.failure(&logger, "timeout"));
        assert!(!rl.failure(&logger, "timeout"));
        assert_eq!(rl.consecutive_failures(), 4);
        rl.success(&logger);
        assert_eq!(rl.consecutive_failures(), 0);
        assert!(rl.failure(&logger, "timeout"));
    }
}
