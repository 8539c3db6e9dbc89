//! Configuration validation.
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: KitConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::KitConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `rate_limit.capacity`.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &KitConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.app.name.trim().is_empty() {
        errors.push(ValidationError::new("app.name", "must not be empty"));
    }
    if config.app.stop_timeout_secs == 0 {
        errors.push(ValidationError::new("app.stop_timeout_secs", "must be positive"));
    }

    if config.http.address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "http.address",
            format!("'{}' is not a socket address", config.http.address),
        ));
    }
    if config.http.timeout_secs == 0 {
        errors.push(ValidationError::new("http.timeout_secs", "must be positive"));
    }

    let recovery = &config.recovery;
    if recovery.enabled && !recovery.disable_stack && recovery.stack_size == 0 {
        errors.push(ValidationError::new(
            "recovery.stack_size",
            "must be positive unless disable_stack is set",
        ));
    }

    let rl = &config.rate_limit;
    if rl.capacity == 0 {
        errors.push(ValidationError::new("rate_limit.capacity", "must be positive"));
    }
    if !(rl.rate.is_finite() && rl.rate > 0.0) {
        errors.push(ValidationError::new("rate_limit.rate", "must be a positive number"));
    }

    let cb = &config.circuit_breaker;
    if cb.max_requests == 0 {
        errors.push(ValidationError::new("circuit_breaker.max_requests", "must be positive"));
    }
    if cb.timeout_secs == 0 {
        errors.push(ValidationError::new("circuit_breaker.timeout_secs", "must be positive"));
    }
    if !(0.0..=1.0).contains(&cb.failure_ratio) {
        errors.push(ValidationError::new(
            "circuit_breaker.failure_ratio",
            "must be between 0.0 and 1.0",
        ));
    }

    let obs = &config.observability;
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", obs.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&KitConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_problem() {
        let mut config = KitConfig::default();
        config.app.name = " ".into();
        config.rate_limit.capacity = 0;
        config.circuit_breaker.failure_ratio = 1.5;
        config.http.address = "not-an-address".into();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "app.name",
                "http.address",
                "rate_limit.capacity",
                "circuit_breaker.failure_ratio"
            ]
        );
    }
}
