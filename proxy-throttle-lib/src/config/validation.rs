use crate::constants::{MAX_MODE_DELAY_MSEC, OFFLINE_MODE};

/// Validation errors specific to configuration
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
  #[error("Missing required field: {field}")]
  MissingRequiredField { field: String },

  #[error("Invalid value for field {field}: {value}. {reason}")]
  InvalidFieldValue { field: String, value: String, reason: String },

  #[error("Mode validation error for '{mode_name}': {reason}")]
  ModeValidationError { mode_name: String, reason: String },

  #[error("Conflicting configuration: {reason}")]
  ConflictingConfiguration { reason: String },
}

/// Result type for configuration validation
pub type ValidationResult<T> = Result<T, ConfigValidationError>;

/// Validator for basic configuration fields
pub struct BasicConfigValidator;

impl BasicConfigValidator {
  /// Validate a listening port
  pub fn validate_port(field: &str, port: u16) -> ValidationResult<()> {
    if port == 0 {
      return Err(ConfigValidationError::InvalidFieldValue {
        field: field.to_string(),
        value: port.to_string(),
        reason: "Port cannot be 0".to_string(),
      });
    }

    if port < 1024 {
      crate::trace::warn!("Using privileged port {}: requires appropriate permissions", port);
    }

    Ok(())
  }

  /// Validate TCP backlog size
  pub fn validate_tcp_backlog(backlog: u32) -> ValidationResult<()> {
    if backlog == 0 {
      return Err(ConfigValidationError::InvalidFieldValue {
        field: "tcp_backlog".to_string(),
        value: backlog.to_string(),
        reason: "TCP backlog cannot be 0".to_string(),
      });
    }

    if backlog > 65535 {
      return Err(ConfigValidationError::InvalidFieldValue {
        field: "tcp_backlog".to_string(),
        value: backlog.to_string(),
        reason: "TCP backlog is too large (max 65535)".to_string(),
      });
    }
    Ok(())
  }

  /// Validate connection limit
  pub fn validate_max_connections(max: u32) -> ValidationResult<()> {
    if max == 0 {
      return Err(ConfigValidationError::InvalidFieldValue {
        field: "max_connections".to_string(),
        value: max.to_string(),
        reason: "Max connections cannot be 0".to_string(),
      });
    }
    Ok(())
  }

  /// The control channel must not collide with the exposed port
  pub fn validate_control_port(control_port: u16, listen_port: Option<u16>) -> ValidationResult<()> {
    Self::validate_port("control_port", control_port)?;
    if listen_port == Some(control_port) {
      return Err(ConfigValidationError::ConflictingConfiguration {
        reason: format!("control_port and listen_port are both {control_port}"),
      });
    }
    Ok(())
  }
}

/// Validator for connection mode definitions
pub struct ModeValidator;

impl ModeValidator {
  /// Validate a custom mode definition
  pub fn validate_mode(name: &str, delay_ms: u64) -> ValidationResult<()> {
    if name.trim().is_empty() {
      return Err(ConfigValidationError::ModeValidationError {
        mode_name: name.to_string(),
        reason: "Mode name cannot be empty".to_string(),
      });
    }

    if name.chars().any(char::is_whitespace) {
      return Err(ConfigValidationError::ModeValidationError {
        mode_name: name.to_string(),
        reason: "Mode name cannot contain whitespace".to_string(),
      });
    }

    if name == OFFLINE_MODE {
      return Err(ConfigValidationError::ModeValidationError {
        mode_name: name.to_string(),
        reason: format!("'{OFFLINE_MODE}' is reserved and cannot be redefined"),
      });
    }

    if delay_ms > MAX_MODE_DELAY_MSEC {
      return Err(ConfigValidationError::ModeValidationError {
        mode_name: name.to_string(),
        reason: format!("Delay of {delay_ms} ms exceeds the maximum of {MAX_MODE_DELAY_MSEC} ms"),
      });
    }

    Ok(())
  }
}
