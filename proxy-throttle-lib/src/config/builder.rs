use crate::{
  config::{Config, validation::*},
  constants::DEFAULT_MODE,
  endpoint::AppEndpoint,
  mode::{ConnectionMode, ModeTable, Throughput},
};
use std::{net::IpAddr, time::Duration};

/// Builder for creating proxy configurations with validation
#[derive(Debug, Default)]
pub struct ConfigBuilder {
  listen_port: Option<u16>,
  listen_ipv6: bool,
  listen_address: Option<IpAddr>,
  tcp_backlog: Option<u32>,
  max_connections: Option<u32>,
  app_endpoint: Option<AppEndpoint>,
  initial_mode: Option<String>,
  modes: ModeTable,
  control_port: Option<u16>,
}

impl ConfigBuilder {
  /// Create a new configuration builder
  pub fn new() -> Self {
    Self::default()
  }

  /// Set the listening port (required)
  pub fn with_listen_port(mut self, port: u16) -> Result<Self, ConfigValidationError> {
    BasicConfigValidator::validate_port("listen_port", port)?;
    self.listen_port = Some(port);
    Ok(self)
  }

  /// Enable or disable IPv6 listening
  pub fn with_ipv6(mut self, enabled: bool) -> Self {
    self.listen_ipv6 = enabled;
    self
  }

  /// Listen on a specific address instead of the unspecified one
  pub fn with_listen_address(mut self, address: IpAddr) -> Self {
    self.listen_address = Some(address);
    self
  }

  /// Set TCP backlog size
  pub fn with_tcp_backlog(mut self, backlog: u32) -> Result<Self, ConfigValidationError> {
    BasicConfigValidator::validate_tcp_backlog(backlog)?;
    self.tcp_backlog = Some(backlog);
    Ok(self)
  }

  /// Set maximum concurrent connections
  pub fn with_max_connections(mut self, max: u32) -> Result<Self, ConfigValidationError> {
    BasicConfigValidator::validate_max_connections(max)?;
    self.max_connections = Some(max);
    Ok(self)
  }

  /// Set the application endpoint (required).
  /// Accepts `tcp://`, `unix://`, `pipe://` forms and bare socket addresses.
  pub fn with_app_endpoint(mut self, endpoint: &str) -> Result<Self, ConfigValidationError> {
    self.app_endpoint = Some(endpoint.parse()?);
    Ok(self)
  }

  /// Set an already resolved application endpoint
  pub fn with_endpoint(mut self, endpoint: AppEndpoint) -> Self {
    self.app_endpoint = Some(endpoint);
    self
  }

  /// Mode active at startup, `perfect` if not set
  pub fn with_initial_mode(mut self, name: &str) -> Self {
    self.initial_mode = Some(name.trim().to_string());
    self
  }

  /// Define a mode or override a built-in one. `None` or `Some(0)` bytes per second means unlimited.
  pub fn with_mode(mut self, name: &str, bps: Option<u64>, delay_ms: u64) -> Result<Self, ConfigValidationError> {
    ModeValidator::validate_mode(name, delay_ms)?;
    let mode = ConnectionMode::new(
      name,
      Throughput::from_bps(bps.unwrap_or(0)),
      Duration::from_millis(delay_ms),
    );
    if let Some(replaced) = self.modes.insert(mode) {
      crate::trace::debug!("Mode '{}' overridden by configuration", replaced.name());
    }
    Ok(self)
  }

  /// Enable the loopback control channel on the given port
  pub fn with_control_port(mut self, port: u16) -> Result<Self, ConfigValidationError> {
    BasicConfigValidator::validate_control_port(port, self.listen_port)?;
    self.control_port = Some(port);
    Ok(self)
  }

  /// Build the final configuration with validation
  pub fn build(self) -> Result<Config, ConfigValidationError> {
    let listen_port = self.listen_port.ok_or_else(|| ConfigValidationError::MissingRequiredField {
      field: "listen_port".to_string(),
    })?;
    let app_endpoint = self.app_endpoint.ok_or_else(|| ConfigValidationError::MissingRequiredField {
      field: "app_endpoint".to_string(),
    })?;

    let initial_mode = self.initial_mode.unwrap_or_else(|| DEFAULT_MODE.to_string());
    if !self.modes.contains(&initial_mode) {
      return Err(ConfigValidationError::InvalidFieldValue {
        field: "initial_mode".to_string(),
        value: initial_mode,
        reason: format!("Known modes are: {}", self.modes.names().join(", ")),
      });
    }

    // with_control_port may have been called before with_listen_port
    if let Some(control_port) = self.control_port {
      BasicConfigValidator::validate_control_port(control_port, Some(listen_port))?;
    }

    let listen_address = match self.listen_address {
      Some(address) => {
        if address.is_ipv6() != self.listen_ipv6 {
          return Err(ConfigValidationError::ConflictingConfiguration {
            reason: format!("listen_address {address} does not match listen_ipv6 = {}", self.listen_ipv6),
          });
        }
        address
      }
      None => Config::unspecified_address(self.listen_ipv6),
    };

    Ok(Config {
      listen_port,
      listen_ipv6: self.listen_ipv6,
      listen_address,
      tcp_backlog: self.tcp_backlog,
      max_connections: self.max_connections,
      app_endpoint,
      initial_mode,
      modes: self.modes,
      control_port: self.control_port,
    })
  }
}
