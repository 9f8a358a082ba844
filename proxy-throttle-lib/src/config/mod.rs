use crate::{endpoint::AppEndpoint, mode::ModeTable};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub mod builder;
pub mod validation;

pub use builder::ConfigBuilder;
pub use validation::{ConfigValidationError, ValidationResult};

/// Configuration for the throttling proxy
#[derive(Debug, Clone)]
pub struct Config {
  /// Exposed listening port
  pub listen_port: u16,
  /// Listen on IPv6
  pub listen_ipv6: bool,
  /// Exposed listening address, unspecified address of the chosen family unless set
  pub listen_address: IpAddr,
  /// TCP backlog size
  pub tcp_backlog: Option<u32>,
  /// Max concurrent proxied connections
  pub max_connections: Option<u32>,
  /// Internal application endpoint
  pub app_endpoint: AppEndpoint,
  /// Mode active at startup
  pub initial_mode: String,
  /// Built-in profiles plus the configured ones
  pub modes: ModeTable,
  /// Loopback port of the control channel, disabled if none
  pub control_port: Option<u16>,
}

impl Config {
  /// Socket address the exposed listener binds to
  pub fn listen_socket_addr(&self) -> SocketAddr {
    SocketAddr::new(self.listen_address, self.listen_port)
  }

  /// Unspecified address of the requested family
  pub(crate) fn unspecified_address(ipv6: bool) -> IpAddr {
    if ipv6 {
      IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
      IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
  }
}
