use crate::log::warn;
use anyhow::anyhow;
use serde::Deserialize;
use std::{
  collections::{HashMap, HashSet},
  fs,
  net::IpAddr,
};
use throttle_proxy_lib::{Config, ConfigBuilder};

#[derive(Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct ConfigToml {
  pub listen_port: Option<u16>,
  pub listen_ipv6: Option<bool>,
  pub listen_address: Option<String>,
  pub tcp_backlog: Option<u32>,
  pub max_connections: Option<u32>,
  /// `tcp://host:port`, `unix:///path`, `pipe://name` or a bare socket address
  pub app_endpoint: Option<String>,
  pub initial_mode: Option<String>,
  pub control_port: Option<u16>,
  // custom and overridden modes
  pub modes: Option<ModesToml>,
}

#[derive(Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct ModesToml(pub HashMap<String, ModeToml>);

#[derive(Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct ModeToml {
  /// Bytes per second, unlimited if omitted or 0
  pub bps: Option<u64>,
  /// Connection establishment delay in milliseconds
  pub delay_ms: Option<u64>,
}

impl ConfigToml {
  pub fn new(config_file: &str) -> Result<Self, anyhow::Error> {
    let config_str = fs::read_to_string(config_file)?;
    Self::parse(&config_str)
  }

  fn parse(config_str: &str) -> Result<Self, anyhow::Error> {
    // Check unused fields during deserialization
    let t = toml::de::Deserializer::new(config_str);
    let mut unused = HashSet::new();

    let res = serde_ignored::deserialize(t, |path| {
      unused.insert(path.to_string());
    })
    .map_err(|e| anyhow::anyhow!(e));

    if !unused.is_empty() {
      let str = unused.iter().fold(String::new(), |acc, x| acc + x + "\n");
      warn!("Configuration file contains unsupported fields. Check typos:\n{}", str);
    }

    res
  }
}

impl TryFrom<ConfigToml> for Config {
  type Error = anyhow::Error;

  fn try_from(config_toml: ConfigToml) -> Result<Self, Self::Error> {
    let Some(listen_port) = config_toml.listen_port else {
      return Err(anyhow!("listen_port is required"));
    };
    let Some(app_endpoint) = config_toml.app_endpoint else {
      return Err(anyhow!("app_endpoint is required"));
    };

    let mut builder = ConfigBuilder::new()
      .with_listen_port(listen_port)
      .map_err(|e| anyhow!("Invalid listen port: {}", e))?
      .with_ipv6(config_toml.listen_ipv6.unwrap_or(false))
      .with_app_endpoint(&app_endpoint)
      .map_err(|e| anyhow!("Invalid app endpoint: {}", e))?;

    if let Some(address) = config_toml.listen_address {
      let address = address
        .parse::<IpAddr>()
        .map_err(|e| anyhow!("Invalid listen address '{}': {}", address, e))?;
      builder = builder.with_listen_address(address);
    }

    if let Some(backlog) = config_toml.tcp_backlog {
      builder = builder
        .with_tcp_backlog(backlog)
        .map_err(|e| anyhow!("Invalid TCP backlog: {}", e))?;
    }

    if let Some(max_conn) = config_toml.max_connections {
      builder = builder
        .with_max_connections(max_conn)
        .map_err(|e| anyhow!("Invalid max connections: {}", e))?;
    }

    if let Some(modes_toml) = config_toml.modes {
      for (name, mode_toml) in modes_toml.0 {
        builder = builder
          .with_mode(&name, mode_toml.bps, mode_toml.delay_ms.unwrap_or(0))
          .map_err(|e| anyhow!("Invalid mode '{}': {}", name, e))?;
      }
    }

    if let Some(initial_mode) = config_toml.initial_mode {
      builder = builder.with_initial_mode(&initial_mode);
    }

    if let Some(control_port) = config_toml.control_port {
      builder = builder
        .with_control_port(control_port)
        .map_err(|e| anyhow!("Invalid control port: {}", e))?;
    }

    builder.build().map_err(|e| anyhow!("Invalid configuration: {}", e))
  }
}
