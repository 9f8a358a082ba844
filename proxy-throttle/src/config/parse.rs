use super::ConfigToml;
use anyhow::anyhow;
use clap::{Arg, ArgMatches, Command, value_parser};

const AFTER_HELP: &str = "\
Modes can be switched at runtime through the control channel when `control_port` is set:
  echo slow | nc 127.0.0.1 <control_port>";

/// Command line options. `mode` and `control_port` take precedence over the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opts {
  pub config_file_path: String,
  /// Directory for throttle-proxy.log and access.log, stdout if none
  pub log_dir_path: Option<String>,
  pub mode: Option<String>,
  pub control_port: Option<u16>,
}

impl Opts {
  /// Apply the command line overrides on top of the parsed config file
  pub fn apply_to(&self, config_toml: &mut ConfigToml) {
    if let Some(mode) = &self.mode {
      config_toml.initial_mode = Some(mode.clone());
    }
    if let Some(port) = self.control_port {
      config_toml.control_port = Some(port);
    }
  }
}

impl TryFrom<&ArgMatches> for Opts {
  type Error = anyhow::Error;

  fn try_from(matches: &ArgMatches) -> Result<Self, Self::Error> {
    let config_file_path = matches
      .get_one::<String>("config_file")
      .ok_or_else(|| anyhow!("--config is required"))?
      .to_owned();
    let control_port = matches.get_one::<u16>("control_port").copied();
    if control_port == Some(0) {
      return Err(anyhow!("--control-port must not be 0"));
    }
    Ok(Opts {
      config_file_path,
      log_dir_path: matches.get_one::<String>("log_dir").cloned(),
      mode: matches.get_one::<String>("mode").cloned(),
      control_port,
    })
  }
}

fn command() -> Command {
  let _ = include_str!("../../Cargo.toml");
  clap::command!()
    .arg(
      Arg::new("config_file")
        .long("config")
        .short('c')
        .value_name("FILE")
        .required(true)
        .help("Configuration file path like ./config.toml"),
    )
    .arg(
      Arg::new("log_dir")
        .long("log-dir")
        .short('l')
        .value_name("LOG_DIR")
        .help("Directory for throttle-proxy.log and access.log. If not specified, logs are printed to stdout."),
    )
    .arg(
      Arg::new("mode")
        .long("mode")
        .short('m')
        .value_name("MODE")
        .help("Mode to start in, overriding `initial_mode`"),
    )
    .arg(
      Arg::new("control_port")
        .long("control-port")
        .value_name("PORT")
        .value_parser(value_parser!(u16))
        .help("Loopback port of the control channel, overriding `control_port`"),
    )
    .after_help(AFTER_HELP)
}

/// Parse arg values passed from cli
pub fn parse_opts() -> Result<Opts, anyhow::Error> {
  Opts::try_from(&command().get_matches())
}
