#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod config;
mod log;

use crate::{
  config::{ConfigToml, Opts, parse_opts},
  log::*,
};
use std::{
  net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
  sync::Arc,
};
use throttle_proxy_lib::*;
use tokio_util::sync::CancellationToken;

fn main() {
  let parsed_opts = match parse_opts() {
    Ok(opts) => opts,
    Err(e) => {
      eprintln!("Invalid options: {e}");
      std::process::exit(1);
    }
  };
  if let Err(e) = init_logger(parsed_opts.log_dir_path.as_deref()) {
    eprintln!("Failed to initialize the logger: {e}");
    std::process::exit(1);
  }

  let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
  runtime_builder.enable_all();
  runtime_builder.thread_name("throttle-proxy");
  let runtime = match runtime_builder.build() {
    Ok(runtime) => runtime,
    Err(e) => {
      error!("Failed to build the async runtime: {e}");
      std::process::exit(1);
    }
  };

  runtime.block_on(async {
    if let Err(e) = entrypoint(&parsed_opts, runtime.handle().clone()).await {
      error!("throttle-proxy exited on error: {e}");
      std::process::exit(1);
    }
  });
}

async fn entrypoint(opts: &Opts, runtime_handle: tokio::runtime::Handle) -> Result<(), anyhow::Error> {
  let mut config_toml = ConfigToml::new(&opts.config_file_path)?;
  opts.apply_to(&mut config_toml);
  let config = Config::try_from(config_toml)?;

  info!(
    "Starting throttle-proxy on {}, relaying to {} (modes: {})",
    config.listen_socket_addr(),
    config.app_endpoint,
    config.modes.names().join(", ")
  );
  let controller = Arc::new(ModeController::start(&config, runtime_handle.clone()).await?);

  let cancel_token = CancellationToken::new();
  let control_service = match config.control_port {
    Some(port) => {
      let loopback = if config.listen_ipv6 {
        IpAddr::V6(Ipv6Addr::LOCALHOST)
      } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
      };
      let server = ControlServer::bind(SocketAddr::new(loopback, port), controller.clone()).await?;
      Some(runtime_handle.spawn(server.serve(cancel_token.child_token())))
    }
    None => None,
  };

  tokio::signal::ctrl_c().await?;
  info!("Received Ctrl-C, shutting down");

  cancel_token.cancel();
  if let Some(control_service) = control_service {
    if let Err(e) = control_service.await {
      warn!("Control channel ended abnormally: {e}");
    }
  }
  controller.shutdown().await;
  Ok(())
}
