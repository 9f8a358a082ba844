use crate::{
  config::Config,
  constants::{MAX_TCP_CONCURRENT_CONNECTIONS, TCP_BACKLOG},
  error::ProxyError,
  listener::{ExposedListener, ExposedListenerBuilder},
  mode::{ActiveMode, ConnectionMode, ModeTable},
  registry::ConnectionRegistry,
  trace::*,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of a mode change request
pub enum ModeChange {
  /// The requested mode was already active, nothing was touched
  Unchanged,
  /// The mode was switched and `closed` live connections were torn down
  Switched { from: String, to: String, closed: usize },
}

/* ---------------------------------------------------------- */
/// Owner of the active mode.
/// Switching modes resets every live connection and opens or closes the exposed listener.
pub struct ModeController {
  modes: Arc<ModeTable>,
  active: ActiveMode,
  registry: ConnectionRegistry,
  /// Also serializes mode changes
  listener: Mutex<ExposedListener>,
}

impl ModeController {
  /// Set up the initial mode and start listening unless it is `offline`
  pub async fn start(config: &Config, runtime_handle: tokio::runtime::Handle) -> Result<Self, ProxyError> {
    let modes = Arc::new(config.modes.clone());
    let initial = modes.get(&config.initial_mode)?;
    let active = ActiveMode::new(initial.clone());
    let registry = ConnectionRegistry::default();

    let mut listener = ExposedListenerBuilder::default()
      .listen_on(config.listen_socket_addr())
      .endpoint(Arc::new(config.app_endpoint.clone()))
      .active_mode(active.reader())
      .registry(registry.clone())
      .backlog(config.tcp_backlog.unwrap_or(TCP_BACKLOG))
      .max_connections(
        config
          .max_connections
          .map(|max| max as usize)
          .unwrap_or(MAX_TCP_CONCURRENT_CONNECTIONS),
      )
      .runtime_handle(runtime_handle)
      .build()
      .map_err(crate::error::ProxyBuildError::from)?;

    if !initial.is_offline() {
      listener.start()?;
    }
    info!(mode = %initial, "Connection mode initialized");

    Ok(Self {
      modes,
      active,
      registry,
      listener: Mutex::new(listener),
    })
  }

  /// Switch to the named mode.
  ///
  /// Requesting the active mode is a no-op. Otherwise every live connection is closed, and the listener is
  /// closed for `offline` or (re)opened for any other mode. If the listener cannot be reopened the previous
  /// mode is restored and the bind error returned. An unknown name changes nothing.
  pub async fn set_connection_type(&self, name: &str) -> Result<ModeChange, ProxyError> {
    let mut listener = self.listener.lock().await;

    let next = self.modes.get(name)?;
    let current = self.active.snapshot();
    if current.name() == next.name() {
      debug!(mode = %name, "Connection mode unchanged");
      return Ok(ModeChange::Unchanged);
    }

    let previous = self.active.replace(next.clone());
    let closed = self.registry.close_all();

    if next.is_offline() {
      listener.stop().await;
    } else if !listener.is_running() {
      if let Err(e) = listener.start() {
        error!(mode = %name, "Failed to reopen the exposed listener: {e}");
        self.active.replace(previous);
        return Err(e);
      }
    }

    info!(
      from = %previous.name(),
      to = %next.name(),
      closed,
      "Connection mode switched"
    );
    Ok(ModeChange::Switched {
      from: previous.name().to_string(),
      to: next.name().to_string(),
      closed,
    })
  }

  /// Currently active mode
  pub fn active_mode(&self) -> Arc<ConnectionMode> {
    self.active.snapshot()
  }

  pub async fn is_listening(&self) -> bool {
    self.listener.lock().await.is_running()
  }

  /// Bound address of the exposed listener while it is open
  pub async fn local_addr(&self) -> Option<SocketAddr> {
    self.listener.lock().await.local_addr()
  }

  /// Number of live proxied connections
  pub fn connection_count(&self) -> usize {
    self.registry.len()
  }

  pub fn modes(&self) -> &ModeTable {
    &self.modes
  }

  pub fn registry(&self) -> &ConnectionRegistry {
    &self.registry
  }

  /// Stop listening and close every connection
  pub async fn shutdown(&self) {
    let mut listener = self.listener.lock().await;
    listener.stop().await;
    let closed = self.registry.close_all();
    info!(closed, "Mode controller shut down");
  }
}
