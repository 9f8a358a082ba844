use crate::{
  access_log::access_log,
  connection::ProxiedConnection,
  endpoint::AppEndpoint,
  error::ProxyError,
  mode::ActiveModeReader,
  registry::ConnectionRegistry,
  socket::bind_tcp_socket,
  trace::*,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
#[derive(Debug)]
/// Accept loop running in the background
struct RunningListener {
  local_addr: SocketAddr,
  cancel_token: CancellationToken,
  handle: JoinHandle<()>,
}

#[derive(Debug, Clone)]
/// Everything the accept loop needs to set up a proxied connection
struct AcceptContext {
  endpoint: Arc<AppEndpoint>,
  active_mode: ActiveModeReader,
  registry: ConnectionRegistry,
  max_connections: usize,
  runtime_handle: tokio::runtime::Handle,
}

/* ---------------------------------------------------------- */
#[derive(Debug, derive_builder::Builder)]
/// Client facing TCP listener.
/// It can be stopped and started again any number of times; established connections are not affected by either.
pub struct ExposedListener {
  /// Bound socket address to listen on, exposed to the client.
  /// With port 0 the port picked at the first start is reused for every restart.
  listen_on: SocketAddr,

  /// Internal application endpoint accepted connections are relayed to
  endpoint: Arc<AppEndpoint>,

  /// Read access to the process-wide mode, snapshotted for each accepted connection
  active_mode: ActiveModeReader,

  /// Set of live connections, shared with the mode controller
  registry: ConnectionRegistry,

  #[builder(default = "crate::constants::TCP_BACKLOG")]
  /// TCP backlog size
  backlog: u32,

  #[builder(default = "crate::constants::MAX_TCP_CONCURRENT_CONNECTIONS")]
  /// Maximum number of concurrent connections
  max_connections: usize,

  /// Tokio runtime handle
  runtime_handle: tokio::runtime::Handle,

  #[builder(setter(skip))]
  running: Option<RunningListener>,
}

impl ExposedListener {
  /// Bind the listening socket and start accepting in the background.
  /// Returns the bound address. Bind failures are returned as they are, without retrying.
  pub fn start(&mut self) -> Result<SocketAddr, ProxyError> {
    if self.running.is_some() {
      return Err(ProxyError::ListenerAlreadyRunning);
    }
    let bind_error = |source: std::io::Error| ProxyError::BindError {
      addr: self.listen_on,
      source,
    };
    let tcp_socket = bind_tcp_socket(&self.listen_on).map_err(bind_error)?;
    let tcp_listener = tcp_socket.listen(self.backlog).map_err(bind_error)?;
    let local_addr = tcp_listener.local_addr()?;
    self.listen_on = local_addr;

    let cancel_token = CancellationToken::new();
    let ctx = AcceptContext {
      endpoint: Arc::clone(&self.endpoint),
      active_mode: self.active_mode.clone(),
      registry: self.registry.clone(),
      max_connections: self.max_connections,
      runtime_handle: self.runtime_handle.clone(),
    };
    let handle = self
      .runtime_handle
      .spawn(accept_service(tcp_listener, ctx, cancel_token.clone()));
    self.running = Some(RunningListener {
      local_addr,
      cancel_token,
      handle,
    });

    info!("Listening on {local_addr}, relaying to {}", self.endpoint);
    Ok(local_addr)
  }

  /// Stop accepting and release the port. Established connections are left alone.
  pub async fn stop(&mut self) {
    let Some(running) = self.running.take() else {
      return;
    };
    running.cancel_token.cancel();
    if let Err(e) = running.handle.await {
      error!("Accept loop ended abnormally: {e}");
    }
    info!("Stopped listening on {}", running.local_addr);
  }

  pub fn is_running(&self) -> bool {
    self.running.is_some()
  }

  /// Address of the running listener
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.running.as_ref().map(|r| r.local_addr)
  }

  pub fn endpoint(&self) -> &AppEndpoint {
    &self.endpoint
  }
}

/// Accept client connections until cancelled. The listening socket is closed when this returns.
async fn accept_service(tcp_listener: TcpListener, ctx: AcceptContext, cancel_token: CancellationToken) {
  loop {
    let (incoming_stream, src_addr) = tokio::select! {
      res = tcp_listener.accept() => match res {
        Err(e) => {
          error!("Error in TCP listener: {e}");
          continue;
        }
        Ok(res) => res,
      },
      _ = cancel_token.cancelled() => break,
    };
    // Connection limit
    if ctx.registry.len() >= ctx.max_connections {
      warn!("TCP connection limit reached: {}", ctx.max_connections);
      continue;
    }
    if let Err(e) = incoming_stream.set_nodelay(true) {
      debug!("Failed to set TCP_NODELAY for {src_addr}: {e}");
    }

    // Register before taking the snapshot: a mode switch either sees this connection and closes it,
    // or happened before the snapshot was taken.
    let registration = ctx.registry.add(src_addr);
    let mode = ctx.active_mode.snapshot();
    if mode.is_offline() {
      debug!("Dropping {src_addr} accepted while going offline");
      continue;
    }

    access_log(registration.id(), &src_addr, &ctx.endpoint, &mode);
    let conn = ProxiedConnection::new(incoming_stream, src_addr, mode, Arc::clone(&ctx.endpoint), registration);
    debug!(
      conn_id = %conn.id(),
      "Accepted TCP connection from: {src_addr} (total: {})",
      ctx.registry.len()
    );
    ctx.runtime_handle.spawn(conn.serve());
  }
  debug!("Accept loop cancelled");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{mode::ActiveMode, test_utils::*};
  use std::time::Duration;
  use tokio::net::TcpStream;

  fn build_listener(active: &ActiveMode, registry: &ConnectionRegistry, endpoint: AppEndpoint) -> ExposedListener {
    ExposedListenerBuilder::default()
      .listen_on("127.0.0.1:0".parse().unwrap())
      .endpoint(Arc::new(endpoint))
      .active_mode(active.reader())
      .registry(registry.clone())
      .runtime_handle(tokio::runtime::Handle::current())
      .build()
      .unwrap()
  }

  #[tokio::test]
  async fn test_listener_defaults() {
    let active = ActiveMode::new(test_mode("perfect", 0, 0));
    let listener = build_listener(&active, &ConnectionRegistry::default(), AppEndpoint::unique_local());
    assert_eq!(listener.backlog, crate::constants::TCP_BACKLOG);
    assert_eq!(listener.max_connections, crate::constants::MAX_TCP_CONCURRENT_CONNECTIONS);
    assert!(!listener.is_running());
    assert!(listener.local_addr().is_none());
  }

  #[tokio::test]
  async fn test_accept_and_relay() {
    let app = EchoApp::spawn().await;
    let active = ActiveMode::new(test_mode("perfect", 0, 0));
    let registry = ConnectionRegistry::default();
    let mut listener = build_listener(&active, &registry, app.endpoint());
    let addr = listener.start().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_echo(&mut client, b"through the proxy").await;
    assert_eq!(registry.len(), 1);
    listener.stop().await;
  }

  #[tokio::test]
  async fn test_stop_keeps_connections_and_restart_reuses_port() {
    let app = EchoApp::spawn().await;
    let active = ActiveMode::new(test_mode("perfect", 0, 0));
    let registry = ConnectionRegistry::default();
    let mut listener = build_listener(&active, &registry, app.endpoint());
    let addr = listener.start().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_echo(&mut client, b"before").await;

    listener.stop().await;
    assert!(!listener.is_running());
    assert!(TcpStream::connect(addr).await.is_err());
    // established connection survives the stop
    assert_echo(&mut client, b"after stop").await;
    assert_eq!(registry.len(), 1);

    let restarted = listener.start().unwrap();
    assert_eq!(restarted, addr);
    let mut client2 = TcpStream::connect(addr).await.unwrap();
    assert_echo(&mut client2, b"after restart").await;
    listener.stop().await;
  }

  #[tokio::test]
  async fn test_start_twice() {
    let active = ActiveMode::new(test_mode("perfect", 0, 0));
    let mut listener = build_listener(&active, &ConnectionRegistry::default(), AppEndpoint::unique_local());
    listener.start().unwrap();
    assert!(matches!(listener.start(), Err(ProxyError::ListenerAlreadyRunning)));
    listener.stop().await;
  }

  #[tokio::test]
  async fn test_bind_error() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupied.local_addr().unwrap();
    let active = ActiveMode::new(test_mode("perfect", 0, 0));
    let mut listener = ExposedListenerBuilder::default()
      .listen_on(addr)
      .endpoint(Arc::new(AppEndpoint::unique_local()))
      .active_mode(active.reader())
      .registry(ConnectionRegistry::default())
      .runtime_handle(tokio::runtime::Handle::current())
      .build()
      .unwrap();
    assert!(matches!(listener.start(), Err(ProxyError::BindError { addr: a, .. }) if a == addr));
    assert!(!listener.is_running());
  }

  #[tokio::test]
  async fn test_connection_limit() {
    let app = EchoApp::spawn().await;
    let active = ActiveMode::new(test_mode("perfect", 0, 0));
    let registry = ConnectionRegistry::default();
    let mut listener = ExposedListenerBuilder::default()
      .listen_on("127.0.0.1:0".parse().unwrap())
      .endpoint(Arc::new(app.endpoint()))
      .active_mode(active.reader())
      .registry(registry.clone())
      .max_connections(1usize)
      .runtime_handle(tokio::runtime::Handle::current())
      .build()
      .unwrap();
    let addr = listener.start().unwrap();

    let mut first = TcpStream::connect(addr).await.unwrap();
    assert_echo(&mut first, b"first").await;
    let mut second = TcpStream::connect(addr).await.unwrap();
    assert!(wait_closed(&mut second, Duration::from_secs(1)).await);
    assert_eq!(registry.len(), 1);
    listener.stop().await;
  }

  #[tokio::test]
  async fn test_mode_is_snapshotted_at_accept() {
    let app = EchoApp::spawn().await;
    let active = ActiveMode::new(test_mode("perfect", 0, 0));
    let registry = ConnectionRegistry::default();
    let mut listener = build_listener(&active, &registry, app.endpoint());
    let addr = listener.start().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_echo(&mut client, b"fast").await;

    // a throttled mode does not apply to the connection accepted before the swap
    active.replace(test_mode("crawl", 1, 0));
    let start = tokio::time::Instant::now();
    assert_echo(&mut client, &[9u8; 4096]).await;
    assert!(start.elapsed() < Duration::from_secs(1));
    listener.stop().await;
  }
}
