use crate::{
  constants::{EARLY_DATA_RECHECK_INTERVAL, PIPE_BUFFER_SIZE},
  endpoint::AppEndpoint,
  error::ProxyError,
  mode::ConnectionMode,
  registry::{ConnectionId, Registration},
  socket::set_reset_on_close,
  throttle::pipe_bidirectional,
  trace::*,
};
use bytes::BytesMut;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
  io::{AsyncReadExt, Interest},
  net::TcpStream,
  time::Instant,
};

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of a proxied connection.
/// `Accepted -> Connecting -> Piping -> Closed`, a connection closed early jumps straight to `Closed`.
pub enum ConnectionState {
  /// External socket accepted, waiting for the mode's connection delay
  Accepted,
  /// Connecting to the application endpoint
  Connecting,
  /// Relaying bytes through the throttled pipes
  Piping,
  Closed,
}

impl std::fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Accepted => write!(f, "accepted"),
      Self::Connecting => write!(f, "connecting"),
      Self::Piping => write!(f, "piping"),
      Self::Closed => write!(f, "closed"),
    }
  }
}

/// How a connection ended without error
#[derive(Debug, PartialEq, Eq)]
enum Closure {
  /// The client closed its socket during the connection delay
  ClosedDuringDelay,
  /// Forced teardown through the registry
  Cancelled,
  /// Both directions reached EOF
  Finished { upstream: u64, downstream: u64 },
}

/* ---------------------------------------------------------- */
/// A client connection relayed to the application endpoint.
/// The mode is snapshotted at accept time and never changes during the lifetime of the connection.
pub(crate) struct ProxiedConnection {
  /// Client facing socket
  external: TcpStream,
  src_addr: SocketAddr,
  mode: Arc<ConnectionMode>,
  endpoint: Arc<AppEndpoint>,
  /// Registry membership, released when the connection is dropped
  registration: Registration,
  state: ConnectionState,
  accepted_at: Instant,
}

impl ProxiedConnection {
  pub(crate) fn new(
    external: TcpStream,
    src_addr: SocketAddr,
    mode: Arc<ConnectionMode>,
    endpoint: Arc<AppEndpoint>,
    registration: Registration,
  ) -> Self {
    Self {
      external,
      src_addr,
      mode,
      endpoint,
      registration,
      state: ConnectionState::Accepted,
      accepted_at: Instant::now(),
    }
  }

  pub(crate) fn id(&self) -> ConnectionId {
    self.registration.id()
  }

  fn transition(&mut self, next: ConnectionState) {
    debug!(conn_id = %self.id(), "Connection state: {} -> {}", self.state, next);
    self.state = next;
  }

  /// Drive the connection until it is closed.
  /// Every error is handled and logged here, nothing escapes to the listener.
  pub(crate) async fn serve(mut self) {
    let conn_id = self.id();
    match self.drive().await {
      Ok(Closure::Finished { upstream, downstream }) => {
        debug!(
          conn_id = %conn_id,
          src_addr = %self.src_addr,
          upstream,
          downstream,
          lifetime = ?self.accepted_at.elapsed(),
          "Connection finished"
        );
      }
      Ok(Closure::Cancelled) => {
        debug!(conn_id = %conn_id, "Connection torn down in state {}", self.state);
      }
      Ok(Closure::ClosedDuringDelay) => {
        debug!(conn_id = %conn_id, "Client closed the connection before it was established");
      }
      Err(e @ ProxyError::EstablishmentError { .. }) => {
        error!(conn_id = %conn_id, src_addr = %self.src_addr, "{e}");
        if let Err(e) = set_reset_on_close(&self.external) {
          debug!(conn_id = %conn_id, "Failed to set linger on the external socket: {e}");
        }
      }
      Err(e) => {
        warn!(conn_id = %conn_id, src_addr = %self.src_addr, "Connection closed by error: {e}");
      }
    }
    self.transition(ConnectionState::Closed);
    // dropping self closes the external socket and leaves the registry
  }

  async fn drive(&mut self) -> Result<Closure, ProxyError> {
    let cancel_token = self.registration.cancel_token().clone();
    let mut early_data = BytesMut::with_capacity(PIPE_BUFFER_SIZE);

    let delay = self.mode.delay();
    if !delay.is_zero() {
      if let Some(closure) = self.wait_delay(delay, &mut early_data).await? {
        return Ok(closure);
      }
    }
    if cancel_token.is_cancelled() {
      return Ok(Closure::Cancelled);
    }

    self.transition(ConnectionState::Connecting);
    let endpoint = Arc::clone(&self.endpoint);
    let internal = tokio::select! {
      res = endpoint.connect() => res.map_err(|source| ProxyError::EstablishmentError {
        endpoint: endpoint.to_string(),
        source,
      })?,
      _ = cancel_token.cancelled() => return Ok(Closure::Cancelled),
    };

    self.transition(ConnectionState::Piping);
    let throughput = self.mode.throughput();
    tokio::select! {
      res = pipe_bidirectional(&mut self.external, &early_data, internal, throughput) => {
        let (upstream, downstream) = res.map_err(ProxyError::TransportError)?;
        Ok(Closure::Finished { upstream, downstream })
      }
      _ = cancel_token.cancelled() => Ok(Closure::Cancelled),
    }
  }

  /// Hold the connection for `delay`.
  /// Bytes sent by the client meanwhile are buffered up to `early_data`'s capacity and relayed once piping starts.
  /// Returns `Some` when the connection ended during the wait.
  async fn wait_delay(&mut self, delay: Duration, early_data: &mut BytesMut) -> Result<Option<Closure>, ProxyError> {
    let cancel_token = self.registration.cancel_token().clone();
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    // set while the buffer is full and unread bytes keep the socket readable
    let mut recheck_at: Option<Instant> = None;

    loop {
      if early_data.len() < early_data.capacity() {
        tokio::select! {
          _ = &mut sleep => return Ok(None),
          _ = cancel_token.cancelled() => return Ok(Some(Closure::Cancelled)),
          res = self.external.read_buf(&mut *early_data) => match res {
            Ok(0) => return Ok(Some(Closure::ClosedDuringDelay)),
            Ok(len) => debug!(conn_id = %self.registration.id(), "Buffered {len} bytes during the connection delay"),
            Err(e) => return Err(ProxyError::TransportError(e)),
          },
        }
        continue;
      }

      // Buffer full: stop reading and only watch for the client closing its side.
      tokio::select! {
        _ = &mut sleep => return Ok(None),
        _ = cancel_token.cancelled() => return Ok(Some(Closure::Cancelled)),
        res = self.external.ready(Interest::READABLE), if recheck_at.is_none() => match res {
          Ok(ready) if ready.is_read_closed() => return Ok(Some(Closure::ClosedDuringDelay)),
          Ok(_) => recheck_at = Some(Instant::now() + EARLY_DATA_RECHECK_INTERVAL),
          Err(e) => return Err(ProxyError::TransportError(e)),
        },
        _ = tokio::time::sleep_until(recheck_at.unwrap_or_else(Instant::now)), if recheck_at.is_some() => {
          recheck_at = None;
        }
      }
    }
  }
}
