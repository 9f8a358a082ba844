use std::net::SocketAddr;

/// Errors that happens during the proxy operation
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
  /* --------------------------------------- */
  #[error("IO error: {0}")]
  IoError(#[from] std::io::Error),

  /* --------------------------------------- */
  /// The exposed listener could not acquire its address
  #[error("Failed to bind {addr}: {source}")]
  BindError {
    addr: SocketAddr,
    #[source]
    source: std::io::Error,
  },

  #[error("Exposed listener is already running")]
  ListenerAlreadyRunning,

  /* --------------------------------------- */
  /// The requested profile is not part of the mode table
  #[error("Unknown connection mode: {0}")]
  UnknownModeError(String),

  /* --------------------------------------- */
  /// Socket level failure while relaying bytes of a single connection
  #[error("Transport error: {0}")]
  TransportError(#[source] std::io::Error),

  /// The internal application endpoint could not be reached
  #[error("Failed to connect to the application endpoint {endpoint}: {source}")]
  EstablishmentError {
    endpoint: String,
    #[source]
    source: std::io::Error,
  },

  /* --------------------------------------- */
  #[error("Build error: {0}")]
  BuildError(#[from] ProxyBuildError),
}

/// Errors that happens during building the proxy
#[derive(thiserror::Error, Debug)]
pub enum ProxyBuildError {
  /// Exposed listener builder error
  #[error("Exposed listener builder error: {0}")]
  ExposedListenerBuilderError(#[from] crate::listener::ExposedListenerBuilderError),
}
