//! Internal application endpoint the proxy forwards to.
//!
//! The application under test is served over a local channel that is unique per process: a Unix domain
//! socket on unix platforms and a named pipe on Windows. Plain TCP is supported as well, mainly for
//! applications that are not hosted in-process.

use crate::{
  config::ConfigValidationError,
  constants::APP_ENDPOINT_PREFIX,
  time_util::get_since_the_epoch_millis,
  trace::*,
};
use std::{net::SocketAddr, str::FromStr};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::{TcpListener, TcpStream},
};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

/// Byte stream to or from the application endpoint
pub trait AppStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AppStream for T {}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, PartialEq, Eq)]
/// Address of the internal application endpoint
pub enum AppEndpoint {
  /// TCP socket address
  Tcp(SocketAddr),
  /// Unix domain socket path
  #[cfg(unix)]
  Unix(PathBuf),
  /// Windows named pipe, e.g. `\\.\pipe\offlinefirst`
  #[cfg(windows)]
  NamedPipe(String),
}

impl AppEndpoint {
  /// Platform default local endpoint, unique to this process
  pub fn unique_local() -> Self {
    let name = format!(
      "{}-{}-{}-{:08x}",
      APP_ENDPOINT_PREFIX,
      std::process::id(),
      get_since_the_epoch_millis(),
      rand::random::<u32>()
    );
    #[cfg(unix)]
    {
      Self::Unix(std::env::temp_dir().join(format!("{name}.sock")))
    }
    #[cfg(windows)]
    {
      Self::NamedPipe(format!(r"\\.\pipe\{name}"))
    }
  }

  /// Open a new stream to the application
  pub async fn connect(&self) -> std::io::Result<Box<dyn AppStream>> {
    match self {
      Self::Tcp(addr) => {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
      }
      #[cfg(unix)]
      Self::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
      #[cfg(windows)]
      Self::NamedPipe(name) => Ok(Box::new(ClientOptions::new().open(name)?)),
    }
  }

  /// Start listening on this endpoint. Used by the application hosting side.
  pub async fn bind(&self) -> std::io::Result<AppListener> {
    let inner = match self {
      Self::Tcp(addr) => AppListenerInner::Tcp(TcpListener::bind(addr).await?),
      #[cfg(unix)]
      Self::Unix(path) => {
        // A socket file left behind by a previous run would make bind fail
        if path.exists() {
          warn!("Removing stale application socket: {}", path.display());
          std::fs::remove_file(path)?;
        }
        AppListenerInner::Unix {
          listener: UnixListener::bind(path)?,
          path: path.clone(),
        }
      }
      #[cfg(windows)]
      Self::NamedPipe(name) => AppListenerInner::NamedPipe {
        server: ServerOptions::new().first_pipe_instance(true).create(name)?,
        name: name.clone(),
      },
    };
    Ok(AppListener { inner })
  }
}

impl std::fmt::Display for AppEndpoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Tcp(addr) => write!(f, "tcp://{addr}"),
      #[cfg(unix)]
      Self::Unix(path) => write!(f, "unix://{}", path.display()),
      #[cfg(windows)]
      Self::NamedPipe(name) => write!(f, "pipe://{name}"),
    }
  }
}

impl FromStr for AppEndpoint {
  type Err = ConfigValidationError;

  /// Accepts `tcp://<addr>`, `unix://<path>`, `pipe://<name>` and bare socket addresses
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = |reason: &str| ConfigValidationError::InvalidFieldValue {
      field: "app_endpoint".to_string(),
      value: s.to_string(),
      reason: reason.to_string(),
    };
    let s = s.trim();

    if let Some(addr) = s.strip_prefix("tcp://") {
      return addr
        .parse::<SocketAddr>()
        .map(Self::Tcp)
        .map_err(|_| invalid("Invalid socket address"));
    }
    if let Some(path) = s.strip_prefix("unix://") {
      if path.is_empty() {
        return Err(invalid("Empty socket path"));
      }
      #[cfg(unix)]
      return Ok(Self::Unix(PathBuf::from(path)));
      #[cfg(not(unix))]
      return Err(invalid("Unix domain sockets are not supported on this platform"));
    }
    if let Some(name) = s.strip_prefix("pipe://") {
      if name.is_empty() {
        return Err(invalid("Empty pipe name"));
      }
      #[cfg(windows)]
      {
        let name = if name.starts_with(r"\\") {
          name.to_string()
        } else {
          format!(r"\\.\pipe\{name}")
        };
        return Ok(Self::NamedPipe(name));
      }
      #[cfg(not(windows))]
      return Err(invalid("Named pipes are only supported on Windows"));
    }
    s.parse::<SocketAddr>()
      .map(Self::Tcp)
      .map_err(|_| invalid("Expected tcp://, unix://, pipe:// or a socket address"))
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug)]
enum AppListenerInner {
  Tcp(TcpListener),
  #[cfg(unix)]
  Unix { listener: UnixListener, path: PathBuf },
  #[cfg(windows)]
  NamedPipe { server: NamedPipeServer, name: String },
}

#[derive(Debug)]
/// Listener on an [`AppEndpoint`]. A Unix socket file is removed when the listener is dropped.
pub struct AppListener {
  inner: AppListenerInner,
}

impl AppListener {
  /// Wait for the next stream from the proxy
  pub async fn accept(&mut self) -> std::io::Result<Box<dyn AppStream>> {
    match &mut self.inner {
      AppListenerInner::Tcp(listener) => {
        let (stream, _) = listener.accept().await?;
        Ok(Box::new(stream))
      }
      #[cfg(unix)]
      AppListenerInner::Unix { listener, .. } => {
        let (stream, _) = listener.accept().await?;
        Ok(Box::new(stream))
      }
      #[cfg(windows)]
      AppListenerInner::NamedPipe { server, name } => {
        server.connect().await?;
        // a pipe instance serves a single client, so set up the next one before handing this one out
        let next = ServerOptions::new().create(name.as_str())?;
        let connected = std::mem::replace(server, next);
        Ok(Box::new(connected))
      }
    }
  }

  /// Endpoint clients should connect to. For TCP this is the actually bound address.
  pub fn endpoint(&self) -> std::io::Result<AppEndpoint> {
    match &self.inner {
      AppListenerInner::Tcp(listener) => Ok(AppEndpoint::Tcp(listener.local_addr()?)),
      #[cfg(unix)]
      AppListenerInner::Unix { path, .. } => Ok(AppEndpoint::Unix(path.clone())),
      #[cfg(windows)]
      AppListenerInner::NamedPipe { name, .. } => Ok(AppEndpoint::NamedPipe(name.clone())),
    }
  }
}

#[cfg(unix)]
impl Drop for AppListener {
  fn drop(&mut self) {
    if let AppListenerInner::Unix { path, .. } = &self.inner {
      if let Err(e) = std::fs::remove_file(path) {
        debug!("Failed to remove application socket {}: {e}", path.display());
      }
    }
  }
}
