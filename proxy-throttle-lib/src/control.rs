//! Loopback control channel.
//!
//! A line based text protocol to drive the [`ModeController`] from test harnesses:
//!
//! ```text
//! > slow              (or: set slow)
//! < ok slow
//! > get
//! < mode slow
//! > modes
//! < modes lie-fi offline perfect slow
//! > status
//! < status mode=slow listening=true connections=0
//! ```

use crate::{
  constants::CONTROL_MAX_LINE_LENGTH,
  controller::{ModeChange, ModeController},
  error::ProxyError,
  trace::*,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
  io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
  net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A single control channel request
pub enum ControlCommand {
  /// Switch to the named mode
  Set(String),
  /// Report the active mode
  Get,
  /// List the known modes
  Modes,
  /// Report mode, listener state and connection count
  Status,
  Unknown(String),
}

impl ControlCommand {
  /// Parse a request line. A bare word other than a keyword is taken as a mode name.
  pub fn parse(line: &str) -> Self {
    let line = line.trim();
    let mut words = line.split_whitespace();
    match (words.next(), words.next(), words.next()) {
      (Some("get"), None, _) => Self::Get,
      (Some("modes"), None, _) => Self::Modes,
      (Some("status"), None, _) => Self::Status,
      (Some("set"), Some(name), None) => Self::Set(name.to_string()),
      (Some(name), None, _) if name != "set" => Self::Set(name.to_string()),
      _ => Self::Unknown(line.to_string()),
    }
  }
}

/* ---------------------------------------------------------- */
/// TCP server of the control channel
pub struct ControlServer {
  listener: TcpListener,
  controller: Arc<ModeController>,
}

impl ControlServer {
  /// Bind the control channel. It is meant for loopback addresses only.
  pub async fn bind(addr: SocketAddr, controller: Arc<ModeController>) -> Result<Self, ProxyError> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|source| ProxyError::BindError { addr, source })?;
    if !addr.ip().is_loopback() {
      warn!("Control channel bound to non-loopback address {addr}");
    }
    Ok(Self { listener, controller })
  }

  pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
    Ok(self.listener.local_addr()?)
  }

  /// Serve control clients until cancelled
  pub async fn serve(self, cancel_token: CancellationToken) {
    info!("Control channel listening on {:?}", self.listener.local_addr().ok());
    loop {
      let (stream, peer) = tokio::select! {
        res = self.listener.accept() => match res {
          Ok(res) => res,
          Err(e) => {
            error!("Error in control listener: {e}");
            continue;
          }
        },
        _ = cancel_token.cancelled() => break,
      };
      debug!("Control client connected: {peer}");
      let controller = self.controller.clone();
      let cancel_token = cancel_token.child_token();
      tokio::spawn(async move {
        tokio::select! {
          res = handle_client(stream, &controller) => {
            if let Err(e) = res {
              debug!("Control client {peer} closed by error: {e}");
            }
          }
          _ = cancel_token.cancelled() => {}
        }
      });
    }
    debug!("Control channel stopped");
  }
}

async fn handle_client(stream: TcpStream, controller: &ModeController) -> std::io::Result<()> {
  let (read_half, mut write_half) = stream.into_split();
  let mut reader = BufReader::new(read_half);
  let mut buf = Vec::with_capacity(CONTROL_MAX_LINE_LENGTH);

  loop {
    buf.clear();
    let read = (&mut reader)
      .take(CONTROL_MAX_LINE_LENGTH as u64 + 1)
      .read_until(b'\n', &mut buf)
      .await?;
    if read == 0 {
      return Ok(());
    }
    if !buf.ends_with(b"\n") && buf.len() > CONTROL_MAX_LINE_LENGTH {
      discard_line(&mut reader).await?;
      write_half.write_all(b"error line too long\n").await?;
      continue;
    }
    let line = String::from_utf8_lossy(&buf);
    if line.trim().is_empty() {
      continue;
    }

    let reply = execute(ControlCommand::parse(&line), controller).await;
    write_half.write_all(reply.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
  }
}

/// Skip the rest of an overlong line
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
  loop {
    let chunk = reader.fill_buf().await?;
    if chunk.is_empty() {
      return Ok(());
    }
    match chunk.iter().position(|b| *b == b'\n') {
      Some(pos) => {
        reader.consume(pos + 1);
        return Ok(());
      }
      None => {
        let len = chunk.len();
        reader.consume(len);
      }
    }
  }
}

async fn execute(command: ControlCommand, controller: &ModeController) -> String {
  match command {
    ControlCommand::Set(name) => match controller.set_connection_type(&name).await {
      Ok(ModeChange::Unchanged) => format!("ok {name} (unchanged)"),
      Ok(ModeChange::Switched { to, .. }) => format!("ok {to}"),
      Err(e) => format!("error {e}"),
    },
    ControlCommand::Get => format!("mode {}", controller.active_mode().name()),
    ControlCommand::Modes => format!("modes {}", controller.modes().names().join(" ")),
    ControlCommand::Status => format!(
      "status mode={} listening={} connections={}",
      controller.active_mode().name(),
      controller.is_listening().await,
      controller.connection_count()
    ),
    ControlCommand::Unknown(line) => format!("error unknown command: {line}"),
  }
}
