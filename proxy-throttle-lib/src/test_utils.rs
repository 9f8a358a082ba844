use crate::{
  endpoint::AppEndpoint,
  mode::{ConnectionMode, Throughput},
};
use std::{
  net::SocketAddr,
  sync::{Arc, Mutex},
  time::Duration,
};
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::{TcpListener, TcpStream},
  task::JoinHandle,
  time::Instant,
};

/// Route crate logs to the test output. Safe to call from every test.
pub(crate) fn init_test_logger() {
  let _ = tracing_subscriber::fmt()
    .with_test_writer()
    .with_max_level(tracing::Level::DEBUG)
    .try_init();
}

pub(crate) fn test_mode(name: &str, bps: u64, delay_ms: u64) -> Arc<ConnectionMode> {
  Arc::new(ConnectionMode::new(name, Throughput::from_bps(bps), Duration::from_millis(delay_ms)))
}

/// A port that was free a moment ago
pub(crate) fn free_port() -> u16 {
  let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  listener.local_addr().unwrap().port()
}

/// Connected loopback pair: (client side, accepted side, client address)
pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream, SocketAddr) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
  let (accepted, src_addr) = accepted.unwrap();
  (client.unwrap(), accepted, src_addr)
}

/// Read and discard until the peer closes the stream. Returns false on timeout.
pub(crate) async fn wait_closed(stream: &mut TcpStream, within: Duration) -> bool {
  let drain = async {
    let mut buf = [0u8; 1024];
    loop {
      match stream.read(&mut buf).await {
        Ok(0) | Err(_) => break,
        Ok(_) => continue,
      }
    }
  };
  tokio::time::timeout(within, drain).await.is_ok()
}

/// Write `msg` and expect it echoed back through the proxy
pub(crate) async fn assert_echo(stream: &mut TcpStream, msg: &[u8]) {
  stream.write_all(msg).await.unwrap();
  let mut buf = vec![0u8; msg.len()];
  tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
    .await
    .expect("echo timed out")
    .unwrap();
  assert_eq!(buf, msg);
}

/// Echo server on a process unique local endpoint, standing in for the application under test
pub(crate) struct EchoApp {
  endpoint: AppEndpoint,
  accept_times: Arc<Mutex<Vec<Instant>>>,
  task: JoinHandle<()>,
}

impl EchoApp {
  pub(crate) async fn spawn() -> Self {
    let mut listener = AppEndpoint::unique_local().bind().await.unwrap();
    let endpoint = listener.endpoint().unwrap();
    let accept_times = Arc::new(Mutex::new(Vec::new()));
    let task = tokio::spawn({
      let accept_times = accept_times.clone();
      async move {
        while let Ok(stream) = listener.accept().await {
          accept_times.lock().unwrap().push(Instant::now());
          tokio::spawn(async move {
            let (mut read_half, mut write_half) = tokio::io::split(stream);
            let _ = tokio::io::copy(&mut read_half, &mut write_half).await;
            let _ = write_half.shutdown().await;
          });
        }
      }
    });
    Self {
      endpoint,
      accept_times,
      task,
    }
  }

  pub(crate) fn endpoint(&self) -> AppEndpoint {
    self.endpoint.clone()
  }

  /// Number of internal connections made so far
  pub(crate) fn accepted(&self) -> usize {
    self.accept_times.lock().unwrap().len()
  }

  pub(crate) fn first_accept_time(&self) -> Option<Instant> {
    self.accept_times.lock().unwrap().first().copied()
  }
}

impl Drop for EchoApp {
  fn drop(&mut self) {
    self.task.abort();
  }
}
