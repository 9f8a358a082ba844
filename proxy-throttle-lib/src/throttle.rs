//! Rate limited byte relay.
//!
//! Each direction of a proxied connection is served by its own [`ThrottledPipe`] with its own limiter.
//! The limiter gates reads from the source, so a fast source is held back by the kernel socket
//! buffers (backpressure) instead of having its data dropped.

use crate::{
  constants::{PIPE_BUFFER_SIZE, THROTTLE_REFILL_DIVISOR},
  mode::Throughput,
  trace::*,
};
use async_speed_limit::{clock::StandardClock, limiter};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type Limiter = limiter::Limiter<StandardClock>;

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, Copy)]
/// One direction of a throttled relay
pub struct ThrottledPipe {
  throughput: Throughput,
  buffer_size: usize,
}

impl ThrottledPipe {
  pub fn new(throughput: Throughput) -> Self {
    Self {
      throughput,
      buffer_size: PIPE_BUFFER_SIZE,
    }
  }

  /// Size of the relay buffer
  pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
    self.buffer_size = buffer_size.max(1);
    self
  }

  pub fn throughput(&self) -> Throughput {
    self.throughput
  }

  fn limiter(&self) -> Limiter {
    match self.throughput {
      Throughput::Unlimited => Limiter::new(f64::INFINITY),
      Throughput::BytesPerSecond(rate) => Limiter::new(rate.get() as f64),
    }
  }

  /// Largest single read. A limited pipe reads 1/N second worth of bytes at a time.
  fn chunk_size(&self) -> usize {
    match self.throughput {
      Throughput::Unlimited => self.buffer_size,
      Throughput::BytesPerSecond(rate) => {
        let chunk = (rate.get() / THROTTLE_REFILL_DIVISOR).max(1);
        usize::try_from(chunk).unwrap_or(usize::MAX).min(self.buffer_size)
      }
    }
  }

  /// Copy `source` into `sink` until `source` reaches EOF, then shut down the write side of `sink`.
  /// Returns the number of bytes forwarded.
  pub async fn run<R, W>(&self, source: R, mut sink: W) -> std::io::Result<u64>
  where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    let mut source = std::pin::pin!(self.limiter().limit(source));
    let mut buf = vec![0u8; self.chunk_size()];
    let mut forwarded = 0u64;

    loop {
      let read_len = source.read(&mut buf).await?;
      if read_len == 0 {
        break;
      }
      sink.write_all(&buf[..read_len]).await?;
      sink.flush().await?;
      forwarded += read_len as u64;
    }

    // The peer may already be gone, which is not an error of this direction.
    if let Err(e) = sink.shutdown().await {
      debug!("Failed to shut down the write side after EOF: {e}");
    }
    Ok(forwarded)
  }
}

/* ---------------------------------------------------------- */
/// Relay both directions between `a` and `b`, each through its own [`ThrottledPipe`].
/// `a_prefix` is sent to `b` before anything read from `a`.
///
/// EOF is propagated as a half close and the relay finishes once both directions reached EOF.
/// An error in either direction drops both streams, closing the other side too.
/// Returns `(bytes a -> b, bytes b -> a)`.
pub async fn pipe_bidirectional<A, B>(a: A, a_prefix: &[u8], b: B, throughput: Throughput) -> std::io::Result<(u64, u64)>
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  let (a_read, a_write) = tokio::io::split(a);
  let (b_read, b_write) = tokio::io::split(b);

  let (up, down) = (ThrottledPipe::new(throughput), ThrottledPipe::new(throughput));
  tokio::try_join!(up.run(a_prefix.chain(a_read), b_write), down.run(b_read, a_write))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::{Duration, Instant};
  use tokio::io::duplex;

  #[test]
  fn test_chunk_size() {
    assert_eq!(ThrottledPipe::new(Throughput::Unlimited).chunk_size(), PIPE_BUFFER_SIZE);
    assert_eq!(ThrottledPipe::new(Throughput::from_bps(4000)).chunk_size(), 400);
    assert_eq!(ThrottledPipe::new(Throughput::from_bps(1)).chunk_size(), 1);
    assert_eq!(ThrottledPipe::new(Throughput::from_bps(10_000_000)).chunk_size(), PIPE_BUFFER_SIZE);
    let small = ThrottledPipe::new(Throughput::from_bps(10_000)).with_buffer_size(64);
    assert_eq!(small.chunk_size(), 64);
  }

  #[tokio::test]
  async fn test_unlimited_pipe_is_verbatim() {
    let (mut client, proxy_in) = duplex(1024);
    let (proxy_out, mut server) = duplex(1024);
    let task = tokio::spawn(async move { ThrottledPipe::new(Throughput::Unlimited).run(proxy_in, proxy_out).await });

    let payload = (0..100_000u32).map(|v| (v % 251) as u8).collect::<Vec<_>>();
    let writer = {
      let payload = payload.clone();
      tokio::spawn(async move {
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();
      })
    };
    let mut received = Vec::new();
    server.read_to_end(&mut received).await.unwrap();
    writer.await.unwrap();

    assert_eq!(received, payload);
    assert_eq!(task.await.unwrap().unwrap(), payload.len() as u64);
  }

  #[tokio::test]
  async fn test_throttled_pipe_respects_rate() {
    const RATE: u64 = 1000;
    const LEN: usize = 5000;
    let (mut client, proxy_in) = duplex(64 * 1024);
    let (proxy_out, mut server) = duplex(64 * 1024);
    let task = tokio::spawn(async move { ThrottledPipe::new(Throughput::from_bps(RATE)).run(proxy_in, proxy_out).await });

    client.write_all(&vec![7u8; LEN]).await.unwrap();
    client.shutdown().await.unwrap();

    let start = Instant::now();
    let mut total = 0usize;
    let mut buf = vec![0u8; 4096];
    loop {
      let n = server.read(&mut buf).await.unwrap();
      if n == 0 {
        break;
      }
      total += n;
      // never more than one second worth of burst plus what accrued since
      let elapsed = start.elapsed().as_secs_f64();
      let allowed = RATE as f64 + RATE as f64 * elapsed;
      assert!(total as f64 <= allowed + 1.0, "{total} bytes after {elapsed}s");
    }

    assert_eq!(total, LEN);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(3900), "finished too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(5600), "finished too late: {elapsed:?}");
    assert_eq!(task.await.unwrap().unwrap(), LEN as u64);
  }

  #[tokio::test]
  async fn test_throttled_pipe_applies_backpressure() {
    // the source is only drained at the throttled rate, nothing is read ahead
    let (mut client, proxy_in) = duplex(256);
    let (proxy_out, mut server) = duplex(64 * 1024);
    let pipe = ThrottledPipe::new(Throughput::from_bps(100)).with_buffer_size(100);
    let task = tokio::spawn(async move { pipe.run(proxy_in, proxy_out).await });

    let write_all = tokio::time::timeout(Duration::from_secs(1), client.write_all(&[1u8; 2000])).await;
    assert!(write_all.is_err(), "writer should have been blocked by the throttle");

    let mut buf = vec![0u8; 2048];
    let n = server.read(&mut buf).await.unwrap();
    assert!(n <= 250, "{n} bytes passed a 100 B/s pipe within a second");
    drop(client);
    drop(server);
    let _ = task.await;
  }

  #[tokio::test]
  async fn test_pipe_bidirectional() {
    let (client, proxy_a) = duplex(1024);
    let (proxy_b, server) = duplex(1024);
    let relay = tokio::spawn(async move { pipe_bidirectional(proxy_a, b"hello ", proxy_b, Throughput::Unlimited).await });

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    client_write.write_all(b"world").await.unwrap();
    client_write.shutdown().await.unwrap();
    let mut upstream = Vec::new();
    server_read.read_to_end(&mut upstream).await.unwrap();
    assert_eq!(upstream, b"hello world");

    // half closed upstream does not prevent the response
    server_write.write_all(b"response").await.unwrap();
    server_write.shutdown().await.unwrap();
    let mut downstream = Vec::new();
    client_read.read_to_end(&mut downstream).await.unwrap();
    assert_eq!(downstream, b"response");

    assert_eq!(relay.await.unwrap().unwrap(), (11, 8));
  }

  #[tokio::test]
  async fn test_bidirectional_directions_are_throttled_independently() {
    const RATE: u64 = 2000;
    let (client, proxy_a) = duplex(64 * 1024);
    let (proxy_b, server) = duplex(64 * 1024);
    let relay = tokio::spawn(async move { pipe_bidirectional(proxy_a, b"", proxy_b, Throughput::from_bps(RATE)).await });

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);
    let start = Instant::now();
    let upload = async {
      client_write.write_all(&[1u8; RATE as usize]).await.unwrap();
      client_write.shutdown().await.unwrap();
      let mut received = Vec::new();
      server_read.read_to_end(&mut received).await.unwrap();
      received.len()
    };
    let download = async {
      server_write.write_all(&[2u8; RATE as usize]).await.unwrap();
      server_write.shutdown().await.unwrap();
      let mut received = Vec::new();
      client_read.read_to_end(&mut received).await.unwrap();
      received.len()
    };
    assert_eq!(tokio::join!(upload, download), (RATE as usize, RATE as usize));

    // a shared budget would need two seconds for both payloads
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(700), "finished too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1600), "directions slowed each other down: {elapsed:?}");
    assert_eq!(relay.await.unwrap().unwrap(), (RATE, RATE));
  }
}
