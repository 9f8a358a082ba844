use socket2::SockRef;
use std::{net::SocketAddr, time::Duration};
use tokio::net::{TcpSocket, TcpStream};

/// Bind TCP socket to the given `SocketAddr`, and returns the TCP socket with `SO_REUSEADDR` option.
/// This option is required to re-bind the socket address when the listener is restarted after going offline.
/// `SO_REUSEPORT` is not set, so a port held by another listener fails to bind.
pub(crate) fn bind_tcp_socket(listening_on: &SocketAddr) -> Result<TcpSocket, std::io::Error> {
  let tcp_socket = if listening_on.is_ipv6() {
    TcpSocket::new_v6()
  } else {
    TcpSocket::new_v4()
  }?;
  tcp_socket.set_reuseaddr(true)?;
  tcp_socket.bind(*listening_on)?;
  Ok(tcp_socket)
}

/// Make the stream send RST instead of FIN when it is dropped, signalling a connection failure to the client.
pub(crate) fn set_reset_on_close(stream: &TcpStream) -> Result<(), std::io::Error> {
  SockRef::from(stream).set_linger(Some(Duration::ZERO))
}
