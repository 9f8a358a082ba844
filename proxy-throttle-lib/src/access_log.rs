use crate::{endpoint::AppEndpoint, mode::ConnectionMode, registry::ConnectionId, trace::info};
use std::net::SocketAddr;

/// Handle log for an accepted connection and the profile it was bound to
pub(crate) fn access_log(conn_id: ConnectionId, src_addr: &SocketAddr, endpoint: &AppEndpoint, mode: &ConnectionMode) {
  info!(name: crate::constants::log_event_names::ACCESS_LOG, "{conn_id} {src_addr} -> {endpoint} [{}]", mode.name());
}
