use crate::trace::*;
use std::{
  net::SocketAddr,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Instant,
};
use tokio_util::sync::CancellationToken;

/// DashMap type alias, uses ahash::RandomState as hashbuilder
type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Identity of a proxied connection, unique within a registry
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "#{}", self.0)
  }
}

#[derive(Debug, Clone)]
/// Public view of a live connection
pub struct ConnectionInfo {
  pub id: ConnectionId,
  /// Client address of the external socket
  pub src_addr: SocketAddr,
  pub accepted_at: Instant,
}

#[derive(Debug)]
struct Entry {
  info: ConnectionInfo,
  cancel_token: CancellationToken,
}

#[derive(Debug, Default)]
struct RegistryInner {
  connections: DashMap<ConnectionId, Entry>,
  next_id: AtomicU64,
}

#[derive(Debug, Clone, Default)]
/// Set of accepted and not yet closed connections.
/// Clones share the same set.
pub struct ConnectionRegistry(Arc<RegistryInner>);

impl ConnectionRegistry {
  /// Register a newly accepted connection.
  /// The membership ends when the returned [`Registration`] is dropped or when [`Self::close_all`] is called.
  pub(crate) fn add(&self, src_addr: SocketAddr) -> Registration {
    let id = ConnectionId(self.0.next_id.fetch_add(1, Ordering::Relaxed));
    let cancel_token = CancellationToken::new();
    let info = ConnectionInfo {
      id,
      src_addr,
      accepted_at: Instant::now(),
    };
    self.0.connections.insert(
      id,
      Entry {
        info,
        cancel_token: cancel_token.clone(),
      },
    );
    Registration {
      id,
      cancel_token,
      registry: self.clone(),
    }
  }

  /// Remove a connection from the set. Removing an absent connection is a no-op.
  pub fn remove(&self, id: ConnectionId) -> bool {
    self.0.connections.remove(&id).is_some()
  }

  /// Force every member to close and empty the set. Returns the number of connections closed.
  ///
  /// Members are removed before this returns; their sockets are released asynchronously by their own tasks.
  pub fn close_all(&self) -> usize {
    let ids = self.0.connections.iter().map(|e| *e.key()).collect::<Vec<_>>();
    let mut closed = 0;
    for id in ids {
      // The member may have closed by itself in the meantime
      let Some((_, entry)) = self.0.connections.remove(&id) else {
        continue;
      };
      entry.cancel_token.cancel();
      debug!(conn_id = %id, src_addr = %entry.info.src_addr, "Connection force-closed");
      closed += 1;
    }
    closed
  }

  pub fn contains(&self, id: ConnectionId) -> bool {
    self.0.connections.contains_key(&id)
  }

  pub fn len(&self) -> usize {
    self.0.connections.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.connections.is_empty()
  }

  /// Snapshot of the live connections ordered by id
  pub fn connections(&self) -> Vec<ConnectionInfo> {
    let mut infos = self
      .0
      .connections
      .iter()
      .map(|e| e.value().info.clone())
      .collect::<Vec<_>>();
    infos.sort_by_key(|info| info.id);
    infos
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug)]
/// Registry membership of a single connection, released on drop
pub(crate) struct Registration {
  id: ConnectionId,
  cancel_token: CancellationToken,
  registry: ConnectionRegistry,
}

impl Registration {
  pub(crate) fn id(&self) -> ConnectionId {
    self.id
  }

  /// Cancelled when the connection is forced to close
  pub(crate) fn cancel_token(&self) -> &CancellationToken {
    &self.cancel_token
  }
}

impl Drop for Registration {
  fn drop(&mut self) {
    self.registry.remove(self.id);
  }
}
