use crate::{
  constants::{DEFAULT_MODE, OFFLINE_MODE},
  error::ProxyError,
};
use std::{collections::HashMap, num::NonZeroU64, sync::Arc, time::Duration};
use tokio::sync::watch;

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Throughput cap applied to each direction of a proxied connection
pub enum Throughput {
  /// No artificial cap
  Unlimited,
  /// Sustained cap in bytes per second
  BytesPerSecond(NonZeroU64),
}

impl Throughput {
  /// `0` means unlimited
  pub fn from_bps(bps: u64) -> Self {
    NonZeroU64::new(bps).map_or(Self::Unlimited, Self::BytesPerSecond)
  }

  pub fn bytes_per_second(&self) -> Option<u64> {
    match self {
      Self::Unlimited => None,
      Self::BytesPerSecond(bps) => Some(bps.get()),
    }
  }

  pub fn is_unlimited(&self) -> bool {
    matches!(self, Self::Unlimited)
  }
}

impl std::fmt::Display for Throughput {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Unlimited => write!(f, "unlimited"),
      Self::BytesPerSecond(bps) => write!(f, "{bps} B/s"),
    }
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, PartialEq, Eq)]
/// Named network condition profile
pub struct ConnectionMode {
  name: String,
  throughput: Throughput,
  /// Delay between accepting a client and connecting to the application endpoint
  delay: Duration,
}

impl ConnectionMode {
  pub fn new(name: impl Into<String>, throughput: Throughput, delay: Duration) -> Self {
    Self {
      name: name.into(),
      throughput,
      delay,
    }
  }

  /// The offline profile carries no throughput or delay, it only means "listener closed".
  pub fn offline() -> Self {
    Self::new(OFFLINE_MODE, Throughput::Unlimited, Duration::ZERO)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn throughput(&self) -> Throughput {
    self.throughput
  }

  pub fn delay(&self) -> Duration {
    self.delay
  }

  pub fn is_offline(&self) -> bool {
    self.name == OFFLINE_MODE
  }
}

impl std::fmt::Display for ConnectionMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.is_offline() {
      return write!(f, "{}", self.name);
    }
    write!(f, "{} ({}, delay {:?})", self.name, self.throughput, self.delay)
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone)]
/// Table of the known profiles, keyed by name.
/// `offline` is always present and cannot be replaced.
pub struct ModeTable {
  modes: HashMap<String, Arc<ConnectionMode>>,
}

impl Default for ModeTable {
  fn default() -> Self {
    let mut table = Self { modes: HashMap::new() };
    table.insert(ConnectionMode::new(DEFAULT_MODE, Throughput::Unlimited, Duration::ZERO));
    table.insert(ConnectionMode::new(
      "slow",
      Throughput::from_bps(4000),
      Duration::from_millis(3000),
    ));
    table.insert(ConnectionMode::new(
      "lie-fi",
      Throughput::from_bps(1),
      Duration::from_millis(10000),
    ));
    table
      .modes
      .insert(OFFLINE_MODE.to_string(), Arc::new(ConnectionMode::offline()));
    table
  }
}

impl ModeTable {
  /// Add or replace a profile, returning the replaced one.
  /// Attempts to redefine `offline` are ignored.
  pub fn insert(&mut self, mode: ConnectionMode) -> Option<Arc<ConnectionMode>> {
    if mode.is_offline() {
      return None;
    }
    self.modes.insert(mode.name.clone(), Arc::new(mode))
  }

  pub fn get(&self, name: &str) -> Result<Arc<ConnectionMode>, ProxyError> {
    self
      .modes
      .get(name)
      .cloned()
      .ok_or_else(|| ProxyError::UnknownModeError(name.to_string()))
  }

  pub fn contains(&self, name: &str) -> bool {
    self.modes.contains_key(name)
  }

  /// Profile names in lexical order
  pub fn names(&self) -> Vec<String> {
    let mut names = self.modes.keys().cloned().collect::<Vec<_>>();
    names.sort();
    names
  }

  pub fn len(&self) -> usize {
    self.modes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.modes.is_empty()
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug)]
/// Process-wide active mode. Only the owner of this value can change it;
/// everybody else reads snapshots through an [`ActiveModeReader`].
pub struct ActiveMode(watch::Sender<Arc<ConnectionMode>>);

impl ActiveMode {
  pub fn new(initial: Arc<ConnectionMode>) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self(tx)
  }

  pub fn snapshot(&self) -> Arc<ConnectionMode> {
    self.0.borrow().clone()
  }

  pub fn reader(&self) -> ActiveModeReader {
    ActiveModeReader(self.0.subscribe())
  }

  /// Swap the active mode, returning the previous one
  pub(crate) fn replace(&self, mode: Arc<ConnectionMode>) -> Arc<ConnectionMode> {
    self.0.send_replace(mode)
  }
}

#[derive(Debug, Clone)]
/// Read-only view of the [`ActiveMode`]
pub struct ActiveModeReader(watch::Receiver<Arc<ConnectionMode>>);

impl ActiveModeReader {
  pub fn snapshot(&self) -> Arc<ConnectionMode> {
    self.0.borrow().clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_mode_table() {
    let table = ModeTable::default();
    assert_eq!(table.names(), vec!["lie-fi", "offline", "perfect", "slow"]);

    let perfect = table.get("perfect").unwrap();
    assert!(perfect.throughput().is_unlimited());
    assert_eq!(perfect.delay(), Duration::ZERO);

    let slow = table.get("slow").unwrap();
    assert_eq!(slow.throughput().bytes_per_second(), Some(4000));
    assert_eq!(slow.delay(), Duration::from_millis(3000));

    let lie_fi = table.get("lie-fi").unwrap();
    assert_eq!(lie_fi.throughput().bytes_per_second(), Some(1));
    assert_eq!(lie_fi.delay(), Duration::from_millis(10000));

    assert!(table.get("offline").unwrap().is_offline());
  }

  #[test]
  fn test_unknown_mode() {
    let table = ModeTable::default();
    assert!(matches!(
      table.get("dial-up"),
      Err(ProxyError::UnknownModeError(name)) if name == "dial-up"
    ));
  }

  #[test]
  fn test_insert_custom_and_override() {
    let mut table = ModeTable::default();
    let old = table.insert(ConnectionMode::new(
      "slow",
      Throughput::from_bps(8000),
      Duration::from_millis(500),
    ));
    assert_eq!(old.unwrap().throughput().bytes_per_second(), Some(4000));
    assert_eq!(table.get("slow").unwrap().throughput().bytes_per_second(), Some(8000));

    table.insert(ConnectionMode::new("3g", Throughput::from_bps(48000), Duration::from_millis(300)));
    assert!(table.contains("3g"));
    assert_eq!(table.len(), 5);
  }

  #[test]
  fn test_offline_cannot_be_redefined() {
    let mut table = ModeTable::default();
    let res = table.insert(ConnectionMode::new(
      OFFLINE_MODE,
      Throughput::from_bps(10),
      Duration::from_secs(1),
    ));
    assert!(res.is_none());
    assert_eq!(*table.get(OFFLINE_MODE).unwrap(), ConnectionMode::offline());
  }

  #[test]
  fn test_throughput_from_bps() {
    assert_eq!(Throughput::from_bps(0), Throughput::Unlimited);
    assert_eq!(Throughput::from_bps(42).bytes_per_second(), Some(42));
    assert_eq!(Throughput::from_bps(42).to_string(), "42 B/s");
    assert_eq!(Throughput::Unlimited.to_string(), "unlimited");
  }

  #[test]
  fn test_active_mode_snapshot() {
    let table = ModeTable::default();
    let active = ActiveMode::new(table.get("perfect").unwrap());
    let reader = active.reader();
    let before = reader.snapshot();

    let previous = active.replace(table.get("slow").unwrap());
    assert_eq!(previous.name(), "perfect");
    // a snapshot taken earlier is not affected by the swap
    assert_eq!(before.name(), "perfect");
    assert_eq!(reader.snapshot().name(), "slow");
    assert_eq!(active.snapshot().name(), "slow");
  }
}
