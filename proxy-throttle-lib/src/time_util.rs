use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current time since the epoch in milliseconds.
#[inline]
pub(crate) fn get_since_the_epoch_millis() -> u128 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis())
    .unwrap_or_default()
}
