/// TCP backlog size
pub const TCP_BACKLOG: u32 = 1024;

/// Max concurrent connections held by the exposed listener
pub const MAX_TCP_CONCURRENT_CONNECTIONS: usize = 1024;

/// Size of the buffer each throttled pipe direction relays through
pub const PIPE_BUFFER_SIZE: usize = 16 * 1024;

/// A rate-limited pipe reads at most 1/N second worth of bytes at once, so the burst stays small on slow links
pub const THROTTLE_REFILL_DIVISOR: u64 = 10;

/// Once the early data buffer is full, the client socket is checked for a close at this interval
pub const EARLY_DATA_RECHECK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(20);

/// Mode applied at startup when nothing else is configured
pub const DEFAULT_MODE: &str = "perfect";

/// Reserved mode name, the exposed listener is closed while it is active
pub const OFFLINE_MODE: &str = "offline";

/// Longest connection establishment delay a profile may define, in milliseconds
pub const MAX_MODE_DELAY_MSEC: u64 = 10 * 60 * 1000;

/// Prefix of the process unique local application endpoint
pub const APP_ENDPOINT_PREFIX: &str = "offlinefirst";

/// Control channel lines longer than this are rejected
pub const CONTROL_MAX_LINE_LENGTH: usize = 256;

/// Event names used to route log records
pub mod log_event_names {
  /// access log
  pub const ACCESS_LOG: &str = "throttle_proxy::access_log";
}
