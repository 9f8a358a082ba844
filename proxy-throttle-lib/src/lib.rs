mod access_log;
mod config;
mod connection;
mod constants;
mod control;
mod controller;
mod endpoint;
mod error;
mod listener;
mod mode;
mod registry;
mod socket;
mod throttle;
mod time_util;
mod trace;

#[cfg(test)]
mod test_utils;

pub use config::{Config, ConfigBuilder, ConfigValidationError, ValidationResult};
pub use connection::ConnectionState;
pub use constants::{OFFLINE_MODE, log_event_names};
pub use control::{ControlCommand, ControlServer};
pub use controller::{ModeChange, ModeController};
pub use endpoint::{AppEndpoint, AppListener, AppStream};
pub use error::{ProxyBuildError, ProxyError};
pub use listener::{ExposedListener, ExposedListenerBuilder, ExposedListenerBuilderError};
pub use mode::{ActiveMode, ActiveModeReader, ConnectionMode, ModeTable, Throughput};
pub use registry::{ConnectionId, ConnectionInfo, ConnectionRegistry};
pub use throttle::{ThrottledPipe, pipe_bidirectional};
