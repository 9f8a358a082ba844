pub(crate) use tracing::{debug, error, info, warn};
