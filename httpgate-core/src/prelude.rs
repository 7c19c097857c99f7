pub use bytes::Bytes;
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};
pub use tracing::{debug, error, info, trace, warn};
