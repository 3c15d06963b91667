// Tracing bootstrap driven by the engine's log_level option. RUST_LOG wins
// when set; repeated init attempts are harmless no-ops.
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
