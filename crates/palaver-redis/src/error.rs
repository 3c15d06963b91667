// Engine error taxonomy. Public operations never surface these to the
// protocol layer; the engine folds them into bool/None results and logs.
use std::time::Duration;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis unavailable after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        source: redis::RedisError,
    },

    #[error("connection pool timed out after {0:?}")]
    PoolTimeout(Duration),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl EngineError {
    /// Transient connectivity failures: refused, dropped, timed out, or an
    /// I/O error mid-command. These are the only errors the pool retries.
    pub fn is_transient(err: &redis::RedisError) -> bool {
        err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
            || err.is_io_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_names_the_deadline() {
        let err = EngineError::PoolTimeout(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn io_errors_are_transient() {
        let err = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(EngineError::is_transient(&err));
    }

    #[test]
    fn type_errors_are_not_transient() {
        let err = redis::RedisError::from((redis::ErrorKind::TypeError, "bad reply"));
        assert!(!EngineError::is_transient(&err));
    }
}
