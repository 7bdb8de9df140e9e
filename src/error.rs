//! # Error Module
//!
//! Defines the error taxonomy for the spiderexpress engine.
//!
//! ## Overview
//!
//! Every fallible operation in the engine returns `Result<T, SpiderError>`.
//! The variants map one-to-one onto the failure classes the controller has to
//! distinguish:
//!
//! - **Config**: validation failure against the project file; fatal, carries
//!   the offending configuration path.
//! - **Plugin**: a plug-in raised or returned a malformed frame; fatal for the
//!   current iteration, the affected seeds are marked `failed`.
//! - **TransientIo**: connector network/disk hiccup; retried with bounded
//!   exponential backoff before the batch is given up on.
//! - **Store**: database transport failure; retried like TransientIo, but
//!   exhaustion aborts the whole run.
//! - **Data**: a router pattern failed to match or a value failed to coerce;
//!   logged and dropped, never counted as an error.
//! - **Cancelled**: an external cancellation signal was latched; clean exit.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Errors produced by the spiderexpress engine.
#[derive(Debug, Error)]
pub enum SpiderError {
    /// Configuration validation failed. `path` is the dotted location of the
    /// offending key, e.g. `layers.twitter.sampler`.
    #[error("invalid configuration at `{path}`: {message}")]
    Config { path: String, message: String },

    /// A plug-in raised, or returned a frame missing required columns.
    #[error("plug-in `{plugin}` failed: {message}")]
    Plugin { plugin: String, message: String },

    /// A connector hit a transient network or disk problem.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// The store's transport failed.
    #[error("store failure: {0}")]
    Store(String),

    /// A record could not be routed or coerced. Dropped, not fatal.
    #[error("unroutable data: {0}")]
    Data(String),

    /// The run was cancelled from the outside.
    #[error("cancelled")]
    Cancelled,
}

impl SpiderError {
    /// Shorthand for a configuration error at a dotted path.
    pub fn config(path: impl Into<String>, message: impl Into<String>) -> Self {
        SpiderError::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a plug-in failure.
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        SpiderError::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Whether the retry helper may re-attempt the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpiderError::TransientIo(_) | SpiderError::Store(_))
    }
}

impl From<rusqlite::Error> for SpiderError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            // Constraint violations are configuration problems, not transport
            // hiccups, and must not be retried.
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                SpiderError::Config {
                    path: "store".to_string(),
                    message: err.to_string(),
                }
            }
            _ => SpiderError::Store(err.to_string()),
        }
    }
}

impl From<std::io::Error> for SpiderError {
    fn from(err: std::io::Error) -> Self {
        SpiderError::TransientIo(err.to_string())
    }
}

impl From<serde_json::Error> for SpiderError {
    fn from(err: serde_json::Error) -> Self {
        SpiderError::Data(err.to_string())
    }
}

/// Retries granted to retryable operations, on top of the initial attempt.
pub const RETRY_ATTEMPTS: u32 = 3;

/// Base delay of the exponential backoff schedule.
pub const RETRY_BASE: Duration = Duration::from_millis(500);

/// Computes the backoff delay before `attempt` (0-based), doubling the base
/// each time and jittering the result by ±25%.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE.as_millis() as f64 * 2f64.powi(attempt as i32);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((base * jitter) as u64)
}

/// Runs an async operation, retrying retryable failures up to
/// [`RETRY_ATTEMPTS`] times with the backoff schedule in between.
/// Non-retryable errors surface on first occurrence.
pub async fn with_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T, SpiderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SpiderError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}), backing off {:?}: {}",
                    what,
                    attempt + 1,
                    RETRY_ATTEMPTS + 1,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
