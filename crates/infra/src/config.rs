//! Queue configuration loaded from the environment.

use tracing::warn;

pub const DEFAULT_MONGO_URI: &str = "mongodb://localhost:27017/secrebot";
pub const DEFAULT_DATABASE: &str = "secrebot";
pub const DEFAULT_COLLECTION: &str = "job_queue";
pub const DEFAULT_RECOVERY_LIMIT: usize = 1000;
pub const DEFAULT_CLEANUP_DAYS: u32 = 7;

/// Runtime settings for a [`crate::JobQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// `MONGO_URI`
    pub mongo_uri: String,
    /// Database name. Taken from the URI path when present, else `JOBQUEUE_DATABASE`.
    pub database: String,
    /// `JOBQUEUE_COLLECTION`
    pub collection: String,
    /// Upper bound on jobs loaded by startup recovery (`JOBQUEUE_RECOVERY_LIMIT`).
    pub recovery_limit: usize,
    /// Default age cutoff for `cleanup` (`JOBQUEUE_CLEANUP_DAYS`).
    pub cleanup_days: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mongo_uri: DEFAULT_MONGO_URI.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            recovery_limit: DEFAULT_RECOVERY_LIMIT,
            cleanup_days: DEFAULT_CLEANUP_DAYS,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or empty keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mongo_uri = get("MONGO_URI").unwrap_or_else(|| DEFAULT_MONGO_URI.to_string());
        let database = database_from_uri(&mongo_uri)
            .or_else(|| get("JOBQUEUE_DATABASE"))
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());

        Self {
            database,
            mongo_uri,
            collection: get("JOBQUEUE_COLLECTION").unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
            recovery_limit: parse_or("JOBQUEUE_RECOVERY_LIMIT", get("JOBQUEUE_RECOVERY_LIMIT"), DEFAULT_RECOVERY_LIMIT),
            cleanup_days: parse_or("JOBQUEUE_CLEANUP_DAYS", get("JOBQUEUE_CLEANUP_DAYS"), DEFAULT_CLEANUP_DAYS),
        }
    }
}

fn parse_or<T: std::str::FromStr + Copy>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "invalid numeric setting, using default");
            default
        }),
    }
}

/// The database named in a connection string path, e.g. `secrebot` in
/// `mongodb://host:27017/secrebot?retryWrites=true`.
///
/// Only a preview for config loading, which stays synchronous. With the
/// `mongodb` feature the driver's own parse of the URI decides at connect time.
pub fn database_from_uri(uri: &str) -> Option<String> {
    let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let (_, path) = rest.split_once('/')?;
    let name = path.split(['?', '/']).next().unwrap_or_default();
    (!name.is_empty()).then(|| name.to_string())
}
