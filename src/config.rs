//! Reader configuration.
//!
//! Defaults can be overridden from the environment:
//!
//! - `BAMHTTP_CACHE_DIR` - directory holding cached index files
//! - `BAMHTTP_MAX_RETRIES` - attempts per remote request
//! - `BAMHTTP_WINDOW_SIZE` - bytes fetched per remote read window

use crate::fetch::RetryPolicy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const CACHE_DIR_ENV: &str = "BAMHTTP_CACHE_DIR";
pub const MAX_RETRIES_ENV: &str = "BAMHTTP_MAX_RETRIES";
pub const WINDOW_SIZE_ENV: &str = "BAMHTTP_WINDOW_SIZE";

/// Suffix appended to the BAM URL to locate its index.
pub const DEFAULT_INDEX_SUFFIX: &str = ".bai";

/// Default remote read window (128KB, two full BGZF blocks).
pub const DEFAULT_WINDOW_SIZE: u64 = 128 * 1024;

/// Default HTTP timeout (30 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Config
{
    /// Directory for the cross-session index cache
    pub cache_dir: PathBuf,
    /// Companion index suffix
    pub index_suffix: String,
    /// Minimum number of bytes requested per remote read
    pub window_size: u64,
    /// Retry behaviour for transient network failures
    pub retry: RetryPolicy,
    /// Global timeout for a single HTTP request
    pub timeout: Duration,
}

impl Default for Config
{
    fn default() -> Self
    {
        Self {
            cache_dir: default_cache_dir(),
            index_suffix: DEFAULT_INDEX_SUFFIX.to_string(),
            window_size: DEFAULT_WINDOW_SIZE,
            retry: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Config
{
    /// Defaults, overridden by any of the `BAMHTTP_*` environment variables.
    ///
    /// Unparseable numeric values are ignored.
    pub fn from_env() -> Self
    {
        let mut config = Self::default();

        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV)
        {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(attempts) = env_number::<u32>(MAX_RETRIES_ENV)
        {
            config.retry.max_attempts = attempts.max(1);
        }
        if let Some(window) = env_number::<u64>(WINDOW_SIZE_ENV)
        {
            config.window_size = window.max(1);
        }

        config
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self
    {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_index_suffix(mut self, suffix: impl Into<String>) -> Self
    {
        self.index_suffix = suffix.into();
        self
    }

    /// Set the remote read window.
    ///
    /// Larger windows reduce the number of HTTP requests but transfer more
    /// bytes that may never be decompressed.
    pub fn with_window_size(mut self, size: u64) -> Self
    {
        self.window_size = size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self
    {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self
    {
        self.timeout = timeout;
        self
    }
}

fn default_cache_dir() -> PathBuf
{
    std::env::var_os(CACHE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("bamhttp-index-cache"))
}

fn env_number<T: FromStr>(name: &str) -> Option<T>
{
    std::env::var(name).ok().and_then(|v| parse_number(&v))
}

/// `None` for anything that is not a number of type `T`, including values
/// out of its range.
fn parse_number<T: FromStr>(value: &str) -> Option<T>
{
    value.trim().parse().ok()
}
