//! Byte-range access to remote resources.
//!
//! [`RangeFetcher`] is the seam between the BAM machinery and the transport.
//! The HTTP implementation lives in [`crate::http`]; [`MemoryFetcher`] serves
//! resources held in memory and counts every fetch, which makes it the
//! natural stand-in for a server in tests and benchmarks.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of attempts per request
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delay before the first retry; doubled after each failed attempt
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Random access to the bytes of remote resources addressed by URL.
pub trait RangeFetcher: Send + Sync
{
    /// Fetch `[offset, offset + length)` of `url`, or everything from
    /// `offset` to the end of the resource when `length` is `None`.
    ///
    /// A range reaching past the end of the resource yields the bytes that
    /// exist, possibly none.
    fn fetch(&self, url: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>>;

    /// An opaque token that changes whenever the resource changes
    /// (ETag, Last-Modified), if the transport can provide one.
    fn validator(&self, _url: &str) -> Result<Option<String>>
    {
        Ok(None)
    }

    /// Release pooled connections.
    fn close(&self) -> Result<()>
    {
        Ok(())
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy
{
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy
{
    fn default() -> Self
    {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }
}

impl RetryPolicy
{
    /// A policy that gives up after the first failure.
    pub fn none() -> Self
    {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are used up. The last error is returned.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempts = 0;
        let mut backoff = self.initial_backoff;

        loop
        {
            match op()
            {
                Ok(value) => return Ok(value),
                Err(e) =>
                {
                    attempts += 1;
                    if !e.is_transient() || attempts >= self.max_attempts.max(1)
                    {
                        return Err(e);
                    }

                    warn!(what, attempt = attempts, error = %e, "retrying after transient failure");
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
            }
        }
    }
}

/// Take `[offset, offset + length)` out of a complete resource body.
pub(crate) fn slice_range(data: &[u8], offset: u64, length: Option<u64>) -> Vec<u8>
{
    let start = offset.min(data.len() as u64) as usize;
    let end = match length
    {
        Some(len) => offset.saturating_add(len).min(data.len() as u64) as usize,
        None => data.len(),
    };
    data[start..end].to_vec()
}

#[derive(Debug, Clone)]
struct MemoryResource
{
    data: std::sync::Arc<Vec<u8>>,
    version: u64,
}

/// Resources served from memory.
///
/// Every call to [`RangeFetcher::fetch`] is counted per URL, so callers can
/// observe exactly how much traffic an operation would have caused.
#[derive(Debug, Default)]
pub struct MemoryFetcher
{
    resources: RwLock<HashMap<String, MemoryResource>>,
    fetches: Mutex<HashMap<String, usize>>,
    closes: AtomicUsize,
    latency: Option<Duration>,
}

impl MemoryFetcher
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Delay every fetch, e.g. to widen race windows in concurrency tests.
    pub fn with_latency(mut self, latency: Duration) -> Self
    {
        self.latency = Some(latency);
        self
    }

    /// Add or replace a resource. Replacing changes its validator.
    pub fn insert(&self, url: impl Into<String>, data: Vec<u8>)
    {
        if let Ok(mut resources) = self.resources.write()
        {
            let url = url.into();
            let version = resources.get(&url).map(|r| r.version + 1).unwrap_or(1);
            resources.insert(
                url,
                MemoryResource {
                    data: std::sync::Arc::new(data),
                    version,
                },
            );
        }
    }

    pub fn remove(&self, url: &str)
    {
        if let Ok(mut resources) = self.resources.write()
        {
            resources.remove(url);
        }
    }

    /// Number of fetches issued against `url`.
    pub fn fetch_count(&self, url: &str) -> usize
    {
        self.fetches
            .lock()
            .map(|f| f.get(url).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of fetches issued against all URLs.
    pub fn total_fetch_count(&self) -> usize
    {
        self.fetches.lock().map(|f| f.values().sum()).unwrap_or(0)
    }

    /// Number of times [`RangeFetcher::close`] was called.
    pub fn close_count(&self) -> usize
    {
        self.closes.load(Ordering::SeqCst)
    }

    fn lookup(&self, url: &str) -> Result<MemoryResource>
    {
        let resources = self.resources.read().map_err(|_| poisoned())?;
        resources
            .get(url)
            .cloned()
            .ok_or_else(|| Error::NotFound(url.to_string()))
    }
}

impl RangeFetcher for MemoryFetcher
{
    fn fetch(&self, url: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>>
    {
        {
            let mut fetches = self.fetches.lock().map_err(|_| poisoned())?;
            *fetches.entry(url.to_string()).or_insert(0) += 1;
        }
        if let Some(latency) = self.latency
        {
            std::thread::sleep(latency);
        }

        let resource = self.lookup(url)?;
        debug!(url, offset, ?length, "memory fetch");
        Ok(slice_range(&resource.data, offset, length))
    }

    fn validator(&self, url: &str) -> Result<Option<String>>
    {
        match self.lookup(url)
        {
            Ok(resource) => Ok(Some(format!("v{}", resource.version))),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn close(&self) -> Result<()>
    {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn poisoned() -> Error
{
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "lock poisoned"))
}
