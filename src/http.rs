//! HTTP/HTTPS range fetching with `ureq`.
//!
//! Servers are expected to answer a range request with `206 Partial
//! Content`, but a server that ignores the `Range` header and sends the
//! whole body with `200 OK` is handled as well: the requested window is cut
//! out of the stream locally.

#![cfg(feature = "url")]

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::{RangeFetcher, RetryPolicy};
use std::io::{self, Read};
use std::sync::RwLock;
use tracing::debug;
use ureq::Agent;

/// A [`RangeFetcher`] speaking HTTP range requests.
///
/// # Example
///
/// ```no_run
/// use bamhttp::http::HttpFetcher;
/// use bamhttp::fetch::RangeFetcher;
///
/// let fetcher = HttpFetcher::new();
/// let magic = fetcher.fetch("https://example.com/sample.bam", 0, Some(4)).unwrap();
/// ```
pub struct HttpFetcher
{
    /// `None` once closed
    agent: RwLock<Option<Agent>>,
    retry: RetryPolicy,
}

impl Default for HttpFetcher
{
    fn default() -> Self
    {
        Self::with_config(&Config::default())
    }
}

impl HttpFetcher
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Create a fetcher using the timeout and retry policy of `config`.
    pub fn with_config(config: &Config) -> Self
    {
        let agent_config = Agent::config_builder()
            .timeout_global(Some(config.timeout))
            .http_status_as_error(false)
            .build();

        Self {
            agent: RwLock::new(Some(Agent::new_with_config(agent_config))),
            retry: config.retry,
        }
    }

    /// Handle on the connection pool, shared with the fetcher.
    fn agent(&self) -> Result<Agent>
    {
        match self.agent.read()
        {
            Ok(agent) => agent.as_ref().cloned().ok_or(Error::ReaderClosed),
            Err(_) => Err(Error::Io(io::Error::new(io::ErrorKind::Other, "lock poisoned"))),
        }
    }

    /// Single fetch attempt (no retry)
    fn fetch_once(&self, url: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>>
    {
        if length == Some(0)
        {
            return Ok(Vec::new());
        }

        let range = range_header(offset, length);
        let mut request = self.agent()?.get(url);
        if let Some(range) = &range
        {
            request = request.header("Range", range);
        }

        let response = request.call().map_err(|e| Error::RemoteUnavailable {
            url: url.to_string(),
            message: format!("HTTP GET request failed: {}", e),
        })?;

        let status = response.status().as_u16();
        let skip = match status
        {
            206 =>
            {
                let served_from = response
                    .headers()
                    .get("Content-Range")
                    .and_then(|v| v.to_str().ok())
                    .and_then(content_range_start)
                    .unwrap_or(offset);
                if served_from > offset
                {
                    return Err(Error::RangeUnsupported {
                        url: url.to_string(),
                        status,
                    });
                }
                offset - served_from
            }
            // Range ignored, the body is the whole resource
            200 => offset,
            416 => return Ok(Vec::new()),
            _ => return Err(status_error(url, status, range.is_some())),
        };

        debug!(url, offset, ?length, status, skip, "range fetched");

        let mut body = response.into_body().into_reader();
        read_window(&mut body, skip, length).map_err(|e| Error::RemoteUnavailable {
            url: url.to_string(),
            message: format!("Failed to read response body: {}", e),
        })
    }

    fn validator_once(&self, url: &str) -> Result<Option<String>>
    {
        let response = self.agent()?.head(url).call().map_err(|e| Error::RemoteUnavailable {
            url: url.to_string(),
            message: format!("HTTP HEAD request failed: {}", e),
        })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status)
        {
            return Err(status_error(url, status, false));
        }

        let headers = response.headers();
        Ok(headers
            .get("ETag")
            .or_else(|| headers.get("Last-Modified"))
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string()))
    }
}

impl RangeFetcher for HttpFetcher
{
    fn fetch(&self, url: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>>
    {
        self.retry.run(url, || self.fetch_once(url, offset, length))
    }

    fn validator(&self, url: &str) -> Result<Option<String>>
    {
        self.retry.run(url, || self.validator_once(url))
    }

    /// Drop the agent and its keep-alive pool. Later requests fail with
    /// [`Error::ReaderClosed`].
    fn close(&self) -> Result<()>
    {
        let mut agent = self
            .agent
            .write()
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::Other, "lock poisoned")))?;
        if agent.take().is_some()
        {
            debug!("HTTP agent released");
        }
        Ok(())
    }
}

/// `Range` header value for a window, `None` for a plain GET of everything.
fn range_header(offset: u64, length: Option<u64>) -> Option<String>
{
    match length
    {
        Some(len) => Some(format!("bytes={}-{}", offset, offset + len - 1)),
        None if offset == 0 => None,
        None => Some(format!("bytes={}-", offset)),
    }
}

/// First byte position of a `Content-Range: bytes <start>-<end>/<total>` value.
fn content_range_start(value: &str) -> Option<u64>
{
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

fn status_error(url: &str, status: u16, ranged: bool) -> Error
{
    match status
    {
        404 | 410 => Error::NotFound(url.to_string()),
        408 | 429 | 500..=599 => Error::RemoteUnavailable {
            url: url.to_string(),
            message: format!("Unexpected HTTP status: {}", status),
        },
        _ if ranged => Error::RangeUnsupported {
            url: url.to_string(),
            status,
        },
        _ => Error::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("Unexpected HTTP status {} for {}", status, url),
        )),
    }
}

/// Discard `skip` bytes of `body`, then read up to `length` bytes.
fn read_window<R: Read>(body: &mut R, skip: u64, length: Option<u64>) -> io::Result<Vec<u8>>
{
    io::copy(&mut body.by_ref().take(skip), &mut io::sink())?;

    let mut data = Vec::new();
    match length
    {
        Some(len) => body.take(len).read_to_end(&mut data)?,
        None => body.read_to_end(&mut data)?,
    };
    Ok(data)
}
