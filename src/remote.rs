//! Seekable byte stream over a remote resource.
//!
//! `RemoteStream` implements `Read` and `Seek` on top of a [`RangeFetcher`],
//! requesting one window of bytes at a time. The end of the resource is
//! discovered from short responses, so no size probe is needed up front.

use crate::fetch::RangeFetcher;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

/// A remote resource read through a sliding fetch window.
///
/// # Example
///
/// ```no_run
/// use bamhttp::fetch::MemoryFetcher;
/// use bamhttp::remote::RemoteStream;
/// use std::io::Read;
/// use std::sync::Arc;
///
/// let fetcher = Arc::new(MemoryFetcher::new());
/// fetcher.insert("mem://data", b"0123456789".to_vec());
/// let mut stream = RemoteStream::new(fetcher, "mem://data", 4);
/// let mut all = Vec::new();
/// stream.read_to_end(&mut all).unwrap();
/// ```
pub struct RemoteStream
{
    /// Resource URL
    url: String,
    fetcher: Arc<dyn RangeFetcher>,
    /// Bytes of the current window
    window: Vec<u8>,
    /// Offset of `window[0]` in the resource
    window_start: u64,
    /// Current position in the resource
    pos: u64,
    /// Default window size
    window_size: u64,
    /// Window size requested by the caller for the next fetch
    min_window: u64,
    /// Resource size, once a short response revealed it
    file_size: Option<u64>,
}

impl RemoteStream
{
    pub fn new(fetcher: Arc<dyn RangeFetcher>, url: impl Into<String>, window_size: u64) -> Self
    {
        Self {
            url: url.into(),
            fetcher,
            window: Vec::new(),
            window_start: 0,
            pos: 0,
            window_size: window_size.max(1),
            min_window: 0,
            file_size: None,
        }
    }

    pub fn url(&self) -> &str
    {
        &self.url
    }

    /// Ask for at least `bytes` to be fetched by the next request, so a
    /// known span can be transferred in one round trip.
    pub fn reserve_window(&mut self, bytes: u64)
    {
        self.min_window = bytes;
    }

    /// Whether `pos` can be served from the current window.
    fn in_window(&self, pos: u64) -> bool
    {
        pos >= self.window_start && pos < self.window_start + self.window.len() as u64
    }

    fn fetch_window(&mut self, offset: u64) -> io::Result<()>
    {
        let length = self.window_size.max(self.min_window);
        self.min_window = 0;

        let data = self
            .fetcher
            .fetch(&self.url, offset, Some(length))
            .map_err(|e| e.into_io())?;

        // An empty answer past the end only bounds the size from above
        if (data.len() as u64) < length && (!data.is_empty() || offset == 0)
        {
            self.file_size = Some(offset + data.len() as u64);
        }
        self.window = data;
        self.window_start = offset;
        Ok(())
    }
}

impl Read for RemoteStream
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        if buf.is_empty() || self.file_size.map(|size| self.pos >= size).unwrap_or(false)
        {
            return Ok(0);
        }

        if !self.in_window(self.pos)
        {
            self.fetch_window(self.pos)?;
            if !self.in_window(self.pos)
            {
                return Ok(0);
            }
        }

        let offset_in_window = (self.pos - self.window_start) as usize;
        let available = &self.window[offset_in_window..];
        let n = std::cmp::min(buf.len(), available.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for RemoteStream
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>
    {
        self.pos = match pos
        {
            SeekFrom::Start(n) => n,
            SeekFrom::End(offset) =>
            {
                let size = self.file_size.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "remote size not yet known")
                })?;
                size.checked_add_signed(offset).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "Seek before file start")
                })?
            }
            SeekFrom::Current(offset) => self.pos.checked_add_signed(offset).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "Seek before file start")
            })?,
        };

        Ok(self.pos)
    }
}
