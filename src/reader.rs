//! Reader for a remote, BAI-indexed BAM file.

use crate::bai::{BamIndex, Chunk};
use crate::bgzf::{BgzfReader, VirtualOffset};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::RangeFetcher;
use crate::header::FileHeader;
use crate::index_store::{IndexLocation, IndexStore};
use crate::iter::{AlignmentIterator, QueryFilter};
use crate::planner;
use crate::remote::RemoteStream;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Random access to the alignments of a remote BAM file.
///
/// Opening fetches and parses the header. The index is fetched on the first
/// query and shared with every other reader of the same file in the process
/// through the [`IndexStore`].
///
/// A reader is meant to be driven by one caller at a time; open several
/// readers for concurrent queries.
///
/// # Example
///
/// ```no_run
/// use bamhttp::BamHttpReader;
///
/// let mut reader = BamHttpReader::open("http://example.com/sample.bam").unwrap();
/// println!("{} references", reader.header().reference_count());
///
/// let count = reader.query("Y", 9_999_999, 10_004_000).unwrap().count();
/// println!("{} records", count);
/// reader.close();
/// ```
pub struct BamHttpReader
{
    url: String,
    /// Taken on close
    fetcher: Option<Arc<dyn RangeFetcher>>,
    header: Arc<FileHeader>,
    /// Virtual offset of the first record, just past the header
    first_record: VirtualOffset,
    store: Arc<IndexStore>,
    location: IndexLocation,
    config: Config,
}

impl BamHttpReader
{
    /// Open `url` over HTTP with the configuration from the environment.
    #[cfg(feature = "url")]
    pub fn open(url: &str) -> Result<Self>
    {
        Self::open_with_config(url, Config::from_env())
    }

    /// Open `url` over HTTP.
    #[cfg(feature = "url")]
    pub fn open_with_config(url: &str, config: Config) -> Result<Self>
    {
        let fetcher = Arc::new(crate::http::HttpFetcher::with_config(&config));
        Self::open_with(url, fetcher, config)
    }

    /// Open `url` through any [`RangeFetcher`].
    ///
    /// # Arguments
    ///
    /// * `url` - location of the BAM file, as understood by `fetcher`
    /// * `fetcher` - transport for the BAM file and its index
    /// * `config` - window size, index suffix and cache directory
    ///
    /// # Returns
    ///
    /// The reader, with its header parsed. Fails with
    /// [`Error::NotFound`] if the file does not exist and
    /// [`Error::InvalidHeader`] if it is not a BAM file.
    pub fn open_with(url: &str, fetcher: Arc<dyn RangeFetcher>, config: Config) -> Result<Self>
    {
        let mut stream = BgzfReader::new(RemoteStream::new(fetcher.clone(), url, config.window_size));
        let header = FileHeader::read(&mut stream)?;
        let first_record = stream.virtual_offset();

        info!(
            url,
            references = header.reference_count(),
            version = header.version().unwrap_or("-"),
            "opened BAM"
        );

        Ok(Self {
            url: url.to_string(),
            location: IndexLocation::new(url, &config.index_suffix, &config.cache_dir),
            fetcher: Some(fetcher),
            header: Arc::new(header),
            first_record,
            store: IndexStore::shared(),
            config,
        })
    }

    /// Use `store` instead of the process-wide index store.
    pub fn with_index_store(mut self, store: Arc<IndexStore>) -> Self
    {
        self.store = store;
        self
    }

    pub fn url(&self) -> &str
    {
        &self.url
    }

    pub fn config(&self) -> &Config
    {
        &self.config
    }

    pub fn header(&self) -> &FileHeader
    {
        &self.header
    }

    pub fn sequence_names(&self) -> &[Arc<str>]
    {
        self.header.reference_names()
    }

    pub fn reference_count(&self) -> usize
    {
        self.header.reference_count()
    }

    /// First URL tried for the index.
    pub fn index_url(&self) -> &str
    {
        self.location.index_urls.first().map(String::as_str).unwrap_or("")
    }

    /// Local file caching the index, whether or not it exists yet.
    pub fn cached_index_path(&self) -> &Path
    {
        &self.location.cache_path
    }

    /// The parsed index, fetched on first use.
    pub fn index(&self) -> Result<Arc<BamIndex>>
    {
        let fetcher = self.fetcher()?;
        self.store.get_or_fetch(fetcher.as_ref(), &self.location)
    }

    /// Forget the cached index in memory and on disk. The next query
    /// fetches it again.
    pub fn invalidate_index(&self) -> Result<()>
    {
        self.store.invalidate(&self.location)
    }

    /// Records overlapping `reference:[start, end)`, 0-based and half-open.
    ///
    /// An empty interval or one past the end of the reference gives an
    /// empty iterator. A reference missing from the header is an
    /// [`Error::UnknownReference`].
    pub fn query(&self, reference: &str, start: u64, end: u64) -> Result<AlignmentIterator>
    {
        self.query_region(reference, start, end, false)
    }

    /// Records lying completely inside `reference:[start, end)`.
    pub fn query_contained(&self, reference: &str, start: u64, end: u64) -> Result<AlignmentIterator>
    {
        self.query_region(reference, start, end, true)
    }

    fn query_region(&self, reference: &str, start: u64, end: u64, contained: bool) -> Result<AlignmentIterator>
    {
        self.fetcher()?;
        if self.header.reference_id(reference).is_none()
        {
            return Err(Error::UnknownReference(reference.to_string()));
        }
        if start >= end
        {
            return Ok(AlignmentIterator::empty(self.header.clone()));
        }

        let index = self.index()?;
        let plan = planner::plan(&index, &self.header, reference, start, end)?;
        let reference_id = match plan.reference_id()
        {
            Some(id) if !plan.is_empty() => id,
            _ => return Ok(AlignmentIterator::empty(self.header.clone())),
        };

        let filter = QueryFilter::new(reference_id, start, end, contained);
        Ok(AlignmentIterator::new(
            self.stream()?,
            plan.into_chunks(),
            Some(filter),
            self.header.clone(),
        ))
    }

    /// Every record in file order, starting right after the header. The
    /// index is not used.
    pub fn iterator(&self) -> Result<AlignmentIterator>
    {
        let everything = Chunk::new(self.first_record, VirtualOffset::MAX);
        Ok(AlignmentIterator::new(
            self.stream()?,
            vec![everything],
            None,
            self.header.clone(),
        ))
    }

    /// Release the transport and its pooled connections. Failures are
    /// logged, not returned, and closing twice does nothing. The on-disk
    /// index cache is left in place.
    pub fn close(&mut self)
    {
        let fetcher = match self.fetcher.take()
        {
            Some(fetcher) => fetcher,
            None => return,
        };

        match fetcher.close()
        {
            Ok(()) => info!(url = %self.url, "closed BAM"),
            Err(e) => warn!(url = %self.url, error = %e, "error while closing"),
        }
    }

    pub fn is_closed(&self) -> bool
    {
        self.fetcher.is_none()
    }

    fn fetcher(&self) -> Result<&Arc<dyn RangeFetcher>>
    {
        self.fetcher.as_ref().ok_or(Error::ReaderClosed)
    }

    fn stream(&self) -> Result<BgzfReader<RemoteStream>>
    {
        let fetcher = self.fetcher()?.clone();
        Ok(BgzfReader::new(RemoteStream::new(fetcher, self.url.clone(), self.config.window_size)))
    }
}
