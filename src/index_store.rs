//! Process-wide cache of parsed BAM indexes.
//!
//! The first request for a BAM resource fetches its companion index, writes
//! the raw bytes to the on-disk cache and parses them. Later requests in the
//! same process share the parsed index; later processes start from the disk
//! copy as long as the remote validator (ETag or Last-Modified) still
//! matches the one stored beside it.
//!
//! Each resource has its own slot. Concurrent first requests for the same
//! resource queue on the slot lock, so only one of them touches the network.

use crate::bai::BamIndex;
use crate::error::{Error, Result};
use crate::fetch::RangeFetcher;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info, warn};

type Slot = Arc<Mutex<Option<Arc<BamIndex>>>>;

/// Extension of the file recording which URL and validator a cached index
/// came from.
const STAMP_EXTENSION: &str = "stamp";

/// Where one resource's index lives, locally and remotely.
#[derive(Debug, Clone)]
pub struct IndexLocation
{
    /// URL of the BAM file the index belongs to
    pub data_url: String,
    /// Candidate index URLs, in the order they are tried
    pub index_urls: Vec<String>,
    /// Cached copy of the index bytes
    pub cache_path: PathBuf,
}

impl IndexLocation
{
    /// Derive index URLs and the cache file for `data_url`.
    ///
    /// # Arguments
    ///
    /// * `data_url` - URL of the BAM file
    /// * `index_suffix` - suffix appended to find the index, usually `.bai`
    /// * `cache_dir` - directory of the on-disk index cache
    pub fn new(data_url: &str, index_suffix: &str, cache_dir: &Path) -> Self
    {
        Self {
            data_url: data_url.to_string(),
            index_urls: index_urls(data_url, index_suffix),
            cache_path: cache_path(cache_dir, data_url, index_suffix),
        }
    }

    fn stamp_path(&self) -> PathBuf
    {
        self.cache_path.with_extension(STAMP_EXTENSION)
    }
}

/// `data.bam.bai` first, then `data.bai`. A query string stays at the end
/// of the URL so signed URLs keep working.
pub fn index_urls(data_url: &str, suffix: &str) -> Vec<String>
{
    let (base, query) = match data_url.find('?')
    {
        Some(pos) => data_url.split_at(pos),
        None => (data_url, ""),
    };

    let mut urls = vec![format!("{}{}{}", base, suffix, query)];
    if let Some(stem) = base.strip_suffix(".bam")
    {
        urls.push(format!("{}{}{}", stem, suffix, query));
    }
    urls
}

/// Cache file for the index of `data_url`: the SHA-256 of URL and suffix,
/// hex encoded.
pub fn cache_path(cache_dir: &Path, data_url: &str, suffix: &str) -> PathBuf
{
    let mut hasher = Sha256::new();
    hasher.update(data_url.as_bytes());
    hasher.update(b"\n");
    hasher.update(suffix.as_bytes());
    let name: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    cache_dir.join(format!("{}.bai", name))
}

/// Keyed cache of parsed indexes with single-flight loading.
#[derive(Debug, Default)]
pub struct IndexStore
{
    slots: Mutex<HashMap<PathBuf, Slot>>,
}

impl IndexStore
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// The store shared by every reader in this process.
    pub fn shared() -> Arc<IndexStore>
    {
        static SHARED: OnceLock<Arc<IndexStore>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(IndexStore::new())).clone()
    }

    fn slot(&self, location: &IndexLocation) -> Result<Slot>
    {
        let mut slots = self.slots.lock().map_err(|_| poisoned())?;
        Ok(slots.entry(location.cache_path.clone()).or_default().clone())
    }

    /// Return the parsed index for `location`, loading it on first use.
    ///
    /// Callers arriving while another caller loads the same index wait for
    /// that load and share its result. A failed load leaves the slot empty,
    /// so the next caller tries again.
    pub fn get_or_fetch(&self, fetcher: &dyn RangeFetcher, location: &IndexLocation) -> Result<Arc<BamIndex>>
    {
        let slot = self.slot(location)?;
        let mut guard = slot.lock().map_err(|_| poisoned())?;

        if let Some(index) = guard.as_ref()
        {
            debug!(url = %location.data_url, "index memory hit");
            return Ok(index.clone());
        }

        let index = Arc::new(load(fetcher, location)?);
        *guard = Some(index.clone());
        Ok(index)
    }

    /// Whether a parsed index for `location` is held in memory.
    pub fn is_loaded(&self, location: &IndexLocation) -> bool
    {
        self.slot(location)
            .ok()
            .and_then(|slot| slot.lock().ok().map(|guard| guard.is_some()))
            .unwrap_or(false)
    }

    /// Drop the in-memory and on-disk copies of the index, forcing the next
    /// access to fetch it again.
    pub fn invalidate(&self, location: &IndexLocation) -> Result<()>
    {
        let slot = self.slot(location)?;
        let mut guard = slot.lock().map_err(|_| poisoned())?;
        *guard = None;

        remove_if_present(&location.cache_path)?;
        remove_if_present(&location.stamp_path())?;
        info!(url = %location.data_url, path = %location.cache_path.display(), "index cache invalidated");
        Ok(())
    }
}

/// Disk cache first, remote otherwise.
fn load(fetcher: &dyn RangeFetcher, location: &IndexLocation) -> Result<BamIndex>
{
    if let Some(index) = load_cached(fetcher, location)
    {
        return Ok(index);
    }

    let (index_url, validator, bytes) = fetch_index(fetcher, location)?;
    // a corrupt remote index is reported, never cached
    let index = BamIndex::from_bytes(&bytes)?;

    if let Err(e) = write_cache(location, &index_url, validator.as_deref(), &bytes)
    {
        warn!(path = %location.cache_path.display(), error = %e, "could not write index cache");
    }

    Ok(index)
}

/// The cached index, unless it is missing, unreadable or stale.
/// Unusable cache files are removed.
fn load_cached(fetcher: &dyn RangeFetcher, location: &IndexLocation) -> Option<BamIndex>
{
    let bytes = match fs::read(&location.cache_path)
    {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound =>
        {
            debug!(url = %location.data_url, "index cache miss");
            return None;
        }
        Err(e) =>
        {
            warn!(path = %location.cache_path.display(), error = %e, "unreadable index cache");
            discard(location);
            return None;
        }
    };

    if let Some((index_url, stored)) = read_stamp(&location.stamp_path())
    {
        match fetcher.validator(&index_url)
        {
            Ok(Some(current)) if Some(&current) != stored.as_ref() =>
            {
                info!(url = %index_url, "remote index changed, discarding cache");
                discard(location);
                return None;
            }
            Ok(_) => (),
            Err(e) => warn!(url = %index_url, error = %e, "could not check index validator, using cache"),
        }
    }

    match BamIndex::from_bytes(&bytes)
    {
        Ok(index) =>
        {
            debug!(path = %location.cache_path.display(), "index disk cache hit");
            Some(index)
        }
        Err(e) =>
        {
            warn!(path = %location.cache_path.display(), error = %e, "corrupt index cache");
            discard(location);
            None
        }
    }
}

/// Try each candidate URL, moving on only when one is missing.
/// The first index found, with the validator read before its bytes so that
/// the validator never describes a newer index than the one cached.
fn fetch_index(fetcher: &dyn RangeFetcher, location: &IndexLocation) -> Result<(String, Option<String>, Vec<u8>)>
{
    for url in &location.index_urls
    {
        let validator = match fetcher.validator(url)
        {
            Ok(v) => v,
            Err(Error::NotFound(_)) => None,
            Err(e) =>
            {
                warn!(url = %url, error = %e, "could not read index validator");
                None
            }
        };
        match fetcher.fetch(url, 0, None)
        {
            Ok(bytes) =>
            {
                info!(url = %url, bytes = bytes.len(), "fetched index");
                return Ok((url.clone(), validator, bytes));
            }
            Err(Error::NotFound(_)) => debug!(url = %url, "no index here"),
            Err(e) => return Err(e),
        }
    }
    Err(Error::NotFound(format!(
        "no index for {} (tried {})",
        location.data_url,
        location.index_urls.join(", ")
    )))
}

/// Stamp format: the index URL on the first line, the validator (possibly
/// empty) on the second.
fn read_stamp(path: &Path) -> Option<(String, Option<String>)>
{
    let text = fs::read_to_string(path).ok()?;
    let mut lines = text.lines();
    let url = lines.next()?.to_string();
    let validator = lines.next().filter(|v| !v.is_empty()).map(str::to_string);
    Some((url, validator))
}

fn write_cache(location: &IndexLocation, index_url: &str, validator: Option<&str>, bytes: &[u8]) -> io::Result<()>
{
    let dir = location
        .cache_path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cache path has no directory"))?;
    fs::create_dir_all(dir)?;

    // stamp first: a cache file never appears without its validator
    let stamp = format!("{}\n{}\n", index_url, validator.unwrap_or(""));
    write_atomic(dir, &location.stamp_path(), stamp.as_bytes())?;
    write_atomic(dir, &location.cache_path, bytes)?;

    debug!(path = %location.cache_path.display(), bytes = bytes.len(), "index cache written");
    Ok(())
}

/// Write to a temporary file in `dir` and rename it over `path`, so readers
/// see either the old file or the complete new one.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<()>
{
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn discard(location: &IndexLocation)
{
    for path in [location.cache_path.clone(), location.stamp_path()]
    {
        if let Err(e) = remove_if_present(&path)
        {
            warn!(path = %path.display(), error = %e, "could not remove index cache file");
        }
    }
}

fn remove_if_present(path: &Path) -> Result<()>
{
    match fs::remove_file(path)
    {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn poisoned() -> Error
{
    Error::Io(io::Error::new(io::ErrorKind::Other, "index store lock poisoned"))
}
