//! Lazy iteration over the records of a query.
//!
//! An [`AlignmentIterator`] owns its decompression stream and walks the
//! chunks of a query plan front to back. Nothing is fetched until the first
//! call to [`AlignmentIterator::has_next`] or [`AlignmentIterator::next_record`];
//! each later network request happens inside one of those calls.

use crate::bai::Chunk;
use crate::bgzf::{BgzfReader, VirtualOffset};
use crate::cursor::ByteCursor;
use crate::error::{Error, Result};
use crate::header::FileHeader;
use crate::record::{parse_record, AlignmentRecord, FIXED_FIELDS_SIZE};
use crate::remote::RemoteStream;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;
use tracing::debug;

/// Largest record accepted before the data is considered corrupt.
const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

/// Upper bound for the fetch window requested for a single chunk.
const MAX_CHUNK_WINDOW: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState
{
    /// More records may follow
    Positioned,
    /// All matching records have been returned
    Exhausted,
    /// Closed by the caller
    Closed,
}

/// Which records a ranged query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueryFilter
{
    reference_id: i32,
    start: i64,
    end: i64,
    /// Require records to lie inside the interval instead of overlapping it
    contained: bool,
}

impl QueryFilter
{
    pub(crate) fn new(reference_id: usize, start: u64, end: u64, contained: bool) -> Self
    {
        Self {
            reference_id: reference_id as i32,
            start: i64::try_from(start).unwrap_or(i64::MAX),
            end: i64::try_from(end).unwrap_or(i64::MAX),
            contained,
        }
    }

    fn matches(&self, record: &AlignmentRecord) -> bool
    {
        if self.contained
        {
            record.contained_in(self.start, self.end)
        }
        else
        {
            record.overlaps(self.start, self.end)
        }
    }

    /// Whether no record after `record` can match, given coordinate order.
    fn is_past(&self, record: &AlignmentRecord) -> bool
    {
        record.reference_id < 0
            || record.reference_id > self.reference_id
            || (record.reference_id == self.reference_id && record.start() >= self.end)
    }
}

/// Single-pass sequence of the records of one query or full scan.
///
/// The iterator moves from `Positioned` to `Exhausted` when no record is
/// left and to `Closed` when [`close`](Self::close) is called. Closing drops
/// the stream, so no further range request is made; calls after closing
/// fail with [`Error::IteratorClosed`].
///
/// # Example
///
/// ```no_run
/// use bamhttp::BamHttpReader;
///
/// let reader = BamHttpReader::open("http://example.com/sample.bam").unwrap();
/// let mut records = reader.query("Y", 9_999_999, 10_004_000).unwrap();
/// while let Some(record) = records.next_record().unwrap()
/// {
///     println!("{}\t{}\t{}", record.read_name, record.position, record.cigar_string());
/// }
/// records.close();
/// ```
pub struct AlignmentIterator
{
    state: IteratorState,
    stream: Option<BgzfReader<RemoteStream>>,
    /// Chunks not yet started
    chunks: VecDeque<Chunk>,
    /// End of the chunk being read, if any
    chunk_end: Option<VirtualOffset>,
    /// Whether the stream has been positioned at all
    seeked: bool,
    filter: Option<QueryFilter>,
    header: Arc<FileHeader>,
    /// Record read ahead by `has_next`
    peeked: Option<AlignmentRecord>,
    /// Scratch buffer for one raw record
    record_buf: Vec<u8>,
}

impl AlignmentIterator
{
    /// An iterator over `chunks`, in order, keeping records accepted by
    /// `filter` (all records without one).
    pub(crate) fn new(
        stream: BgzfReader<RemoteStream>,
        chunks: Vec<Chunk>,
        filter: Option<QueryFilter>,
        header: Arc<FileHeader>,
    ) -> Self
    {
        let mut iter = Self {
            state: IteratorState::Positioned,
            stream: Some(stream),
            chunks: chunks.into(),
            chunk_end: None,
            seeked: false,
            filter,
            header,
            peeked: None,
            record_buf: Vec::new(),
        };
        if iter.chunks.is_empty()
        {
            iter.finish();
        }
        iter
    }

    /// An iterator that never yields and never fetches.
    pub(crate) fn empty(header: Arc<FileHeader>) -> Self
    {
        Self {
            state: IteratorState::Exhausted,
            stream: None,
            chunks: VecDeque::new(),
            chunk_end: None,
            seeked: false,
            filter: None,
            header,
            peeked: None,
            record_buf: Vec::new(),
        }
    }

    pub fn state(&self) -> IteratorState
    {
        self.state
    }

    pub fn is_closed(&self) -> bool
    {
        self.state == IteratorState::Closed
    }

    /// Whether another record is available. Reads ahead at most one record
    /// and keeps it for the next call to [`next_record`](Self::next_record).
    pub fn has_next(&mut self) -> Result<bool>
    {
        match self.state
        {
            IteratorState::Closed => Err(Error::IteratorClosed),
            IteratorState::Exhausted => Ok(false),
            IteratorState::Positioned =>
            {
                if self.peeked.is_some()
                {
                    return Ok(true);
                }
                match self.advance()
                {
                    Ok(Some(record)) =>
                    {
                        self.peeked = Some(record);
                        Ok(true)
                    }
                    Ok(None) =>
                    {
                        self.finish();
                        Ok(false)
                    }
                    Err(e) =>
                    {
                        self.finish();
                        Err(e)
                    }
                }
            }
        }
    }

    /// The next matching record, `None` once the iterator is exhausted.
    pub fn next_record(&mut self) -> Result<Option<AlignmentRecord>>
    {
        if self.has_next()?
        {
            Ok(self.peeked.take())
        }
        else
        {
            Ok(None)
        }
    }

    /// Stop iterating and release the stream. Closing twice is harmless.
    pub fn close(&mut self)
    {
        if self.state != IteratorState::Closed
        {
            debug!(remaining_chunks = self.chunks.len(), "iterator closed");
        }
        self.state = IteratorState::Closed;
        self.release();
    }

    fn finish(&mut self)
    {
        self.state = IteratorState::Exhausted;
        self.release();
    }

    fn release(&mut self)
    {
        self.stream = None;
        self.chunks.clear();
        self.chunk_end = None;
        self.peeked = None;
    }

    /// Read records until one passes the filter or the plan runs out.
    fn advance(&mut self) -> Result<Option<AlignmentRecord>>
    {
        loop
        {
            let end = match self.chunk_end
            {
                Some(end) => end,
                None => match self.enter_next_chunk()?
                {
                    Some(end) => end,
                    None => return Ok(None),
                },
            };

            let stream = self.stream.as_mut().ok_or(Error::IteratorClosed)?;
            if stream.virtual_offset() >= end
            {
                self.chunk_end = None;
                continue;
            }

            let record = match read_record(stream, &mut self.record_buf, self.header.reference_names())?
            {
                Some(record) => record,
                None => return Ok(None),
            };

            match &self.filter
            {
                None => return Ok(Some(record)),
                Some(filter) if filter.is_past(&record) =>
                {
                    debug!(name = %record.read_name, "past the query interval");
                    return Ok(None);
                }
                Some(filter) if filter.matches(&record) => return Ok(Some(record)),
                Some(_) => (),
            }
        }
    }

    /// Move the stream to the next chunk that still lies ahead and return
    /// its end. Chunks already passed are skipped; the stream never moves
    /// backwards.
    fn enter_next_chunk(&mut self) -> Result<Option<VirtualOffset>>
    {
        let stream = self.stream.as_mut().ok_or(Error::IteratorClosed)?;

        while let Some(chunk) = self.chunks.pop_front()
        {
            let here = stream.virtual_offset();
            if self.seeked && chunk.end <= here
            {
                debug!(start = %chunk.start, end = %chunk.end, "chunk already read");
                continue;
            }

            if !self.seeked || chunk.start > here
            {
                if chunk.end != VirtualOffset::MAX
                {
                    stream
                        .get_mut()
                        .reserve_window(chunk.compressed_span().min(MAX_CHUNK_WINDOW));
                }
                stream.seek_virtual(chunk.start)?;
                self.seeked = true;
            }

            self.chunk_end = Some(chunk.end);
            return Ok(Some(chunk.end));
        }

        Ok(None)
    }
}

impl Iterator for AlignmentIterator
{
    type Item = Result<AlignmentRecord>;

    /// Yields records until the iterator is exhausted, fails or is closed.
    fn next(&mut self) -> Option<Self::Item>
    {
        if self.is_closed()
        {
            return None;
        }
        self.next_record().transpose()
    }
}

/// Read one length-prefixed record. `None` at a clean end of stream.
fn read_record<R: Read>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    reference_names: &[Arc<str>],
) -> Result<Option<AlignmentRecord>>
{
    let mut prefix = [0u8; 4];
    let n = read_fully(reader, &mut prefix)?;
    if n == 0
    {
        return Ok(None);
    }
    if n < prefix.len()
    {
        return Err(Error::TruncatedRecord {
            expected: prefix.len(),
            available: n,
        });
    }

    let block_size = i32::from_le_bytes(prefix);
    if block_size < FIXED_FIELDS_SIZE as i32 || block_size as usize > MAX_RECORD_SIZE
    {
        return Err(Error::MalformedRecord(format!("implausible block_size {}", block_size)));
    }
    let total = block_size as usize + prefix.len();

    buf.clear();
    buf.extend_from_slice(&prefix);
    buf.resize(total, 0);
    let body = read_fully(reader, &mut buf[prefix.len()..])?;
    if body + prefix.len() < total
    {
        return Err(Error::TruncatedRecord {
            expected: total,
            available: body + prefix.len(),
        });
    }

    let (record, _) = parse_record(&mut ByteCursor::new(buf), reference_names)?;
    Ok(Some(record))
}

/// Fill `buf` as far as the reader allows and return the byte count.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
{
    let mut filled = 0;
    while filled < buf.len()
    {
        match reader.read(&mut buf[filled..])
        {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
