//! Translate a genomic interval into the virtual offset ranges to read.
//!
//! The BAI binning scheme splits a reference into a fixed six-level
//! hierarchy: one bin of 512Mbp, 8 of 64Mbp, 64 of 8Mbp, 512 of 1Mbp,
//! 4096 of 128kbp and 32768 of 16kbp. A record is registered in the
//! smallest bin that contains it, so a query has to visit every bin at
//! every level that intersects it.

use crate::bai::{BamIndex, Chunk, LINEAR_WINDOW_SHIFT};
use crate::error::{Error, Result};
use crate::header::FileHeader;
use tracing::debug;

/// Coordinates beyond this are outside the binning scheme.
pub const MAX_COORDINATE: u64 = 1 << 29;

/// First bin number and coordinate shift of each level, coarsest first.
const LEVELS: [(u32, u32); 6] = [(0, 29), (1, 26), (9, 23), (73, 20), (585, 17), (4681, 14)];

/// The ordered, non-overlapping chunks to read for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPlan
{
    /// Resolved reference index, if the query can match anything at all
    reference_id: Option<usize>,
    chunks: Vec<Chunk>,
}

impl QueryPlan
{
    pub fn empty() -> Self
    {
        Self::default()
    }

    pub fn reference_id(&self) -> Option<usize>
    {
        self.reference_id
    }

    pub fn chunks(&self) -> &[Chunk]
    {
        &self.chunks
    }

    pub fn len(&self) -> usize
    {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.chunks.is_empty()
    }

    pub fn into_chunks(self) -> Vec<Chunk>
    {
        self.chunks
    }
}

/// Bins of every level intersecting the 0-based half-open interval
/// `[start, end)`.
///
/// # Arguments
///
/// * `start` - first base of the interval
/// * `end` - one past the last base, greater than `start`
pub fn region_to_bins(start: u64, end: u64) -> Vec<u32>
{
    let start = start.min(MAX_COORDINATE - 1) as u32;
    let last = (end.min(MAX_COORDINATE).max(1) - 1) as u32;

    let mut bins = Vec::new();
    for (offset, shift) in LEVELS
    {
        for bin in offset + (start >> shift)..=offset + (last >> shift)
        {
            bins.push(bin);
        }
    }
    bins
}

/// Build the read plan for `reference:[start, end)`.
///
/// # Returns
///
/// An empty plan for an empty interval, an interval past the end of the
/// reference, or a reference without index data. [`Error::UnknownReference`]
/// if the header does not name `reference`.
pub fn plan(index: &BamIndex, header: &FileHeader, reference: &str, start: u64, end: u64) -> Result<QueryPlan>
{
    let reference_id = header
        .reference_id(reference)
        .ok_or_else(|| Error::UnknownReference(reference.to_string()))?;

    let length = header.reference(reference_id).map(|r| r.length as u64).unwrap_or(0);
    let end = end.min(MAX_COORDINATE);
    if start >= end || start >= length.max(1).min(MAX_COORDINATE)
    {
        return Ok(QueryPlan::empty());
    }

    let reference_index = match index.reference(reference_id)
    {
        Some(r) => r,
        None => return Ok(QueryPlan::empty()),
    };

    // Nothing overlapping `start` can begin before the linear index entry
    let min_offset = reference_index.min_offset(start as u32);

    let mut chunks: Vec<Chunk> = region_to_bins(start, end)
        .into_iter()
        .flat_map(|bin| reference_index.chunks(bin).iter().copied())
        .filter(|chunk| chunk.end > min_offset)
        .collect();
    let candidates = chunks.len();
    chunks = merge_chunks(chunks);

    debug!(
        reference,
        start,
        end,
        candidates,
        merged = chunks.len(),
        linear_window = start >> LINEAR_WINDOW_SHIFT,
        "query plan"
    );

    Ok(QueryPlan {
        reference_id: Some(reference_id),
        chunks,
    })
}

/// Sort chunks and merge the ones that overlap, touch, or end and start in
/// the same compressed block.
fn merge_chunks(mut chunks: Vec<Chunk>) -> Vec<Chunk>
{
    chunks.sort_by_key(|c| c.start);

    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks
    {
        match merged.last_mut()
        {
            Some(current)
                if chunk.start <= current.end
                    || chunk.start.block_address() == current.end.block_address() =>
            {
                current.end = current.end.max(chunk.end);
            }
            _ => merged.push(chunk),
        }
    }
    merged
}
