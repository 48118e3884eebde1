//! BAM index (.bai) parser.
//!
//! The index maps each reference sequence to a hierarchical binning index
//! (bin number -> chunks of virtual offsets) and a linear index of the
//! smallest virtual offset per 16kbp window.

use crate::bgzf::VirtualOffset;
use crate::cursor::ByteCursor;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

const BAI_MAGIC: &[u8; 4] = b"BAI\x01";

/// Pseudo-bin carrying per-reference metadata instead of chunks.
pub const METADATA_BIN: u32 = 37450;

/// Highest regular bin number.
pub const MAX_BIN: u32 = 37449;

/// Window size of the linear index (16kbp).
pub const LINEAR_WINDOW_SHIFT: u32 = 14;

/// A contiguous range `[start, end)` of the decompressed BAM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk
{
    pub start: VirtualOffset,
    pub end: VirtualOffset,
}

impl Chunk
{
    pub fn new(start: VirtualOffset, end: VirtualOffset) -> Self
    {
        Chunk { start, end }
    }

    /// Compressed bytes covering the chunk, from its first block up to and
    /// including the block holding its end.
    pub fn compressed_span(&self) -> u64
    {
        self.end.block_address().saturating_sub(self.start.block_address())
            + crate::bgzf::BGZF_MAX_BLOCK_SIZE as u64
    }
}

/// Contents of the metadata pseudo-bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceMetadata
{
    /// Virtual offset of the first record on the reference
    pub start: VirtualOffset,
    /// Virtual offset just past the last record on the reference
    pub end: VirtualOffset,
    pub mapped: u64,
    pub unmapped: u64,
}

/// Index data for one reference sequence.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex
{
    /// Chunks per bin number
    pub bins: HashMap<u32, Vec<Chunk>>,
    /// Smallest virtual offset of a record overlapping each 16kbp window
    pub intervals: Vec<VirtualOffset>,
    pub metadata: Option<ReferenceMetadata>,
}

impl ReferenceIndex
{
    pub fn chunks(&self, bin: u32) -> &[Chunk]
    {
        self.bins.get(&bin).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Lower bound for the virtual offset of any record overlapping
    /// `position`, from the linear index.
    pub fn min_offset(&self, position: u32) -> VirtualOffset
    {
        let window = (position >> LINEAR_WINDOW_SHIFT) as usize;
        self.intervals.get(window).copied().unwrap_or_default()
    }
}

/// A parsed BAM index.
///
/// # Example
///
/// ```no_run
/// use bamhttp::bai::BamIndex;
/// use std::path::Path;
///
/// let index = BamIndex::from_path(Path::new("data.bam.bai")).unwrap();
/// println!("index covers {} references", index.reference_count());
/// ```
#[derive(Debug, Clone, Default)]
pub struct BamIndex
{
    references: Vec<ReferenceIndex>,
    /// Number of reads without coordinates, if recorded
    unplaced_unmapped: Option<u64>,
}

impl BamIndex
{
    pub fn from_path(path: &Path) -> Result<Self>
    {
        let buffer = std::fs::read(path)?;
        Self::from_bytes(&buffer)
    }

    /// Parse a BAI index from raw bytes.
    ///
    /// ```text
    /// magic[4]        "BAI\1"
    /// n_ref[4]        Number of reference sequences (int32)
    /// For each reference:
    ///   n_bin[4]      Number of bins (int32)
    ///   For each bin:
    ///     bin[4]      Bin number (uint32)
    ///     n_chunk[4]  Number of chunks (int32)
    ///     chunk_beg[8], chunk_end[8] per chunk
    ///   n_intv[4]     Number of 16kbp windows (int32)
    ///   ioffset[8]    per window
    /// n_no_coor[8]    Optional count of unplaced reads (uint64)
    /// ```
    pub fn from_bytes(buffer: &[u8]) -> Result<Self>
    {
        let mut cursor = ByteCursor::new(buffer);
        Self::parse(&mut cursor).map_err(|e| match e
        {
            Error::TruncatedRecord { expected, available } => Error::CorruptIndex(format!(
                "index data ends early: needed {} more bytes, {} available",
                expected, available
            )),
            other => other,
        })
    }

    fn parse(cursor: &mut ByteCursor<'_>) -> Result<Self>
    {
        let magic = cursor.read_bytes(4)?;
        if magic != BAI_MAGIC
        {
            return Err(Error::CorruptIndex(format!(
                "invalid BAI magic bytes: expected 'BAI\\x01', got {:?}",
                magic
            )));
        }

        let n_ref = read_count(cursor, "reference")?;
        let mut references = Vec::with_capacity(n_ref.min(1 << 16));
        for _ in 0..n_ref
        {
            references.push(Self::parse_reference(cursor)?);
        }

        let unplaced_unmapped = if cursor.remaining() >= 8
        {
            Some(cursor.read_u64()?)
        }
        else
        {
            None
        };

        Ok(BamIndex {
            references,
            unplaced_unmapped,
        })
    }

    fn parse_reference(cursor: &mut ByteCursor<'_>) -> Result<ReferenceIndex>
    {
        let n_bin = read_count(cursor, "bin")?;
        let mut reference = ReferenceIndex::default();

        for _ in 0..n_bin
        {
            let bin = cursor.read_u32()?;
            let n_chunk = read_count(cursor, "chunk")?;

            if bin == METADATA_BIN
            {
                if n_chunk != 2
                {
                    return Err(Error::CorruptIndex(format!(
                        "metadata bin with {} chunks",
                        n_chunk
                    )));
                }
                reference.metadata = Some(ReferenceMetadata {
                    start: VirtualOffset::from_raw(cursor.read_u64()?),
                    end: VirtualOffset::from_raw(cursor.read_u64()?),
                    mapped: cursor.read_u64()?,
                    unmapped: cursor.read_u64()?,
                });
                continue;
            }
            if bin > MAX_BIN
            {
                return Err(Error::CorruptIndex(format!("bin number {} out of range", bin)));
            }

            let chunks = reference.bins.entry(bin).or_default();
            for _ in 0..n_chunk
            {
                let start = VirtualOffset::from_raw(cursor.read_u64()?);
                let end = VirtualOffset::from_raw(cursor.read_u64()?);
                if end < start
                {
                    return Err(Error::CorruptIndex(format!(
                        "chunk in bin {} ends before it starts ({} < {})",
                        bin, end, start
                    )));
                }
                chunks.push(Chunk::new(start, end));
            }
        }

        let n_intv = read_count(cursor, "interval")?;
        reference.intervals.reserve(n_intv.min(1 << 20));
        for _ in 0..n_intv
        {
            reference
                .intervals
                .push(VirtualOffset::from_raw(cursor.read_u64()?));
        }

        Ok(reference)
    }

    pub fn reference_count(&self) -> usize
    {
        self.references.len()
    }

    pub fn reference(&self, id: usize) -> Option<&ReferenceIndex>
    {
        self.references.get(id)
    }

    pub fn references(&self) -> &[ReferenceIndex]
    {
        &self.references
    }

    /// Number of reads without coordinates, when the index records it.
    pub fn unplaced_unmapped(&self) -> Option<u64>
    {
        self.unplaced_unmapped
    }
}

fn read_count(cursor: &mut ByteCursor<'_>, what: &str) -> Result<usize>
{
    let n = cursor.read_i32()?;
    if n < 0
    {
        return Err(Error::CorruptIndex(format!("negative {} count: {}", what, n)));
    }
    // every entry takes at least four bytes
    if n as usize > cursor.remaining() / 4 + 1
    {
        return Err(Error::CorruptIndex(format!(
            "{} count {} exceeds the remaining index data",
            what, n
        )));
    }
    Ok(n as usize)
}
