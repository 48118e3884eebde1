//! Blocked GZip Format (BGZF) reader with virtual offset seeking.
//!
//! BGZF is a variant of gzip that uses independent blocks for random access.
//! Each block is a valid gzip member whose extra field records the block's
//! own compressed size, so block boundaries are known without scanning.
//! A position in the decompressed stream is addressed by a [`VirtualOffset`].

use crate::error::Error;
use flate2::{Crc, Decompress, FlushDecompress, Status};
use std::fmt;
use std::io::{self, BufRead, Read, Seek, SeekFrom};

/// BGZF magic numbers and constants
const GZIP_ID1: u8 = 0x1f;
const GZIP_ID2: u8 = 0x8b;
const GZIP_CM_DEFLATE: u8 = 8;
const GZIP_FLG_FEXTRA: u8 = 4;
const BGZF_EXTRA_ID: u8 = 66; // 'B'
const BGZF_EXTRA_SUBFIELD: u8 = 67; // 'C'
const BGZF_HEADER_SIZE: usize = 12;
const BGZF_TRAILER_SIZE: usize = 8;

/// Largest compressed or uncompressed size of a single block.
pub const BGZF_MAX_BLOCK_SIZE: usize = 64 * 1024;

/// A position in a BGZF stream: the compressed offset of a block start (high
/// 48 bits) and an offset into that block's decompressed data (low 16 bits).
///
/// Ordering of the packed value is the lexicographic ordering of the pair.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualOffset(u64);

impl VirtualOffset
{
    pub const MAX: VirtualOffset = VirtualOffset(u64::MAX);

    pub fn new(block_address: u64, within_block: u16) -> Self
    {
        VirtualOffset((block_address << 16) | within_block as u64)
    }

    pub fn from_raw(value: u64) -> Self
    {
        VirtualOffset(value)
    }

    pub fn as_raw(self) -> u64
    {
        self.0
    }

    /// Compressed file offset of the block (high 48 bits).
    pub fn block_address(self) -> u64
    {
        self.0 >> 16
    }

    /// Offset within the decompressed block (low 16 bits).
    pub fn within_block(self) -> u16
    {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Debug for VirtualOffset
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "VirtualOffset({}:{})", self.block_address(), self.within_block())
    }
}

impl fmt::Display for VirtualOffset
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}:{}", self.block_address(), self.within_block())
    }
}

/// A BGZF reader positioned by virtual offsets.
///
/// # Type Parameters
///
/// * `R` - The underlying compressed stream (must implement Read and Seek)
///
/// # Example
///
/// ```no_run
/// use bamhttp::bgzf::{BgzfReader, VirtualOffset};
/// use std::fs::File;
/// use std::io::Read;
///
/// let file = File::open("data.bam").unwrap();
/// let mut reader = BgzfReader::new(file);
/// reader.seek_virtual(VirtualOffset::new(0, 0)).unwrap();
/// let mut magic = [0u8; 4];
/// reader.read_exact(&mut magic).unwrap();
/// ```
pub struct BgzfReader<R: Read + Seek>
{
    /// The underlying compressed stream
    inner: R,
    /// Decompressed contents of the current block
    decompressed_buf: Vec<u8>,
    /// Current position in decompressed buffer
    buf_pos: usize,
    /// Compressed offset of the current block
    block_address: u64,
    /// Compressed offset of the block after the current one
    next_block_address: u64,
    /// Scratch buffer for compressed block bodies
    compressed_buf: Vec<u8>,
    /// End of stream flag
    eof: bool,
}

impl<R: Read + Seek> BgzfReader<R>
{
    /// Create a reader positioned at the start of `inner`.
    pub fn new(inner: R) -> Self
    {
        Self {
            inner,
            decompressed_buf: Vec::with_capacity(BGZF_MAX_BLOCK_SIZE),
            buf_pos: 0,
            block_address: 0,
            next_block_address: 0,
            compressed_buf: Vec::with_capacity(BGZF_MAX_BLOCK_SIZE),
            eof: false,
        }
    }

    /// The virtual offset of the next byte to be read.
    ///
    /// Once a block is fully consumed the offset refers to the start of the
    /// following block.
    pub fn virtual_offset(&self) -> VirtualOffset
    {
        if self.buf_pos < self.decompressed_buf.len()
        {
            VirtualOffset::new(self.block_address, self.buf_pos as u16)
        }
        else
        {
            VirtualOffset::new(self.next_block_address, 0)
        }
    }

    /// Position the reader at `offset`.
    ///
    /// Seeking within the block already in memory does not touch the
    /// underlying stream.
    pub fn seek_virtual(&mut self, offset: VirtualOffset) -> io::Result<()>
    {
        let address = offset.block_address();
        let within = offset.within_block() as usize;

        let loaded = !self.decompressed_buf.is_empty() && address == self.block_address;
        if !loaded
        {
            self.inner.seek(SeekFrom::Start(address))?;
            self.next_block_address = address;
            self.decompressed_buf.clear();
            self.buf_pos = 0;
            self.eof = false;

            if within > 0 && !self.read_next_block()?
            {
                return Err(corrupt(address, "virtual offset points past the end of the stream"));
            }
        }

        if within > self.decompressed_buf.len()
        {
            return Err(corrupt(
                address,
                &format!(
                    "within-block offset {} beyond block of {} bytes",
                    within,
                    self.decompressed_buf.len()
                ),
            ));
        }
        self.buf_pos = within;
        Ok(())
    }

    /// Mutable access to the underlying stream.
    pub fn get_mut(&mut self) -> &mut R
    {
        &mut self.inner
    }

    /// Read the next BGZF block.
    ///
    /// Returns true if a block was read, false on EOF.
    fn read_next_block(&mut self) -> io::Result<bool>
    {
        let address = self.next_block_address;

        // ID1, ID2, CM, FLG, MTIME(4), XFL, OS, XLEN(2)
        let mut header = [0u8; BGZF_HEADER_SIZE];
        let mut total_read = 0;
        while total_read < BGZF_HEADER_SIZE
        {
            let n = self.inner.read(&mut header[total_read..])?;
            if n == 0
            {
                break;
            }
            total_read += n;
        }

        if total_read == 0
        {
            self.eof = true;
            self.block_address = address;
            self.decompressed_buf.clear();
            self.buf_pos = 0;
            return Ok(false);
        }
        if total_read < BGZF_HEADER_SIZE
        {
            return Err(corrupt(address, "incomplete BGZF header"));
        }

        if header[0] != GZIP_ID1 || header[1] != GZIP_ID2
        {
            return Err(corrupt(address, "invalid gzip magic number"));
        }
        if header[2] != GZIP_CM_DEFLATE
        {
            return Err(corrupt(address, "not deflate compression"));
        }
        if header[3] & GZIP_FLG_FEXTRA == 0
        {
            return Err(corrupt(address, "BGZF requires extra field (FEXTRA flag not set)"));
        }

        let xlen = u16::from_le_bytes([header[10], header[11]]) as usize;
        let mut extra = vec![0u8; xlen];
        self.inner
            .read_exact(&mut extra)
            .map_err(|_| corrupt(address, "truncated BGZF extra field"))?;

        let bsize = bgzf_block_size(&extra)
            .ok_or_else(|| corrupt(address, "BC subfield not found in BGZF extra field"))?;

        // BSIZE is the total block size minus one
        let block_size = bsize as usize + 1;
        let overhead = BGZF_HEADER_SIZE + xlen + BGZF_TRAILER_SIZE;
        if block_size < overhead
        {
            return Err(corrupt(
                address,
                &format!("invalid BGZF block size: {}, xlen: {}", block_size, xlen),
            ));
        }
        let compressed_size = block_size - overhead;

        self.compressed_buf.resize(compressed_size, 0);
        self.inner.read_exact(&mut self.compressed_buf).map_err(|_| {
            corrupt(
                address,
                &format!("block declares {} bytes but the stream ended early", block_size),
            )
        })?;

        // CRC32 + ISIZE
        let mut trailer = [0u8; BGZF_TRAILER_SIZE];
        self.inner
            .read_exact(&mut trailer)
            .map_err(|_| corrupt(address, "truncated BGZF trailer"))?;
        let expected_crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let expected_size = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]) as usize;
        if expected_size > BGZF_MAX_BLOCK_SIZE
        {
            return Err(corrupt(address, &format!("ISIZE {} exceeds block limit", expected_size)));
        }

        // Capacity is reserved, length stays 0 so decompress_vec appends
        self.decompressed_buf.clear();
        self.decompressed_buf.reserve(BGZF_MAX_BLOCK_SIZE);

        let mut decompress = Decompress::new(false);
        let status = decompress
            .decompress_vec(&self.compressed_buf, &mut self.decompressed_buf, FlushDecompress::Finish)
            .map_err(|e| corrupt(address, &format!("inflate failed: {}", e)))?;
        if status != Status::StreamEnd
        {
            return Err(corrupt(address, "deflate stream did not terminate within the block"));
        }

        if self.decompressed_buf.len() != expected_size
        {
            return Err(corrupt(
                address,
                &format!(
                    "ISIZE mismatch: trailer says {}, inflated {}",
                    expected_size,
                    self.decompressed_buf.len()
                ),
            ));
        }
        let mut crc = Crc::new();
        crc.update(&self.decompressed_buf);
        if crc.sum() != expected_crc
        {
            return Err(corrupt(address, "CRC32 mismatch"));
        }

        self.block_address = address;
        self.next_block_address = address + block_size as u64;
        self.buf_pos = 0;
        Ok(true)
    }

    /// Ensure there's data available in the buffer, skipping empty blocks.
    fn fill_buf(&mut self) -> io::Result<&[u8]>
    {
        while self.buf_pos >= self.decompressed_buf.len()
        {
            if self.eof || !self.read_next_block()?
            {
                return Ok(&[]);
            }
        }
        Ok(&self.decompressed_buf[self.buf_pos..])
    }
}

/// Locate the BC subfield in a gzip extra field and return BSIZE.
fn bgzf_block_size(extra: &[u8]) -> Option<u16>
{
    let mut pos = 0;
    while pos + 4 <= extra.len()
    {
        let si1 = extra[pos];
        let si2 = extra[pos + 1];
        let sublen = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        let data = pos + 4;

        if data + sublen > extra.len()
        {
            return None;
        }
        if si1 == BGZF_EXTRA_ID && si2 == BGZF_EXTRA_SUBFIELD && sublen == 2
        {
            return Some(u16::from_le_bytes([extra[data], extra[data + 1]]));
        }
        pos = data + sublen;
    }
    None
}

fn corrupt(offset: u64, message: &str) -> io::Error
{
    Error::CorruptBlock {
        offset,
        message: message.to_string(),
    }
    .into_io()
}

impl<R: Read + Seek> Read for BgzfReader<R>
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        let mut total_read = 0;
        while total_read < buf.len()
        {
            let available = self.fill_buf()?;
            if available.is_empty()
            {
                break;
            }
            let to_read = std::cmp::min(available.len(), buf.len() - total_read);
            buf[total_read..total_read + to_read].copy_from_slice(&available[..to_read]);
            self.buf_pos += to_read;
            total_read += to_read;
        }
        Ok(total_read)
    }
}

impl<R: Read + Seek> BufRead for BgzfReader<R>
{
    fn fill_buf(&mut self) -> io::Result<&[u8]>
    {
        BgzfReader::fill_buf(self)
    }

    fn consume(&mut self, amt: usize)
    {
        self.buf_pos = std::cmp::min(self.buf_pos + amt, self.decompressed_buf.len());
    }
}
