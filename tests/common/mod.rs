//! Builds BAM files and their BAI indexes in memory for the tests and
//! benchmarks.

#![allow(dead_code)]

use bamhttp::MemoryFetcher;
use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::io::Write;

/// Uncompressed bytes per BGZF block. Small, so records straddle blocks.
const BLOCK_TARGET: usize = 4096;

const FLAG_UNMAPPED: u16 = 0x4;

// CIGAR operation codes
const OP_M: u32 = 0;
const OP_I: u32 = 1;
const OP_D: u32 = 2;
const OP_N: u32 = 3;
const OP_S: u32 = 4;

/// A record to be written, with the coordinates the reader should report.
#[derive(Debug, Clone)]
pub struct SimRecord
{
    pub reference_id: i32,
    pub position: i32,
    pub name: String,
    pub flags: u16,
    /// Packed `len << 4 | op`
    pub cigar: Vec<u32>,
    /// Exclusive end, at least one past `position`
    pub end: i64,
}

impl SimRecord
{
    pub fn new(reference_id: i32, position: i32, name: &str, flags: u16, cigar: Vec<u32>) -> Self
    {
        let span: i64 = cigar
            .iter()
            .filter(|op| matches!(*op & 0xf, 0 | 2 | 3 | 7 | 8))
            .map(|op| (*op >> 4) as i64)
            .sum();
        Self {
            reference_id,
            position,
            name: name.to_string(),
            flags,
            cigar,
            end: position as i64 + span.max(1),
        }
    }

    pub fn overlaps(&self, reference_id: i32, start: i64, end: i64) -> bool
    {
        self.reference_id == reference_id && self.position >= 0 && (self.position as i64) < end && self.end > start
    }

    pub fn contained_in(&self, reference_id: i32, start: i64, end: i64) -> bool
    {
        self.reference_id == reference_id && self.position >= 0 && self.position as i64 >= start && self.end <= end
    }

    fn query_length(&self) -> usize
    {
        self.cigar
            .iter()
            .filter(|op| matches!(*op & 0xf, 0 | 1 | 4 | 7 | 8))
            .map(|op| (*op >> 4) as usize)
            .sum()
    }

    fn encode(&self) -> Vec<u8>
    {
        let seq_len = if self.cigar.is_empty() { 36 } else { self.query_length() };
        let bin = if self.position < 0 { 4680 } else { reg2bin(self.position as i64, self.end) };

        let mut body = Vec::new();
        body.extend_from_slice(&self.reference_id.to_le_bytes());
        body.extend_from_slice(&self.position.to_le_bytes());
        body.push(self.name.len() as u8 + 1);
        body.push(if self.flags & FLAG_UNMAPPED != 0 { 0 } else { 60 });
        body.extend_from_slice(&bin.to_le_bytes());
        body.extend_from_slice(&(self.cigar.len() as u16).to_le_bytes());
        body.extend_from_slice(&self.flags.to_le_bytes());
        body.extend_from_slice(&(seq_len as u32).to_le_bytes());
        body.extend_from_slice(&self.reference_id.to_le_bytes());
        body.extend_from_slice(&self.position.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(self.name.as_bytes());
        body.push(0);
        for op in &self.cigar
        {
            body.extend_from_slice(&op.to_le_bytes());
        }
        // "AC" repeated, a trailing G for odd lengths
        body.extend(std::iter::repeat(0x12u8).take(seq_len / 2));
        if seq_len % 2 == 1
        {
            body.push(0x40);
        }
        body.extend(std::iter::repeat(35u8).take(seq_len));
        body.extend_from_slice(b"RGZgroup1\x00");

        let mut out = (body.len() as i32).to_le_bytes().to_vec();
        out.extend(body);
        out
    }
}

/// Smallest bin containing `[beg, end)`.
pub fn reg2bin(beg: i64, end: i64) -> u16
{
    let end = end - 1;
    let bin = if beg >> 14 == end >> 14
    {
        4681 + (beg >> 14)
    }
    else if beg >> 17 == end >> 17
    {
        585 + (beg >> 17)
    }
    else if beg >> 20 == end >> 20
    {
        73 + (beg >> 20)
    }
    else if beg >> 23 == end >> 23
    {
        9 + (beg >> 23)
    }
    else if beg >> 26 == end >> 26
    {
        1 + (beg >> 26)
    }
    else
    {
        0
    };
    bin as u16
}

/// Compress `data` into one BGZF block.
pub fn bgzf_block(data: &[u8]) -> Vec<u8>
{
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    let cdata = encoder.finish().unwrap();

    let mut crc = Crc::new();
    crc.update(data);

    let bsize = (12 + 6 + cdata.len() + 8 - 1) as u16;
    let mut block = vec![0x1f, 0x8b, 8, 4, 0, 0, 0, 0, 0, 0xff, 6, 0];
    block.extend_from_slice(&[b'B', b'C', 2, 0]);
    block.extend_from_slice(&bsize.to_le_bytes());
    block.extend_from_slice(&cdata);
    block.extend_from_slice(&crc.sum().to_le_bytes());
    block.extend_from_slice(&(data.len() as u32).to_le_bytes());
    block
}

/// BGZF writer that reports virtual offsets as it goes.
struct BgzfWriter
{
    out: Vec<u8>,
    pending: Vec<u8>,
}

impl BgzfWriter
{
    fn new() -> Self
    {
        Self {
            out: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn virtual_offset(&self) -> u64
    {
        ((self.out.len() as u64) << 16) | self.pending.len() as u64
    }

    fn write(&mut self, data: &[u8])
    {
        self.pending.extend_from_slice(data);
        while self.pending.len() >= BLOCK_TARGET
        {
            let rest = self.pending.split_off(BLOCK_TARGET);
            self.out.extend(bgzf_block(&self.pending));
            self.pending = rest;
        }
    }

    fn flush(&mut self)
    {
        if !self.pending.is_empty()
        {
            self.out.extend(bgzf_block(&self.pending));
            self.pending.clear();
        }
    }

    fn finish(mut self) -> Vec<u8>
    {
        self.flush();
        self.out.extend(bgzf_block(b""));
        self.out
    }
}

#[derive(Default)]
struct ReferenceBins
{
    bins: HashMap<u32, Vec<(u64, u64)>>,
    intervals: Vec<Option<u64>>,
    first: Option<u64>,
    last: u64,
    mapped: u64,
    unmapped: u64,
}

/// A BAM file with its index and the records it holds.
pub struct Fixture
{
    pub references: Vec<(String, u32)>,
    pub records: Vec<SimRecord>,
    pub bam: Vec<u8>,
    pub bai: Vec<u8>,
}

impl Fixture
{
    /// Write `records`, which must be coordinate sorted with unplaced
    /// records last.
    pub fn build(version: &str, references: &[(&str, u32)], records: Vec<SimRecord>) -> Self
    {
        let mut text = format!("@HD\tVN:{}\tSO:coordinate\n", version);
        for (name, length) in references
        {
            text.push_str(&format!("@SQ\tSN:{}\tLN:{}\n", name, length));
        }

        let mut header = b"BAM\x01".to_vec();
        header.extend_from_slice(&(text.len() as i32).to_le_bytes());
        header.extend_from_slice(text.as_bytes());
        header.extend_from_slice(&(references.len() as i32).to_le_bytes());
        for (name, length) in references
        {
            header.extend_from_slice(&(name.len() as i32 + 1).to_le_bytes());
            header.extend_from_slice(name.as_bytes());
            header.push(0);
            header.extend_from_slice(&(*length as i32).to_le_bytes());
        }

        let mut writer = BgzfWriter::new();
        writer.write(&header);
        writer.flush();

        let mut index: Vec<ReferenceBins> = references.iter().map(|_| ReferenceBins::default()).collect();
        let mut unplaced = 0u64;

        for record in &records
        {
            let start = writer.virtual_offset();
            writer.write(&record.encode());
            let end = writer.virtual_offset();

            if record.reference_id < 0 || record.position < 0
            {
                unplaced += 1;
                continue;
            }

            let reference = &mut index[record.reference_id as usize];
            let bin = reg2bin(record.position as i64, record.end) as u32;
            let chunks = reference.bins.entry(bin).or_default();
            match chunks.last_mut()
            {
                Some(last) if last.1 == start => last.1 = end,
                _ => chunks.push((start, end)),
            }

            let first_window = (record.position >> 14) as usize;
            let last_window = ((record.end - 1) >> 14) as usize;
            if reference.intervals.len() <= last_window
            {
                reference.intervals.resize(last_window + 1, None);
            }
            for window in first_window..=last_window
            {
                reference.intervals[window].get_or_insert(start);
            }

            reference.first.get_or_insert(start);
            reference.last = end;
            if record.flags & FLAG_UNMAPPED != 0
            {
                reference.unmapped += 1;
            }
            else
            {
                reference.mapped += 1;
            }
        }

        let bam = writer.finish();
        let bai = encode_index(&index, unplaced);

        Self {
            references: references.iter().map(|(n, l)| (n.to_string(), *l)).collect(),
            records,
            bam,
            bai,
        }
    }

    /// Coordinate-sorted random records over three references, including
    /// spliced reads, indels, placed unmapped mates and unplaced reads.
    pub fn random(seed: u64, per_reference: usize) -> Self
    {
        let references = [("1", 2_000_000u32), ("2", 1_000_000), ("Y", 600_000)];
        let mut rng = StdRng::seed_from_u64(seed);
        let mut records = Vec::new();
        let mut serial = 0;

        for (reference_id, (_, length)) in references.iter().enumerate()
        {
            let mut positions: Vec<i32> = (0..per_reference)
                .map(|_| rng.gen_range(0..(*length as i32 - 20_000)))
                .collect();
            positions.sort_unstable();

            for position in positions
            {
                serial += 1;
                let name = format!("r{:06}", serial);
                let kind = rng.gen_range(0..20);
                let (flags, cigar) = match kind
                {
                    0 => (0, vec![(40 << 4) | OP_M, (rng.gen_range(1000u32..15000) << 4) | OP_N, (60 << 4) | OP_M]),
                    1 => (0, vec![(30 << 4) | OP_M, (5 << 4) | OP_I, (65 << 4) | OP_M]),
                    2 => (0, vec![(10 << 4) | OP_S, (50 << 4) | OP_M, (4 << 4) | OP_D, (40 << 4) | OP_M]),
                    3 => (FLAG_UNMAPPED, vec![]),
                    _ => (0, vec![(100 << 4) | OP_M]),
                };
                records.push(SimRecord::new(reference_id as i32, position, &name, flags, cigar));
            }
        }
        for _ in 0..per_reference / 20 + 1
        {
            serial += 1;
            records.push(SimRecord::new(-1, -1, &format!("u{:06}", serial), FLAG_UNMAPPED, vec![]));
        }

        Self::build("1.0", &references, records)
    }

    pub fn reference_id(&self, name: &str) -> i32
    {
        self.references.iter().position(|(n, _)| n == name).map(|i| i as i32).unwrap_or(-1)
    }

    /// Names of the records overlapping (or contained in) the interval, in
    /// file order.
    pub fn expected(&self, reference: &str, start: i64, end: i64, contained: bool) -> Vec<String>
    {
        let id = self.reference_id(reference);
        self.records
            .iter()
            .filter(|r| if contained { r.contained_in(id, start, end) } else { r.overlaps(id, start, end) })
            .map(|r| r.name.clone())
            .collect()
    }

    /// Serve the BAM at `url` and its index at `url.bai`.
    pub fn install(&self, fetcher: &MemoryFetcher, url: &str)
    {
        fetcher.insert(url, self.bam.clone());
        fetcher.insert(format!("{}.bai", url), self.bai.clone());
    }
}

fn encode_index(references: &[ReferenceBins], unplaced: u64) -> Vec<u8>
{
    let mut out = b"BAI\x01".to_vec();
    out.extend_from_slice(&(references.len() as i32).to_le_bytes());

    for reference in references
    {
        let with_metadata = reference.first.is_some();
        let n_bin = reference.bins.len() + with_metadata as usize;
        out.extend_from_slice(&(n_bin as i32).to_le_bytes());

        let mut bins: Vec<_> = reference.bins.iter().collect();
        bins.sort_by_key(|(bin, _)| **bin);
        for (bin, chunks) in bins
        {
            out.extend_from_slice(&bin.to_le_bytes());
            out.extend_from_slice(&(chunks.len() as i32).to_le_bytes());
            for (start, end) in chunks
            {
                out.extend_from_slice(&start.to_le_bytes());
                out.extend_from_slice(&end.to_le_bytes());
            }
        }
        if let Some(first) = reference.first
        {
            out.extend_from_slice(&37450u32.to_le_bytes());
            out.extend_from_slice(&2i32.to_le_bytes());
            for value in [first, reference.last, reference.mapped, reference.unmapped]
            {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }

        // empty windows take the offset of the window before them
        out.extend_from_slice(&(reference.intervals.len() as i32).to_le_bytes());
        let mut previous = 0u64;
        for interval in &reference.intervals
        {
            let offset = interval.unwrap_or(previous);
            out.extend_from_slice(&offset.to_le_bytes());
            previous = offset;
        }
    }

    out.extend_from_slice(&unplaced.to_le_bytes());
    out
}
