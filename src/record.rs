//! BAM alignment records.
//!
//! Layout of one record (little-endian), preceded by its `block_size`:
//!
//! ```text
//! refID i32 | pos i32 | l_read_name u8 | mapq u8 | bin u16 | n_cigar_op u16
//! flag u16 | l_seq u32 | next_refID i32 | next_pos i32 | tlen i32
//! read_name[l_read_name] | cigar u32[n_cigar_op] | seq u8[(l_seq+1)/2]
//! qual u8[l_seq] | auxiliary data (rest of block)
//! ```

use crate::cursor::ByteCursor;
use crate::error::{Error, Result};
use std::sync::Arc;

/// Size of the fixed part of a record, after `block_size`.
pub const FIXED_FIELDS_SIZE: usize = 32;

const SEQ_ALPHABET: &[u8; 16] = b"=ACMGRSVTWYHKDBN";

pub const FLAG_PAIRED: u16 = 0x1;
pub const FLAG_UNMAPPED: u16 = 0x4;
pub const FLAG_MATE_UNMAPPED: u16 = 0x8;
pub const FLAG_REVERSE: u16 = 0x10;
pub const FLAG_SECONDARY: u16 = 0x100;
pub const FLAG_DUPLICATE: u16 = 0x400;
pub const FLAG_SUPPLEMENTARY: u16 = 0x800;

/// CIGAR operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CigarOp
{
    Match(u32),       // M: alignment match (can be match or mismatch)
    Insertion(u32),   // I: insertion to reference
    Deletion(u32),    // D: deletion from reference
    Skip(u32),        // N: skipped region (intron)
    SoftClip(u32),    // S: soft clipping
    HardClip(u32),    // H: hard clipping
    Padding(u32),     // P: padding
    SeqMatch(u32),    // =: sequence match
    SeqMismatch(u32), // X: sequence mismatch
}

impl CigarOp
{
    /// Decode a packed `len << 4 | op` value.
    pub fn from_raw(raw: u32) -> Result<Self>
    {
        let len = raw >> 4;
        Ok(match raw & 0xf
        {
            0 => CigarOp::Match(len),
            1 => CigarOp::Insertion(len),
            2 => CigarOp::Deletion(len),
            3 => CigarOp::Skip(len),
            4 => CigarOp::SoftClip(len),
            5 => CigarOp::HardClip(len),
            6 => CigarOp::Padding(len),
            7 => CigarOp::SeqMatch(len),
            8 => CigarOp::SeqMismatch(len),
            op => return Err(Error::MalformedRecord(format!("invalid CIGAR operation code {}", op))),
        })
    }

    pub fn len(self) -> u32
    {
        match self
        {
            CigarOp::Match(len)
            | CigarOp::Insertion(len)
            | CigarOp::Deletion(len)
            | CigarOp::Skip(len)
            | CigarOp::SoftClip(len)
            | CigarOp::HardClip(len)
            | CigarOp::Padding(len)
            | CigarOp::SeqMatch(len)
            | CigarOp::SeqMismatch(len) => len,
        }
    }

    pub fn is_empty(self) -> bool
    {
        self.len() == 0
    }

    pub fn consumes_reference(self) -> bool
    {
        matches!(
            self,
            CigarOp::Match(_)
                | CigarOp::Deletion(_)
                | CigarOp::Skip(_)
                | CigarOp::SeqMatch(_)
                | CigarOp::SeqMismatch(_)
        )
    }

    pub fn symbol(self) -> char
    {
        match self
        {
            CigarOp::Match(_) => 'M',
            CigarOp::Insertion(_) => 'I',
            CigarOp::Deletion(_) => 'D',
            CigarOp::Skip(_) => 'N',
            CigarOp::SoftClip(_) => 'S',
            CigarOp::HardClip(_) => 'H',
            CigarOp::Padding(_) => 'P',
            CigarOp::SeqMatch(_) => '=',
            CigarOp::SeqMismatch(_) => 'X',
        }
    }
}

/// Number of reference bases covered by `cigar`.
pub fn reference_span(cigar: &[CigarOp]) -> u64
{
    cigar
        .iter()
        .filter(|op| op.consumes_reference())
        .map(|op| op.len() as u64)
        .sum()
}

/// One parsed alignment.
///
/// Records own all their data; nothing refers back to the file they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentRecord
{
    /// Reference sequence index, -1 for unplaced reads
    pub reference_id: i32,
    /// Reference sequence name, resolved through the header
    pub reference_name: Option<Arc<str>>,
    /// 0-based leftmost position, -1 for unplaced reads
    pub position: i32,
    /// Exclusive end: `position` plus the reference span of the CIGAR
    /// (at least one base)
    pub end: i64,
    pub read_name: String,
    pub mapping_quality: u8,
    pub bin: u16,
    pub flags: u16,
    pub cigar: Vec<CigarOp>,
    /// Decoded bases
    pub sequence: Vec<u8>,
    /// Phred qualities; all 0xff when absent
    pub quality: Vec<u8>,
    pub mate_reference_id: i32,
    pub mate_position: i32,
    pub template_length: i32,
    /// Raw auxiliary fields
    pub tags: Vec<u8>,
}

impl AlignmentRecord
{
    pub fn start(&self) -> i64
    {
        self.position as i64
    }

    pub fn is_unmapped(&self) -> bool
    {
        self.flags & FLAG_UNMAPPED != 0
    }

    pub fn is_reverse(&self) -> bool
    {
        self.flags & FLAG_REVERSE != 0
    }

    pub fn is_paired(&self) -> bool
    {
        self.flags & FLAG_PAIRED != 0
    }

    /// Whether the record has a reference and position at all.
    pub fn is_placed(&self) -> bool
    {
        self.reference_id >= 0 && self.position >= 0
    }

    /// Whether the record intersects the half-open interval `[start, end)`.
    pub fn overlaps(&self, start: i64, end: i64) -> bool
    {
        self.is_placed() && self.start() < end && self.end > start
    }

    /// Whether the record lies completely inside `[start, end)`.
    pub fn contained_in(&self, start: i64, end: i64) -> bool
    {
        self.is_placed() && self.start() >= start && self.end <= end
    }

    pub fn cigar_string(&self) -> String
    {
        if self.cigar.is_empty()
        {
            return "*".to_string();
        }
        self.cigar
            .iter()
            .map(|op| format!("{}{}", op.len(), op.symbol()))
            .collect()
    }
}

/// Parse one length-prefixed record at the cursor.
///
/// Returns the record and the number of bytes consumed, `block_size` prefix
/// included. `reference_names` resolves the record's reference index.
pub fn parse_record(
    cursor: &mut ByteCursor<'_>,
    reference_names: &[Arc<str>],
) -> Result<(AlignmentRecord, usize)>
{
    let available = cursor.remaining();
    let block_size = cursor.read_i32()?;
    if block_size < FIXED_FIELDS_SIZE as i32
    {
        return Err(Error::MalformedRecord(format!("block_size {} below minimum", block_size)));
    }
    let block_size = block_size as usize;
    if block_size > cursor.remaining()
    {
        return Err(Error::TruncatedRecord {
            expected: block_size + 4,
            available,
        });
    }

    let mut body = cursor.sub_cursor(block_size)?;
    let record = parse_body(&mut body, reference_names)?;
    Ok((record, block_size + 4))
}

fn parse_body(body: &mut ByteCursor<'_>, reference_names: &[Arc<str>]) -> Result<AlignmentRecord>
{
    let reference_id = body.read_i32()?;
    let position = body.read_i32()?;
    let l_read_name = body.read_u8()? as usize;
    let mapping_quality = body.read_u8()?;
    let bin = body.read_u16()?;
    let n_cigar_op = body.read_u16()? as usize;
    let flags = body.read_u16()?;
    let l_seq = body.read_u32()? as usize;
    let mate_reference_id = body.read_i32()?;
    let mate_position = body.read_i32()?;
    let template_length = body.read_i32()?;

    let raw_name = body.read_bytes(l_read_name)?;
    let name_bytes = raw_name.strip_suffix(&[0]).unwrap_or(raw_name);
    let read_name = String::from_utf8_lossy(name_bytes).into_owned();

    let mut cigar = Vec::with_capacity(n_cigar_op);
    for _ in 0..n_cigar_op
    {
        cigar.push(CigarOp::from_raw(body.read_u32()?)?);
    }

    let packed = body.read_bytes(l_seq.div_ceil(2))?;
    let sequence = decode_sequence(packed, l_seq);
    let quality = body.read_bytes(l_seq)?.to_vec();
    let tags = body.read_rest().to_vec();

    let reference_name = if reference_id >= 0
    {
        let name = reference_names.get(reference_id as usize).ok_or_else(|| {
            Error::MalformedRecord(format!(
                "reference id {} outside the {} header references",
                reference_id,
                reference_names.len()
            ))
        })?;
        Some(name.clone())
    }
    else
    {
        None
    };

    // Zero-span records (unmapped mates, all-insertion CIGARs) occupy one base
    let end = position as i64 + reference_span(&cigar).max(1) as i64;

    Ok(AlignmentRecord {
        reference_id,
        reference_name,
        position,
        end,
        read_name,
        mapping_quality,
        bin,
        flags,
        cigar,
        sequence,
        quality,
        mate_reference_id,
        mate_position,
        template_length,
        tags,
    })
}

/// Expand 4-bit packed bases.
fn decode_sequence(packed: &[u8], l_seq: usize) -> Vec<u8>
{
    let mut bases = Vec::with_capacity(l_seq);
    for &byte in packed
    {
        bases.push(SEQ_ALPHABET[(byte >> 4) as usize]);
        bases.push(SEQ_ALPHABET[(byte & 0xf) as usize]);
    }
    bases.truncate(l_seq);
    bases
}

#[cfg(test)]
pub(crate) mod tests
{
    use super::*;

    /// Encode a record body with its `block_size` prefix.
    pub(crate) fn encode_record(
        reference_id: i32,
        position: i32,
        name: &str,
        flags: u16,
        cigar: &[u32],
        seq_len: usize,
    ) -> Vec<u8>
    {
        let mut body = Vec::new();
        body.extend_from_slice(&reference_id.to_le_bytes());
        body.extend_from_slice(&position.to_le_bytes());
        body.push(name.len() as u8 + 1);
        body.push(60);
        body.extend_from_slice(&4680u16.to_le_bytes());
        body.extend_from_slice(&(cigar.len() as u16).to_le_bytes());
        body.extend_from_slice(&flags.to_le_bytes());
        body.extend_from_slice(&(seq_len as u32).to_le_bytes());
        body.extend_from_slice(&(-1i32).to_le_bytes());
        body.extend_from_slice(&(-1i32).to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        for op in cigar
        {
            body.extend_from_slice(&op.to_le_bytes());
        }
        // A, C, G, T, A, C, ...
        let codes = [1u8, 2, 4, 8];
        let mut packed = vec![0u8; seq_len.div_ceil(2)];
        for i in 0..seq_len
        {
            let code = codes[i % 4];
            packed[i / 2] |= if i % 2 == 0 { code << 4 } else { code };
        }
        body.extend_from_slice(&packed);
        body.extend(std::iter::repeat(30u8).take(seq_len));
        body.extend_from_slice(b"NMC\x00");

        let mut record = (body.len() as i32).to_le_bytes().to_vec();
        record.extend(body);
        record
    }

    fn names() -> Vec<Arc<str>>
    {
        vec![Arc::from("chr1"), Arc::from("chr2")]
    }

    #[test]
    fn test_parse_record_fields()
    {
        // 10M2D5M
        let cigar = [10 << 4, (2 << 4) | 2, 5 << 4];
        let bytes = encode_record(1, 1000, "read1", FLAG_REVERSE, &cigar, 15);
        let mut cursor = ByteCursor::new(&bytes);
        let (record, consumed) = parse_record(&mut cursor, &names()).unwrap();

        assert_eq!(consumed, bytes.len());
        assert!(cursor.is_empty());
        assert_eq!(record.reference_id, 1);
        assert_eq!(record.reference_name.as_deref(), Some("chr2"));
        assert_eq!(record.position, 1000);
        assert_eq!(record.end, 1017);
        assert_eq!(record.read_name, "read1");
        assert_eq!(record.cigar_string(), "10M2D5M");
        assert_eq!(record.sequence, b"ACGTACGTACGTACG".to_vec());
        assert_eq!(record.quality, vec![30u8; 15]);
        assert_eq!(record.tags, b"NMC\x00".to_vec());
        assert!(record.is_reverse());
        assert!(!record.is_unmapped());
    }

    #[test]
    fn test_end_ignores_insertions_and_clips()
    {
        // 3S4M100I4M2H
        let cigar = [(3 << 4) | 4, 4 << 4, (100 << 4) | 1, 4 << 4, (2 << 4) | 5];
        let bytes = encode_record(0, 50, "r", 0, &cigar, 111);
        let (record, _) = parse_record(&mut ByteCursor::new(&bytes), &names()).unwrap();
        assert_eq!(record.end, 58);
    }

    #[test]
    fn test_spliced_read_spans_intron()
    {
        // 50M10000N50M
        let cigar = [50 << 4, (10000 << 4) | 3, 50 << 4];
        let bytes = encode_record(0, 0, "spliced", 0, &cigar, 100);
        let (record, _) = parse_record(&mut ByteCursor::new(&bytes), &names()).unwrap();
        assert_eq!(record.end, 10100);
        assert!(record.overlaps(5000, 5001));
    }

    #[test]
    fn test_unmapped_record_has_unit_span()
    {
        let bytes = encode_record(0, 77, "mate", FLAG_UNMAPPED, &[], 10);
        let (record, _) = parse_record(&mut ByteCursor::new(&bytes), &names()).unwrap();
        assert_eq!(record.end, 78);
        assert_eq!(record.cigar_string(), "*");
        assert!(record.overlaps(77, 78));
        assert!(!record.overlaps(78, 100));
    }

    #[test]
    fn test_unplaced_record()
    {
        let bytes = encode_record(-1, -1, "lost", FLAG_UNMAPPED, &[], 4);
        let (record, _) = parse_record(&mut ByteCursor::new(&bytes), &names()).unwrap();
        assert!(record.reference_name.is_none());
        assert!(!record.is_placed());
        assert!(!record.overlaps(-10, 10));
    }

    #[test]
    fn test_overlap_and_containment()
    {
        let bytes = encode_record(0, 100, "r", 0, &[50 << 4], 50);
        let (record, _) = parse_record(&mut ByteCursor::new(&bytes), &names()).unwrap();
        assert!(record.overlaps(149, 200));
        assert!(!record.overlaps(150, 200));
        assert!(!record.overlaps(0, 100));
        assert!(record.contained_in(100, 150));
        assert!(!record.contained_in(101, 150));
    }

    #[test]
    fn test_truncated_record()
    {
        let bytes = encode_record(0, 1, "r", 0, &[4 << 4], 4);
        let short = &bytes[..bytes.len() - 3];
        let err = parse_record(&mut ByteCursor::new(short), &names()).unwrap_err();
        match err
        {
            Error::TruncatedRecord { expected, available } =>
            {
                assert_eq!(expected, bytes.len());
                assert_eq!(available, short.len());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_field_overrunning_block_is_truncated()
    {
        let mut bytes = encode_record(0, 1, "r", 0, &[4 << 4], 4);
        // claim a longer sequence than the block holds
        bytes[4 + 16..4 + 20].copy_from_slice(&1000u32.to_le_bytes());
        let err = parse_record(&mut ByteCursor::new(&bytes), &names()).unwrap_err();
        assert!(matches!(err, Error::TruncatedRecord { .. }));
    }

    #[test]
    fn test_invalid_cigar_op()
    {
        let bytes = encode_record(0, 1, "r", 0, &[(4 << 4) | 9], 4);
        let err = parse_record(&mut ByteCursor::new(&bytes), &names()).unwrap_err();
        assert!(matches!(err, Error::MalformedRecord(_)));
    }

    #[test]
    fn test_consecutive_records()
    {
        let mut bytes = encode_record(0, 1, "a", 0, &[4 << 4], 4);
        bytes.extend(encode_record(0, 2, "b", 0, &[4 << 4], 4));
        let mut cursor = ByteCursor::new(&bytes);
        let (first, n1) = parse_record(&mut cursor, &names()).unwrap();
        let (second, n2) = parse_record(&mut cursor, &names()).unwrap();
        assert_eq!(first.read_name, "a");
        assert_eq!(second.read_name, "b");
        assert_eq!(n1 + n2, bytes.len());
    }
}
