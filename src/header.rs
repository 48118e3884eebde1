//! BAM file header: SAM text plus the binary reference dictionary.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;

const BAM_MAGIC: &[u8; 4] = b"BAM\x01";

/// Upper bound for header text and reference name lengths.
const MAX_HEADER_FIELD: usize = 256 * 1024 * 1024;

/// A reference sequence from the header dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSequence
{
    pub name: Arc<str>,
    pub length: u32,
}

/// Header of a BAM file, parsed once per reader.
///
/// # Example
///
/// ```no_run
/// use bamhttp::bgzf::BgzfReader;
/// use bamhttp::header::FileHeader;
/// use std::fs::File;
///
/// let mut reader = BgzfReader::new(File::open("data.bam").unwrap());
/// let header = FileHeader::read(&mut reader).unwrap();
/// println!("{} references, version {:?}", header.reference_count(), header.version());
/// ```
#[derive(Debug, Clone)]
pub struct FileHeader
{
    text: String,
    version: Option<String>,
    sort_order: Option<String>,
    references: Vec<ReferenceSequence>,
    names: Vec<Arc<str>>,
    ids: HashMap<Arc<str>, usize>,
}

impl FileHeader
{
    /// Read the header from the start of a decompressed BAM stream.
    ///
    /// ```text
    /// magic[4]    "BAM\1"
    /// l_text[4]   Length of the header text (int32)
    /// text        SAM header text, possibly NUL padded
    /// n_ref[4]    Number of reference sequences (int32)
    /// For each reference:
    ///   l_name[4] Length of the name including NUL (int32)
    ///   name      NUL terminated name
    ///   l_ref[4]  Length of the sequence (int32)
    /// ```
    pub fn read<R: Read>(reader: &mut R) -> Result<Self>
    {
        let mut magic = [0u8; 4];
        read_exact(reader, &mut magic, "magic")?;
        if &magic != BAM_MAGIC
        {
            return Err(Error::InvalidHeader(format!(
                "invalid BAM magic bytes: expected 'BAM\\x01', got {:?}",
                magic
            )));
        }

        let l_text = read_length(reader, "header text")?;
        let mut raw_text = vec![0u8; l_text];
        read_exact(reader, &mut raw_text, "header text")?;
        let text_end = memchr::memchr(0, &raw_text).unwrap_or(raw_text.len());
        let text = String::from_utf8_lossy(&raw_text[..text_end]).into_owned();

        let n_ref = read_length(reader, "reference count")?;
        let mut references = Vec::with_capacity(n_ref.min(1 << 16));
        for _ in 0..n_ref
        {
            let l_name = read_length(reader, "reference name")?;
            let mut raw_name = vec![0u8; l_name];
            read_exact(reader, &mut raw_name, "reference name")?;
            let name_end = memchr::memchr(0, &raw_name).unwrap_or(raw_name.len());
            let name = String::from_utf8_lossy(&raw_name[..name_end]);

            let length = read_i32(reader, "reference length")?;
            if length < 0
            {
                return Err(Error::InvalidHeader(format!(
                    "negative length {} for reference {}",
                    length, name
                )));
            }

            references.push(ReferenceSequence {
                name: Arc::from(name.as_ref()),
                length: length as u32,
            });
        }

        Ok(Self::from_parts(text, references))
    }

    /// Build a header from its text and reference dictionary.
    pub fn from_parts(text: String, references: Vec<ReferenceSequence>) -> Self
    {
        let (version, sort_order) = parse_hd_line(&text);
        let names: Vec<Arc<str>> = references.iter().map(|r| r.name.clone()).collect();
        let ids = names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id))
            .collect();

        Self {
            text,
            version,
            sort_order,
            references,
            names,
            ids,
        }
    }

    /// The `VN` tag of the `@HD` line.
    pub fn version(&self) -> Option<&str>
    {
        self.version.as_deref()
    }

    /// The `SO` tag of the `@HD` line.
    pub fn sort_order(&self) -> Option<&str>
    {
        self.sort_order.as_deref()
    }

    pub fn text(&self) -> &str
    {
        &self.text
    }

    pub fn reference_count(&self) -> usize
    {
        self.references.len()
    }

    pub fn references(&self) -> &[ReferenceSequence]
    {
        &self.references
    }

    pub fn reference(&self, id: usize) -> Option<&ReferenceSequence>
    {
        self.references.get(id)
    }

    /// Internal index of a reference sequence name.
    pub fn reference_id(&self, name: &str) -> Option<usize>
    {
        self.ids.get(name).copied()
    }

    /// Names in dictionary order, indexed by reference id.
    pub fn reference_names(&self) -> &[Arc<str>]
    {
        &self.names
    }
}

/// Extract `VN` and `SO` from the `@HD` line, if there is one.
fn parse_hd_line(text: &str) -> (Option<String>, Option<String>)
{
    let bytes = text.as_bytes();
    let mut line_start = 0;
    let line_ends = memchr::memchr_iter(b'\n', bytes).chain(std::iter::once(bytes.len()));

    for line_end in line_ends
    {
        let line = text[line_start..line_end].trim_end_matches('\r');
        line_start = line_end + 1;

        if let Some(fields) = line.strip_prefix("@HD\t")
        {
            let mut version = None;
            let mut sort_order = None;
            for field in fields.split('\t')
            {
                if let Some(v) = field.strip_prefix("VN:")
                {
                    version = Some(v.to_string());
                }
                else if let Some(so) = field.strip_prefix("SO:")
                {
                    sort_order = Some(so.to_string());
                }
            }
            return (version, sort_order);
        }
        if line_start > bytes.len()
        {
            break;
        }
    }
    (None, None)
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()>
{
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof
        {
            Error::InvalidHeader(format!("stream ended inside {}", what))
        }
        else
        {
            Error::from(e)
        }
    })
}

fn read_i32<R: Read>(reader: &mut R, what: &str) -> Result<i32>
{
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, what)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_length<R: Read>(reader: &mut R, what: &str) -> Result<usize>
{
    let value = read_i32(reader, what)?;
    if value < 0 || value as usize > MAX_HEADER_FIELD
    {
        return Err(Error::InvalidHeader(format!("invalid {} length {}", what, value)));
    }
    Ok(value as usize)
}
