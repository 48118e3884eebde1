// Example: Stream the first alignments of a remote BAM file as SAM-like text
//
// A full scan starts right after the header and does not need the index.
// The iterator is closed after LIMIT records, so the rest of the file is
// never requested.
//
// Run with: cargo run --example bam_scan_remote --features url -- [URL [LIMIT]]

use std::error::Error;
use tracing_subscriber::EnvFilter;

const DEFAULT_URL: &str = "http://www.broadinstitute.org/igvdata/1KG/freeze5_merged/low_coverage_CEU.Y.bam";

fn main() -> Result<(), Box<dyn Error>>
{
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let url = args.get(1).map(String::as_str).unwrap_or(DEFAULT_URL);
    let limit: usize = args.get(2).map(|s| s.parse::<usize>()).transpose()?.unwrap_or(20);

    let mut reader = bamhttp::BamHttpReader::open(url)?;
    let mut records = reader.iterator()?;

    for record in records.by_ref().take(limit)
    {
        let record = record?;
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            record.read_name,
            record.flags,
            record.reference_name.as_deref().unwrap_or("*"),
            record.position + 1,
            record.mapping_quality,
            record.cigar_string(),
            String::from_utf8_lossy(&record.sequence),
        );
    }

    records.close();
    reader.close();
    Ok(())
}
