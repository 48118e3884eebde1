// Example: Count the alignments in a region of a remote BAM file
//
// The BAI index is fetched on first use and cached under $BAMHTTP_CACHE_DIR
// (or the system temp directory), so a second run skips the index download.
// Set RUST_LOG=bamhttp=debug to watch the range requests.
//
// Run with: cargo run --example bam_count_remote_region --features url -- [URL [REF START END]]

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
    let reference = args.get(2).map(String::as_str).unwrap_or("Y");
    let start: u64 = args.get(3).map(|s| s.parse::<u64>()).transpose()?.unwrap_or(9_999_999);
    let end: u64 = args.get(4).map(|s| s.parse::<u64>()).transpose()?.unwrap_or(10_004_000);

    let mut reader = bamhttp::BamHttpReader::open(url)?;
    println!("index cache: {}", reader.cached_index_path().display());

    let mut count = 0usize;
    let mut reverse = 0usize;
    let mut records = reader.query(reference, start, end)?;
    while let Some(record) = records.next_record()?
    {
        count += 1;
        if record.is_reverse()
        {
            reverse += 1;
        }
    }
    records.close();

    println!("{}:{}-{}\t{} alignments ({} reverse strand)", reference, start, end, count, reverse);

    reader.close();
    Ok(())
}
