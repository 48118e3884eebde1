// Example: Print the header of a remote BAM file
//
// Only the first BGZF blocks of the file are transferred; the index is not
// touched.
//
// Run with: cargo run --example bam_header_remote --features url -- [URL]

use std::error::Error;
use tracing_subscriber::EnvFilter;

const DEFAULT_URL: &str = "http://www.broadinstitute.org/igvdata/1KG/freeze5_merged/low_coverage_CEU.Y.bam";

fn main() -> Result<(), Box<dyn Error>>
{
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_URL.to_string());
    let mut reader = bamhttp::BamHttpReader::open(&url)?;

    let header = reader.header();
    println!("version:     {}", header.version().unwrap_or("-"));
    println!("sort order:  {}", header.sort_order().unwrap_or("-"));
    println!("references:  {}", header.reference_count());
    for reference in header.references().iter().take(25)
    {
        println!("  {}\t{}", reference.name, reference.length);
    }
    if header.reference_count() > 25
    {
        println!("  ... {} more", header.reference_count() - 25);
    }

    reader.close();
    Ok(())
}
