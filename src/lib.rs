//! Random access to remote BAM files.
//!
//! A [`BamHttpReader`] reads the header of a BAM file served over HTTP and
//! answers interval queries by fetching only the BGZF blocks the BAI index
//! points at. The index itself is fetched once, cached on disk and shared by
//! all readers of the same file in the process.
//!
//! ```no_run
//! use bamhttp::BamHttpReader;
//!
//! let reader = BamHttpReader::open("http://example.com/sample.bam").unwrap();
//! for record in reader.query("Y", 9_999_999, 10_004_000).unwrap()
//! {
//!     let record = record.unwrap();
//!     println!("{}\t{}\t{}", record.read_name, record.position, record.end);
//! }
//! ```

pub mod bai;
pub mod bgzf;
pub mod config;
pub mod cursor;
pub mod error;
pub mod fetch;
pub mod header;
pub mod http;
pub mod index_store;
pub mod iter;
pub mod planner;
pub mod reader;
pub mod record;
pub mod remote;

pub use config::Config;
pub use error::{Error, Result};
pub use fetch::{MemoryFetcher, RangeFetcher, RetryPolicy};
pub use header::FileHeader;
#[cfg(feature = "url")]
pub use http::HttpFetcher;
pub use index_store::IndexStore;
pub use iter::AlignmentIterator;
pub use reader::BamHttpReader;
pub use record::AlignmentRecord;
