//! Read-ahead entry reader for a segmented, append-only distributed log.
//!
//! A dlog stream is an ordered sequence of log segments; entries are
//! addressed by `(segment sequence number, entry id)` coordinates
//! ([`Dlsn`](dlog_common::Dlsn)). The tail segment is in-progress (its last
//! durable entry, the LAC, advances over time) while older segments are
//! closed and immutable.
//!
//! [`ReadAheadEntryReader`] is the pull side of a log reader: given a
//! starting position it prefetches entries from the segment store into a
//! bounded in-memory queue, crossing segment boundaries transparently and
//! absorbing segment metadata changes (new segments appearing, the tail
//! closing, the LAC advancing). Backpressure is cooperative: the read-ahead
//! pauses when the queue reaches its threshold and resumes as the consumer
//! drains it.
//!
//! # Key Concepts
//!
//! - **Single-writer discipline**: every state mutation runs on one ordered
//!   task stream; completions and notifications post work rather than mutate.
//! - **Catch-up tracking**: the reader reports when it has reached the tail
//!   of the log since starting, and the flag never flips back.
//! - **Sticky errors**: the first fatal error is re-raised on every
//!   subsequent consumer call until the reader is closed.
//!
//! # Example
//!
//! ```ignore
//! use dlog_reader::{ReadAheadEntryReader, ReaderConfig, ReaderMetrics};
//! use dlog_common::Dlsn;
//!
//! let reader = ReadAheadEntryReader::new(
//!     "orders",
//!     Dlsn::INITIAL,
//!     ReaderConfig::default(),
//!     entry_store,
//!     metadata_store,
//!     Arc::new(ReaderMetrics::new()),
//! );
//! reader.start(initial_segments);
//! while let Some(entry) = reader.next_entry(Duration::from_secs(1)).await? {
//!     println!("{} : {:?}", entry.dlsn(), entry.payload);
//! }
//! ```

mod cache;
mod config;
mod error;
mod metrics;
mod position;
mod reader;
mod segment;
mod serializer;

pub use config::ReaderConfig;
pub use error::{Error, Result};
pub use metrics::ReaderMetrics;
pub use reader::{ReadAheadEntryReader, ReaderStateListener};
