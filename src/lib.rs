//! # partar — distributed parallel pax archiver
//!
//! Core guarantees:
//! - Entry byte ranges are planned up front by a prefix scan over the
//!   team; no two ranks ever write overlapping archive bytes
//! - Entries are laid out in global path order without gaps; payloads are
//!   512-byte padded; the archive ends in two all-zero 512-byte blocks
//! - The `.idx` sidecar holds one 8-byte big-endian offset per entry and
//!   makes seek-based extraction possible; when it is absent, extraction
//!   falls back to a header scan, then to rank-striped streaming
//! - Payload bytes move through a work-stealing chunk queue: any rank may
//!   execute any chunk, every byte moves exactly once
//! - The end-of-archive trailer is written exactly once, by rank 0, after
//!   the queue drains — the header encoder cannot emit it
//! - A failure on any rank becomes a global failure at the next phase
//!   checkpoint; there are no per-chunk retries

pub mod archive;
pub mod comm;
pub mod entry;
pub mod error;
pub mod header;
pub mod index;
pub mod layout;
pub mod paths;
pub mod progress;
pub mod scan;
pub mod scheduler;

// Flat re-exports for the most common types.
pub use archive::{archive_create, archive_extract, check_archive_paths,
                  ArchiveOptions, RunSummary};
pub use comm::Comm;
pub use entry::{collect_entries, Entry, EntryKind};
pub use error::{ArchiveError, Result};
pub use index::{index_path, read_index, write_index};
pub use layout::{pad512, Layout};
pub use scheduler::ChunkWorkItem;
