//! Input reading, run directory layout and run records.

pub mod fasta;
mod layout;
mod manifest;

pub use fasta::{count_records, FastaReader, FastaRecord, SequenceSet};
pub use layout::WorkLayout;
pub use manifest::{ChunkEntry, RunManifest};
