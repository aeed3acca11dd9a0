//! Split the query input into job chunks.

use crate::chunk::{ChunkOutputs, JobBudget, JobChunk};
use crate::error::{Result, SchedulerError};
use crate::io::{count_records, SequenceSet, WorkLayout};
use crate::pipeline::Metrics;
use rayon::prelude::*;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;

/// Writes each chunk's records to its own input file.
pub struct Chunker {
    layout: Arc<WorkLayout>,
    metrics: Arc<Metrics>,
}

/// Chunk file being filled.
struct OpenChunk {
    index: usize,
    records: usize,
    writer: BufWriter<File>,
}

impl Chunker {
    pub fn new(layout: Arc<WorkLayout>, metrics: Arc<Metrics>) -> Self {
        Self { layout, metrics }
    }

    /// Split `seq_set` into chunks of at most the budgeted record count.
    ///
    /// Chunks follow input order, start at index 1, and break only at record
    /// headers. The last chunk holds the remainder.
    pub fn split(&self, seq_set: &SequenceSet, budget: &JobBudget) -> Result<Vec<JobChunk>> {
        let total = seq_set.record_count();
        if total == 0 {
            return Err(SchedulerError::EmptyInput {
                path: seq_set.path().to_path_buf(),
            });
        }

        let per_job = budget.effective_records_per_job(total);
        if budget.is_large_target && per_job != budget.records_per_job {
            tracing::info!(
                "Large target: {} records per job (was {}) to stay within {} jobs",
                per_job,
                budget.records_per_job,
                budget.max_jobs_for_large_target
            );
        }

        let mut chunks = Vec::with_capacity(budget.chunk_count(total));
        let mut current: Option<OpenChunk> = None;
        let mut written = 0usize;

        for record in seq_set.records()? {
            let record = record?;
            let mut open = match current.take() {
                Some(open) => open,
                None => self.open_chunk(chunks.len() + 1)?,
            };

            record
                .write_to(&mut open.writer)
                .map_err(|e| SchedulerError::io(self.layout.chunk_input(open.index), e))?;
            open.records += 1;
            written += 1;

            if open.records == per_job {
                chunks.push(self.close_chunk(open)?);
            } else {
                current = Some(open);
            }
        }
        if let Some(rest) = current.take() {
            chunks.push(self.close_chunk(rest)?);
        }

        if written != total {
            return Err(SchedulerError::Chunking(format!(
                "{} changed while splitting: counted {} records, read {}",
                seq_set.path().display(),
                total,
                written
            )));
        }

        tracing::info!(
            "Split {} records into {} chunks of up to {}",
            total,
            chunks.len(),
            per_job
        );
        Ok(chunks)
    }

    fn open_chunk(&self, index: usize) -> Result<OpenChunk> {
        let path = self.layout.chunk_input(index);
        let file = create_new(&path, index)?;
        Ok(OpenChunk {
            index,
            records: 0,
            writer: BufWriter::new(file),
        })
    }

    fn close_chunk(&self, mut open: OpenChunk) -> Result<JobChunk> {
        let index = open.index;
        let input_path = self.layout.chunk_input(index);
        open.writer
            .flush()
            .map_err(|e| SchedulerError::io(&input_path, e))?;
        self.metrics.add_chunk_written(open.records as u64);

        Ok(JobChunk {
            index,
            record_count: open.records,
            input_path,
            script_path: self.layout.chunk_script(index),
            sentinel_path: self.layout.chunk_sentinel(index),
            outputs: ChunkOutputs {
                archive: self.layout.chunk_archive(index),
                result: self.layout.chunk_result(index),
            },
        })
    }

    /// Recount every chunk file and check the total against the input.
    pub fn verify_partition(chunks: &[JobChunk], expected: usize) -> Result<()> {
        let counts: Vec<(usize, usize)> = chunks
            .par_iter()
            .map(|chunk| count_records(&chunk.input_path).map(|n| (chunk.index, n)))
            .collect::<Result<_>>()?;

        for (chunk, (index, actual)) in chunks.iter().zip(&counts) {
            if *actual == 0 || *actual != chunk.record_count {
                return Err(SchedulerError::Chunking(format!(
                    "chunk {} holds {} records, expected {}",
                    index, actual, chunk.record_count
                )));
            }
        }

        let sum: usize = counts.iter().map(|(_, n)| n).sum();
        if sum != expected {
            return Err(SchedulerError::Chunking(format!(
                "chunks hold {} records but the input has {}",
                sum, expected
            )));
        }
        Ok(())
    }
}

/// Create a file that must not already exist.
pub(crate) fn create_new(path: &Path, index: usize) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => SchedulerError::ScriptCollision {
                index,
                path: path.to_path_buf(),
            },
            _ => SchedulerError::io(path, e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResultFormat;
    use crate::io::FastaReader;
    use std::fmt::Write as _;
    use tempfile::TempDir;

    fn write_input(dir: &TempDir, n: usize) -> SequenceSet {
        let mut text = String::new();
        for i in 0..n {
            // Two sequence lines per record so boundaries are not line-based
            writeln!(text, ">seq{} sample=S{}\nACGT{}\nTTGG", i, i % 3, i).unwrap();
        }
        let path = dir.path().join("query.fasta");
        std::fs::write(&path, text).unwrap();
        SequenceSet::open(&path).unwrap()
    }

    fn chunker(dir: &TempDir) -> (Chunker, Arc<WorkLayout>) {
        let layout = Arc::new(WorkLayout::new(
            dir.path().join("run"),
            "blast",
            ResultFormat::Tabular,
        ));
        layout.create_dirs().unwrap();
        (Chunker::new(layout.clone(), Metrics::new()), layout)
    }

    fn budget(per_job: usize, max_jobs: usize, large: bool) -> JobBudget {
        JobBudget {
            records_per_job: per_job,
            max_jobs_for_large_target: max_jobs,
            is_large_target: large,
        }
    }

    #[test]
    fn test_even_split() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 1000);
        let (chunker, _) = chunker(&dir);

        let chunks = chunker.split(&input, &budget(250, 5, false)).unwrap();

        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.record_count == 250));
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        Chunker::verify_partition(&chunks, 1000).unwrap();
    }

    #[test]
    fn test_large_target_split() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 1000);
        let (chunker, _) = chunker(&dir);

        let chunks = chunker.split(&input, &budget(100, 5, true)).unwrap();

        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.record_count == 200));
    }

    #[test]
    fn test_remainder_in_last_chunk() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 23);
        let (chunker, _) = chunker(&dir);

        let chunks = chunker.split(&input, &budget(10, 5, false)).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|c| c.record_count).collect::<Vec<_>>(),
            vec![10, 10, 3]
        );
        Chunker::verify_partition(&chunks, 23).unwrap();
    }

    #[test]
    fn test_chunks_preserve_record_order() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 37);
        let (chunker, _) = chunker(&dir);

        let chunks = chunker.split(&input, &budget(8, 5, false)).unwrap();

        let original: Vec<_> = input.records().unwrap().map(|r| r.unwrap()).collect();
        let rejoined: Vec<_> = chunks
            .iter()
            .flat_map(|c| FastaReader::open(&c.input_path).unwrap())
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(original, rejoined);
    }

    #[test]
    fn test_empty_input_fails() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 0);
        let (chunker, layout) = chunker(&dir);

        let err = chunker.split(&input, &budget(10, 5, false)).unwrap_err();

        assert!(matches!(err, SchedulerError::EmptyInput { .. }));
        assert!(!layout.chunk_input(1).exists());
    }

    #[test]
    fn test_existing_chunk_file_collides() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 5);
        let (chunker, layout) = chunker(&dir);
        std::fs::write(layout.chunk_input(1), ">old\nA\n").unwrap();

        let err = chunker.split(&input, &budget(10, 5, false)).unwrap_err();

        assert!(matches!(err, SchedulerError::ScriptCollision { index: 1, .. }));
    }

    #[test]
    fn test_verify_partition_detects_mismatch() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, 6);
        let (chunker, _) = chunker(&dir);
        let chunks = chunker.split(&input, &budget(3, 5, false)).unwrap();

        assert!(Chunker::verify_partition(&chunks, 7).is_err());
    }
}
