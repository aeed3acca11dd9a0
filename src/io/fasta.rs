//! FASTA reading, writing and record counting.
//!
//! A record starts at a line beginning with `>` and runs until the next
//! such line. Files ending in `.gz` are decompressed transparently.

use crate::error::{Result, SchedulerError};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One FASTA record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastaRecord {
    /// Identifier: header text up to the first whitespace
    pub id: String,
    /// Full header line without the leading `>`
    pub header: String,
    /// Sequence lines concatenated
    pub seq: String,
}

impl FastaRecord {
    /// Write the record as a header line plus one sequence line.
    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(out, ">{}", self.header)?;
        if !self.seq.is_empty() {
            writeln!(out, "{}", self.seq)?;
        }
        Ok(())
    }
}

/// Open a possibly gzipped text file for buffered reading.
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path).map_err(|e| SchedulerError::io(path, e))?;
    let is_gz = path.extension().and_then(|e| e.to_str()) == Some("gz");
    if is_gz {
        Ok(Box::new(BufReader::with_capacity(
            1024 * 1024,
            MultiGzDecoder::new(file),
        )))
    } else {
        Ok(Box::new(BufReader::with_capacity(1024 * 1024, file)))
    }
}

/// Sequential FASTA reader with one line of lookahead.
pub struct FastaReader {
    path: PathBuf,
    reader: Box<dyn BufRead + Send>,
    line_buf: String,
    pending_header: Option<String>,
}

impl FastaReader {
    /// Open a FASTA file and position the reader on the first header.
    ///
    /// Non-blank text before the first header is rejected.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = open_text(&path)?;
        let mut fasta = Self {
            path,
            reader,
            line_buf: String::with_capacity(256),
            pending_header: None,
        };

        loop {
            if !fasta.next_line()? {
                break;
            }
            let line = fasta.line_buf.trim_end();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix('>') {
                fasta.pending_header = Some(header.to_string());
                break;
            }
            return Err(SchedulerError::Chunking(format!(
                "{}: expected a '>' header, found '{}'",
                fasta.path.display(),
                line.chars().take(50).collect::<String>()
            )));
        }

        Ok(fasta)
    }

    fn next_line(&mut self) -> Result<bool> {
        self.line_buf.clear();
        let n = self
            .reader
            .read_line(&mut self.line_buf)
            .map_err(|e| SchedulerError::io(&self.path, e))?;
        Ok(n > 0)
    }

    /// Read the next record, or `None` at end of file.
    pub fn read_next(&mut self) -> Result<Option<FastaRecord>> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => return Ok(None),
        };

        let mut seq = String::new();
        while self.next_line()? {
            let line = self.line_buf.trim_end();
            if let Some(next) = line.strip_prefix('>') {
                self.pending_header = Some(next.to_string());
                break;
            }
            seq.push_str(line.trim_start());
        }

        let id = header.split_whitespace().next().unwrap_or("").to_string();
        Ok(Some(FastaRecord { id, header, seq }))
    }
}

impl Iterator for FastaReader {
    type Item = Result<FastaRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

/// Count FASTA records by counting header lines.
pub fn count_records<P: AsRef<Path>>(path: P) -> Result<usize> {
    let path = path.as_ref();
    let mut reader = open_text(path)?;
    let mut line = String::new();
    let mut count = 0usize;
    loop {
        line.clear();
        if reader
            .read_line(&mut line)
            .map_err(|e| SchedulerError::io(path, e))?
            == 0
        {
            break;
        }
        if line.starts_with('>') {
            count += 1;
        } else if count == 0 && !line.trim().is_empty() {
            return Err(SchedulerError::Chunking(format!(
                "{}: sequence data before the first '>' header",
                path.display()
            )));
        }
    }
    Ok(count)
}

/// The query input: a FASTA file and its record count.
///
/// Records are streamed on demand; only the count is held.
#[derive(Debug, Clone)]
pub struct SequenceSet {
    path: PathBuf,
    record_count: usize,
}

impl SequenceSet {
    /// Open and count an input file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let record_count = count_records(&path)?;
        tracing::info!("{} records in {}", record_count, path.display());
        Ok(Self { path, record_count })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Stream the records in file order.
    pub fn records(&self) -> Result<FastaReader> {
        FastaReader::open(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_reads_multiline_records() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "q.fasta", ">r1 sample=A\nACGT\nTT\n>r2\nGGCC\n");

        let records: Vec<_> = FastaReader::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "r1");
        assert_eq!(records[0].header, "r1 sample=A");
        assert_eq!(records[0].seq, "ACGTTT");
        assert_eq!(records[1].seq, "GGCC");
    }

    #[test]
    fn test_count_records() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "q.fasta", "\n>a\nA\n>b\nC\n>c\n");
        assert_eq!(count_records(&path).unwrap(), 3);
    }

    #[test]
    fn test_count_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "empty.fasta", "");
        assert_eq!(count_records(&path).unwrap(), 0);
        assert!(FastaReader::open(&path).unwrap().read_next().unwrap().is_none());
    }

    #[test]
    fn test_rejects_text_before_header() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "bad.fasta", "ACGT\n>a\nA\n");
        assert!(matches!(
            count_records(&path),
            Err(SchedulerError::Chunking(_))
        ));
        assert!(FastaReader::open(&path).is_err());
    }

    #[test]
    fn test_rejects_multibyte_text_before_header() {
        let dir = TempDir::new().unwrap();
        let preamble = format!("a{}", "é".repeat(40));
        let path = write(&dir, "bad.fasta", &format!("{}\n>a\nA\n", preamble));

        match FastaReader::open(&path) {
            Err(SchedulerError::Chunking(msg)) => {
                let shown: String = preamble.chars().take(50).collect();
                assert!(msg.contains(&shown));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_gzip_input() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("q.fasta.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(b">a\nAC\n>b\nGT\n").unwrap();
        enc.finish().unwrap();

        let set = SequenceSet::open(&path).unwrap();
        assert_eq!(set.record_count(), 2);
        let ids: Vec<_> = set.records().unwrap().map(|r| r.unwrap().id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_write_record() {
        let record = FastaRecord {
            id: "x".to_string(),
            header: "x desc".to_string(),
            seq: "ACGT".to_string(),
        };
        let mut out = Vec::new();
        record.write_to(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), ">x desc\nACGT\n");
    }
}
