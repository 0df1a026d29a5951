// ============================================================================
// TABULAR READER / WRITER
// ============================================================================
// Header-prefixed, comma-delimited files. The writer batches rows between
// flushes; the reader discards the header and isolates per-row faults:
// - malformed row (bad CSV, bad UTF-8, field count != header) -> skipped,
//   recorded as SoftError::MalformedRecord
// - underlying I/O failure -> fatal
// Both check the cancellation token before every row.
// ============================================================================

use std::fs::File;
use std::io::{self, Read, Write};
use std::mem;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{EngineError, EngineResult, SoftError};

// ----------------------------------------------------------------------------
// Batched Writer
// ----------------------------------------------------------------------------

/// Row writer that flushes every `batch_size` rows and once more on finish.
pub struct BatchWriter<W: Write> {
    inner: csv::Writer<W>,
    path: PathBuf,
    batch_size: usize,
    pending: usize,
    written: u64,
    row: Vec<String>,
}

impl<W: Write> std::fmt::Debug for BatchWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("path", &self.path)
            .field("batch_size", &self.batch_size)
            .field("pending", &self.pending)
            .field("written", &self.written)
            .finish()
    }
}

impl BatchWriter<File> {
    /// Create (truncate) `path` for writing.
    pub fn create(path: impl AsRef<Path>, batch_size: usize) -> EngineResult<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| EngineError::io("create", path, e))?;
        Ok(Self::from_writer(file, path, batch_size))
    }
}

impl<W: Write> BatchWriter<W> {
    /// Wrap any sink. `label` names it in errors.
    pub fn from_writer(writer: W, label: impl AsRef<Path>, batch_size: usize) -> Self {
        Self {
            inner: WriterBuilder::new().has_headers(false).flexible(false).from_writer(writer),
            path: label.as_ref().to_path_buf(),
            batch_size: batch_size.max(1),
            pending: 0,
            written: 0,
            row: Vec::new(),
        }
    }

    /// Write the header row. Fixes the width of every following row.
    pub fn write_header(&mut self, columns: &[&str]) -> EngineResult<()> {
        self.inner.write_record(columns).map_err(|e| self.write_error(e))?;
        self.row = vec![String::new(); columns.len()];
        self.pending += 1;
        Ok(())
    }

    /// Write one row. `fill` receives the cleared column slots of the row.
    pub fn write_row<F>(&mut self, cancel: &CancellationToken, fill: F) -> EngineResult<()>
    where
        F: FnOnce(&mut [String]) -> EngineResult<()>,
    {
        if cancel.is_cancelled() {
            return Err(EngineError::cancelled("write"));
        }

        for slot in self.row.iter_mut() {
            slot.clear();
        }
        fill(&mut self.row)?;

        self.inner.write_record(&self.row).map_err(|e| self.write_error(e))?;
        self.pending += 1;
        self.written += 1;

        if self.pending >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Data rows written so far
    pub fn rows_written(&self) -> u64 {
        self.written
    }

    fn flush(&mut self) -> EngineResult<()> {
        trace!(target: "noctua::snapshot", path = %self.path.display(), rows = self.pending, "flush batch");
        self.inner.flush().map_err(|e| EngineError::io("flush", &self.path, e))?;
        self.pending = 0;
        Ok(())
    }

    /// Final flush. Returns the underlying sink.
    pub fn finish(mut self) -> EngineResult<W> {
        self.flush()?;
        let path = self.path;
        self.inner
            .into_inner()
            .map_err(|e| EngineError::io("flush", path, io::Error::new(e.error().kind(), e.error().to_string())))
    }

    fn write_error(&self, source: csv::Error) -> EngineError {
        EngineError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

// ----------------------------------------------------------------------------
// Fault-isolating Reader
// ----------------------------------------------------------------------------

/// One data row and the line it started on.
#[derive(Debug, Clone)]
pub struct Record {
    pub line: u64,
    fields: StringRecord,
}

impl Record {
    /// Field `index`, or the empty string past the end
    pub fn get(&self, index: usize) -> &str {
        self.fields.get(index).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Lazy, finite, non-restartable row reader.
pub struct TabularReader<R: Read> {
    inner: csv::Reader<R>,
    path: PathBuf,
    header: StringRecord,
    skipped: Vec<SoftError>,
    rows: u64,
}

impl<R: Read> std::fmt::Debug for TabularReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabularReader")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("skipped", &self.skipped.len())
            .field("rows", &self.rows)
            .finish()
    }
}

impl TabularReader<File> {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| EngineError::io("open", path, e))?;
        Self::from_reader(file, path)
    }
}

impl<R: Read> TabularReader<R> {
    /// Wrap any source and consume its header row. `label` names it in errors.
    pub fn from_reader(reader: R, label: impl AsRef<Path>) -> EngineResult<Self> {
        let path = label.as_ref().to_path_buf();
        let mut inner = ReaderBuilder::new().has_headers(false).flexible(true).from_reader(reader);

        let mut header = StringRecord::new();
        match inner.read_record(&mut header) {
            Ok(true) => {}
            Ok(false) => return Err(EngineError::MissingHeader { path }),
            Err(e) => return Err(EngineError::io("read header", path, into_io(e))),
        }

        Ok(Self {
            inner,
            path,
            header,
            skipped: Vec::new(),
            rows: 0,
        })
    }

    /// Number of columns declared by the header
    pub fn width(&self) -> usize {
        self.header.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next well-formed row, or `None` at end of input.
    pub fn next_record(&mut self, cancel: &CancellationToken) -> EngineResult<Option<Record>> {
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::cancelled("read"));
            }

            let mut fields = StringRecord::new();
            match self.inner.read_record(&mut fields) {
                Ok(false) => return Ok(None),
                Ok(true) => {
                    let line = fields.position().map(|p| p.line()).unwrap_or(0);
                    if fields.len() != self.header.len() {
                        self.skip(
                            line,
                            format!("found {} fields, header declares {}", fields.len(), self.header.len()),
                        );
                        continue;
                    }
                    self.rows += 1;
                    return Ok(Some(Record { line, fields }));
                }
                Err(e) if e.is_io_error() => {
                    return Err(EngineError::io("read", &self.path, into_io(e)));
                }
                Err(e) => {
                    let line = e.position().map(|p| p.line()).unwrap_or(0);
                    self.skip(line, e.to_string());
                }
            }
        }
    }

    /// Iterator view over [`next_record`](Self::next_record).
    pub fn records<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
    ) -> impl Iterator<Item = EngineResult<Record>> + 'a {
        std::iter::from_fn(move || self.next_record(cancel).transpose())
    }

    /// Data rows returned so far
    pub fn rows_read(&self) -> u64 {
        self.rows
    }

    /// Drain the malformed-row side list.
    pub fn take_skipped(&mut self) -> Vec<SoftError> {
        mem::take(&mut self.skipped)
    }

    fn skip(&mut self, line: u64, message: String) {
        trace!(target: "noctua::snapshot", path = %self.path.display(), line, %message, "skip malformed record");
        self.skipped.push(SoftError::MalformedRecord {
            path: self.path.clone(),
            line,
            message,
        });
    }
}

fn into_io(err: csv::Error) -> io::Error {
    match err.into_kind() {
        csv::ErrorKind::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, format!("{other:?}")),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn read_all(input: &[u8]) -> (Vec<Vec<String>>, Vec<SoftError>) {
        let cancel = CancellationToken::new();
        let mut reader = TabularReader::from_reader(input, "mem.csv").unwrap();
        let rows = reader
            .records(&cancel)
            .map(|r| {
                let r = r.unwrap();
                (0..r.len()).map(|i| r.get(i).to_string()).collect()
            })
            .collect();
        (rows, reader.take_skipped())
    }

    #[test]
    fn test_header_is_discarded() {
        let (rows, skipped) = read_all(b"name\nup\nnode_load1\n");
        assert_eq!(rows, vec![vec!["up".to_string()], vec!["node_load1".to_string()]]);
        assert!(skipped.is_empty());
    }

    #[test]
    fn test_missing_header_is_fatal() {
        let err = TabularReader::from_reader(&b""[..], "empty.csv").unwrap_err();
        assert!(matches!(err, EngineError::MissingHeader { .. }));
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let input = b"a,b\n1,2\n3\n4,5,6\n7,8\n";
        let (rows, skipped) = read_all(input);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec!["7".to_string(), "8".to_string()]);
        assert_eq!(skipped.len(), 2);
        match &skipped[0] {
            SoftError::MalformedRecord { line, .. } => assert_eq!(*line, 3),
            other => panic!("unexpected soft error: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_utf8_row_is_skipped() {
        let input = b"a\nok\n\xff\xfe\nalso_ok\n";
        let (rows, skipped) = read_all(input);
        assert_eq!(rows, vec![vec!["ok".to_string()], vec!["also_ok".to_string()]]);
        assert_eq!(skipped.len(), 1);
    }

    #[test]
    fn test_reader_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut reader = TabularReader::from_reader(&b"a\n1\n"[..], "mem.csv").unwrap();
        let err = reader.next_record(&cancel).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_writer_batches_and_finishes() {
        let cancel = CancellationToken::new();
        let mut writer = BatchWriter::from_writer(Vec::new(), "mem.csv", 2);
        writer.write_header(&["name", "note"]).unwrap();
        for (name, note) in [("a", "plain"), ("b", "has,comma"), ("c", "has \"quote\"")] {
            writer
                .write_row(&cancel, |row| {
                    row[0].push_str(name);
                    row[1].push_str(note);
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(writer.rows_written(), 3);
        let out = String::from_utf8(writer.finish().unwrap()).unwrap();
        assert_eq!(out, "name,note\na,plain\nb,\"has,comma\"\nc,\"has \"\"quote\"\"\"\n");
    }

    #[test]
    fn test_writer_observes_cancellation() {
        let cancel = CancellationToken::new();
        let mut writer = BatchWriter::from_writer(Vec::new(), "mem.csv", 10);
        writer.write_header(&["name"]).unwrap();
        cancel.cancel();
        let err = writer.write_row(&cancel, |_| Ok(())).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let cancel = CancellationToken::new();

        let mut writer = BatchWriter::create(&path, 100).unwrap();
        writer.write_header(&["name"]).unwrap();
        writer.write_row(&cancel, |row| {
            row[0].push_str("up");
            Ok(())
        })
        .unwrap();
        writer.finish().unwrap();

        let mut reader = TabularReader::open(&path).unwrap();
        let record = reader.next_record(&cancel).unwrap().unwrap();
        assert_eq!(record.get(0), "up");
        assert_eq!(record.line, 2);
        assert!(reader.next_record(&cancel).unwrap().is_none());
    }

    /// Serves `data`, then fails every read.
    struct FailingReader {
        data: &'static [u8],
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() {
                return Err(io::Error::new(io::ErrorKind::Other, "disk gone"));
            }
            self.data.read(buf)
        }
    }

    /// Discards writes, fails every flush.
    #[derive(Debug)]
    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "device full"))
        }
    }

    #[test]
    fn test_read_failure_mid_stream_is_fatal() {
        let cancel = CancellationToken::new();
        let mut reader = TabularReader::from_reader(FailingReader { data: b"name\nup\nnode\n" }, "m.csv").unwrap();

        let result: EngineResult<Vec<String>> =
            reader.records(&cancel).map(|r| r.map(|rec| rec.get(0).to_string())).collect();

        let err = result.unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }), "{err}");
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert_eq!(reader.rows_read(), 2);
        assert!(reader.take_skipped().is_empty());
    }

    #[test]
    fn test_failed_batch_flush_is_fatal() {
        let cancel = CancellationToken::new();
        let mut writer = BatchWriter::from_writer(FailingWriter, "x.csv", 1);
        writer.write_header(&["name"]).unwrap();

        let err = writer
            .write_row(&cancel, |row| {
                row[0].push_str("up");
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }), "{err}");
    }

    #[test]
    fn test_failed_final_flush_is_fatal() {
        let cancel = CancellationToken::new();
        let mut writer = BatchWriter::from_writer(FailingWriter, "x.csv", 100);
        writer.write_header(&["name"]).unwrap();
        writer
            .write_row(&cancel, |row| {
                row[0].push_str("up");
                Ok(())
            })
            .unwrap();

        let err = writer.finish().unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }), "{err}");
    }

    #[test]
    fn test_open_missing_file_is_io() {
        let err = TabularReader::open("/no/such/dir/rules.csv").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }
}
