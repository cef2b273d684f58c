use log::{debug, info};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    ffi::OsStr,
    fs::OpenOptions,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::error::SmuError;

/// Buffered append-only record file.
///
/// Records are appended as JSON lines in batches of `buffer_size`. A failed
/// flush keeps the batch and is retried on the next flush; only after
/// `max_flush_failures` consecutive failures does it surface as an error, so
/// a flaky disk does not abort a running sweep.
#[derive(Debug)]
pub struct RecordLogger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    final_format_json: bool,
    written: usize,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl<T> RecordLogger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    /// `final_format_json` rewrites the file as one pretty JSON array when
    /// the logger is finalized; otherwise it stays JSONL.
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize, final_format_json: bool) -> Self {
        let mut path = file_path.into();
        let extension = if final_format_json { "json" } else { "jsonl" };
        if path.extension() != Some(OsStr::new(extension)) {
            path.set_extension(extension);
        }

        Self {
            buffer: Vec::with_capacity(buffer_size.max(1)),
            buffer_size: buffer_size.max(1),
            file_path: path,
            final_format_json,
            written: 0,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn add(&mut self, record: T) -> Result<(), SmuError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SmuError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.append_buffer() {
            Ok(()) => {
                self.flush_failures = 0;
                self.written += self.buffer.len();
                debug!(
                    "Flushed {} records to {}",
                    self.buffer.len(),
                    self.file_path.display()
                );
                self.buffer.clear();
                Ok(())
            }
            Err(e) => self.record_failure(e),
        }
    }

    fn append_buffer(&self) -> Result<(), SmuError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(|source| SmuError::Io {
                source,
                context: format!("Failed to open record file {}", self.file_path.display()),
            })?;
        let mut writer = BufWriter::new(file);
        for record in &self.buffer {
            let line = serde_json::to_string(record)?;
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        Ok(())
    }

    fn record_failure(&mut self, e: SmuError) -> Result<(), SmuError> {
        self.flush_failures += 1;
        log::error!(
            "Flush failure {}/{}: {}",
            self.flush_failures,
            self.max_flush_failures,
            e
        );
        if self.flush_failures % 3 == 0 {
            log::warn!(
                "Experiencing intermittent flush failures ({}/{})",
                self.flush_failures,
                self.max_flush_failures
            );
        }
        if self.flush_failures >= self.max_flush_failures {
            return Err(SmuError::Io {
                source: std::io::Error::other(e.to_string()),
                context: format!(
                    "Too many consecutive flush failures ({}) for {}",
                    self.max_flush_failures,
                    self.file_path.display()
                ),
            });
        }
        Ok(())
    }

    /// Flush what is left and, if requested, rewrite the JSONL file as a
    /// JSON array.
    pub fn finalize(&mut self) -> Result<(), SmuError> {
        self.flush()?;
        if !self.final_format_json || !self.file_path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.file_path).map_err(|source| SmuError::Io {
            source,
            context: format!("Could not read JSONL file at {}", self.file_path.display()),
        })?;

        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<T>(line))
            .collect::<Result<Vec<_>, _>>()?;

        let json_output = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&self.file_path, json_output).map_err(|source| SmuError::Io {
            source,
            context: format!("Could not write JSON file at {}", self.file_path.display()),
        })?;

        // The file is now an array; further appends would corrupt it.
        self.final_format_json = false;
        info!("Converted {} entries from JSONL to JSON format", entries.len());
        Ok(())
    }

    /// Records buffered and not yet on disk.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Records successfully written so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

impl<T> Drop for RecordLogger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            log::warn!("Failed to finalize {}: {e}", self.file_path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        n: u32,
    }

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rusty-smu-logger-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(path.with_extension("jsonl"));
        let _ = std::fs::remove_file(path.with_extension("json"));
        path
    }

    #[test]
    fn test_extension_follows_format() {
        let logger: RecordLogger<Row> = RecordLogger::new("/tmp/x.txt", 4, false);
        assert_eq!(logger.path(), Path::new("/tmp/x.jsonl"));
        let logger: RecordLogger<Row> = RecordLogger::new("/tmp/x", 4, true);
        assert_eq!(logger.path(), Path::new("/tmp/x.json"));
    }

    #[test]
    fn test_flushes_in_batches() {
        let path = temp_path("batches");
        let mut logger = RecordLogger::new(&path, 2, false);
        logger.add(Row { n: 1 }).unwrap();
        assert_eq!(logger.pending(), 1);
        logger.add(Row { n: 2 }).unwrap();
        assert_eq!(logger.pending(), 0);
        assert_eq!(logger.written(), 2);
        logger.add(Row { n: 3 }).unwrap();
        drop(logger);

        let content = std::fs::read_to_string(path.with_extension("jsonl")).unwrap();
        assert_eq!(content.lines().collect::<Vec<_>>(), vec![r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#]);
    }

    #[test]
    fn test_finalize_rewrites_as_array() {
        let path = temp_path("array");
        let mut logger = RecordLogger::new(&path, 10, true);
        logger.add(Row { n: 7 }).unwrap();
        logger.add(Row { n: 8 }).unwrap();
        logger.finalize().unwrap();

        let content = std::fs::read_to_string(path.with_extension("json")).unwrap();
        let rows: Vec<Row> = serde_json::from_str(&content).unwrap();
        assert_eq!(rows, vec![Row { n: 7 }, Row { n: 8 }]);
    }
}
