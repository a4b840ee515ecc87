use std::fs::File;
use std::path::{Path, PathBuf};

use super::batch::Batch;
use super::constants::BATCH_FILE_EXTENSION;
use super::error::SinkError;
use super::sample::TechniqueKind;
use super::sink::{BatchLocation, PersistenceSink};

/// A simple sink which wraps around the csv library.
///
/// Writes one delimited table per batch into a directory, named
/// `<experiment_id>_<sequence_id>_<KIND>.csv`. The header is the union of the fields present in
/// the batch; a row lacking a field gets an empty cell. Each table is written to a hidden
/// temporary file and renamed into place once it is complete, so a failed write never leaves a
/// partial table behind.
#[derive(Debug)]
pub struct CsvSink {
    directory: PathBuf,
    experiment_id: String,
    files_written: u64,
    bytes_written: u64,
}

impl CsvSink {
    /// Create the sink, creating the output directory if needed
    pub fn new(directory: &Path, experiment_id: &str) -> Result<Self, SinkError> {
        std::fs::create_dir_all(directory)?;
        Ok(Self {
            directory: directory.to_path_buf(),
            experiment_id: experiment_id.to_string(),
            files_written: 0,
            bytes_written: 0,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn file_name(&self, sequence_id: u64, kind: TechniqueKind) -> String {
        format!(
            "{}_{}_{}.{}",
            self.experiment_id,
            sequence_id,
            kind.label(),
            BATCH_FILE_EXTENSION
        )
    }

    /// The first sequence id not yet used by a table of this experiment in the directory.
    ///
    /// Lets a restarted process continue numbering instead of colliding with earlier output.
    pub fn next_free_sequence_id(&self) -> Result<u64, SinkError> {
        let prefix = format!("{}_", self.experiment_id);
        let mut next = 0;
        for item in self.directory.read_dir()? {
            let item_path = item?.path();
            if item_path.extension().and_then(|ext| ext.to_str()) != Some(BATCH_FILE_EXTENSION) {
                continue;
            }
            let stem = match item_path.file_stem().and_then(|stem| stem.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            // <experiment_id>_<sequence_id>_<KIND>
            let sequence = stem
                .strip_prefix(&prefix)
                .and_then(|rest| rest.split('_').next())
                .and_then(|number| number.parse::<u64>().ok());
            if let Some(sequence) = sequence {
                next = next.max(sequence + 1);
            }
        }
        Ok(next)
    }

    /// Log a summary of what was written, consume the sink
    pub fn close(self) {
        log::info!(
            "{} tables ({}) written to {}",
            self.files_written,
            human_bytes::human_bytes(self.bytes_written as f64),
            self.directory.display()
        );
    }

    fn write_table(path: &Path, batch: &Batch) -> Result<(), SinkError> {
        let columns = batch.columns();
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&columns)?;
        for row in batch.rows() {
            writer.write_record(columns.iter().map(|column| match row.get(column) {
                Some(value) => value.to_string(),
                None => String::new(),
            }))?;
        }
        writer.flush()?;
        let file: File = writer
            .into_inner()
            .map_err(|e| SinkError::IOError(e.into_error()))?;
        file.sync_all()?;
        Ok(())
    }
}

impl PersistenceSink for CsvSink {
    fn write(&mut self, batch: &Batch) -> Result<BatchLocation, SinkError> {
        let sequence_id = batch.global_sequence_id().ok_or(SinkError::Unnumbered)?;
        let file_name = self.file_name(sequence_id, batch.technique_kind());
        let final_path = self.directory.join(&file_name);
        if final_path.exists() {
            return Err(SinkError::AlreadyExists(final_path));
        }

        let tmp_path = self.directory.join(format!(".{file_name}.tmp"));
        if let Err(e) = Self::write_table(&tmp_path, batch) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
        if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(SinkError::IOError(e));
        }

        let size = final_path.metadata()?.len();
        self.files_written += 1;
        self.bytes_written += size;
        log::info!(
            "Saved batch {} ({} rows of {}, {}) to {}",
            sequence_id,
            batch.len(),
            batch.technique_kind(),
            human_bytes::human_bytes(size as f64),
            final_path.display()
        );
        Ok(BatchLocation::File(final_path))
    }
}
