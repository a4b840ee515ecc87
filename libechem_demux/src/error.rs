use std::path::PathBuf;
use thiserror::Error;

use super::worker_status::WorkerStatus;

#[derive(Debug, Clone, Error)]
pub enum TechniqueError {
    #[error("Unrecognized technique kind: {0}")]
    UnknownKind(String),
    #[error("Technique {kind} has an invalid {name} of {value}; it must be positive")]
    InvalidParameter {
        kind: String,
        name: &'static str,
        value: f64,
    },
}

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("Could not connect to the instrument at {port} (channel {channel}): {reason}")]
    ConnectFailed {
        port: String,
        channel: u8,
        reason: String,
    },
    #[error("Instrument rejected the technique list: {0}")]
    Rejected(String),
    #[error("Instrument stream dropped after {samples} samples: {reason}")]
    StreamDropped { samples: u64, reason: String },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Sink failed due to CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Refusing to overwrite existing batch file {0:?}")]
    AlreadyExists(PathBuf),
    #[error("Batch was handed to the sink before it was given a sequence id")]
    Unnumbered,
    #[error("Sink rejected batch {0}")]
    Rejected(u64),
    #[error("Background writer failed on batch {sequence_id} of technique run {run_id}: {reason}")]
    WriterFailed {
        run_id: u32,
        sequence_id: u64,
        reason: String,
    },
    #[error("Background writer thread is no longer running")]
    WriterDisconnected,
}

impl SinkError {
    /// The batch a background failure belongs to, when it is not the batch being written
    pub fn failed_batch(&self) -> Option<(u32, u64)> {
        match self {
            Self::WriterFailed {
                run_id,
                sequence_id,
                ..
            } => Some((*run_id, *sequence_id)),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AccumulatorError {
    #[error("Failed to persist batch {sequence_id} of technique run {run_id}: {source}")]
    Persist {
        run_id: u32,
        sequence_id: u64,
        #[source]
        source: SinkError,
    },
}

impl AccumulatorError {
    /// Charge a sink failure to the batch it belongs to, `run_id`/`sequence_id` unless the sink
    /// names a different one
    pub fn persist(source: SinkError, run_id: u32, sequence_id: u64) -> Self {
        let (run_id, sequence_id) = source.failed_batch().unwrap_or((run_id, sequence_id));
        Self::Persist {
            run_id,
            sequence_id,
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Gave up on the instrument after {attempts} attempts with technique run {last_run_id:?} and batch {next_sequence_id} in flight; last error: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_run_id: Option<u32>,
        next_sequence_id: u64,
        last_error: ConnectionError,
    },
    #[error("Run aborted by a persistence failure: {0}")]
    Persistence(#[from] AccumulatorError),
    #[error("Run was given an invalid technique: {0}")]
    Technique(#[from] TechniqueError),
    #[error("Run was given an empty technique list")]
    NoTechniques,
    #[error("Orchestrator failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config failed validation: {0}")]
    Invalid(String),
    #[error("Config contains an invalid technique: {0}")]
    Technique(#[from] TechniqueError),
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Metadata failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Metadata failed to convert to json: {0}")]
    ParsingError(#[from] serde_json::Error),
    #[error("Metadata failed to format a timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
}

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("Sequencer failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Sequencer failed due to Orchestrator error: {0}")]
    OrchestratorError(#[from] OrchestratorError),
    #[error("Sequencer failed due to Sink error: {0}")]
    SinkError(#[from] SinkError),
    #[error("Sequencer failed due to Metadata error: {0}")]
    MetadataError(#[from] MetadataError),
    #[error("Sequencer failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}
