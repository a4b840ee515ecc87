use std::fmt::Display;
use std::path::PathBuf;

use super::batch::Batch;
use super::error::SinkError;

/// Where a flushed batch ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchLocation {
    File(PathBuf),
    Memory(usize),
    /// Handed to a background writer which has not reported back yet
    Queued { sequence_id: u64 },
}

impl Display for BatchLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Memory(index) => write!(f, "memory[{index}]"),
            Self::Queued { sequence_id } => write!(f, "queued batch {sequence_id}"),
        }
    }
}

/// Durable storage for completed batches.
///
/// The sink only reads the batch. Every batch it is given has already been assigned its global
/// sequence id; batches arrive in ascending sequence order.
pub trait PersistenceSink {
    fn write(&mut self, batch: &Batch) -> Result<BatchLocation, SinkError>;

    /// Block until every batch accepted so far is durable. A sink that writes synchronously has
    /// nothing to wait for.
    fn sync(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: PersistenceSink + ?Sized> PersistenceSink for &mut S {
    fn write(&mut self, batch: &Batch) -> Result<BatchLocation, SinkError> {
        (**self).write(batch)
    }

    fn sync(&mut self) -> Result<(), SinkError> {
        (**self).sync()
    }
}

impl<S: PersistenceSink + ?Sized> PersistenceSink for Box<S> {
    fn write(&mut self, batch: &Batch) -> Result<BatchLocation, SinkError> {
        (**self).write(batch)
    }

    fn sync(&mut self) -> Result<(), SinkError> {
        (**self).sync()
    }
}

/// Keeps batches in memory. Handy for dry runs and tests.
///
/// Can be told to reject a given sequence id to stand in for a full disk.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub batches: Vec<Batch>,
    reject_sequence_id: Option<u64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(sequence_id: u64) -> Self {
        Self {
            batches: Vec::new(),
            reject_sequence_id: Some(sequence_id),
        }
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.batches.iter().map(|batch| batch.len()).collect()
    }

    pub fn sequence_ids(&self) -> Vec<u64> {
        self.batches
            .iter()
            .filter_map(|batch| batch.global_sequence_id())
            .collect()
    }
}

impl PersistenceSink for MemorySink {
    fn write(&mut self, batch: &Batch) -> Result<BatchLocation, SinkError> {
        let sequence_id = batch.global_sequence_id().ok_or(SinkError::Unnumbered)?;
        if self.reject_sequence_id == Some(sequence_id) {
            return Err(SinkError::Rejected(sequence_id));
        }
        self.batches.push(batch.clone());
        Ok(BatchLocation::Memory(self.batches.len() - 1))
    }
}
