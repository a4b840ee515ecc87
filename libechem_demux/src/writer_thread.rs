use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::batch::Batch;
use super::error::SinkError;
use super::sink::{BatchLocation, PersistenceSink};

/// The batch the background writer failed on
#[derive(Debug, Clone)]
struct WriterFailure {
    run_id: u32,
    sequence_id: u64,
    reason: String,
}

impl WriterFailure {
    fn to_error(&self) -> SinkError {
        SinkError::WriterFailed {
            run_id: self.run_id,
            sequence_id: self.sequence_id,
            reason: self.reason.clone(),
        }
    }
}

/// Moves batch persistence onto a single background thread.
///
/// Batches are queued in flush order and written one at a time by the thread that owns the
/// inner sink, so files appear in ascending sequence order and never concurrently. A failure in
/// the writer is remembered along with the batch it happened on, and reported by the next
/// `write`, by `sync` and by `finish`.
#[derive(Debug)]
pub struct QueuedSink {
    tx: Option<Sender<Batch>>,
    handle: Option<JoinHandle<Result<Vec<BatchLocation>, SinkError>>>,
    failure: Arc<Mutex<Option<WriterFailure>>>,
    written: Vec<BatchLocation>,
}

impl QueuedSink {
    pub fn spawn<S: PersistenceSink + Send + 'static>(mut inner: S) -> Self {
        let (tx, rx) = mpsc::channel::<Batch>();
        let failure = Arc::new(Mutex::new(None));
        let thread_failure = failure.clone();
        let handle = std::thread::spawn(move || {
            let mut locations = Vec::new();
            for batch in rx {
                match inner.write(&batch) {
                    Ok(location) => locations.push(location),
                    Err(e) => {
                        let failed = WriterFailure {
                            run_id: batch.technique_run_id(),
                            sequence_id: batch.global_sequence_id().unwrap_or_default(),
                            reason: e.to_string(),
                        };
                        log::error!(
                            "Background writer failed on batch {} of technique run {}: {e}",
                            failed.sequence_id,
                            failed.run_id
                        );
                        let error = failed.to_error();
                        if let Ok(mut slot) = thread_failure.lock() {
                            *slot = Some(failed);
                        }
                        return Err(error);
                    }
                }
            }
            Ok(locations)
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
            failure,
            written: Vec::new(),
        }
    }

    fn check_failure(&self) -> Result<(), SinkError> {
        match self.failure.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(failed) => Err(failed.to_error()),
                None => Ok(()),
            },
            Err(_) => Err(SinkError::WriterDisconnected),
        }
    }

    /// Wait for every queued batch to be written.
    ///
    /// Returns the locations reported by the inner sink, in write order.
    pub fn finish(mut self) -> Result<Vec<BatchLocation>, SinkError> {
        self.sync()?;
        Ok(std::mem::take(&mut self.written))
    }
}

impl PersistenceSink for QueuedSink {
    fn write(&mut self, batch: &Batch) -> Result<BatchLocation, SinkError> {
        self.check_failure()?;
        let sequence_id = batch.global_sequence_id().ok_or(SinkError::Unnumbered)?;
        match self.tx.as_ref() {
            Some(tx) => {
                if tx.send(batch.clone()).is_err() {
                    // The writer stops receiving once it has recorded a failure
                    self.check_failure()?;
                    return Err(SinkError::WriterDisconnected);
                }
            }
            None => return Err(SinkError::WriterDisconnected),
        }
        Ok(BatchLocation::Queued { sequence_id })
    }

    /// Close the queue and join the writer. Later writes are refused.
    fn sync(&mut self) -> Result<(), SinkError> {
        drop(self.tx.take());
        match self.handle.take() {
            Some(handle) => {
                let locations = handle
                    .join()
                    .map_err(|_| SinkError::WriterDisconnected)??;
                self.written.extend(locations);
                Ok(())
            }
            None => self.check_failure(),
        }
    }
}

impl Drop for QueuedSink {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Background writer thread panicked");
            }
        }
    }
}
