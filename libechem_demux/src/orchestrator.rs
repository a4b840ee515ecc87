use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SendError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::batch_accumulator::{BatchAccumulator, FlushedBatch};
use super::boundary_detector::BoundaryDetector;
use super::config::Config;
use super::constants::{
    DEFAULT_CHANNEL, DEFAULT_MAX_ATTEMPTS, DEFAULT_PORT, DEFAULT_RESTART_THRESHOLD,
    DEFAULT_RETRY_DELAY_SECS, PROGRESS_STEP,
};
use super::error::{AccumulatorError, ConnectionError, OrchestratorError};
use super::instrument::{Connector, InstrumentConnection};
use super::sink::{BatchLocation, PersistenceSink};
use super::technique::TechniqueDescriptor;
use super::worker_status::{JobPhase, WorkerStatus};

/// Shared flag asking a run to stop at the next sample
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Waits out the backoff between connect attempts
pub trait Sleeper: Send {
    /// Sleep for `duration`, returning early if `cancel` is set
    fn sleep(&self, duration: Duration, cancel: &CancelToken);
}

/// Sleeps on the calling thread in short slices
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) {
        let deadline = Instant::now() + duration;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Disconnected,
    Connecting,
    Streaming,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub port: String,
    pub channel: u8,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub restart_threshold: f64,
    /// Persist the partial batch when the stream drops instead of discarding it
    pub flush_on_failure: bool,
    pub first_sequence_id: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            channel: DEFAULT_CHANNEL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            restart_threshold: DEFAULT_RESTART_THRESHOLD,
            flush_on_failure: false,
            first_sequence_id: 0,
        }
    }
}

impl From<&Config> for RunOptions {
    fn from(config: &Config) -> Self {
        Self {
            port: config.port.clone(),
            channel: config.channel,
            max_attempts: config.max_attempts,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            restart_threshold: config.restart_threshold,
            flush_on_failure: config.flush_on_failure,
            first_sequence_id: 0,
        }
    }
}

/// How a single stream ended when the instrument did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug)]
enum StreamFailure {
    Connection(ConnectionError),
    Persistence(AccumulatorError),
    Status(SendError<WorkerStatus>),
}

impl From<AccumulatorError> for StreamFailure {
    fn from(value: AccumulatorError) -> Self {
        Self::Persistence(value)
    }
}

impl From<SendError<WorkerStatus>> for StreamFailure {
    fn from(value: SendError<WorkerStatus>) -> Self {
        Self::Status(value)
    }
}

/// What a finished run produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Every batch handed to the sink, in flush order
    pub batches: Vec<FlushedBatch>,
    /// The id the next batch written to the same place should take
    pub next_sequence_id: u64,
    pub attempts: u32,
    pub restarts_detected: u32,
    pub samples: u64,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn locations(&self) -> Vec<BatchLocation> {
        self.batches
            .iter()
            .map(|batch| batch.location.clone())
            .collect()
    }
}

#[derive(Debug)]
struct StatusReporter {
    tx: Sender<WorkerStatus>,
    job_index: usize,
    job_name: String,
}

/// RunOrchestrator drives one technique list from connect to the final flushed batch.
///
/// Connects, submits the techniques and pumps every sample through the boundary detector and the
/// accumulator. A connection failure, before or during the stream, is retried up to
/// `max_attempts` with `retry_delay` slept between attempts. Sink failures are never retried.
/// Numbering state lives for the whole run, so ids handed out by an earlier attempt are never
/// reused by a later one.
pub struct RunOrchestrator {
    options: RunOptions,
    state: RunState,
    sleeper: Box<dyn Sleeper>,
    cancel: CancelToken,
    status: Option<StatusReporter>,
    detector: BoundaryDetector,
    accumulator: BatchAccumulator,
    /// Technique run of the most recent sample, kept across attempts
    last_run_id: Option<u32>,
}

impl RunOrchestrator {
    pub fn new(options: RunOptions) -> Self {
        let detector = BoundaryDetector::new(options.restart_threshold);
        let accumulator = BatchAccumulator::with_start(options.first_sequence_id);
        Self {
            options,
            state: RunState::Disconnected,
            sleeper: Box::new(ThreadSleeper),
            cancel: CancelToken::new(),
            status: None,
            detector,
            accumulator,
            last_run_id: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Report progress of this run as job `job_index` over `tx`
    pub fn with_status(
        mut self,
        tx: Sender<WorkerStatus>,
        job_index: usize,
        job_name: &str,
    ) -> Self {
        self.status = Some(StatusReporter {
            tx,
            job_index,
            job_name: job_name.to_string(),
        });
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn set_state(&mut self, state: RunState) {
        if self.state != state {
            log::debug!("Run state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn report(
        &self,
        progress: f32,
        summary: &RunSummary,
        phase: JobPhase,
    ) -> Result<(), SendError<WorkerStatus>> {
        if let Some(status) = &self.status {
            status.tx.send(WorkerStatus::new(
                progress.min(1.0),
                status.job_index,
                &status.job_name,
                summary.batches.len() as u64,
                phase,
            ))?;
        }
        Ok(())
    }

    /// Run the techniques to completion, retrying the instrument as needed
    pub fn run(
        &mut self,
        connector: &mut dyn Connector,
        techniques: &[TechniqueDescriptor],
        sink: &mut dyn PersistenceSink,
    ) -> Result<RunSummary, OrchestratorError> {
        if techniques.is_empty() {
            return Err(OrchestratorError::NoTechniques);
        }
        for technique in techniques {
            technique.validate()?;
        }

        let mut summary = RunSummary::default();
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            attempt += 1;
            summary.attempts = attempt;
            self.set_state(RunState::Connecting);
            self.report(0.0, &summary, JobPhase::Connecting)?;
            log::info!(
                "Connecting to the potentiostat at {} channel {}, attempt {} / {}",
                self.options.port,
                self.options.channel,
                attempt,
                self.options.max_attempts
            );

            match self.attempt(connector, techniques, sink, &mut summary) {
                Ok(StreamOutcome::Completed) => break,
                Ok(StreamOutcome::Cancelled) => {
                    summary.cancelled = true;
                    break;
                }
                Err(StreamFailure::Persistence(e)) => {
                    self.set_state(RunState::Failed);
                    self.report(0.0, &summary, JobPhase::Failed)?;
                    return Err(OrchestratorError::Persistence(e));
                }
                Err(StreamFailure::Status(e)) => {
                    self.set_state(RunState::Failed);
                    return Err(OrchestratorError::SendError(e));
                }
                Err(StreamFailure::Connection(e)) => {
                    let next_sequence_id = self.accumulator.next_sequence_id();
                    log::error!(
                        "Attempt {} failed with technique run {:?} and batch {} in flight: {}",
                        attempt,
                        self.last_run_id,
                        next_sequence_id,
                        e
                    );
                    self.detector.reset();
                    if attempt >= self.options.max_attempts {
                        self.set_state(RunState::Failed);
                        self.report(0.0, &summary, JobPhase::Failed)?;
                        return Err(OrchestratorError::RetriesExhausted {
                            attempts: attempt,
                            last_run_id: self.last_run_id,
                            next_sequence_id,
                            last_error: e,
                        });
                    }
                    self.set_state(RunState::Disconnected);
                    log::warn!(
                        "Retrying in {} s ({} attempts left)",
                        self.options.retry_delay.as_secs_f64(),
                        self.options.max_attempts - attempt
                    );
                    self.report(0.0, &summary, JobPhase::Backoff)?;
                    self.sleeper.sleep(self.options.retry_delay, &self.cancel);
                }
            }
        }

        if summary.cancelled {
            log::warn!("Run cancelled after {} samples", summary.samples);
        }
        summary.next_sequence_id = self.accumulator.next_sequence_id();
        self.set_state(RunState::Done);
        self.report(1.0, &summary, JobPhase::Done)?;
        Ok(summary)
    }

    /// One connect-stream-close cycle
    fn attempt(
        &mut self,
        connector: &mut dyn Connector,
        techniques: &[TechniqueDescriptor],
        sink: &mut dyn PersistenceSink,
        summary: &mut RunSummary,
    ) -> Result<StreamOutcome, StreamFailure> {
        let mut connection = connector
            .connect(&self.options.port, self.options.channel)
            .map_err(StreamFailure::Connection)?;
        let result = self.stream_once(connection.as_mut(), techniques, sink, summary);
        if let Err(e) = connection.close() {
            log::warn!("Failed to close the instrument connection: {e}");
        }
        self.set_state(RunState::Disconnected);
        result
    }

    fn stream_once(
        &mut self,
        connection: &mut dyn InstrumentConnection,
        techniques: &[TechniqueDescriptor],
        sink: &mut dyn PersistenceSink,
        summary: &mut RunSummary,
    ) -> Result<StreamOutcome, StreamFailure> {
        let mut stream = connection
            .run_techniques(techniques)
            .map_err(StreamFailure::Connection)?;
        self.set_state(RunState::Streaming);

        let expected: u64 = techniques.iter().map(|t| t.expected_samples()).sum();
        let report_every = ((expected as f64 * PROGRESS_STEP as f64) as u64).max(1);
        let mut streamed: u64 = 0;
        self.report(0.0, summary, JobPhase::Streaming)?;

        loop {
            if self.cancel.is_cancelled() {
                if let Some(flushed) = self.accumulator.flush_if_non_empty(&mut *sink)? {
                    summary.batches.push(flushed);
                }
                self.accumulator.sync(&mut *sink)?;
                return Ok(StreamOutcome::Cancelled);
            }

            let sample = match stream.next() {
                Some(Ok(sample)) => sample,
                Some(Err(e)) => {
                    self.abandon_open_batch(sink, summary)?;
                    return Err(StreamFailure::Connection(e));
                }
                None => break,
            };

            streamed += 1;
            summary.samples += 1;
            self.last_run_id = Some(sample.technique_run_id);
            let verdict = self.detector.classify(&sample);
            if verdict.bump_offset {
                summary.restarts_detected += 1;
            }
            if let Some(flushed) = self.accumulator.on_sample(sample, verdict, &mut *sink)? {
                summary.batches.push(flushed);
            }
            if streamed % report_every == 0 {
                self.report(
                    streamed as f32 / expected.max(1) as f32,
                    summary,
                    JobPhase::Streaming,
                )?;
            }
        }

        if let Some(flushed) = self.accumulator.flush_if_non_empty(&mut *sink)? {
            summary.batches.push(flushed);
        }
        self.accumulator.sync(&mut *sink)?;
        log::info!(
            "Stream complete: {} samples in {} batches",
            streamed,
            summary.batches.len()
        );
        Ok(StreamOutcome::Completed)
    }

    /// Deal with the in-progress batch after the stream dropped
    fn abandon_open_batch(
        &mut self,
        sink: &mut dyn PersistenceSink,
        summary: &mut RunSummary,
    ) -> Result<(), StreamFailure> {
        let run_id = match self.accumulator.open_technique_run_id() {
            Some(run_id) => run_id,
            None => return Ok(()),
        };
        let sequence_id = self.accumulator.next_sequence_id();
        if self.options.flush_on_failure {
            log::warn!(
                "Stream dropped during technique run {run_id}; keeping its partial batch as {sequence_id}"
            );
            if let Some(flushed) = self.accumulator.flush_if_non_empty(&mut *sink)? {
                summary.batches.push(flushed);
            }
        } else {
            let lost = self.accumulator.discard_open_batch();
            log::error!(
                "Stream dropped during technique run {run_id}; discarded {lost} rows of batch {sequence_id}"
            );
        }
        Ok(())
    }
}
