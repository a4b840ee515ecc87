use fxhash::FxHashMap;
use std::path::PathBuf;
use std::sync::mpsc::Sender;

use super::config::Config;
use super::csv_writer::CsvSink;
use super::error::{AccumulatorError, OrchestratorError, SequencerError};
use super::instrument::Connector;
use super::metadata::{local_now, ExperimentMetadata};
use super::orchestrator::{CancelToken, RunOptions, RunOrchestrator, RunSummary};
use super::worker_status::WorkerStatus;
use super::writer_thread::QueuedSink;

/// Outcome of one configured job
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub name: String,
    pub directory: PathBuf,
    pub run: RunSummary,
}

/// Sequencer runs the jobs of an experiment one after the other.
///
/// It owns the experiment directory layout and `metadata.json`. Each job gets its own orchestrator
/// and its own sink; jobs writing into the same directory continue each other's numbering, and
/// numbering starts after any tables already present so a rerun never collides with old output.
#[derive(Debug)]
pub struct Sequencer {
    config: Config,
    experiment_id: String,
    metadata: ExperimentMetadata,
    cancel: CancelToken,
}

impl Sequencer {
    /// Validate the config, lay out the experiment directory and write the initial metadata
    pub fn new(config: Config) -> Result<Self, SequencerError> {
        config.validate()?;
        let started = local_now();
        let experiment_id = config.resolve_experiment_id(started.date());

        std::fs::create_dir_all(config.get_experiment_directory(&experiment_id))?;
        for job in config.jobs.iter() {
            std::fs::create_dir_all(config.get_job_directory(&experiment_id, job))?;
        }
        let metadata = ExperimentMetadata::new(&config, &experiment_id, started)?;
        metadata.write(&config.get_metadata_path(&experiment_id))?;
        log::info!(
            "Experiment {} set up in {}",
            experiment_id,
            config.get_experiment_directory(&experiment_id).display()
        );

        Ok(Self {
            config,
            experiment_id,
            metadata,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    pub fn experiment_directory(&self) -> PathBuf {
        self.config.get_experiment_directory(&self.experiment_id)
    }

    pub fn metadata(&self) -> &ExperimentMetadata {
        &self.metadata
    }

    /// Run every job. The metadata status ends up `completed` or `failed`.
    pub fn run(
        &mut self,
        connector: &mut dyn Connector,
        tx: Option<&Sender<WorkerStatus>>,
    ) -> Result<Vec<JobSummary>, SequencerError> {
        let mut summaries = Vec::new();
        let result = self.run_jobs(connector, tx, &mut summaries);
        let metadata_path = self.config.get_metadata_path(&self.experiment_id);
        match result {
            Ok(()) => {
                self.metadata.mark_completed(local_now())?;
                self.metadata.write(&metadata_path)?;
                log::info!(
                    "Experiment {} completed with {} jobs",
                    self.experiment_id,
                    summaries.len()
                );
                Ok(summaries)
            }
            Err(e) => {
                log::error!("Experiment {} failed: {e}", self.experiment_id);
                let marked = self
                    .metadata
                    .mark_failed(local_now(), &e.to_string())
                    .and_then(|_| self.metadata.write(&metadata_path));
                if let Err(me) = marked {
                    log::error!("Could not record the failure in the metadata: {me}");
                }
                Err(e)
            }
        }
    }

    fn run_jobs(
        &mut self,
        connector: &mut dyn Connector,
        tx: Option<&Sender<WorkerStatus>>,
        summaries: &mut Vec<JobSummary>,
    ) -> Result<(), SequencerError> {
        let mut next_ids: FxHashMap<PathBuf, u64> = FxHashMap::default();
        let metadata_path = self.config.get_metadata_path(&self.experiment_id);

        for (idx, job) in self.config.jobs.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!("Cancelled, skipping job {}", job.name);
                break;
            }

            let directory = self.config.get_job_directory(&self.experiment_id, job);
            let mut csv = CsvSink::new(&directory, &self.experiment_id)?;
            let first_sequence_id = match next_ids.get(&directory) {
                Some(next) => *next,
                None => csv.next_free_sequence_id()?,
            };

            let mut options = RunOptions::from(&self.config);
            options.first_sequence_id = first_sequence_id;
            let mut orchestrator = RunOrchestrator::new(options).with_cancel(self.cancel.clone());
            if let Some(tx) = tx {
                orchestrator = orchestrator.with_status(tx.clone(), idx, &job.name);
            }
            log::info!(
                "Starting job {} with {} techniques, numbering from {}",
                job.name,
                job.techniques.len(),
                first_sequence_id
            );

            let run = if self.config.background_writer {
                let mut queued = QueuedSink::spawn(csv);
                let result = orchestrator.run(&mut *connector, &job.techniques, &mut queued);
                let written = queued.finish();
                let mut run = result?;
                let written = written.map_err(|source| {
                    let (run_id, sequence_id) = run
                        .batches
                        .last()
                        .map(|batch| (batch.technique_run_id, batch.sequence_id))
                        .unwrap_or((0, run.next_sequence_id));
                    OrchestratorError::Persistence(AccumulatorError::persist(
                        source,
                        run_id,
                        sequence_id,
                    ))
                })?;
                for (batch, location) in run.batches.iter_mut().zip(written) {
                    batch.location = location;
                }
                run
            } else {
                let result = orchestrator.run(&mut *connector, &job.techniques, &mut csv);
                csv.close();
                result?
            };

            log::info!(
                "Finished job {}: {} batches from {} samples",
                job.name,
                run.batches.len(),
                run.samples
            );
            next_ids.insert(directory.clone(), run.next_sequence_id);
            self.metadata.record_batches(&job.name, &run.locations());
            self.metadata.write(&metadata_path)?;

            let cancelled = run.cancelled;
            summaries.push(JobSummary {
                name: job.name.clone(),
                directory,
                run,
            });
            if cancelled {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use crate::metadata::ExperimentStatus;
    use crate::simulated::{FaultPlan, SimulatedConnector};
    use crate::sink::BatchLocation;
    use crate::technique::{CvParams, OcvParams, PeisParams, TechniqueDescriptor};
    use std::path::Path;

    fn ocv() -> TechniqueDescriptor {
        TechniqueDescriptor::Ocv(OcvParams {
            rest_time: 2.0,
            record_every_dt: 0.5,
        })
    }

    fn cv() -> TechniqueDescriptor {
        TechniqueDescriptor::Cv(CvParams {
            start: 0.0,
            vertex: 0.1,
            scan_rate: 0.1,
            n_cycles: 1,
            record_every_de: 0.05,
        })
    }

    fn peis() -> TechniqueDescriptor {
        TechniqueDescriptor::Peis(PeisParams {
            initial_frequency: 1e4,
            final_frequency: 1.0,
            frequency_number: 3,
            amplitude_voltage: 0.01,
        })
    }

    fn config(data_path: &Path, jobs: Vec<(&str, &str, Vec<TechniqueDescriptor>)>) -> Config {
        Config {
            experiment_id: String::from("exp"),
            data_path: data_path.to_path_buf(),
            retry_delay_secs: 0,
            jobs: jobs
                .into_iter()
                .map(|(name, directory, techniques)| JobConfig {
                    name: name.to_string(),
                    directory: directory.to_string(),
                    techniques,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn names(directory: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(directory)
            .unwrap()
            .map(|item| item.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_runs_jobs_and_writes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(
            dir.path(),
            vec![
                ("deposition", "deposition", vec![ocv(), ocv()]),
                ("characterization", "characterization", vec![ocv(), peis()]),
            ],
        );
        let mut sequencer = Sequencer::new(config).unwrap();
        let mut connector = SimulatedConnector::default();
        let summaries = sequencer.run(&mut connector, None).unwrap();
        assert_eq!(summaries.len(), 2);

        let root = dir.path().join("exp");
        assert_eq!(
            names(&root.join("deposition")),
            vec!["exp_0_OCV.csv", "exp_1_OCV.csv"]
        );
        assert_eq!(
            names(&root.join("characterization")),
            vec!["exp_0_OCV.csv", "exp_1_PEIS.csv"]
        );

        let metadata = ExperimentMetadata::read(&root.join("metadata.json")).unwrap();
        assert_eq!(metadata.status, ExperimentStatus::Completed);
        assert_eq!(metadata.batches["characterization"].len(), 2);
    }

    #[test]
    fn test_jobs_sharing_a_directory_chain_ids() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(
            dir.path(),
            vec![
                ("sweep", "characterization", vec![ocv(), cv()]),
                ("impedance", "characterization", vec![peis()]),
            ],
        );
        let mut sequencer = Sequencer::new(config.clone()).unwrap();
        let summaries = sequencer
            .run(&mut SimulatedConnector::default(), None)
            .unwrap();
        assert_eq!(summaries[1].run.batches[0].sequence_id, 2);
        assert_eq!(summaries[1].run.next_sequence_id, 3);

        // A second session into the same experiment continues after the existing tables
        let mut sequencer = Sequencer::new(config).unwrap();
        let summaries = sequencer
            .run(&mut SimulatedConnector::default(), None)
            .unwrap();
        assert_eq!(summaries[0].run.batches[0].sequence_id, 3);
        assert_eq!(
            names(&dir.path().join("exp").join("characterization")),
            vec![
                "exp_0_OCV.csv",
                "exp_1_CV.csv",
                "exp_2_PEIS.csv",
                "exp_3_OCV.csv",
                "exp_4_CV.csv",
                "exp_5_PEIS.csv"
            ]
        );
    }

    #[test]
    fn test_failure_marks_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), vec![("deposition", "deposition", vec![ocv()])]);
        config.max_attempts = 2;
        let mut sequencer = Sequencer::new(config).unwrap();
        let mut connector = SimulatedConnector::new(FaultPlan {
            failed_connects: 5,
            ..Default::default()
        });
        match sequencer.run(&mut connector, None) {
            Err(SequencerError::OrchestratorError(OrchestratorError::RetriesExhausted {
                attempts,
                ..
            })) => assert_eq!(attempts, 2),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(connector.connect_calls(), 2);
        let metadata =
            ExperimentMetadata::read(&dir.path().join("exp").join("metadata.json")).unwrap();
        assert_eq!(metadata.status, ExperimentStatus::Failed);
        assert!(metadata.error.is_some());
        assert!(names(&dir.path().join("exp").join("deposition")).is_empty());
    }

    #[test]
    fn test_background_writer_reports_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), vec![("deposition", "deposition", vec![ocv(), cv()])]);
        config.background_writer = true;
        let mut sequencer = Sequencer::new(config).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let summaries = sequencer
            .run(&mut SimulatedConnector::default(), Some(&tx))
            .unwrap();
        let expected: Vec<BatchLocation> = ["exp_0_OCV.csv", "exp_1_CV.csv"]
            .iter()
            .map(|name| BatchLocation::File(dir.path().join("exp").join("deposition").join(name)))
            .collect();
        assert_eq!(summaries[0].run.locations(), expected);
        assert!(rx.try_iter().any(|status| status.batches_written == 2));
    }

    #[test]
    fn test_invalid_config_is_rejected_before_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![("deposition", "deposition", vec![])]);
        assert!(matches!(
            Sequencer::new(config),
            Err(SequencerError::ConfigError(_))
        ));
        assert!(!dir.path().join("exp").exists());
    }
}
