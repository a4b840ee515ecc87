use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::constants::{
    AUTO_EXPERIMENT_ID, DEFAULT_CHANNEL, DEFAULT_MAX_ATTEMPTS, DEFAULT_PORT,
    DEFAULT_RESTART_THRESHOLD, DEFAULT_RETRY_DELAY_SECS, METADATA_FILE_NAME,
};
use super::error::ConfigError;
use super::technique::{CpParams, CvParams, OcvParams, PeisParams, TechniqueDescriptor};

/// One technique list run against the instrument, and the directory its batches go to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub directory: String,
    pub techniques: Vec<TechniqueDescriptor>,
}

/// Structure representing the application configuration. Contains pathing, instrument and job
/// information.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub experiment_id: String,
    pub run_number: String,
    pub data_path: PathBuf,
    pub cell: String,
    pub notes: String,
    pub port: String,
    pub channel: u8,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub restart_threshold: f64,
    pub flush_on_failure: bool,
    pub background_writer: bool,
    pub jobs: Vec<JobConfig>,
}

impl Default for Config {
    /// Generate a template Config: a deposition followed by a characterization
    fn default() -> Self {
        let ocv = |rest_time| {
            TechniqueDescriptor::Ocv(OcvParams {
                rest_time,
                record_every_dt: 0.5,
            })
        };
        Self {
            experiment_id: String::from(AUTO_EXPERIMENT_ID),
            run_number: String::from("001"),
            data_path: PathBuf::from("data"),
            cell: String::from("A1"),
            notes: String::new(),
            port: String::from(DEFAULT_PORT),
            channel: DEFAULT_CHANNEL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            restart_threshold: DEFAULT_RESTART_THRESHOLD,
            flush_on_failure: false,
            background_writer: false,
            jobs: vec![
                JobConfig {
                    name: String::from("deposition"),
                    directory: String::from("deposition"),
                    techniques: vec![
                        ocv(60.0),
                        TechniqueDescriptor::Cp(CpParams {
                            current: -0.002,
                            duration: 60.0,
                            record_every_dt: 0.1,
                        }),
                        ocv(60.0),
                    ],
                },
                JobConfig {
                    name: String::from("characterization"),
                    directory: String::from("characterization"),
                    techniques: vec![
                        ocv(10.0),
                        TechniqueDescriptor::Peis(PeisParams {
                            initial_frequency: 200000.0,
                            final_frequency: 1.0,
                            frequency_number: 60,
                            amplitude_voltage: 0.01,
                        }),
                        TechniqueDescriptor::Cv(CvParams {
                            start: 0.0,
                            vertex: 1.0,
                            scan_rate: 0.05,
                            n_cycles: 5,
                            record_every_de: 0.01,
                        }),
                    ],
                },
            ],
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// The experiment id, with `auto` expanded to `YYYYMMDD_<run_number>` for `date`
    pub fn resolve_experiment_id(&self, date: time::Date) -> String {
        if self.experiment_id == AUTO_EXPERIMENT_ID {
            format!(
                "{:04}{:02}{:02}_{}",
                date.year(),
                u8::from(date.month()),
                date.day(),
                self.run_number
            )
        } else {
            self.experiment_id.clone()
        }
    }

    pub fn get_experiment_directory(&self, experiment_id: &str) -> PathBuf {
        self.data_path.join(experiment_id)
    }

    pub fn get_job_directory(&self, experiment_id: &str, job: &JobConfig) -> PathBuf {
        self.get_experiment_directory(experiment_id)
            .join(&job.directory)
    }

    pub fn get_metadata_path(&self, experiment_id: &str) -> PathBuf {
        self.get_experiment_directory(experiment_id)
            .join(METADATA_FILE_NAME)
    }

    /// Check the config describes something that can be run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::Invalid(String::from(
                "max_attempts must be at least 1",
            )));
        }
        if !(self.restart_threshold > 0.0 && self.restart_threshold.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "restart_threshold must be positive, got {}",
                self.restart_threshold
            )));
        }
        if self.experiment_id.is_empty() || self.run_number.is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "experiment_id and run_number must not be empty",
            )));
        }
        if self.jobs.is_empty() {
            return Err(ConfigError::Invalid(String::from("no jobs configured")));
        }
        for job in self.jobs.iter() {
            if job.directory.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "job {} has no output directory",
                    job.name
                )));
            }
            if job.techniques.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "job {} has an empty technique list",
                    job.name
                )));
            }
            for technique in job.techniques.iter() {
                technique.validate()?;
            }
        }
        Ok(())
    }
}
