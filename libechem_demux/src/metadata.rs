use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use time::macros::format_description;
use time::OffsetDateTime;

use super::config::Config;
use super::error::MetadataError;
use super::sink::BatchLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Running,
    Completed,
    Failed,
}

/// The current local time, or UTC when the local offset cannot be determined
pub fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn format_date(moment: OffsetDateTime) -> Result<String, MetadataError> {
    Ok(moment.format(format_description!("[year][month][day]"))?)
}

fn format_time(moment: OffsetDateTime) -> Result<String, MetadataError> {
    Ok(moment.format(format_description!("[hour]:[minute]:[second]"))?)
}

/// The `metadata.json` stored at the top of every experiment directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    pub date: String,
    pub time: String,
    #[serde(rename = "runNumber")]
    pub run_number: String,
    #[serde(rename = "experimentID")]
    pub experiment_id: String,
    pub cell: String,
    pub notes: String,
    pub status: ExperimentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Batch locations per job name
    #[serde(default)]
    pub batches: BTreeMap<String, Vec<String>>,
}

impl ExperimentMetadata {
    pub fn new(
        config: &Config,
        experiment_id: &str,
        started: OffsetDateTime,
    ) -> Result<Self, MetadataError> {
        Ok(Self {
            date: format_date(started)?,
            time: format_time(started)?,
            run_number: config.run_number.clone(),
            experiment_id: experiment_id.to_string(),
            cell: config.cell.clone(),
            notes: config.notes.clone(),
            status: ExperimentStatus::Running,
            completion_time: None,
            error: None,
            batches: BTreeMap::new(),
        })
    }

    pub fn record_batches(&mut self, job_name: &str, locations: &[BatchLocation]) {
        self.batches
            .entry(job_name.to_string())
            .or_default()
            .extend(locations.iter().map(|location| location.to_string()));
    }

    pub fn mark_completed(&mut self, finished: OffsetDateTime) -> Result<(), MetadataError> {
        self.status = ExperimentStatus::Completed;
        self.completion_time = Some(format_time(finished)?);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        finished: OffsetDateTime,
        error: &str,
    ) -> Result<(), MetadataError> {
        self.status = ExperimentStatus::Failed;
        self.completion_time = Some(format_time(finished)?);
        self.error = Some(error.to_string());
        Ok(())
    }

    pub fn write(&self, path: &Path) -> Result<(), MetadataError> {
        let json_str = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json_str)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, MetadataError> {
        let json_str = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str::<Self>(&json_str)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use time::macros::datetime;

    #[test]
    fn test_status_transitions_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        let config = Config::default();
        let started = datetime!(2024-03-07 09:05:01 UTC);
        let mut metadata = ExperimentMetadata::new(&config, "20240307_001", started).unwrap();
        assert_eq!(metadata.date, "20240307");
        assert_eq!(metadata.time, "09:05:01");
        metadata.write(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"status\": \"running\""));
        assert!(text.contains("\"runNumber\": \"001\""));
        assert!(text.contains("\"experimentID\": \"20240307_001\""));
        assert!(!text.contains("run_number"));
        assert!(!text.contains("completion_time"));

        metadata.record_batches(
            "deposition",
            &[BatchLocation::File(PathBuf::from("d/20240307_001_0_OCV.csv"))],
        );
        metadata
            .mark_completed(datetime!(2024-03-07 09:20:00 UTC))
            .unwrap();
        metadata.write(&path).unwrap();
        let read = ExperimentMetadata::read(&path).unwrap();
        assert_eq!(read.status, ExperimentStatus::Completed);
        assert_eq!(read.completion_time.as_deref(), Some("09:20:00"));
        assert_eq!(read.batches["deposition"], vec!["d/20240307_001_0_OCV.csv"]);
    }

    #[test]
    fn test_failure_records_error() {
        let config = Config::default();
        let moment = datetime!(2024-03-07 09:05:01 UTC);
        let mut metadata = ExperimentMetadata::new(&config, "x", moment).unwrap();
        metadata.mark_failed(moment, "instrument busy").unwrap();
        assert_eq!(metadata.status, ExperimentStatus::Failed);
        assert_eq!(metadata.error.as_deref(), Some("instrument busy"));
    }
}
