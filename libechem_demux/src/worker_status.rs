#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BarColor {
    #[default]
    CYAN,
    MAGENTA,
    RED,
    GREEN,
}

/// Where a job is in its life
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobPhase {
    #[default]
    Connecting,
    Streaming,
    Backoff,
    Done,
    Failed,
}

impl JobPhase {
    pub fn color(&self) -> BarColor {
        match self {
            Self::Connecting => BarColor::MAGENTA,
            Self::Streaming => BarColor::CYAN,
            Self::Backoff | Self::Failed => BarColor::RED,
            Self::Done => BarColor::GREEN,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub progress: f32,
    pub job_index: usize,
    pub job_name: String,
    pub batches_written: u64,
    pub phase: JobPhase,
}

impl WorkerStatus {
    pub fn new(
        progress: f32,
        job_index: usize,
        job_name: &str,
        batches_written: u64,
        phase: JobPhase,
    ) -> Self {
        Self {
            progress,
            job_index,
            job_name: job_name.to_string(),
            batches_written,
            phase,
        }
    }

    pub fn color(&self) -> BarColor {
        self.phase.color()
    }
}
