/// Connect attempts per run before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Seconds to wait between connect attempts
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 50;
/// Backwards jump of the time field (seconds) taken as a silent technique restart
pub const DEFAULT_RESTART_THRESHOLD: f64 = 2.0;
pub const DEFAULT_PORT: &str = "USB0";
pub const DEFAULT_CHANNEL: u8 = 1;

/// Name of the raw-sample field used by the restart heuristic
pub const TIME_FIELD: &str = "time";

pub const AUTO_EXPERIMENT_ID: &str = "auto";
pub const METADATA_FILE_NAME: &str = "metadata.json";
pub const BATCH_FILE_EXTENSION: &str = "csv";

/// Fraction of a run between two progress messages
pub const PROGRESS_STEP: f32 = 0.01;
