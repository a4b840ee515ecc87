use super::constants::DEFAULT_RESTART_THRESHOLD;
use super::sample::{Sample, TechniqueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    SameBatch,
    NewBatch,
}

/// The decision made for a single sample.
///
/// `bump_offset` is only ever set together with `Boundary::NewBatch`; it asks the caller to
/// advance the numbering offset for every batch flushed from now on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub boundary: Boundary,
    pub bump_offset: bool,
}

impl Verdict {
    pub const SAME: Verdict = Verdict {
        boundary: Boundary::SameBatch,
        bump_offset: false,
    };
    pub const NEW: Verdict = Verdict {
        boundary: Boundary::NewBatch,
        bump_offset: false,
    };
    pub const RESTART: Verdict = Verdict {
        boundary: Boundary::NewBatch,
        bump_offset: true,
    };

    pub fn is_new_batch(&self) -> bool {
        self.boundary == Boundary::NewBatch
    }
}

/// BoundaryDetector decides where one technique execution ends and the next begins.
///
/// The instrument run id is the primary signal. Certain instrument restarts replay a technique
/// without incrementing the id; the only hint left is the raw `time` field jumping backwards,
/// so a backwards jump larger than `restart_threshold` under a constant id is also taken as a
/// boundary. The threshold is empirical: techniques with coarse time steps can trip it, and a
/// restart with a small backwards jump slips through.
#[derive(Debug, Clone)]
pub struct BoundaryDetector {
    last_technique_run_id: Option<u32>,
    last_technique_kind: Option<TechniqueKind>,
    previous_time: f64,
    current_time: f64,
    restart_threshold: f64,
}

impl Default for BoundaryDetector {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_THRESHOLD)
    }
}

impl BoundaryDetector {
    pub fn new(restart_threshold: f64) -> Self {
        Self {
            last_technique_run_id: None,
            last_technique_kind: None,
            previous_time: 0.0,
            current_time: 0.0,
            restart_threshold,
        }
    }

    /// Forget everything seen so far. Used when the instrument replays a run from scratch.
    pub fn reset(&mut self) {
        *self = Self::new(self.restart_threshold);
    }

    pub fn restart_threshold(&self) -> f64 {
        self.restart_threshold
    }

    /// Classify a sample against everything seen before it.
    pub fn classify(&mut self, sample: &Sample) -> Verdict {
        let previous_run_id = self.last_technique_run_id.replace(sample.technique_run_id);
        let previous_kind = self.last_technique_kind.replace(sample.technique_kind);

        // The clock is tracked for every raw timed sample, including the first of a new run,
        // so a fresh run is never compared against the previous run's clock.
        let mut clock_went_back = false;
        if let Some(time) = sample.time() {
            self.previous_time = self.current_time;
            self.current_time = time;
            clock_went_back = self.previous_time - self.restart_threshold > self.current_time;
        }

        match previous_run_id {
            None => Verdict::NEW,
            Some(run_id) if run_id != sample.technique_run_id => Verdict::NEW,
            Some(run_id) => {
                if clock_went_back {
                    log::info!(
                        "Detected a restart of technique run {} (time went from {} to {}); advancing the numbering offset",
                        run_id,
                        self.previous_time,
                        self.current_time
                    );
                    Verdict::RESTART
                } else if previous_kind.is_some_and(|kind| kind != sample.technique_kind) {
                    log::warn!(
                        "Technique run {} changed kind from {:?} to {} without a new run id; starting a new batch",
                        run_id,
                        previous_kind,
                        sample.technique_kind
                    );
                    Verdict::NEW
                } else {
                    Verdict::SAME
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::FieldMap;

    fn timed(run_id: u32, time: f64) -> Sample {
        Sample::raw(
            run_id,
            TechniqueKind::Ocv,
            0,
            FieldMap::from_iter([("time", time), ("Ewe", 0.25)]),
        )
    }

    #[test]
    fn test_first_sample_opens_a_batch() {
        let mut detector = BoundaryDetector::default();
        assert_eq!(detector.classify(&timed(0, 0.0)), Verdict::NEW);
        assert_eq!(detector.classify(&timed(0, 0.1)), Verdict::SAME);
    }

    #[test]
    fn test_run_id_change_is_a_boundary() {
        let mut detector = BoundaryDetector::default();
        let verdicts: Vec<Verdict> = [(0, 0.0), (0, 1.0), (1, 0.0), (1, 1.0), (2, 0.0)]
            .iter()
            .map(|(id, t)| detector.classify(&timed(*id, *t)))
            .collect();
        assert_eq!(
            verdicts,
            vec![
                Verdict::NEW,
                Verdict::SAME,
                Verdict::NEW,
                Verdict::SAME,
                Verdict::NEW
            ]
        );
    }

    #[test]
    fn test_backwards_clock_under_same_id_is_a_restart() {
        let mut detector = BoundaryDetector::default();
        detector.classify(&timed(0, 0.0));
        detector.classify(&timed(0, 1.0));
        detector.classify(&timed(0, 3.0));
        assert_eq!(detector.classify(&timed(0, 0.5)), Verdict::RESTART);
        assert_eq!(detector.classify(&timed(0, 0.6)), Verdict::SAME);
    }

    #[test]
    fn test_small_backwards_jump_is_not_a_restart() {
        // 2.0 - 2 > 0.5 does not hold, so this stays one batch
        let mut detector = BoundaryDetector::default();
        for t in [0.0, 1.0, 2.0] {
            detector.classify(&timed(0, t));
        }
        assert_eq!(detector.classify(&timed(0, 0.5)), Verdict::SAME);
    }

    #[test]
    fn test_new_run_is_not_compared_against_old_clock() {
        let mut detector = BoundaryDetector::default();
        detector.classify(&timed(0, 9.0));
        assert_eq!(detector.classify(&timed(1, 0.0)), Verdict::NEW);
        assert_eq!(detector.classify(&timed(1, 0.1)), Verdict::SAME);
    }

    #[test]
    fn test_restart_after_run_change_only_opens_batch() {
        let mut detector = BoundaryDetector::default();
        detector.classify(&timed(1, 3.0));
        // Id changed: rule 2 wins and the offset is left alone
        assert_eq!(detector.classify(&timed(0, 0.0)), Verdict::NEW);
    }

    #[test]
    fn test_process_and_untimed_samples_skip_clock() {
        let mut detector = BoundaryDetector::default();
        detector.classify(&timed(0, 10.0));
        let process = Sample::process(
            0,
            TechniqueKind::Ocv,
            1,
            1,
            FieldMap::from_iter([("time", 0.0), ("freq", 100.0)]),
        );
        assert_eq!(detector.classify(&process), Verdict::SAME);
        let untimed = Sample::raw(0, TechniqueKind::Ocv, 2, FieldMap::from_iter([("Ewe", 0.1)]));
        assert_eq!(detector.classify(&untimed), Verdict::SAME);
        assert_eq!(detector.classify(&timed(0, 10.5)), Verdict::SAME);
    }

    #[test]
    fn test_kind_change_under_same_id_is_a_boundary() {
        let mut detector = BoundaryDetector::default();
        detector.classify(&timed(0, 0.0));
        let cp = Sample::raw(0, TechniqueKind::Cp, 1, FieldMap::from_iter([("time", 0.1)]));
        assert_eq!(detector.classify(&cp), Verdict::NEW);
    }

    #[test]
    fn test_threshold_is_tunable() {
        let mut detector = BoundaryDetector::new(0.1);
        detector.classify(&timed(0, 0.0));
        detector.classify(&timed(0, 0.5));
        assert_eq!(detector.classify(&timed(0, 0.2)), Verdict::RESTART);
        detector.reset();
        assert_eq!(detector.restart_threshold(), 0.1);
        assert_eq!(detector.classify(&timed(0, 0.0)), Verdict::NEW);
    }
}
