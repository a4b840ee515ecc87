use super::batch::Batch;
use super::boundary_detector::Verdict;
use super::error::AccumulatorError;
use super::sample::{Sample, TechniqueKind};
use super::sink::{BatchLocation, PersistenceSink};

/// Record of a batch that was handed to the sink
#[derive(Debug, Clone, PartialEq)]
pub struct FlushedBatch {
    pub sequence_id: u64,
    pub technique_run_id: u32,
    pub technique_kind: TechniqueKind,
    pub rows: usize,
    pub location: BatchLocation,
}

/// BatchAccumulator takes classified Samples and composes them into Batches.
///
/// It owns the single open batch and the numbering state. When the detector reports a new
/// batch, the open one is flushed to the sink before the sample is appended to a fresh batch.
/// Nothing is buffered beyond the open batch, so every sample lands in exactly one flush.
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    open: Option<Batch>,
    flush_counter: u64,
    run_base_offset: u64,
    last_flushed: Option<(u32, u64)>,
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start numbering at `first_sequence_id`, continuing a previous job's output
    pub fn with_start(first_sequence_id: u64) -> Self {
        Self {
            open: None,
            flush_counter: first_sequence_id,
            run_base_offset: 0,
            last_flushed: None,
        }
    }

    /// Append a sample according to its verdict.
    ///
    /// Returns the batch that was flushed to make room, if any.
    pub fn on_sample<S: PersistenceSink + ?Sized>(
        &mut self,
        sample: Sample,
        verdict: Verdict,
        sink: &mut S,
    ) -> Result<Option<FlushedBatch>, AccumulatorError> {
        let mut flushed = None;
        if verdict.is_new_batch() {
            flushed = self.flush_if_non_empty(sink)?;
            // Only batches flushed after this point take the new offset
            if verdict.bump_offset {
                self.run_base_offset += 1;
            }
        }

        let kind = sample.technique_kind;
        let run_id = sample.technique_run_id;
        self.open
            .get_or_insert_with(|| Batch::new(kind, run_id))
            .push_row(sample.into_row());
        Ok(flushed)
    }

    /// Flush the open batch, if there is one with rows in it.
    ///
    /// Used at the end of a stream. Flushing an empty accumulator does not touch the sink and
    /// does not use up a sequence id.
    pub fn flush_if_non_empty<S: PersistenceSink + ?Sized>(
        &mut self,
        sink: &mut S,
    ) -> Result<Option<FlushedBatch>, AccumulatorError> {
        let mut batch = match self.open.take() {
            Some(batch) if !batch.is_empty() => batch,
            _ => return Ok(None),
        };

        let sequence_id = self.next_sequence_id();
        self.flush_counter += 1;
        batch.assign_sequence_id(sequence_id);

        let location = sink.write(&batch).map_err(|source| {
            AccumulatorError::persist(source, batch.technique_run_id(), sequence_id)
        })?;
        self.last_flushed = Some((batch.technique_run_id(), sequence_id));

        Ok(Some(FlushedBatch {
            sequence_id,
            technique_run_id: batch.technique_run_id(),
            technique_kind: batch.technique_kind(),
            rows: batch.len(),
            location,
        }))
    }

    /// Wait until the sink holds every flushed batch.
    ///
    /// A failure the sink cannot attribute is charged to the last batch flushed.
    pub fn sync<S: PersistenceSink + ?Sized>(&self, sink: &mut S) -> Result<(), AccumulatorError> {
        sink.sync().map_err(|source| {
            let (run_id, sequence_id) = self
                .last_flushed
                .unwrap_or((0, self.next_sequence_id()));
            AccumulatorError::persist(source, run_id, sequence_id)
        })
    }

    /// Drop the open batch without persisting it. Returns the number of rows lost.
    pub fn discard_open_batch(&mut self) -> usize {
        self.open.take().map(|batch| batch.len()).unwrap_or(0)
    }

    /// The id the next flushed batch will get
    pub fn next_sequence_id(&self) -> u64 {
        self.run_base_offset + self.flush_counter
    }

    pub fn run_base_offset(&self) -> u64 {
        self.run_base_offset
    }

    pub fn open_len(&self) -> usize {
        self.open.as_ref().map(|batch| batch.len()).unwrap_or(0)
    }

    pub fn open_technique_run_id(&self) -> Option<u32> {
        self.open.as_ref().map(|batch| batch.technique_run_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary_detector::BoundaryDetector;
    use crate::error::SinkError;
    use crate::sample::FieldMap;
    use crate::sink::MemorySink;

    fn timed(run_id: u32, kind: TechniqueKind, ordinal: u64, time: f64) -> Sample {
        Sample::raw(
            run_id,
            kind,
            ordinal,
            FieldMap::from_iter([("time", time), ("ordinal", ordinal as f64)]),
        )
    }

    /// Feed a stream through a fresh detector and accumulator into a memory sink
    fn demux(samples: Vec<Sample>) -> (MemorySink, BatchAccumulator) {
        let mut detector = BoundaryDetector::default();
        let mut accumulator = BatchAccumulator::new();
        let mut sink = MemorySink::new();
        for sample in samples {
            let verdict = detector.classify(&sample);
            accumulator.on_sample(sample, verdict, &mut sink).unwrap();
        }
        accumulator.flush_if_non_empty(&mut sink).unwrap();
        (sink, accumulator)
    }

    fn stream(ids: &[u32], times: &[f64]) -> Vec<Sample> {
        ids.iter()
            .zip(times)
            .enumerate()
            .map(|(idx, (id, t))| timed(*id, TechniqueKind::Ocv, idx as u64, *t))
            .collect()
    }

    #[test]
    fn test_run_id_boundaries() {
        let (sink, _) = demux(stream(&[0, 0, 0, 1, 1, 2], &[0.0, 0.1, 0.2, 0.3, 0.4, 0.5]));
        assert_eq!(sink.sizes(), vec![3, 2, 1]);
        assert_eq!(sink.sequence_ids(), vec![0, 1, 2]);
    }

    #[test]
    fn test_restart_advances_offset() {
        let (sink, accumulator) = demux(stream(&[0, 0, 0, 0], &[0.0, 1.0, 3.0, 0.5]));
        assert_eq!(sink.sizes(), vec![3, 1]);
        // Without the offset the second batch would be numbered 1
        assert_eq!(sink.sequence_ids(), vec![0, 2]);
        assert_eq!(accumulator.run_base_offset(), 1);
        assert_eq!(accumulator.next_sequence_id(), 3);
    }

    #[test]
    fn test_every_sample_lands_once_in_order() {
        let ids = [0, 0, 1, 1, 1, 1, 2, 3, 3];
        let times = [0.0, 0.5, 0.0, 5.0, 1.0, 1.5, 0.0, 0.0, 0.1];
        let (sink, _) = demux(stream(&ids, &times));
        let ordinals: Vec<f64> = sink
            .batches
            .iter()
            .flat_map(|batch| batch.rows().iter().filter_map(|row| row.get("ordinal")))
            .collect();
        assert_eq!(ordinals, (0..9).map(|o| o as f64).collect::<Vec<f64>>());
        assert_eq!(sink.sizes(), vec![2, 2, 2, 1, 2]);
    }

    #[test]
    fn test_scenario_ocv_cp_ocv() {
        let mut samples = Vec::new();
        let mut ordinal = 0;
        for i in 0..10 {
            samples.push(timed(0, TechniqueKind::Ocv, ordinal, i as f64 * 0.1));
            ordinal += 1;
        }
        for i in 0..5 {
            samples.push(timed(1, TechniqueKind::Cp, ordinal, i as f64 * 0.1));
            ordinal += 1;
        }
        for i in 0..3 {
            samples.push(timed(0, TechniqueKind::Ocv, ordinal, i as f64 * 0.1));
            ordinal += 1;
        }
        let (sink, accumulator) = demux(samples);
        assert_eq!(sink.sizes(), vec![10, 5, 3]);
        assert_eq!(sink.sequence_ids(), vec![0, 1, 2]);
        // Returning to an old id is caught by the id change alone
        assert_eq!(accumulator.run_base_offset(), 0);
        for batch in sink.batches.iter() {
            let expected = if batch.technique_run_id() == 1 {
                TechniqueKind::Cp
            } else {
                TechniqueKind::Ocv
            };
            assert_eq!(batch.technique_kind(), expected);
        }
    }

    #[test]
    fn test_scenario_replayed_id_with_clock_reset() {
        let mut samples = Vec::new();
        for i in 0..10 {
            samples.push(timed(0, TechniqueKind::Ocv, i, i as f64 * 0.1));
        }
        for (i, t) in [0.0, 1.0, 2.0, 3.0, 0.0, 0.1, 0.2].iter().enumerate() {
            samples.push(timed(1, TechniqueKind::Cp, 10 + i as u64, *t));
        }
        let (sink, accumulator) = demux(samples);
        assert_eq!(sink.sizes(), vec![10, 4, 3]);
        assert_eq!(sink.sequence_ids(), vec![0, 1, 3]);
        assert_eq!(accumulator.run_base_offset(), 1);
    }

    #[test]
    fn test_flush_of_empty_accumulator_is_noop() {
        let mut accumulator = BatchAccumulator::new();
        let mut sink = MemorySink::new();
        assert_eq!(accumulator.flush_if_non_empty(&mut sink).unwrap(), None);
        assert_eq!(accumulator.flush_if_non_empty(&mut sink).unwrap(), None);
        assert!(sink.batches.is_empty());
        assert_eq!(accumulator.next_sequence_id(), 0);
    }

    #[test]
    fn test_process_rows_are_not_merged_with_raw() {
        let mut detector = BoundaryDetector::default();
        let mut accumulator = BatchAccumulator::new();
        let mut sink = MemorySink::new();
        let samples = vec![
            Sample::process(
                0,
                TechniqueKind::Peis,
                0,
                0,
                FieldMap::from_iter([("time", 0.0), ("Ewe", 0.1), ("I", 1e-4)]),
            ),
            Sample::process(
                0,
                TechniqueKind::Peis,
                1,
                1,
                FieldMap::from_iter([("freq", 1e5), ("Re(Z)", 10.0), ("Im(Z)", -0.5)]),
            ),
        ];
        for sample in samples {
            let verdict = detector.classify(&sample);
            accumulator.on_sample(sample, verdict, &mut sink).unwrap();
        }
        accumulator.flush_if_non_empty(&mut sink).unwrap();
        let rows = sink.batches[0].rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 3);
        assert!(!rows[0].contains("freq"));
        assert!(!rows[1].contains("time"));
    }

    #[test]
    fn test_sink_failure_propagates_with_ids() {
        let mut detector = BoundaryDetector::default();
        let mut accumulator = BatchAccumulator::new();
        let mut sink = MemorySink::rejecting(0);
        let mut result = Ok(None);
        for sample in stream(&[0, 0, 1], &[0.0, 0.1, 0.0]) {
            let verdict = detector.classify(&sample);
            result = accumulator.on_sample(sample, verdict, &mut sink);
            if result.is_err() {
                break;
            }
        }
        match result {
            Err(AccumulatorError::Persist {
                run_id,
                sequence_id,
                source: SinkError::Rejected(_),
            }) => {
                assert_eq!(run_id, 0);
                assert_eq!(sequence_id, 0);
            }
            other => panic!("expected a persistence failure, got {other:?}"),
        }
        assert!(sink.batches.is_empty());
    }

    #[test]
    fn test_continue_numbering_and_discard() {
        let mut accumulator = BatchAccumulator::with_start(7);
        let mut sink = MemorySink::new();
        accumulator
            .on_sample(timed(0, TechniqueKind::Cv, 0, 0.0), Verdict::NEW, &mut sink)
            .unwrap();
        accumulator
            .on_sample(timed(0, TechniqueKind::Cv, 1, 0.1), Verdict::SAME, &mut sink)
            .unwrap();
        assert_eq!(accumulator.open_len(), 2);
        assert_eq!(accumulator.open_technique_run_id(), Some(0));
        assert_eq!(accumulator.discard_open_batch(), 2);
        assert_eq!(accumulator.open_len(), 0);
        accumulator
            .on_sample(timed(1, TechniqueKind::Cv, 2, 0.0), Verdict::NEW, &mut sink)
            .unwrap();
        let flushed = accumulator.flush_if_non_empty(&mut sink).unwrap().unwrap();
        assert_eq!(flushed.sequence_id, 7);
        assert_eq!(flushed.rows, 1);
        assert_eq!(flushed.location, BatchLocation::Memory(0));
    }
}
