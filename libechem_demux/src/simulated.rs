use std::time::Duration;

use super::error::ConnectionError;
use super::instrument::{Connector, InstrumentConnection, SampleStream};
use super::sample::{FieldMap, Sample, TechniqueKind};
use super::technique::{step_count, TechniqueDescriptor};

/// Faults the simulated potentiostat can be told to produce
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Refuse this many connects before accepting one
    pub failed_connects: u32,
    /// Drop the first stream after this many samples
    pub drop_after: Option<u64>,
    /// Play this technique twice under the same run id, the clock restarting at zero
    pub replay_technique: Option<usize>,
}

/// A deterministic stand-in for the potentiostat.
///
/// Produces the same field sets as the real instrument for each technique, with smooth
/// synthetic traces. Used by the CLI and by tests.
#[derive(Debug, Default)]
pub struct SimulatedConnector {
    faults: FaultPlan,
    sample_interval: Option<Duration>,
    connect_calls: u32,
    streams_opened: u32,
}

impl SimulatedConnector {
    pub fn new(faults: FaultPlan) -> Self {
        Self {
            faults,
            ..Default::default()
        }
    }

    /// Wait this long before producing each sample, to mimic a live instrument
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = Some(interval);
        self
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls
    }
}

impl Connector for SimulatedConnector {
    fn connect(
        &mut self,
        port: &str,
        channel: u8,
    ) -> Result<Box<dyn InstrumentConnection + '_>, ConnectionError> {
        self.connect_calls += 1;
        if self.connect_calls <= self.faults.failed_connects {
            return Err(ConnectionError::ConnectFailed {
                port: port.to_string(),
                channel,
                reason: String::from("simulated instrument busy"),
            });
        }
        let first_stream = self.streams_opened == 0;
        self.streams_opened += 1;
        log::info!("Connected to simulated potentiostat on {port} channel {channel}");
        Ok(Box::new(SimulatedChannel {
            drop_after: if first_stream {
                self.faults.drop_after
            } else {
                None
            },
            replay_technique: self.faults.replay_technique,
            sample_interval: self.sample_interval,
        }))
    }
}

#[derive(Debug)]
pub struct SimulatedChannel {
    drop_after: Option<u64>,
    replay_technique: Option<usize>,
    sample_interval: Option<Duration>,
}

impl InstrumentConnection for SimulatedChannel {
    fn run_techniques(
        &mut self,
        techniques: &[TechniqueDescriptor],
    ) -> Result<SampleStream<'_>, ConnectionError> {
        if techniques.is_empty() {
            return Err(ConnectionError::Rejected(String::from(
                "no techniques submitted",
            )));
        }

        let mut generator = TraceGenerator::default();
        let mut samples = Vec::new();
        for (idx, technique) in techniques.iter().enumerate() {
            generator.generate(idx as u32, technique, &mut samples);
            if self.replay_technique == Some(idx) {
                generator.generate(idx as u32, technique, &mut samples);
            }
        }

        let interval = self.sample_interval;
        let paced = samples.into_iter().inspect(move |_| {
            if let Some(interval) = interval {
                std::thread::sleep(interval);
            }
        });
        let stream: SampleStream<'_> = match self.drop_after {
            Some(limit) => Box::new(paced.take(limit as usize).map(Ok).chain(std::iter::once(
                Err(ConnectionError::StreamDropped {
                    samples: limit,
                    reason: String::from("simulated USB reset"),
                }),
            ))),
            None => Box::new(paced.map(Ok)),
        };
        Ok(stream)
    }

    fn close(&mut self) -> Result<(), ConnectionError> {
        log::debug!("Released simulated potentiostat channel");
        Ok(())
    }
}

/// Synthesizes technique traces. Keeps the running ordinal and experiment clock.
#[derive(Debug, Default)]
struct TraceGenerator {
    ordinal: u64,
    total_time: f64,
}

impl TraceGenerator {
    fn push_raw(
        &mut self,
        run_id: u32,
        kind: TechniqueKind,
        fields: FieldMap,
        out: &mut Vec<Sample>,
    ) {
        out.push(Sample::raw(run_id, kind, self.ordinal, fields));
        self.ordinal += 1;
    }

    fn push_process(
        &mut self,
        run_id: u32,
        index: u8,
        fields: FieldMap,
        out: &mut Vec<Sample>,
    ) {
        out.push(Sample::process(
            run_id,
            TechniqueKind::Peis,
            self.ordinal,
            index,
            fields,
        ));
        self.ordinal += 1;
    }

    fn generate(&mut self, run_id: u32, technique: &TechniqueDescriptor, out: &mut Vec<Sample>) {
        let kind = technique.kind();
        let start_time = self.total_time;
        let mut time = 0.0;
        match technique {
            TechniqueDescriptor::Ocv(p) => {
                for i in 0..step_count(p.rest_time, p.record_every_dt) {
                    time = i as f64 * p.record_every_dt;
                    let ewe = 0.25 + 0.02 * (-time / 30.0).exp();
                    let fields = FieldMap::from_iter([
                        ("time", time),
                        ("total_time", start_time + time),
                        ("Ewe", ewe),
                        ("Ece", -0.1),
                    ]);
                    self.push_raw(run_id, kind, fields, out);
                }
            }
            TechniqueDescriptor::Cp(p) => {
                for i in 0..step_count(p.duration, p.record_every_dt) {
                    time = i as f64 * p.record_every_dt;
                    let ewe = -0.9 + 0.05 * (-time / 5.0).exp();
                    let fields = FieldMap::from_iter([
                        ("time", time),
                        ("total_time", start_time + time),
                        ("Ewe", ewe),
                        ("I", p.current),
                        ("cycle", 0.0),
                    ]);
                    self.push_raw(run_id, kind, fields, out);
                }
            }
            TechniqueDescriptor::Ca(p) => {
                for i in 0..step_count(p.duration, p.record_every_dt) {
                    time = i as f64 * p.record_every_dt;
                    let current = 1e-3 * p.voltage.signum() * (-time / 10.0).exp();
                    let fields = FieldMap::from_iter([
                        ("time", time),
                        ("total_time", start_time + time),
                        ("Ewe", p.voltage),
                        ("I", current),
                        ("cycle", 0.0),
                    ]);
                    self.push_raw(run_id, kind, fields, out);
                }
            }
            TechniqueDescriptor::Cv(p) => {
                let span = (p.vertex - p.start).abs();
                let direction = (p.vertex - p.start).signum();
                let dt = p.record_every_de / p.scan_rate;
                let per_cycle = step_count(2.0 * span, p.record_every_de);
                for cycle in 0..p.n_cycles as u64 {
                    for k in 0..per_cycle {
                        time = (cycle * per_cycle + k) as f64 * dt;
                        let travelled = k as f64 * p.record_every_de;
                        let (potential, sweep) = if travelled <= span {
                            (p.start + direction * travelled, direction)
                        } else {
                            (p.vertex - direction * (travelled - span), -direction)
                        };
                        let current = 1e-4 * (potential - p.start) / span + 2e-5 * sweep;
                        let fields = FieldMap::from_iter([
                            ("time", time),
                            ("total_time", start_time + time),
                            ("Ec", potential),
                            ("I_avg", current),
                            ("Ewe_avg", potential),
                            ("cycle", cycle as f64),
                        ]);
                        self.push_raw(run_id, kind, fields, out);
                    }
                }
            }
            TechniqueDescriptor::Lp(p) => {
                let direction = (p.end - p.start).signum();
                let dt = p.record_every_de / p.scan_rate;
                for k in 0..step_count((p.end - p.start).abs(), p.record_every_de) {
                    time = k as f64 * dt;
                    let potential = p.start + direction * k as f64 * p.record_every_de;
                    let current = 1e-6 * (potential / 0.05).sinh();
                    let fields = FieldMap::from_iter([
                        ("time", time),
                        ("total_time", start_time + time),
                        ("Ewe", potential),
                        ("Ec", potential),
                        ("I_avg", current),
                        ("Ewe_avg", potential),
                    ]);
                    self.push_raw(run_id, kind, fields, out);
                }
            }
            TechniqueDescriptor::Peis(p) => {
                // Randles cell: solution resistance in series with R_ct || C_dl
                let (r_s, r_ct, c_dl) = (10.0, 100.0, 1e-5);
                let n = p.frequency_number.max(1);
                for k in 0..n {
                    let fraction = if n == 1 {
                        0.0
                    } else {
                        k as f64 / (n - 1) as f64
                    };
                    let ratio = p.final_frequency / p.initial_frequency;
                    let freq = p.initial_frequency * ratio.powf(fraction);
                    time = k as f64;
                    let raw = FieldMap::from_iter([
                        ("time", time),
                        ("total_time", start_time + time),
                        ("Ewe", 0.0),
                        ("I", 0.0),
                    ]);
                    self.push_process(run_id, 0, raw, out);

                    let wrc = 2.0 * std::f64::consts::PI * freq * r_ct * c_dl;
                    let re_z = r_s + r_ct / (1.0 + wrc * wrc);
                    let im_z = -r_ct * wrc / (1.0 + wrc * wrc);
                    let modulus = (re_z * re_z + im_z * im_z).sqrt();
                    let point = FieldMap::from_iter([
                        ("freq", freq),
                        ("Ewe_mod", p.amplitude_voltage),
                        ("I_mod", p.amplitude_voltage / modulus),
                        ("phase_Zwe", im_z.atan2(re_z)),
                        ("Re(Z)", re_z),
                        ("Im(Z)", im_z),
                        ("|Z|", modulus),
                    ]);
                    self.push_process(run_id, 1, point, out);
                }
            }
        }
        self.total_time = start_time + time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_accumulator::BatchAccumulator;
    use crate::boundary_detector::BoundaryDetector;
    use crate::sink::MemorySink;
    use crate::technique::{CpParams, OcvParams, PeisParams};

    fn techniques() -> Vec<TechniqueDescriptor> {
        vec![
            TechniqueDescriptor::Ocv(OcvParams {
                rest_time: 5.0,
                record_every_dt: 0.5,
            }),
            TechniqueDescriptor::Cp(CpParams {
                current: -0.002,
                duration: 3.0,
                record_every_dt: 0.5,
            }),
            TechniqueDescriptor::Peis(PeisParams {
                initial_frequency: 1e5,
                final_frequency: 1.0,
                frequency_number: 6,
                amplitude_voltage: 0.01,
            }),
        ]
    }

    fn drain(connector: &mut SimulatedConnector) -> Vec<Result<Sample, ConnectionError>> {
        let techniques = techniques();
        let mut connection = connector.connect("USB0", 1).unwrap();
        let samples = connection.run_techniques(&techniques).unwrap().collect();
        connection.close().unwrap();
        samples
    }

    #[test]
    fn test_streams_expected_samples() {
        let mut connector = SimulatedConnector::default();
        let samples: Vec<Sample> = drain(&mut connector)
            .into_iter()
            .map(|s| s.unwrap())
            .collect();
        let expected: u64 = techniques().iter().map(|t| t.expected_samples()).sum();
        assert_eq!(samples.len() as u64, expected);
        assert!(samples
            .iter()
            .filter(|s| s.technique_kind == TechniqueKind::Peis)
            .all(|s| s.is_process_sample()));
        let ordinals: Vec<u64> = samples.iter().map(|s| s.ordinal).collect();
        assert_eq!(ordinals, (0..expected).collect::<Vec<u64>>());
    }

    #[test]
    fn test_refuses_configured_connects() {
        let mut connector = SimulatedConnector::new(FaultPlan {
            failed_connects: 2,
            ..Default::default()
        });
        assert!(connector.connect("USB0", 1).is_err());
        assert!(connector.connect("USB0", 1).is_err());
        assert!(connector.connect("USB0", 1).is_ok());
        assert_eq!(connector.connect_calls(), 3);
    }

    #[test]
    fn test_drops_only_first_stream() {
        let mut connector = SimulatedConnector::new(FaultPlan {
            drop_after: Some(4),
            ..Default::default()
        });
        let first = drain(&mut connector);
        assert_eq!(first.len(), 5);
        assert!(matches!(
            first.last(),
            Some(Err(ConnectionError::StreamDropped { samples: 4, .. }))
        ));
        assert!(drain(&mut connector).iter().all(|s| s.is_ok()));
    }

    #[test]
    fn test_replay_is_split_by_the_detector() {
        let mut connector = SimulatedConnector::new(FaultPlan {
            replay_technique: Some(0),
            ..Default::default()
        });
        let mut detector = BoundaryDetector::default();
        let mut accumulator = BatchAccumulator::new();
        let mut sink = MemorySink::new();
        for sample in drain(&mut connector) {
            let sample = sample.unwrap();
            let verdict = detector.classify(&sample);
            accumulator.on_sample(sample, verdict, &mut sink).unwrap();
        }
        accumulator.flush_if_non_empty(&mut sink).unwrap();
        assert_eq!(sink.sizes(), vec![10, 10, 6, 12]);
        assert_eq!(sink.sequence_ids(), vec![0, 2, 3, 4]);
    }
}
