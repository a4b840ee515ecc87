use serde::{Deserialize, Serialize};

use super::error::TechniqueError;
use super::sample::TechniqueKind;

/// Open circuit voltage: rest the cell and record the potential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcvParams {
    pub rest_time: f64,       // s
    pub record_every_dt: f64, // s
}

/// Cyclic voltammetry between `start` and `vertex`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvParams {
    pub start: f64,  // V
    pub vertex: f64, // V
    pub scan_rate: f64, // V/s
    pub n_cycles: u32,
    pub record_every_de: f64, // V
}

/// Potentio electrochemical impedance spectroscopy, logarithmic sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeisParams {
    pub initial_frequency: f64, // Hz
    pub final_frequency: f64,   // Hz
    pub frequency_number: u32,
    pub amplitude_voltage: f64, // V
}

/// Chronopotentiometry: hold a current, record the potential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpParams {
    pub current: f64,  // A
    pub duration: f64, // s
    pub record_every_dt: f64,
}

/// Linear polarization sweep from `start` to `end`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LpParams {
    pub start: f64, // V
    pub end: f64,   // V
    pub scan_rate: f64,
    pub record_every_de: f64,
}

/// Chronoamperometry: hold a potential, record the current
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaParams {
    pub voltage: f64,
    pub duration: f64,
    pub record_every_dt: f64,
}

/// One entry of the technique list submitted to the instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TechniqueDescriptor {
    Ocv(OcvParams),
    Cv(CvParams),
    Peis(PeisParams),
    Cp(CpParams),
    Lp(LpParams),
    Ca(CaParams),
}

fn require_positive(
    kind: TechniqueKind,
    name: &'static str,
    value: f64,
) -> Result<(), TechniqueError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(TechniqueError::InvalidParameter {
            kind: kind.label().to_string(),
            name,
            value,
        })
    }
}

/// Number of `step`-sized increments needed to cover `span`, at least one
pub(crate) fn step_count(span: f64, step: f64) -> u64 {
    // Tolerance keeps 30.0 / 0.1 from rounding up to 301
    (span / step - 1e-9).ceil().max(1.0) as u64
}

impl TechniqueDescriptor {
    pub fn kind(&self) -> TechniqueKind {
        match self {
            Self::Ocv(_) => TechniqueKind::Ocv,
            Self::Cv(_) => TechniqueKind::Cv,
            Self::Peis(_) => TechniqueKind::Peis,
            Self::Cp(_) => TechniqueKind::Cp,
            Self::Lp(_) => TechniqueKind::Lp,
            Self::Ca(_) => TechniqueKind::Ca,
        }
    }

    /// Check that every duration, rate, step and count is positive
    pub fn validate(&self) -> Result<(), TechniqueError> {
        let kind = self.kind();
        match self {
            Self::Ocv(p) => {
                require_positive(kind, "rest_time", p.rest_time)?;
                require_positive(kind, "record_every_dt", p.record_every_dt)
            }
            Self::Cv(p) => {
                require_positive(kind, "scan_rate", p.scan_rate)?;
                require_positive(kind, "n_cycles", p.n_cycles as f64)?;
                require_positive(kind, "record_every_de", p.record_every_de)?;
                require_positive(kind, "vertex - start", (p.vertex - p.start).abs())
            }
            Self::Peis(p) => {
                require_positive(kind, "initial_frequency", p.initial_frequency)?;
                require_positive(kind, "final_frequency", p.final_frequency)?;
                require_positive(kind, "frequency_number", p.frequency_number as f64)?;
                require_positive(kind, "amplitude_voltage", p.amplitude_voltage)
            }
            Self::Cp(p) => {
                require_positive(kind, "duration", p.duration)?;
                require_positive(kind, "record_every_dt", p.record_every_dt)
            }
            Self::Lp(p) => {
                require_positive(kind, "scan_rate", p.scan_rate)?;
                require_positive(kind, "record_every_de", p.record_every_de)?;
                require_positive(kind, "end - start", (p.end - p.start).abs())
            }
            Self::Ca(p) => {
                require_positive(kind, "duration", p.duration)?;
                require_positive(kind, "record_every_dt", p.record_every_dt)
            }
        }
    }

    /// Number of samples the technique is expected to stream. Used for progress estimates.
    pub fn expected_samples(&self) -> u64 {
        let steps = step_count;
        match self {
            Self::Ocv(p) => steps(p.rest_time, p.record_every_dt),
            Self::Cv(p) => {
                steps(2.0 * (p.vertex - p.start).abs(), p.record_every_de) * p.n_cycles as u64
            }
            // One timed reading and one impedance point per frequency
            Self::Peis(p) => 2 * p.frequency_number as u64,
            Self::Cp(p) => steps(p.duration, p.record_every_dt),
            Self::Lp(p) => steps((p.end - p.start).abs(), p.record_every_de),
            Self::Ca(p) => steps(p.duration, p.record_every_dt),
        }
    }
}
