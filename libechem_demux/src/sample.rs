use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

use super::constants::TIME_FIELD;
use super::error::TechniqueError;

/// The electrochemical technique that produced a sample.
///
/// Supplied by the instrument adapter when a sample is constructed. The label is embedded in
/// every output file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TechniqueKind {
    Ocv,
    Cv,
    Peis,
    Cp,
    Lp,
    Ca,
}

impl TechniqueKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ocv => "OCV",
            Self::Cv => "CV",
            Self::Peis => "PEIS",
            Self::Cp => "CP",
            Self::Lp => "LP",
            Self::Ca => "CA",
        }
    }
}

impl Display for TechniqueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for TechniqueKind {
    type Err = TechniqueError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ocv" => Ok(Self::Ocv),
            "cv" => Ok(Self::Cv),
            "peis" => Ok(Self::Peis),
            "cp" => Ok(Self::Cp),
            "lp" => Ok(Self::Lp),
            "ca" => Ok(Self::Ca),
            _ => Err(TechniqueError::UnknownKind(s.to_string())),
        }
    }
}

/// Field name to value mapping which remembers insertion order.
///
/// The set of fields differs per technique (and per process index for impedance data), so
/// rows are kept as small ordered lists rather than fixed structs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    entries: Vec<(String, f64)>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field. An existing field keeps its position and takes the new value.
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(key, _)| key == name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for FieldMap {
    fn from_iter<T: IntoIterator<Item = (S, f64)>>(iter: T) -> Self {
        let mut map = FieldMap::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

/// The data carried by a sample.
///
/// Raw readings are timed measurements. Process readings are points the instrument derives
/// (e.g. one impedance point per frequency) and are tagged with their process index.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(FieldMap),
    Process { index: u8, fields: FieldMap },
}

/// A single measurement record streamed by the instrument
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub technique_run_id: u32,
    pub technique_kind: TechniqueKind,
    pub ordinal: u64,
    pub payload: Payload,
}

impl Sample {
    pub fn raw(
        technique_run_id: u32,
        technique_kind: TechniqueKind,
        ordinal: u64,
        fields: FieldMap,
    ) -> Self {
        Self {
            technique_run_id,
            technique_kind,
            ordinal,
            payload: Payload::Raw(fields),
        }
    }

    pub fn process(
        technique_run_id: u32,
        technique_kind: TechniqueKind,
        ordinal: u64,
        index: u8,
        fields: FieldMap,
    ) -> Self {
        Self {
            technique_run_id,
            technique_kind,
            ordinal,
            payload: Payload::Process { index, fields },
        }
    }

    pub fn is_process_sample(&self) -> bool {
        matches!(self.payload, Payload::Process { .. })
    }

    /// The fields of whichever payload produced this sample
    pub fn fields(&self) -> &FieldMap {
        match &self.payload {
            Payload::Raw(fields) => fields,
            Payload::Process { fields, .. } => fields,
        }
    }

    /// The time of a raw reading. Process readings never report a time here.
    pub fn time(&self) -> Option<f64> {
        match &self.payload {
            Payload::Raw(fields) => fields.get(TIME_FIELD),
            Payload::Process { .. } => None,
        }
    }

    /// Consume the sample, giving the table row it contributes
    pub fn into_row(self) -> FieldMap {
        match self.payload {
            Payload::Raw(fields) => fields,
            Payload::Process { fields, .. } => fields,
        }
    }
}
