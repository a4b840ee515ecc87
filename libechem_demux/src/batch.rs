use fxhash::FxHashSet;

use super::sample::{FieldMap, TechniqueKind};

/// The ordered rows of one technique execution, destined for one output table.
///
/// A batch is created when a boundary is detected, only ever grows by appending rows in
/// arrival order, and is given its global sequence id when it is flushed.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    global_sequence_id: Option<u64>,
    technique_kind: TechniqueKind,
    technique_run_id: u32,
    rows: Vec<FieldMap>,
}

impl Batch {
    pub fn new(technique_kind: TechniqueKind, technique_run_id: u32) -> Self {
        Self {
            global_sequence_id: None,
            technique_kind,
            technique_run_id,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: FieldMap) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[FieldMap] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn technique_kind(&self) -> TechniqueKind {
        self.technique_kind
    }

    pub fn technique_run_id(&self) -> u32 {
        self.technique_run_id
    }

    /// None until the batch has been flushed
    pub fn global_sequence_id(&self) -> Option<u64> {
        self.global_sequence_id
    }

    pub(crate) fn assign_sequence_id(&mut self, sequence_id: u64) {
        self.global_sequence_id = Some(sequence_id);
    }

    /// Every field name present in the batch, in the order it was first seen.
    ///
    /// This is the header of the persisted table.
    pub fn columns(&self) -> Vec<&str> {
        let mut seen = FxHashSet::default();
        let mut columns = Vec::new();
        for row in self.rows.iter() {
            for key in row.keys() {
                if seen.insert(key) {
                    columns.push(key);
                }
            }
        }
        columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_are_union_in_first_seen_order() {
        let mut batch = Batch::new(TechniqueKind::Peis, 4);
        batch.push_row(FieldMap::from_iter([("time", 0.0), ("Ewe", 0.1), ("I", 0.2)]));
        batch.push_row(FieldMap::from_iter([("freq", 1e5), ("Ewe", 0.1), ("Re(Z)", 10.0)]));
        assert_eq!(batch.columns(), vec!["time", "Ewe", "I", "freq", "Re(Z)"]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.global_sequence_id(), None);
    }
}
