use std::collections::HashMap;

use crate::formats::{DedupKey, EventRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// Same key, and the newcomer had more optional fields populated.
    Replaced,
    KeptExisting,
}

/// Ordered, deduplicated event collection. Insertion order is discovery
/// order; a replacement keeps the position of the record it replaces.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    records: Vec<EventRecord>,
    index: HashMap<DedupKey, usize>,
}

impl RunResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, record: EventRecord) -> MergeOutcome {
        let key = record.dedup_key();
        match self.index.get(&key) {
            Some(&position) => {
                if record.completeness() > self.records[position].completeness() {
                    self.records[position] = record;
                    MergeOutcome::Replaced
                } else {
                    MergeOutcome::KeptExisting
                }
            }
            None => {
                self.index.insert(key, self.records.len());
                self.records.push(record);
                MergeOutcome::Inserted
            }
        }
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.records)
    }
}
