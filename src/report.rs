use crate::{
    processor::{ItemOutcome, ItemResult},
    util::{now_rfc3339, sha256_hex},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub redacted: usize,
    pub unchanged: usize,
    pub fallback: usize,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: ItemOutcome) {
        self.total += 1;
        match outcome {
            ItemOutcome::Redacted => self.redacted += 1,
            ItemOutcome::Unchanged => self.unchanged += 1,
            ItemOutcome::FallbackOriginal => self.fallback += 1,
        }
    }

    /// Items that went through detection without error.
    pub fn succeeded(&self) -> usize {
        self.redacted + self.unchanged
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub index: usize,
    pub name: String,
    pub outcome: ItemOutcome,
    pub error: Option<String>,
    pub regions_detected: usize,
    pub regions_applied: usize,
    pub output_bytes: usize,
    pub output_sha256: String,
}

impl From<&ItemResult> for ItemRecord {
    fn from(r: &ItemResult) -> Self {
        Self {
            index: r.index,
            name: r.name.clone(),
            outcome: r.outcome,
            error: r.error.clone(),
            regions_detected: r.regions_detected,
            regions_applied: r.regions_applied,
            output_bytes: r.output.len(),
            output_sha256: sha256_hex(&r.output),
        }
    }
}

/// What stays in memory when results are streamed to a sink: counters and
/// one small record per item, never the payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub started: String,
    pub finished: Option<String>,
    pub expected: usize,
    pub summary: BatchSummary,
    pub items: Vec<ItemRecord>,
}

impl BatchReport {
    pub fn new(expected: usize) -> Self {
        Self {
            started: now_rfc3339(),
            finished: None,
            expected,
            summary: BatchSummary::default(),
            items: Vec::with_capacity(expected),
        }
    }

    pub fn record(&mut self, result: &ItemResult) {
        self.summary.record(result.outcome);
        self.items.push(ItemRecord::from(result));
    }

    pub fn finish(&mut self) {
        self.finished = Some(now_rfc3339());
    }
}
