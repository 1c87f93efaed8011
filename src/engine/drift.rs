//! Drift Detector: structural diff between two knowledge snapshots.
//!
//! Doubles as the freshness gate for the knowledge gate: an audit refuses to
//! consult a snapshot whose diff against the live tree is non-empty.

use crate::engine::knowledge::KnowledgeSnapshot;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Structural hash differs.
    pub changed: Vec<String>,
    /// Hash unchanged, but domain or capability assignment moved.
    pub reclassified: Vec<String>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && self.reclassified.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "+{} -{} ~{} reclassified {}",
            self.added.len(),
            self.removed.len(),
            self.changed.len(),
            self.reclassified.len()
        )
    }
}

/// Diff two snapshots, keyed by qualified name. Output vectors are sorted
/// because the symbol maps are ordered.
pub fn diff(prev: &KnowledgeSnapshot, cur: &KnowledgeSnapshot) -> DriftReport {
    let mut report = DriftReport::default();

    for (name, symbol) in &cur.symbols {
        match prev.symbols.get(name) {
            None => report.added.push(name.clone()),
            Some(old) => {
                if old.structural_hash != symbol.structural_hash {
                    report.changed.push(name.clone());
                } else if old.domain != symbol.domain || old.capability != symbol.capability {
                    report.reclassified.push(name.clone());
                }
            }
        }
    }
    for name in prev.symbols.keys() {
        if !cur.symbols.contains_key(name) {
            report.removed.push(name.clone());
        }
    }

    report
}
