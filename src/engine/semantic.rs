//! Seam to the external semantic collaborator.
//!
//! The collaborator answers one narrow question: given a symbol, which known
//! symbols are most similar? It is best-effort by contract. When it is
//! unavailable the dependent knowledge rule degrades and the degradation is
//! surfaced in the audit report; it never takes the run down with it.

use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct SemanticMatch {
    pub qualified_name: String,
    pub similarity: f64,
}

#[derive(Error, Debug)]
pub enum SemanticError {
    #[error("semantic collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("semantic collaborator timed out")]
    Timeout,
}

/// Nearest-neighbour lookup over known symbols.
///
/// Implementations own their transport and their timeout; callers treat any
/// error as "this rule is degraded for this run".
pub trait SemanticIndex: Sync {
    fn nearest(
        &self,
        qualified_name: &str,
        structural_hash: &str,
        k: usize,
        threshold: f64,
    ) -> Result<Vec<SemanticMatch>, SemanticError>;
}

/// The unconfigured default: every query reports the collaborator absent.
pub struct NullSemanticIndex;

impl SemanticIndex for NullSemanticIndex {
    fn nearest(
        &self,
        _qualified_name: &str,
        _structural_hash: &str,
        _k: usize,
        _threshold: f64,
    ) -> Result<Vec<SemanticMatch>, SemanticError> {
        Err(SemanticError::Unavailable("not configured".to_string()))
    }
}

/// In-memory index keyed by qualified name. Used by tests and by local
/// mirrors of the collaborator's answers.
#[derive(Default)]
pub struct StaticSemanticIndex {
    matches: FxHashMap<String, Vec<SemanticMatch>>,
}

impl StaticSemanticIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, qualified_name: &str, matches: Vec<SemanticMatch>) {
        self.matches.insert(qualified_name.to_string(), matches);
    }
}

impl SemanticIndex for StaticSemanticIndex {
    fn nearest(
        &self,
        qualified_name: &str,
        _structural_hash: &str,
        k: usize,
        threshold: f64,
    ) -> Result<Vec<SemanticMatch>, SemanticError> {
        let mut out: Vec<SemanticMatch> = self
            .matches
            .get(qualified_name)
            .map(|v| {
                v.iter()
                    .filter(|m| m.similarity >= threshold)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.truncate(k);
        Ok(out)
    }
}
