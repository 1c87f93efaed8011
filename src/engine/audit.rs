//! Audit Orchestrator.
//!
//! One audit is one synchronous pass: load the RuleSet from disk, verify the
//! knowledge snapshot is fresh (resyncing when asked to), fan the file-scoped
//! gates out over the tree, run the knowledge gates and the built-in domain
//! boundary checks against the snapshot, apply the declarative overrides,
//! and compute the verdict. The full finding list is always returned; a
//! failing run is never truncated.
//!
//! Per-file evaluation has no shared mutable state, so it runs on a rayon
//! pool; the fan-in sort makes the report deterministic regardless of worker
//! count. An audit that errors mid-way propagates the error and leaves no
//! partial report behind.

use crate::core::error::CovenantError;
use crate::core::parse::{self, ParseFailure, ParsedFile};
use crate::core::rules::{self, RuleSet, Severity};
use crate::core::store::Store;
use crate::engine::boundary;
use crate::engine::gates::{self, CompiledRule, Finding};
use crate::engine::knowledge::{self, KnowledgeSnapshot};
use crate::engine::{drift, semantic::SemanticIndex};
use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub run_id: String,
    pub verdict: Verdict,
    pub findings: Vec<Finding>,
    pub error_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
    /// Rule ids that were skipped or degraded (collaborator unavailable).
    /// Silent loss of governance coverage is itself a defect, so these are
    /// always surfaced.
    pub degraded: Vec<String>,
}

impl AuditReport {
    fn from_findings(findings: Vec<Finding>, degraded: Vec<String>) -> AuditReport {
        let error_count = findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .count();
        let warning_count = findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
            .count();
        let info_count = findings
            .iter()
            .filter(|f| f.severity == Severity::Info)
            .count();
        let verdict = if findings.iter().any(|f| f.blocking) {
            Verdict::Fail
        } else {
            Verdict::Pass
        };
        AuditReport {
            run_id: Ulid::new().to_string(),
            verdict,
            findings,
            error_count,
            warning_count,
            info_count,
            degraded,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditOptions {
    /// Worker threads for the per-file fan-out; None uses the global pool.
    pub jobs: Option<usize>,
    /// Resync a stale snapshot instead of failing closed.
    pub resync: bool,
}

impl Default for AuditOptions {
    fn default() -> Self {
        AuditOptions {
            jobs: None,
            resync: true,
        }
    }
}

struct FileOutcome {
    findings: Vec<Finding>,
}

fn evaluate_file(
    repo_root: &Path,
    rel_path: &str,
    compiled: &[CompiledRule],
    ruleset: &RuleSet,
) -> FileOutcome {
    let file_rules: Vec<&CompiledRule> = compiled
        .iter()
        .filter(|r| !r.is_knowledge() && r.applies_to_path(rel_path))
        .collect();
    if file_rules.is_empty() {
        return FileOutcome {
            findings: Vec::new(),
        };
    }

    // Every file at least one rule applies to is read; only files that are
    // unreadable or not valid UTF-8 have no text for the line gates, and the
    // glob gate still sees their paths.
    let content: Option<String> = fs::read_to_string(repo_root.join(rel_path)).ok();

    // Parse once per file, shared by every AST rule that applies to it.
    let parsed: Option<Result<ParsedFile, ParseFailure>> =
        if parse::is_parsable_path(rel_path) {
            content
                .as_deref()
                .map(|c| parse::parse_source(rel_path, c))
        } else {
            None
        };

    let mut findings = Vec::new();
    for rule in file_rules {
        findings.extend(rule.evaluate_file(ruleset, rel_path, content.as_deref(), parsed.as_ref()));
    }
    FileOutcome { findings }
}

/// Built-in domain checks: the default-deny import matrix and the cycle
/// check run on every audit, with or without authored knowledge rules.
fn builtin_domain_findings(ruleset: &RuleSet, snapshot: &KnowledgeSnapshot) -> Vec<Finding> {
    let now = Utc::now();
    let mut findings = Vec::new();

    let boundary_mode = ruleset.mode_for(rules::RULE_DOMAIN_BOUNDARY);
    for violation in boundary::check_edges(snapshot, ruleset, now) {
        if violation.waived {
            findings.push(Finding {
                rule_id: rules::RULE_DOMAIN_BOUNDARY.to_string(),
                file_path: violation.file.clone(),
                line: Some(violation.line),
                severity: Severity::Info,
                blocking: false,
                message: format!(
                    "waived import: {} -> {} ('{}')",
                    violation.source_domain, violation.target_domain, violation.target_module
                ),
            });
            continue;
        }
        findings.push(Finding {
            rule_id: rules::RULE_DOMAIN_BOUNDARY.to_string(),
            file_path: violation.file.clone(),
            line: Some(violation.line),
            severity: Severity::Error,
            blocking: rules::is_blocking(Severity::Error, boundary_mode),
            message: format!(
                "domain '{}' may not import from '{}' (import of '{}')",
                violation.source_domain, violation.target_domain, violation.target_module
            ),
        });
    }

    let cycle_mode = ruleset.mode_for(rules::RULE_DOMAIN_CYCLE);
    for cycle in boundary::find_cycles(snapshot) {
        findings.push(Finding {
            rule_id: rules::RULE_DOMAIN_CYCLE.to_string(),
            file_path: format!("constitution/{}", rules::DOMAINS_FILE),
            line: None,
            severity: Severity::Error,
            blocking: rules::is_blocking(Severity::Error, cycle_mode),
            message: format!("domain import cycle: {}", cycle.path.join(" -> ")),
        });
    }

    findings
}

/// Declarative post-processing: matching findings are demoted to warnings,
/// which also clears their blocking flag.
fn apply_post_processing(ruleset: &RuleSet, findings: &mut [Finding]) {
    for finding in findings.iter_mut() {
        if ruleset
            .overrides
            .iter()
            .any(|o| o.matches(&finding.rule_id, &finding.file_path))
        {
            finding.severity = Severity::Warning;
            finding.blocking = false;
        }
    }
}

/// Run the gates over a tree with an explicit RuleSet and snapshot. This is
/// the shared engine behind both live audits and canary simulations; it
/// never touches the persisted snapshot.
pub fn audit_tree(
    repo_root: &Path,
    ruleset: &RuleSet,
    snapshot: &KnowledgeSnapshot,
    semantic: &dyn SemanticIndex,
    opts: &AuditOptions,
) -> Result<AuditReport, CovenantError> {
    let compiled = gates::compile_rules(ruleset)?;
    let files = knowledge::collect_files(repo_root)?;

    let run = || -> Vec<FileOutcome> {
        files
            .par_iter()
            .map(|rel| evaluate_file(repo_root, rel, &compiled, ruleset))
            .collect()
    };
    let outcomes = match opts.jobs {
        Some(jobs) => rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build()
            .map_err(|e| CovenantError::Configuration(format!("worker pool: {}", e)))?
            .install(run),
        None => run(),
    };

    let mut findings: Vec<Finding> = Vec::new();
    for outcome in outcomes {
        findings.extend(outcome.findings);
    }

    let mut degraded: Vec<String> = Vec::new();
    for rule in compiled.iter().filter(|r| r.is_knowledge()) {
        let (knowledge_findings, was_degraded) =
            rule.evaluate_knowledge(ruleset, snapshot, semantic);
        findings.extend(knowledge_findings);
        if was_degraded {
            degraded.push(rule.rule.rule_id.clone());
            findings.push(Finding {
                rule_id: rule.rule.rule_id.clone(),
                file_path: String::new(),
                line: None,
                severity: Severity::Info,
                blocking: false,
                message: "rule degraded: semantic collaborator unavailable".to_string(),
            });
        }
    }

    findings.extend(builtin_domain_findings(ruleset, snapshot));

    apply_post_processing(ruleset, &mut findings);
    gates::sort_findings(&mut findings);
    degraded.sort();

    Ok(AuditReport::from_findings(findings, degraded))
}

/// The caller-facing run-audit operation: loads the constitution from disk,
/// enforces snapshot freshness, and audits the live tree.
pub fn run_audit(
    store: &Store,
    semantic: &dyn SemanticIndex,
    opts: &AuditOptions,
) -> Result<AuditReport, CovenantError> {
    let ruleset = rules::load_ruleset(&store.constitution_dir())?;

    let fresh = knowledge::build_snapshot(&store.repo_root, &ruleset)?;
    let stored = knowledge::load_snapshot(store)?;
    let stale = match &stored {
        None => true,
        Some(prev) => !drift::diff(prev, &fresh).is_clean(),
    };
    if stale {
        if !opts.resync {
            // Fail closed: the knowledge gate must not consult a snapshot
            // that no longer mirrors the tree.
            return Err(CovenantError::StaleSnapshot(
                "tree has drifted since the last sync (run `covenant sync`)".to_string(),
            ));
        }
        knowledge::save_snapshot(store, &fresh)?;
    }

    audit_tree(&store.repo_root, &ruleset, &fresh, semantic, opts)
}

/// Rebuild and persist the knowledge snapshot, returning the drift against
/// the previously stored one.
pub fn sync_knowledge(store: &Store) -> Result<drift::DriftReport, CovenantError> {
    let ruleset = rules::load_ruleset(&store.constitution_dir())?;
    let fresh = knowledge::build_snapshot(&store.repo_root, &ruleset)?;
    let stored = knowledge::load_snapshot(store)?.unwrap_or_default();
    let report = drift::diff(&stored, &fresh);
    knowledge::save_snapshot(store, &fresh)?;
    Ok(report)
}

/// Standalone drift health check; does not write anything.
pub fn check_drift(store: &Store) -> Result<drift::DriftReport, CovenantError> {
    let ruleset = rules::load_ruleset(&store.constitution_dir())?;
    let fresh = knowledge::build_snapshot(&store.repo_root, &ruleset)?;
    let stored = knowledge::load_snapshot(store)?.unwrap_or_default();
    Ok(drift::diff(&stored, &fresh))
}
