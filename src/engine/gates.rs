//! Gate Evaluators.
//!
//! Each rule is compiled into one variant of a closed tagged union, so gate
//! dispatch is exhaustive and statically checkable. File-scoped gates (ast,
//! glob, regex) evaluate one rule against one file; the knowledge gate
//! evaluates against the knowledge snapshot instead of raw text.
//!
//! A parse failure is contained: it yields a Finding for the AST rules that
//! apply to that file and leaves glob and regex evaluation untouched.
//! Findings are sorted by (file_path, line, rule_id) at the fan-in point, so
//! report order is independent of evaluation order.

use crate::core::error::CovenantError;
use crate::core::parse::{Construct, ParseFailure, ParsedFile};
use crate::core::rules::{
    self, GateType, KnowledgeCheck, Rule, RuleSet, Severity,
};
use crate::engine::boundary;
use crate::engine::knowledge::{KnowledgeSnapshot, SymbolKind};
use crate::engine::semantic::SemanticIndex;
use globset::{Glob, GlobMatcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const NEAR_DUPLICATE_K: usize = 3;
pub const NEAR_DUPLICATE_THRESHOLD: f64 = 0.9;

/// One rule violation (or note) at a specific location. Immutable once
/// produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: String,
    pub file_path: String,
    pub line: Option<u32>,
    pub severity: Severity,
    pub blocking: bool,
    pub message: String,
}

/// Canonical report order: (file_path, line, rule_id).
pub fn sort_findings(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        a.file_path
            .cmp(&b.file_path)
            .then_with(|| match (a.line, b.line) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => x.cmp(&y),
            })
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });
}

#[derive(Debug, Clone)]
enum AstPattern {
    Construct(Construct),
    Import(GlobMatcher),
    Call(String),
}

/// Closed variant set of rule-evaluation strategies.
#[derive(Debug, Clone)]
pub enum Gate {
    Ast(AstGate),
    Glob(GlobGate),
    Regex(RegexGate),
    Knowledge(KnowledgeGate),
}

#[derive(Debug, Clone)]
pub struct AstGate {
    pattern: AstPattern,
}

#[derive(Debug, Clone)]
pub struct GlobGate {
    required: GlobMatcher,
}

#[derive(Debug, Clone)]
pub struct RegexGate {
    regex: Regex,
}

#[derive(Debug, Clone)]
pub struct KnowledgeGate {
    check: KnowledgeCheck,
}

/// A rule bound to its compiled gate and applies_to matcher.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: Rule,
    gate: Gate,
    applies: GlobMatcher,
}

fn pattern_of(rule: &Rule) -> Result<&str, CovenantError> {
    rule.pattern.as_deref().ok_or_else(|| {
        CovenantError::Configuration(format!("rule '{}': missing pattern", rule.rule_id))
    })
}

impl CompiledRule {
    /// Compile one rule. The loader has already validated patterns, so a
    /// failure here means the RuleSet was constructed by hand incorrectly.
    pub fn compile(rule: &Rule) -> Result<CompiledRule, CovenantError> {
        let bad = |msg: String| CovenantError::Configuration(msg);
        let gate = match rule.gate_type {
            GateType::Ast => {
                let pattern = pattern_of(rule)?;
                let ast = match pattern.split_once(':') {
                    Some(("construct", name)) => Construct::from_name(name)
                        .map(AstPattern::Construct)
                        .ok_or_else(|| {
                            bad(format!("rule '{}': unknown construct '{}'", rule.rule_id, name))
                        })?,
                    Some(("import", target)) => AstPattern::Import(
                        Glob::new(target)
                            .map_err(|e| bad(format!("rule '{}': {}", rule.rule_id, e)))?
                            .compile_matcher(),
                    ),
                    Some(("call", callee)) => AstPattern::Call(callee.to_string()),
                    _ => {
                        return Err(bad(format!(
                            "rule '{}': unrecognized ast pattern '{}'",
                            rule.rule_id, pattern
                        )));
                    }
                };
                Gate::Ast(AstGate { pattern: ast })
            }
            GateType::Glob => Gate::Glob(GlobGate {
                required: Glob::new(pattern_of(rule)?)
                    .map_err(|e| bad(format!("rule '{}': {}", rule.rule_id, e)))?
                    .compile_matcher(),
            }),
            GateType::Regex => Gate::Regex(RegexGate {
                regex: Regex::new(pattern_of(rule)?)
                    .map_err(|e| bad(format!("rule '{}': {}", rule.rule_id, e)))?,
            }),
            GateType::Knowledge => Gate::Knowledge(KnowledgeGate {
                check: KnowledgeCheck::from_pattern(pattern_of(rule)?).ok_or_else(|| {
                    bad(format!(
                        "rule '{}': unknown knowledge check '{:?}'",
                        rule.rule_id, rule.pattern
                    ))
                })?,
            }),
        };
        let applies = Glob::new(&rule.applies_to)
            .map_err(|e| bad(format!("rule '{}': applies_to: {}", rule.rule_id, e)))?
            .compile_matcher();
        Ok(CompiledRule {
            rule: rule.clone(),
            gate,
            applies,
        })
    }

    pub fn is_knowledge(&self) -> bool {
        matches!(self.gate, Gate::Knowledge(_))
    }

    pub fn applies_to_path(&self, rel_path: &str) -> bool {
        self.applies.is_match(rel_path)
    }

    fn finding(&self, ruleset: &RuleSet, file_path: &str, line: Option<u32>, message: String) -> Finding {
        let mode = ruleset.mode_for(&self.rule.rule_id);
        Finding {
            rule_id: self.rule.rule_id.clone(),
            file_path: file_path.to_string(),
            line,
            severity: self.rule.severity,
            blocking: rules::is_blocking(self.rule.severity, mode),
            message,
        }
    }

    /// Evaluate a file-scoped rule against one file. `content` is None for
    /// files that are not valid UTF-8; only the glob gate sees those.
    pub fn evaluate_file(
        &self,
        ruleset: &RuleSet,
        rel_path: &str,
        content: Option<&str>,
        parsed: Option<&Result<ParsedFile, ParseFailure>>,
    ) -> Vec<Finding> {
        if !self.applies_to_path(rel_path) {
            return Vec::new();
        }
        match &self.gate {
            Gate::Ast(gate) => self.evaluate_ast(gate, ruleset, rel_path, parsed),
            Gate::Glob(gate) => {
                if gate.required.is_match(rel_path) {
                    Vec::new()
                } else {
                    vec![self.finding(
                        ruleset,
                        rel_path,
                        None,
                        format!(
                            "{} (file must match '{}')",
                            self.rule.description,
                            self.rule.pattern.as_deref().unwrap_or("")
                        ),
                    )]
                }
            }
            Gate::Regex(gate) => {
                let Some(content) = content else {
                    return Vec::new();
                };
                let mut findings = Vec::new();
                for (idx, line) in content.lines().enumerate() {
                    if gate.regex.is_match(line) {
                        findings.push(self.finding(
                            ruleset,
                            rel_path,
                            Some((idx + 1) as u32),
                            format!("forbidden pattern: {}", self.rule.description),
                        ));
                    }
                }
                findings
            }
            Gate::Knowledge(_) => Vec::new(),
        }
    }

    fn evaluate_ast(
        &self,
        gate: &AstGate,
        ruleset: &RuleSet,
        rel_path: &str,
        parsed: Option<&Result<ParsedFile, ParseFailure>>,
    ) -> Vec<Finding> {
        let Some(outcome) = parsed else {
            return Vec::new();
        };
        let parsed = match outcome {
            Ok(p) => p,
            Err(failure) => {
                // Parse failure is a Finding, never a crash, and the other
                // gates on this file still run.
                return vec![self.finding(
                    ruleset,
                    rel_path,
                    Some(failure.line),
                    format!("file could not be parsed: {}", failure.message),
                )];
            }
        };
        let mut findings = Vec::new();
        match &gate.pattern {
            AstPattern::Construct(construct) => {
                for site in &parsed.constructs {
                    if site.construct == *construct {
                        findings.push(self.finding(
                            ruleset,
                            rel_path,
                            Some(site.line),
                            format!("{} ({})", self.rule.description, construct.as_str()),
                        ));
                    }
                }
            }
            AstPattern::Import(target) => {
                for import in &parsed.imports {
                    if target.is_match(&import.module) {
                        findings.push(self.finding(
                            ruleset,
                            rel_path,
                            Some(import.line),
                            format!("forbidden import of '{}'", import.module),
                        ));
                    }
                }
            }
            AstPattern::Call(callee) => {
                for call in &parsed.calls {
                    let hit = call.callee == *callee
                        || call.callee.ends_with(&format!(".{}", callee));
                    if hit {
                        findings.push(self.finding(
                            ruleset,
                            rel_path,
                            Some(call.line),
                            format!("disallowed call to '{}'", call.callee),
                        ));
                    }
                }
            }
        }
        findings
    }

    /// Evaluate a knowledge rule against the snapshot. Returns the findings
    /// plus whether the rule degraded (collaborator unavailable).
    pub fn evaluate_knowledge(
        &self,
        ruleset: &RuleSet,
        snapshot: &KnowledgeSnapshot,
        semantic: &dyn SemanticIndex,
    ) -> (Vec<Finding>, bool) {
        let Gate::Knowledge(gate) = &self.gate else {
            return (Vec::new(), false);
        };
        match gate.check {
            KnowledgeCheck::CapabilityCoverage => {
                let findings = snapshot
                    .symbols
                    .values()
                    .filter(|s| {
                        s.is_public
                            && s.kind != SymbolKind::Module
                            && s.capability.is_none()
                            && self.applies_to_path(&s.file_path)
                    })
                    .map(|s| {
                        self.finding(
                            ruleset,
                            &s.file_path,
                            Some(s.line_start),
                            format!(
                                "public symbol '{}' is unassigned (no capability mapping)",
                                s.qualified_name
                            ),
                        )
                    })
                    .collect();
                (findings, false)
            }
            KnowledgeCheck::DomainCycles => {
                let location = format!("constitution/{}", rules::DOMAINS_FILE);
                let findings = boundary::find_cycles(snapshot)
                    .into_iter()
                    .map(|cycle| {
                        self.finding(
                            ruleset,
                            &location,
                            None,
                            format!("domain import cycle: {}", cycle.path.join(" -> ")),
                        )
                    })
                    .collect();
                (findings, false)
            }
            KnowledgeCheck::NearDuplicates => {
                let mut findings = Vec::new();
                for symbol in snapshot.symbols.values() {
                    if !symbol.is_public
                        || symbol.kind == SymbolKind::Module
                        || !self.applies_to_path(&symbol.file_path)
                    {
                        continue;
                    }
                    let matches = match semantic.nearest(
                        &symbol.qualified_name,
                        &symbol.structural_hash,
                        NEAR_DUPLICATE_K,
                        NEAR_DUPLICATE_THRESHOLD,
                    ) {
                        Ok(m) => m,
                        // Best-effort collaborator: its absence degrades
                        // this rule, not the run.
                        Err(_) => return (Vec::new(), true),
                    };
                    for m in matches {
                        if m.qualified_name == symbol.qualified_name {
                            continue;
                        }
                        findings.push(self.finding(
                            ruleset,
                            &symbol.file_path,
                            Some(symbol.line_start),
                            format!(
                                "'{}' is a near-duplicate of '{}' (similarity {:.2})",
                                symbol.qualified_name, m.qualified_name, m.similarity
                            ),
                        ));
                    }
                }
                (findings, false)
            }
        }
    }
}

/// Compile every rule in the set. Fails fast: a rule that cannot compile is
/// a configuration error, raised before any Finding is produced.
pub fn compile_rules(ruleset: &RuleSet) -> Result<Vec<CompiledRule>, CovenantError> {
    ruleset.rules.iter().map(CompiledRule::compile).collect()
}
