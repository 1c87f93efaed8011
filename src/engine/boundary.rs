//! Domain Boundary Checker.
//!
//! Validates every inter-domain import edge against the allow-list
//! (default-deny) and runs cycle detection on the domain-level graph. Cycles
//! are blocking regardless of individual edge legality. Waivers can suppress
//! a specific (source, target) violation until their wall-clock expiry; an
//! expired waiver is treated as absent.

use crate::core::rules::RuleSet;
use crate::engine::knowledge::KnowledgeSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryViolation {
    pub source_domain: String,
    pub target_domain: String,
    pub file: String,
    pub line: u32,
    pub target_module: String,
    pub waived: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainCycle {
    /// Closed walk through the domain graph, first element repeated last.
    pub path: Vec<String>,
}

/// Check every inter-domain edge against the matrix. Violations suppressed
/// by an active waiver are returned with `waived = true` so callers can still
/// report them as informational.
pub fn check_edges(
    snapshot: &KnowledgeSnapshot,
    ruleset: &RuleSet,
    now: DateTime<Utc>,
) -> Vec<BoundaryViolation> {
    let mut violations = Vec::new();
    for edge in &snapshot.imports {
        let (Some(source), Some(target)) = (&edge.from_domain, &edge.target_domain) else {
            continue;
        };
        if source == target || ruleset.domain_allows(source, target) {
            continue;
        }
        let waived = ruleset.active_waiver(source, target, now).is_some();
        violations.push(BoundaryViolation {
            source_domain: source.clone(),
            target_domain: target.clone(),
            file: edge.from_file.clone(),
            line: edge.line,
            target_module: edge.target_module.clone(),
            waived,
        });
    }
    violations
}

/// Adjacency of the domain-level graph derived from actual imports.
fn domain_adjacency(snapshot: &KnowledgeSnapshot) -> BTreeMap<String, BTreeSet<String>> {
    let mut adjacency: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for edge in &snapshot.imports {
        let (Some(source), Some(target)) = (&edge.from_domain, &edge.target_domain) else {
            continue;
        };
        if source == target {
            continue;
        }
        adjacency
            .entry(source.clone())
            .or_default()
            .insert(target.clone());
        adjacency.entry(target.clone()).or_default();
    }
    adjacency
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// DFS with coloring over the domain graph. Deterministic: adjacency is
/// ordered, so the same tree always reports the same cycles.
pub fn find_cycles(snapshot: &KnowledgeSnapshot) -> Vec<DomainCycle> {
    let adjacency = domain_adjacency(snapshot);
    let mut colors: BTreeMap<&str, Color> = adjacency
        .keys()
        .map(|k| (k.as_str(), Color::White))
        .collect();
    let mut stack: Vec<&str> = Vec::new();
    let mut cycles: Vec<DomainCycle> = Vec::new();
    let mut seen: BTreeSet<Vec<String>> = BTreeSet::new();

    fn visit<'a>(
        node: &'a str,
        adjacency: &'a BTreeMap<String, BTreeSet<String>>,
        colors: &mut BTreeMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
        cycles: &mut Vec<DomainCycle>,
        seen: &mut BTreeSet<Vec<String>>,
    ) {
        colors.insert(node, Color::Gray);
        stack.push(node);
        if let Some(targets) = adjacency.get(node) {
            for target in targets {
                match colors.get(target.as_str()).copied().unwrap_or(Color::White) {
                    Color::White => {
                        visit(target, adjacency, colors, stack, cycles, seen);
                    }
                    Color::Gray => {
                        let start = stack
                            .iter()
                            .position(|n| *n == target.as_str())
                            .unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        path.push(target.clone());
                        let key = normalize_cycle(&path);
                        if seen.insert(key) {
                            cycles.push(DomainCycle { path });
                        }
                    }
                    Color::Black => {}
                }
            }
        }
        stack.pop();
        colors.insert(node, Color::Black);
    }

    let nodes: Vec<&str> = adjacency.keys().map(|k| k.as_str()).collect();
    for node in nodes {
        if colors.get(node).copied() == Some(Color::White) {
            visit(node, &adjacency, &mut colors, &mut stack, &mut cycles, &mut seen);
        }
    }
    cycles
}

/// Rotate a closed walk so it starts at its smallest element, giving one
/// canonical key per cycle.
fn normalize_cycle(path: &[String]) -> Vec<String> {
    let core = &path[..path.len() - 1];
    let min_idx = core
        .iter()
        .enumerate()
        .min_by_key(|(_, v)| v.as_str())
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut rotated: Vec<String> = Vec::with_capacity(core.len());
    for offset in 0..core.len() {
        rotated.push(core[(min_idx + offset) % core.len()].clone());
    }
    rotated
}
