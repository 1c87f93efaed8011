//! Rule Loader: compiles the on-disk constitution into an in-memory RuleSet.
//!
//! The constitution directory holds declarative rule documents plus the
//! enforcement mapping, domain matrix, capability declarations, waivers,
//! finding overrides, and the approver registry. The loader rebuilds the
//! RuleSet from disk on every invocation, so the constitution enforced is
//! exactly what is currently on disk. There is no process-global state: the
//! RuleSet is an owned value passed into the orchestrator.
//!
//! Any malformed document (unknown gate type, missing required field,
//! duplicate rule_id, invalid pattern) is a fatal configuration error raised
//! before a single Finding is produced.

use crate::core::error::CovenantError;
use crate::core::parse::Construct;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

pub const RULES_SUBDIR: &str = "rules";
pub const ENFORCEMENT_FILE: &str = "enforcement.toml";
pub const DOMAINS_FILE: &str = "domains.toml";
pub const CAPABILITIES_FILE: &str = "capabilities.toml";
pub const WAIVERS_FILE: &str = "waivers.toml";
pub const OVERRIDES_FILE: &str = "overrides.toml";
pub const APPROVERS_FILE: &str = "approvers.toml";

/// Reserved rule id for default-deny import-matrix violations.
pub const RULE_DOMAIN_BOUNDARY: &str = "domain.boundary";
/// Reserved rule id for domain-graph cycles.
pub const RULE_DOMAIN_CYCLE: &str = "domain.cycle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateType {
    Ast,
    Glob,
    Regex,
    Knowledge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    Blocking,
    Reporting,
    Advisory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeTier {
    Standard,
    Critical,
}

impl ChangeTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeTier::Standard => "standard",
            ChangeTier::Critical => "critical",
        }
    }
}

/// A Finding blocks iff the rule is an error and its enforcement is blocking.
pub fn is_blocking(severity: Severity, mode: EnforcementMode) -> bool {
    severity == Severity::Error && mode == EnforcementMode::Blocking
}

/// One declarative rule. Immutable once loaded for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub description: String,
    #[serde(rename = "check_type")]
    pub gate_type: GateType,
    pub severity: Severity,
    /// Path glob selecting the files (or symbols, for knowledge rules) the
    /// rule applies to.
    pub applies_to: String,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RuleDocument {
    #[allow(dead_code)]
    schema: String,
    #[allow(dead_code)]
    category: String,
    #[serde(default)]
    rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub owned_paths: Vec<String>,
    /// Explicit allow-list of import targets. Absence means forbidden.
    pub allowed_imports: Vec<String>,
    #[serde(default)]
    pub default_capability: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DomainSpec {
    owned_paths: Vec<String>,
    #[serde(default)]
    allowed_imports: Vec<String>,
    #[serde(default)]
    default_capability: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DomainsFile {
    #[serde(default)]
    domains: BTreeMap<String, DomainSpec>,
}

/// A declared unit of intended functionality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub domain: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CapabilitiesFile {
    #[serde(default, rename = "capability")]
    capabilities: Vec<Capability>,
}

/// Suppresses one (source, target) boundary violation until expiry.
/// Waiver files live inside the constitution, so editing them goes through
/// the amendment protocol like any other constitutional change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waiver {
    pub source: String,
    pub target: String,
    pub reason: String,
    pub expires_at: DateTime<Utc>,
}

impl Waiver {
    /// An expired waiver is treated as absent.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WaiversFile {
    #[serde(default, rename = "waiver")]
    waivers: Vec<Waiver>,
}

/// Declarative post-processing: demote findings of `rule_id` inside files
/// matching `path` to warnings (e.g. entry-point exemptions).
#[derive(Debug, Clone, Deserialize)]
struct OverrideSpec {
    rule_id: String,
    path: String,
    #[serde(default)]
    #[allow(dead_code)]
    note: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OverridesFile {
    #[serde(default, rename = "override")]
    overrides: Vec<OverrideSpec>,
}

#[derive(Debug, Clone)]
pub struct AuditOverride {
    pub rule_id: String,
    pub path: String,
    matcher: GlobMatcher,
}

impl AuditOverride {
    pub fn matches(&self, rule_id: &str, file_path: &str) -> bool {
        self.rule_id == rule_id && self.matcher.is_match(file_path)
    }
}

/// Minimum distinct valid signatures per change tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuorumPolicy {
    pub standard: usize,
    pub critical: usize,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        QuorumPolicy {
            standard: 1,
            critical: 2,
        }
    }
}

impl QuorumPolicy {
    pub fn required(&self, tier: ChangeTier) -> usize {
        match tier {
            ChangeTier::Standard => self.standard,
            ChangeTier::Critical => self.critical,
        }
    }
}

/// Registered approvers: signer_id -> hex-encoded ed25519 public key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApproverRegistry {
    #[serde(default)]
    pub approvers: BTreeMap<String, String>,
    #[serde(default)]
    pub quorum: QuorumPolicy,
}

/// The compiled constitution for one run.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub enforcement: BTreeMap<String, EnforcementMode>,
    pub domains: Vec<Domain>,
    pub capabilities: Vec<Capability>,
    pub waivers: Vec<Waiver>,
    pub overrides: Vec<AuditOverride>,
    pub registry: ApproverRegistry,
    domain_globs: Vec<GlobSet>,
}

impl RuleSet {
    /// Enforcement defaults to blocking: silence never weakens the
    /// constitution, the mapping exists to demote as much as to promote.
    pub fn mode_for(&self, rule_id: &str) -> EnforcementMode {
        self.enforcement
            .get(rule_id)
            .copied()
            .unwrap_or(EnforcementMode::Blocking)
    }

    /// Resolve the owning domain of a repo-relative path.
    pub fn domain_for_path(&self, rel_path: &str) -> Option<&Domain> {
        for (domain, globs) in self.domains.iter().zip(&self.domain_globs) {
            if globs.is_match(rel_path) {
                return Some(domain);
            }
        }
        None
    }

    pub fn domain(&self, name: &str) -> Option<&Domain> {
        self.domains.iter().find(|d| d.name == name)
    }

    /// Default-deny: absence of (source, target) in the allow-list means
    /// forbidden. Self-imports are always legal.
    pub fn domain_allows(&self, source: &str, target: &str) -> bool {
        if source == target {
            return true;
        }
        self.domain(source)
            .is_some_and(|d| d.allowed_imports.iter().any(|t| t == target))
    }

    pub fn active_waiver(&self, source: &str, target: &str, now: DateTime<Utc>) -> Option<&Waiver> {
        self.waivers
            .iter()
            .find(|w| w.source == source && w.target == target && w.is_active(now))
    }
}

fn config_err(path: &Path, err: impl std::fmt::Display) -> CovenantError {
    CovenantError::Configuration(format!("{}: {}", path.display(), err))
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CovenantError> {
    let content = fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| config_err(path, e))
}

fn read_toml_or<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T, CovenantError> {
    if path.exists() {
        read_toml(path)
    } else {
        Ok(T::default())
    }
}

/// Knowledge-gate checks a rule pattern may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnowledgeCheck {
    CapabilityCoverage,
    DomainCycles,
    NearDuplicates,
}

impl KnowledgeCheck {
    pub fn from_pattern(pattern: &str) -> Option<KnowledgeCheck> {
        match pattern {
            "capability_coverage" => Some(KnowledgeCheck::CapabilityCoverage),
            "domain_cycles" => Some(KnowledgeCheck::DomainCycles),
            "near_duplicates" => Some(KnowledgeCheck::NearDuplicates),
            _ => None,
        }
    }
}

/// Validate a rule's pattern against its gate type so bad constitutions fail
/// at load, not mid-audit.
fn validate_rule(doc_path: &Path, rule: &Rule) -> Result<(), CovenantError> {
    let pattern = rule.pattern.as_deref();
    match rule.gate_type {
        GateType::Ast => {
            let p = pattern.ok_or_else(|| {
                config_err(
                    doc_path,
                    format!("rule '{}': ast rules require a pattern", rule.rule_id),
                )
            })?;
            let valid = match p.split_once(':') {
                Some(("construct", name)) => Construct::from_name(name).is_some(),
                Some(("import", target)) => !target.is_empty(),
                Some(("call", callee)) => !callee.is_empty(),
                _ => false,
            };
            if !valid {
                return Err(config_err(
                    doc_path,
                    format!(
                        "rule '{}': unrecognized ast pattern '{}' (expected construct:, import:, or call:)",
                        rule.rule_id, p
                    ),
                ));
            }
        }
        GateType::Glob => {
            let p = pattern.ok_or_else(|| {
                config_err(
                    doc_path,
                    format!("rule '{}': glob rules require a pattern", rule.rule_id),
                )
            })?;
            Glob::new(p).map_err(|e| {
                config_err(doc_path, format!("rule '{}': {}", rule.rule_id, e))
            })?;
        }
        GateType::Regex => {
            let p = pattern.ok_or_else(|| {
                config_err(
                    doc_path,
                    format!("rule '{}': regex rules require a pattern", rule.rule_id),
                )
            })?;
            Regex::new(p).map_err(|e| {
                config_err(doc_path, format!("rule '{}': {}", rule.rule_id, e))
            })?;
        }
        GateType::Knowledge => {
            let p = pattern.ok_or_else(|| {
                config_err(
                    doc_path,
                    format!("rule '{}': knowledge rules require a pattern", rule.rule_id),
                )
            })?;
            if KnowledgeCheck::from_pattern(p).is_none() {
                return Err(config_err(
                    doc_path,
                    format!(
                        "rule '{}': unknown knowledge check '{}'",
                        rule.rule_id, p
                    ),
                ));
            }
        }
    }
    Glob::new(&rule.applies_to).map_err(|e| {
        config_err(
            doc_path,
            format!("rule '{}': applies_to: {}", rule.rule_id, e),
        )
    })?;
    Ok(())
}

fn compile_domain_globs(domains: &[Domain]) -> Result<Vec<GlobSet>, CovenantError> {
    let mut out = Vec::with_capacity(domains.len());
    for domain in domains {
        let mut builder = GlobSetBuilder::new();
        for pattern in &domain.owned_paths {
            let glob = Glob::new(pattern).map_err(|e| {
                CovenantError::Configuration(format!(
                    "domain '{}': owned path '{}': {}",
                    domain.name, pattern, e
                ))
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| {
            CovenantError::Configuration(format!("domain '{}': {}", domain.name, e))
        })?;
        out.push(set);
    }
    Ok(out)
}

/// Load the full constitution from disk. No caching, no globals: the
/// returned RuleSet is exactly what is on disk right now.
pub fn load_ruleset(constitution_dir: &Path) -> Result<RuleSet, CovenantError> {
    if !constitution_dir.is_dir() {
        return Err(CovenantError::Configuration(format!(
            "constitution directory not found: {}",
            constitution_dir.display()
        )));
    }

    let rules_dir = constitution_dir.join(RULES_SUBDIR);
    if !rules_dir.is_dir() {
        return Err(CovenantError::Configuration(format!(
            "missing rules directory: {}",
            rules_dir.display()
        )));
    }

    let mut doc_paths: Vec<_> = fs::read_dir(&rules_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("toml"))
        .collect();
    doc_paths.sort();

    let mut rules: Vec<Rule> = Vec::new();
    let mut seen_ids: BTreeSet<String> = BTreeSet::new();
    for doc_path in &doc_paths {
        let doc: RuleDocument = read_toml(doc_path)?;
        for rule in doc.rules {
            if !seen_ids.insert(rule.rule_id.clone()) {
                return Err(config_err(
                    doc_path,
                    format!("duplicate rule_id '{}'", rule.rule_id),
                ));
            }
            validate_rule(doc_path, &rule)?;
            rules.push(rule);
        }
    }

    let enforcement_path = constitution_dir.join(ENFORCEMENT_FILE);
    let enforcement: BTreeMap<String, EnforcementMode> = if enforcement_path.exists() {
        read_toml(&enforcement_path)?
    } else {
        BTreeMap::new()
    };
    for rule_id in enforcement.keys() {
        let known = seen_ids.contains(rule_id)
            || rule_id == RULE_DOMAIN_BOUNDARY
            || rule_id == RULE_DOMAIN_CYCLE;
        if !known {
            return Err(config_err(
                &enforcement_path,
                format!("enforcement mapping references unknown rule_id '{}'", rule_id),
            ));
        }
    }

    let domains_file: DomainsFile = read_toml_or(&constitution_dir.join(DOMAINS_FILE))?;
    let domains: Vec<Domain> = domains_file
        .domains
        .into_iter()
        .map(|(name, spec)| Domain {
            name,
            owned_paths: spec.owned_paths,
            allowed_imports: spec.allowed_imports,
            default_capability: spec.default_capability,
        })
        .collect();
    let domain_globs = compile_domain_globs(&domains)?;

    for domain in &domains {
        for target in &domain.allowed_imports {
            if !domains.iter().any(|d| &d.name == target) {
                return Err(CovenantError::Configuration(format!(
                    "domain '{}' allows imports from undeclared domain '{}'",
                    domain.name, target
                )));
            }
        }
    }

    let capabilities_file: CapabilitiesFile =
        read_toml_or(&constitution_dir.join(CAPABILITIES_FILE))?;
    for capability in &capabilities_file.capabilities {
        if !domains.iter().any(|d| d.name == capability.domain) {
            return Err(CovenantError::Configuration(format!(
                "capability '{}' names undeclared domain '{}'",
                capability.id, capability.domain
            )));
        }
    }

    let waivers_file: WaiversFile = read_toml_or(&constitution_dir.join(WAIVERS_FILE))?;

    let overrides_path = constitution_dir.join(OVERRIDES_FILE);
    let overrides_file: OverridesFile = read_toml_or(&overrides_path)?;
    let mut overrides = Vec::with_capacity(overrides_file.overrides.len());
    for spec in overrides_file.overrides {
        let matcher = Glob::new(&spec.path)
            .map_err(|e| config_err(&overrides_path, e))?
            .compile_matcher();
        overrides.push(AuditOverride {
            rule_id: spec.rule_id,
            path: spec.path,
            matcher,
        });
    }

    let registry: ApproverRegistry = read_toml_or(&constitution_dir.join(APPROVERS_FILE))?;

    Ok(RuleSet {
        rules,
        enforcement,
        domains,
        capabilities: capabilities_file.capabilities,
        waivers: waivers_file.waivers,
        overrides,
        registry,
        domain_globs,
    })
}
