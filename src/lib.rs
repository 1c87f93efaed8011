//! Covenant: a constitutional governance engine.
//!
//! Covenant keeps a continuously changing codebase aligned with an explicit,
//! versioned rulebook, the constitution. It loads the constitution from
//! disk on every run, audits the tree through four gate types (AST, path,
//! regex, knowledge), mirrors the tree in a knowledge graph, and only lets
//! the constitution itself change through a signed, quorum-gated proposal
//! that must survive a simulated audit first.
//!
//! # Core guarantees
//!
//! - **No ambient constitution**: the RuleSet is rebuilt from disk per run
//!   and passed by value; what is enforced is exactly what is on disk.
//! - **Deterministic reports**: findings are sorted at the fan-in point, so
//!   worker count and evaluation order never change the output.
//! - **Default-deny boundaries**: an inter-domain import absent from the
//!   allow-list is a violation, waivable only until wall-clock expiry.
//! - **Canary-gated amendment**: the live constitution mutates at exactly
//!   one transition, and only after the amended rulebook passes a full
//!   audit run against an isolated copy.
//! - **Surfaced degradation**: when the semantic collaborator is down, the
//!   dependent rule is marked degraded in the report, never silently
//!   dropped.
//!
//! # Crate structure
//!
//! - [`core`]: errors, the `.covenant/` store, sqlite access, the rule
//!   loader, and the structural parser.
//! - [`engine`]: gate evaluators, knowledge graph builder, drift detector,
//!   boundary checker, audit orchestrator, and the amendment protocol.

pub mod core;
pub mod engine;

use crate::core::error::CovenantError;
use crate::core::rules::{self, ChangeTier};
use crate::core::store::Store;
use crate::engine::audit::{self, AuditOptions, Verdict};
use crate::engine::{amend, semantic::NullSemanticIndex};

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "covenant",
    version = env!("CARGO_PKG_VERSION"),
    about = "Constitutional governance for codebases"
)]
struct Cli {
    /// Repository root (defaults to the current working directory).
    #[clap(long, global = true)]
    repo: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct AuditCli {
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text")]
    format: String,
    /// Worker threads for per-file evaluation (defaults to the rayon pool).
    #[clap(long)]
    jobs: Option<usize>,
    /// Fail closed on a stale snapshot instead of resyncing.
    #[clap(long)]
    no_resync: bool,
}

#[derive(clap::Args, Debug)]
struct FormatCli {
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text")]
    format: String,
}

#[derive(clap::Args, Debug)]
struct ProposeCli {
    /// Constitution-relative target, e.g. constitution/rules/style.toml.
    #[clap(long)]
    target: String,
    /// File holding the proposed content.
    #[clap(long)]
    content_file: PathBuf,
    #[clap(long)]
    justification: String,
    /// Change tier: 'standard' or 'critical'.
    #[clap(long, default_value = "standard")]
    tier: String,
}

#[derive(clap::Args, Debug)]
struct SignCli {
    #[clap(long)]
    id: String,
    #[clap(long)]
    signer: String,
    /// File holding the signer's hex-encoded ed25519 secret key.
    #[clap(long)]
    key_file: PathBuf,
}

#[derive(clap::Args, Debug)]
struct ApproveCli {
    #[clap(long)]
    id: String,
    #[clap(long)]
    jobs: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct RejectCli {
    #[clap(long)]
    id: String,
    #[clap(long)]
    reason: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full audit of the tree against the constitution.
    Audit(AuditCli),
    /// Rebuild the knowledge snapshot from the tree.
    Sync(FormatCli),
    /// Diff the stored snapshot against a fresh build.
    Drift(FormatCli),
    /// Create a constitutional amendment proposal.
    Propose(ProposeCli),
    /// Sign a proposal with a local secret key.
    Sign(SignCli),
    /// Advance a proposal through quorum, canary, and ratification.
    Approve(ApproveCli),
    /// Reject a pending proposal.
    Reject(RejectCli),
    /// List pending proposals.
    Proposals(FormatCli),
    /// Generate an ed25519 keypair for the approver registry.
    Keygen,
}

fn parse_tier(raw: &str) -> Result<ChangeTier, CovenantError> {
    match raw {
        "standard" => Ok(ChangeTier::Standard),
        "critical" => Ok(ChangeTier::Critical),
        other => Err(CovenantError::Configuration(format!(
            "unknown change tier '{}'",
            other
        ))),
    }
}

/// CLI entrypoint. Returns whether the invoked operation succeeded in the
/// pass/fail sense (an audit FAIL is an unsuccessful run, not an error).
pub fn run() -> Result<bool, CovenantError> {
    let cli = Cli::parse();
    let repo_root = match cli.repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let store = Store::open(&repo_root)?;
    let semantic = NullSemanticIndex;

    match cli.command {
        Command::Audit(audit_cli) => {
            let opts = AuditOptions {
                jobs: audit_cli.jobs,
                resync: !audit_cli.no_resync,
            };
            let report = audit::run_audit(&store, &semantic, &opts)?;
            if audit_cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for finding in &report.findings {
                    let line = finding
                        .line
                        .map(|l| format!(":{}", l))
                        .unwrap_or_default();
                    let marker = if finding.blocking {
                        "BLOCK".red().to_string()
                    } else {
                        finding.severity.as_str().to_string()
                    };
                    println!(
                        "{} {}{} [{}] {}",
                        marker, finding.file_path, line, finding.rule_id, finding.message
                    );
                }
                for rule_id in &report.degraded {
                    println!("degraded: {}", rule_id);
                }
                let verdict = match report.verdict {
                    Verdict::Pass => "PASS".green(),
                    Verdict::Fail => "FAIL".red(),
                };
                println!(
                    "{} ({} errors, {} warnings, {} info)",
                    verdict, report.error_count, report.warning_count, report.info_count
                );
            }
            Ok(report.verdict == Verdict::Pass)
        }
        Command::Sync(format_cli) => {
            let drift = audit::sync_knowledge(&store)?;
            if format_cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&drift)?);
            } else {
                println!("knowledge synced: {}", drift.summary());
            }
            Ok(true)
        }
        Command::Drift(format_cli) => {
            let drift = audit::check_drift(&store)?;
            if format_cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&drift)?);
            } else if drift.is_clean() {
                println!("no drift");
            } else {
                println!("drift detected: {}", drift.summary());
            }
            Ok(drift.is_clean())
        }
        Command::Propose(propose_cli) => {
            let content = fs::read_to_string(&propose_cli.content_file)?;
            let tier = parse_tier(&propose_cli.tier)?;
            let proposal = amend::create_proposal(
                &store,
                &propose_cli.target,
                &propose_cli.justification,
                &content,
                tier,
            )?;
            println!("proposal created: {}", proposal.proposal_id);
            Ok(true)
        }
        Command::Sign(sign_cli) => {
            let ruleset = rules::load_ruleset(&store.constitution_dir())?;
            let secret = fs::read_to_string(&sign_cli.key_file)?;
            let proposal = amend::sign_with_key(
                &store,
                &sign_cli.id,
                &sign_cli.signer,
                secret.trim(),
                &ruleset.registry,
            )?;
            println!(
                "proposal {} signed by {} (state: {})",
                proposal.proposal_id,
                sign_cli.signer,
                proposal.state.as_str()
            );
            Ok(true)
        }
        Command::Approve(approve_cli) => {
            let opts = AuditOptions {
                jobs: approve_cli.jobs,
                resync: true,
            };
            let outcome = amend::approve(&store, &approve_cli.id, &semantic, &opts)?;
            println!(
                "proposal {}: {}",
                outcome.proposal.proposal_id,
                outcome.proposal.state.as_str()
            );
            if let Some(report) = &outcome.canary {
                println!(
                    "canary: {} ({} findings)",
                    match report.verdict {
                        Verdict::Pass => "PASS".green(),
                        Verdict::Fail => "FAIL".red(),
                    },
                    report.findings.len()
                );
            }
            Ok(outcome.proposal.state == amend::ProposalState::Ratified
                || !outcome.proposal.state.is_terminal())
        }
        Command::Reject(reject_cli) => {
            let proposal = amend::reject(&store, &reject_cli.id, &reject_cli.reason)?;
            println!("proposal {} rejected", proposal.proposal_id);
            Ok(true)
        }
        Command::Proposals(format_cli) => {
            let proposals = amend::list_proposals(&store)?;
            if format_cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&proposals)?);
            } else if proposals.is_empty() {
                println!("no pending proposals");
            } else {
                for p in &proposals {
                    println!(
                        "{} {} {} -> {} ({} signatures)",
                        p.proposal_id,
                        p.state.as_str(),
                        p.change_tier.as_str(),
                        p.target_path,
                        p.signatures.len()
                    );
                }
            }
            Ok(true)
        }
        Command::Keygen => {
            let (secret, public) = amend::generate_keypair();
            println!("secret: {}", secret);
            println!("public: {}", public);
            Ok(true)
        }
    }
}
