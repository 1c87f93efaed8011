//! Amendment Protocol.
//!
//! Changes to the constitution travel through a proposal state machine:
//!
//! `Draft -> Signed -> QuorumMet -> CanaryValidated -> Ratified | Rejected`
//!
//! Every signature is verified against the signer's registered ed25519
//! public key over a canonical digest of the proposal; quorum counts
//! distinct valid signers only. Before ratification the engine rebuilds the
//! RuleSet and knowledge snapshot inside an isolated copy of the
//! constitution with the proposed content applied, and runs a full audit
//! there. The live constitution is mutated at exactly one transition,
//! Ratified, and only after that simulated audit passes: the system never
//! accepts an amendment it could not audit itself under.

use crate::core::error::CovenantError;
use crate::core::rules::{self, ApproverRegistry, ChangeTier};
use crate::core::store::Store;
use crate::engine::audit::{self, AuditOptions, AuditReport, Verdict};
use crate::engine::gates::Finding;
use crate::engine::knowledge;
use crate::engine::semantic::SemanticIndex;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Draft,
    Signed,
    QuorumMet,
    CanaryValidated,
    Ratified,
    Rejected,
}

impl ProposalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalState::Ratified | ProposalState::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalState::Draft => "draft",
            ProposalState::Signed => "signed",
            ProposalState::QuorumMet => "quorum_met",
            ProposalState::CanaryValidated => "canary_validated",
            ProposalState::Ratified => "ratified",
            ProposalState::Rejected => "rejected",
        }
    }
}

/// A signature as submitted. The `verified` flag is computed against the
/// registry on every evaluation; the stored value is never trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub signer_id: String,
    /// Hex-encoded ed25519 signature over the canonical digest.
    pub signature: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: String,
    /// Repo-relative path inside the constitution directory.
    pub target_path: String,
    pub justification: String,
    pub new_content: String,
    pub change_tier: ChangeTier,
    pub signatures: Vec<Signature>,
    pub state: ProposalState,
    /// Rejection evidence: the simulated findings on canary failure, or the
    /// stated reason.
    #[serde(default)]
    pub evidence: Vec<Finding>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Canonical serialization signed by approvers: the digest covers exactly
/// what ratification will do.
pub fn canonical_digest(proposal: &Proposal) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(proposal.target_path.as_bytes());
    hasher.update(b"\n");
    hasher.update(proposal.change_tier.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(proposal.new_content.as_bytes());
    hasher.finalize().into()
}

fn proposal_path(store: &Store, id: &str) -> PathBuf {
    store.proposals_dir().join(format!("{}.json", id))
}

/// Create a Draft proposal on disk. Targets must stay inside the
/// constitution directory; the amendment protocol governs nothing else.
pub fn create_proposal(
    store: &Store,
    target_path: &str,
    justification: &str,
    new_content: &str,
    change_tier: ChangeTier,
) -> Result<Proposal, CovenantError> {
    let normalized = target_path.replace('\\', "/");
    let inside = normalized.starts_with(&format!("{}/", crate::core::store::CONSTITUTION_DIR));
    if !inside || normalized.split('/').any(|seg| seg == "..") {
        return Err(CovenantError::Configuration(format!(
            "proposal target must be a path inside {}/: '{}'",
            crate::core::store::CONSTITUTION_DIR,
            target_path
        )));
    }

    let proposal = Proposal {
        proposal_id: Ulid::new().to_string(),
        target_path: normalized,
        justification: justification.to_string(),
        new_content: new_content.to_string(),
        change_tier,
        signatures: Vec::new(),
        state: ProposalState::Draft,
        evidence: Vec::new(),
        rejection_reason: None,
        created_at: Utc::now(),
    };
    save_proposal(store, &proposal)?;
    Ok(proposal)
}

pub fn save_proposal(store: &Store, proposal: &Proposal) -> Result<(), CovenantError> {
    fs::create_dir_all(store.proposals_dir())?;
    let path = proposal_path(store, &proposal.proposal_id);
    fs::write(&path, serde_json::to_string_pretty(proposal)?)?;
    Ok(())
}

pub fn load_proposal(store: &Store, id: &str) -> Result<Proposal, CovenantError> {
    let path = proposal_path(store, id);
    if !path.exists() {
        return Err(CovenantError::NotFound(format!("proposal '{}'", id)));
    }
    let content = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

pub fn list_proposals(store: &Store) -> Result<Vec<Proposal>, CovenantError> {
    let dir = store.proposals_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut proposals = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = fs::read_to_string(&path)?;
        proposals.push(serde_json::from_str::<Proposal>(&content)?);
    }
    proposals.sort_by(|a, b| a.proposal_id.cmp(&b.proposal_id));
    Ok(proposals)
}

fn decode_verifying_key(signer_id: &str, key_hex: &str) -> Result<VerifyingKey, CovenantError> {
    let bytes = hex::decode(key_hex).map_err(|_| {
        CovenantError::Signature(format!("signer '{}': malformed public key", signer_id))
    })?;
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        CovenantError::Signature(format!("signer '{}': public key must be 32 bytes", signer_id))
    })?;
    VerifyingKey::from_bytes(&arr).map_err(|_| {
        CovenantError::Signature(format!("signer '{}': invalid public key", signer_id))
    })
}

fn verify_one(
    proposal: &Proposal,
    signature: &Signature,
    registry: &ApproverRegistry,
) -> Result<(), CovenantError> {
    let key_hex = registry.approvers.get(&signature.signer_id).ok_or_else(|| {
        CovenantError::Signature(format!("unknown signer '{}'", signature.signer_id))
    })?;
    let key = decode_verifying_key(&signature.signer_id, key_hex)?;
    let sig_bytes = hex::decode(&signature.signature).map_err(|_| {
        CovenantError::Signature(format!(
            "signer '{}': malformed signature encoding",
            signature.signer_id
        ))
    })?;
    let sig = DalekSignature::from_slice(&sig_bytes).map_err(|_| {
        CovenantError::Signature(format!(
            "signer '{}': malformed signature",
            signature.signer_id
        ))
    })?;
    key.verify(&canonical_digest(proposal), &sig).map_err(|_| {
        CovenantError::Signature(format!(
            "signer '{}': signature does not verify",
            signature.signer_id
        ))
    })
}

/// Distinct signers whose signatures verify against the registry. A
/// repeated signature from one signer never increases the count.
pub fn distinct_valid_signers(
    proposal: &Proposal,
    registry: &ApproverRegistry,
) -> BTreeSet<String> {
    let mut signers = BTreeSet::new();
    for signature in &proposal.signatures {
        if verify_one(proposal, signature, registry).is_ok() {
            signers.insert(signature.signer_id.clone());
        }
    }
    signers
}

fn recompute_signing_state(proposal: &mut Proposal, registry: &ApproverRegistry) {
    let valid = distinct_valid_signers(proposal, registry);
    for signature in proposal.signatures.iter_mut() {
        signature.verified = valid.contains(&signature.signer_id);
    }
    // Only the pre-canary states are recomputed from signatures.
    if matches!(
        proposal.state,
        ProposalState::Draft | ProposalState::Signed | ProposalState::QuorumMet
    ) {
        proposal.state = if valid.len() >= registry.quorum.required(proposal.change_tier) {
            ProposalState::QuorumMet
        } else if valid.is_empty() {
            ProposalState::Draft
        } else {
            ProposalState::Signed
        };
    }
}

/// Attach a signature after verifying it. An invalid signature is rejected
/// without changing proposal state.
pub fn add_signature(
    store: &Store,
    id: &str,
    signer_id: &str,
    signature_hex: &str,
    registry: &ApproverRegistry,
) -> Result<Proposal, CovenantError> {
    let mut proposal = load_proposal(store, id)?;
    if proposal.state.is_terminal() {
        return Err(CovenantError::InvalidTransition(format!(
            "proposal '{}' is {}",
            id,
            proposal.state.as_str()
        )));
    }
    let candidate = Signature {
        signer_id: signer_id.to_string(),
        signature: signature_hex.to_string(),
        timestamp: Utc::now(),
        verified: false,
    };
    verify_one(&proposal, &candidate, registry)?;

    proposal.signatures.push(candidate);
    recompute_signing_state(&mut proposal, registry);
    save_proposal(store, &proposal)?;
    Ok(proposal)
}

/// Sign with a local secret key and attach the result.
pub fn sign_with_key(
    store: &Store,
    id: &str,
    signer_id: &str,
    secret_key_hex: &str,
    registry: &ApproverRegistry,
) -> Result<Proposal, CovenantError> {
    let bytes = hex::decode(secret_key_hex)
        .map_err(|_| CovenantError::Signature("malformed secret key".to_string()))?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CovenantError::Signature("secret key must be 32 bytes".to_string()))?;
    let signing_key = SigningKey::from_bytes(&arr);
    let proposal = load_proposal(store, id)?;
    let signature = signing_key.sign(&canonical_digest(&proposal));
    add_signature(store, id, signer_id, &hex::encode(signature.to_bytes()), registry)
}

/// Generate a fresh ed25519 keypair as (secret_hex, public_hex).
pub fn generate_keypair() -> (String, String) {
    use rand::RngCore;
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    let signing_key = SigningKey::from_bytes(&secret);
    (
        hex::encode(signing_key.to_bytes()),
        hex::encode(signing_key.verifying_key().to_bytes()),
    )
}

/// Lock guard serializing canary runs per proposal id.
struct CanaryLock {
    path: PathBuf,
}

impl CanaryLock {
    fn acquire(store: &Store, id: &str) -> Result<CanaryLock, CovenantError> {
        fs::create_dir_all(store.proposals_dir())?;
        let path = store.proposals_dir().join(format!("{}.lock", id));
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(CanaryLock { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(CovenantError::InvalidTransition(format!(
                    "a canary run is already in flight for proposal '{}'",
                    id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for CanaryLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn copy_dir(src: &Path, dst: &Path) -> Result<(), CovenantError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Run the canary simulation: audit the live tree under the hypothetical
/// constitution. Never touches the live constitution or the persisted
/// snapshot.
pub fn run_canary(
    store: &Store,
    proposal: &Proposal,
    semantic: &dyn SemanticIndex,
    opts: &AuditOptions,
) -> Result<AuditReport, CovenantError> {
    let _lock = CanaryLock::acquire(store, &proposal.proposal_id)?;

    let staging = std::env::temp_dir().join(format!("covenant-canary-{}", Ulid::new()));
    let staged_constitution = staging.join(crate::core::store::CONSTITUTION_DIR);
    copy_dir(&store.constitution_dir(), &staged_constitution)?;

    let target = staging.join(&proposal.target_path);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, &proposal.new_content)?;

    let result = (|| {
        // A proposal that breaks constitution loading must fail its canary,
        // not crash the protocol.
        let hypothetical = match rules::load_ruleset(&staged_constitution) {
            Ok(rs) => rs,
            Err(CovenantError::Configuration(msg)) => {
                let finding = Finding {
                    rule_id: "canary.configuration".to_string(),
                    file_path: proposal.target_path.clone(),
                    line: None,
                    severity: rules::Severity::Error,
                    blocking: true,
                    message: format!("amended constitution failed to load: {}", msg),
                };
                return Ok(synthetic_failure_report(finding));
            }
            Err(other) => return Err(other),
        };
        let snapshot = knowledge::build_snapshot(&store.repo_root, &hypothetical)?;
        audit::audit_tree(&store.repo_root, &hypothetical, &snapshot, semantic, opts)
    })();

    let _ = fs::remove_dir_all(&staging);
    result
}

fn synthetic_failure_report(finding: Finding) -> AuditReport {
    AuditReport {
        run_id: Ulid::new().to_string(),
        verdict: Verdict::Fail,
        error_count: 1,
        warning_count: 0,
        info_count: 0,
        findings: vec![finding],
        degraded: Vec::new(),
    }
}

/// Outcome of an approve step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveOutcome {
    pub proposal: Proposal,
    /// The canary report, when one was run.
    pub canary: Option<AuditReport>,
}

/// Drive the proposal forward as far as its evidence allows: quorum check,
/// canary simulation, then ratification. Quorum not yet met is a valid
/// pending state, not an error.
pub fn approve(
    store: &Store,
    id: &str,
    semantic: &dyn SemanticIndex,
    opts: &AuditOptions,
) -> Result<ApproveOutcome, CovenantError> {
    let ruleset = rules::load_ruleset(&store.constitution_dir())?;
    let registry = &ruleset.registry;

    let mut proposal = load_proposal(store, id)?;
    if proposal.state.is_terminal() {
        return Err(CovenantError::InvalidTransition(format!(
            "proposal '{}' is {}",
            id,
            proposal.state.as_str()
        )));
    }

    recompute_signing_state(&mut proposal, registry);
    save_proposal(store, &proposal)?;
    if matches!(proposal.state, ProposalState::Draft | ProposalState::Signed) {
        return Ok(ApproveOutcome {
            proposal,
            canary: None,
        });
    }

    let report = run_canary(store, &proposal, semantic, opts)?;
    if report.verdict != Verdict::Pass {
        proposal.state = ProposalState::Rejected;
        proposal.evidence = report.findings.clone();
        proposal.rejection_reason =
            Some("canary audit failed under the amended constitution".to_string());
        save_proposal(store, &proposal)?;
        archive_proposal(store, &proposal)?;
        return Ok(ApproveOutcome {
            proposal,
            canary: Some(report),
        });
    }

    proposal.state = ProposalState::CanaryValidated;
    save_proposal(store, &proposal)?;

    ratify(store, &mut proposal)?;
    Ok(ApproveOutcome {
        proposal,
        canary: Some(report),
    })
}

/// The single transition that mutates the live constitution.
fn ratify(store: &Store, proposal: &mut Proposal) -> Result<(), CovenantError> {
    if proposal.state != ProposalState::CanaryValidated {
        return Err(CovenantError::InvalidTransition(format!(
            "ratification requires a validated canary, proposal is {}",
            proposal.state.as_str()
        )));
    }

    let target = store.repo_root.join(&proposal.target_path);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, &proposal.new_content)?;

    proposal.state = ProposalState::Ratified;
    save_proposal(store, proposal)?;
    archive_proposal(store, proposal)?;

    // The constitution changed; derived knowledge must follow it.
    let ruleset = rules::load_ruleset(&store.constitution_dir())?;
    let snapshot = knowledge::build_snapshot(&store.repo_root, &ruleset)?;
    knowledge::save_snapshot(store, &snapshot)?;
    Ok(())
}

/// Reject from any non-terminal state, recording why. Live state untouched.
pub fn reject(store: &Store, id: &str, reason: &str) -> Result<Proposal, CovenantError> {
    let mut proposal = load_proposal(store, id)?;
    if proposal.state.is_terminal() {
        return Err(CovenantError::InvalidTransition(format!(
            "proposal '{}' is {}",
            id,
            proposal.state.as_str()
        )));
    }
    proposal.state = ProposalState::Rejected;
    proposal.rejection_reason = Some(reason.to_string());
    save_proposal(store, &proposal)?;
    archive_proposal(store, &proposal)?;
    Ok(proposal)
}

/// Terminal proposals move to the archive; the pending ledger only ever
/// holds live state machines.
fn archive_proposal(store: &Store, proposal: &Proposal) -> Result<(), CovenantError> {
    let archive = store.proposal_archive_dir();
    fs::create_dir_all(&archive)?;
    let from = proposal_path(store, &proposal.proposal_id);
    let to = archive.join(format!("{}.json", proposal.proposal_id));
    fs::write(&to, serde_json::to_string_pretty(proposal)?)?;
    if from.exists() {
        fs::remove_file(&from)?;
    }
    Ok(())
}
