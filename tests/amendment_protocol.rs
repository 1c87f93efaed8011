use covenant::core::error::CovenantError;
use covenant::core::rules::{self, ChangeTier, RuleSet};
use covenant::core::store::Store;
use covenant::engine::amend::{self, ProposalState};
use covenant::engine::audit::AuditOptions;
use covenant::engine::semantic::NullSemanticIndex;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
    fs::write(path, content).expect("write");
}

/// Two registered approvers with freshly generated keys. Returns their
/// secret keys; the public halves land in the approver registry.
fn seed(root: &Path) -> (String, String) {
    fs::create_dir_all(root.join("constitution/rules")).expect("mkdir");
    let (alice_secret, alice_public) = amend::generate_keypair();
    let (bob_secret, bob_public) = amend::generate_keypair();
    write(
        root,
        "constitution/approvers.toml",
        &format!(
            "[approvers]\nalice = \"{}\"\nbob = \"{}\"\n\n[quorum]\nstandard = 1\ncritical = 2\n",
            alice_public, bob_public
        ),
    );
    (alice_secret, bob_secret)
}

fn ruleset(root: &Path) -> RuleSet {
    rules::load_ruleset(&root.join("constitution")).expect("load")
}

const STYLE_RULE_DOC: &str = r#"schema = "1"
category = "style"

[[rules]]
rule_id = "no_print_calls"
description = "print statements belong in the logger"
check_type = "ast"
severity = "warning"
applies_to = "**/*.py"
pattern = "call:print"
"#;

fn propose_style_rule(store: &Store, tier: ChangeTier) -> amend::Proposal {
    amend::create_proposal(
        store,
        "constitution/rules/style.toml",
        "codify the logging convention",
        STYLE_RULE_DOC,
        tier,
    )
    .expect("create")
}

#[test]
fn targets_outside_the_constitution_are_refused() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path());
    let store = Store::open(tmp.path()).unwrap();

    for target in ["src/main.rs", "constitution/../src/main.rs", "rules/x.toml"] {
        let err = amend::create_proposal(&store, target, "j", "content", ChangeTier::Standard)
            .unwrap_err();
        assert!(matches!(err, CovenantError::Configuration(_)), "{}", target);
    }
}

#[test]
fn one_signature_under_critical_quorum_stays_signed() {
    let tmp = TempDir::new().unwrap();
    let (alice_secret, _) = seed(tmp.path());
    let store = Store::open(tmp.path()).unwrap();
    let registry = ruleset(tmp.path()).registry;

    let proposal = propose_style_rule(&store, ChangeTier::Critical);
    assert_eq!(proposal.state, ProposalState::Draft);

    let signed = amend::sign_with_key(
        &store,
        &proposal.proposal_id,
        "alice",
        &alice_secret,
        &registry,
    )
    .expect("sign");
    assert_eq!(signed.state, ProposalState::Signed);

    let outcome = amend::approve(
        &store,
        &proposal.proposal_id,
        &NullSemanticIndex,
        &AuditOptions::default(),
    )
    .expect("approve");
    assert_eq!(outcome.proposal.state, ProposalState::Signed);
    assert!(outcome.canary.is_none());
}

#[test]
fn quorum_counts_distinct_signers_only() {
    let tmp = TempDir::new().unwrap();
    let (alice_secret, bob_secret) = seed(tmp.path());
    let store = Store::open(tmp.path()).unwrap();
    let registry = ruleset(tmp.path()).registry;

    let proposal = propose_style_rule(&store, ChangeTier::Critical);
    let id = proposal.proposal_id.clone();

    amend::sign_with_key(&store, &id, "alice", &alice_secret, &registry).unwrap();
    let twice = amend::sign_with_key(&store, &id, "alice", &alice_secret, &registry).unwrap();
    assert_eq!(twice.signatures.len(), 2);
    assert_eq!(twice.state, ProposalState::Signed);

    let both = amend::sign_with_key(&store, &id, "bob", &bob_secret, &registry).unwrap();
    assert_eq!(both.state, ProposalState::QuorumMet);
}

#[test]
fn invalid_signature_is_rejected_without_state_change() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path());
    let store = Store::open(tmp.path()).unwrap();
    let registry = ruleset(tmp.path()).registry;

    let proposal = propose_style_rule(&store, ChangeTier::Standard);
    let err = amend::add_signature(
        &store,
        &proposal.proposal_id,
        "alice",
        &"ab".repeat(64),
        &registry,
    )
    .unwrap_err();
    assert!(matches!(err, CovenantError::Signature(_)));

    let reloaded = amend::load_proposal(&store, &proposal.proposal_id).unwrap();
    assert_eq!(reloaded.state, ProposalState::Draft);
    assert!(reloaded.signatures.is_empty());
}

#[test]
fn unknown_signer_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let (alice_secret, _) = seed(tmp.path());
    let store = Store::open(tmp.path()).unwrap();
    let registry = ruleset(tmp.path()).registry;

    let proposal = propose_style_rule(&store, ChangeTier::Standard);
    let err = amend::sign_with_key(
        &store,
        &proposal.proposal_id,
        "mallory",
        &alice_secret,
        &registry,
    )
    .unwrap_err();
    match err {
        CovenantError::Signature(msg) => assert!(msg.contains("unknown signer")),
        other => panic!("expected signature error, got {:?}", other),
    }
}

#[test]
fn standard_amendment_ratifies_after_a_passing_canary() {
    let tmp = TempDir::new().unwrap();
    let (alice_secret, _) = seed(tmp.path());
    write(tmp.path(), "api/app.py", "def run():\n    return 0\n");
    let store = Store::open(tmp.path()).unwrap();
    let registry = ruleset(tmp.path()).registry;

    let proposal = propose_style_rule(&store, ChangeTier::Standard);
    let id = proposal.proposal_id.clone();
    amend::sign_with_key(&store, &id, "alice", &alice_secret, &registry).unwrap();

    let outcome = amend::approve(&store, &id, &NullSemanticIndex, &AuditOptions::default())
        .expect("approve");
    assert_eq!(outcome.proposal.state, ProposalState::Ratified);
    let canary = outcome.canary.expect("canary ran");
    assert_eq!(canary.verdict, covenant::engine::audit::Verdict::Pass);

    // The live constitution now carries the amendment.
    let written =
        fs::read_to_string(tmp.path().join("constitution/rules/style.toml")).unwrap();
    assert_eq!(written, STYLE_RULE_DOC);
    assert!(ruleset(tmp.path())
        .rules
        .iter()
        .any(|r| r.rule_id == "no_print_calls"));

    // Terminal proposals leave the pending ledger for the archive.
    assert!(matches!(
        amend::load_proposal(&store, &id),
        Err(CovenantError::NotFound(_))
    ));
    assert!(store
        .proposal_archive_dir()
        .join(format!("{}.json", id))
        .exists());
    assert!(amend::list_proposals(&store).unwrap().is_empty());
}

#[test]
fn failing_canary_rejects_and_leaves_the_constitution_untouched() {
    let tmp = TempDir::new().unwrap();
    let (alice_secret, _) = seed(tmp.path());
    write(tmp.path(), "api/app.py", "def run():\n    # TODO: handle errors\n    return 0\n");
    let store = Store::open(tmp.path()).unwrap();
    let registry = ruleset(tmp.path()).registry;

    let proposal = amend::create_proposal(
        &store,
        "constitution/rules/quality.toml",
        "forbid unresolved TODO markers",
        r#"schema = "1"
category = "quality"

[[rules]]
rule_id = "no_todo_markers"
description = "unresolved TODO markers"
check_type = "regex"
severity = "error"
applies_to = "**/*.py"
pattern = "TODO"
"#,
        ChangeTier::Standard,
    )
    .unwrap();
    let id = proposal.proposal_id.clone();
    amend::sign_with_key(&store, &id, "alice", &alice_secret, &registry).unwrap();

    let outcome = amend::approve(&store, &id, &NullSemanticIndex, &AuditOptions::default())
        .expect("approve");
    assert_eq!(outcome.proposal.state, ProposalState::Rejected);
    assert!(outcome
        .proposal
        .evidence
        .iter()
        .any(|f| f.rule_id == "no_todo_markers" && f.file_path == "api/app.py"));
    assert!(outcome.proposal.rejection_reason.is_some());

    // The amendment was never applied.
    assert!(!tmp.path().join("constitution/rules/quality.toml").exists());
}

#[test]
fn amendment_that_breaks_constitution_loading_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let (alice_secret, _) = seed(tmp.path());
    let store = Store::open(tmp.path()).unwrap();
    let registry = ruleset(tmp.path()).registry;

    let proposal = amend::create_proposal(
        &store,
        "constitution/rules/broken.toml",
        "oops",
        "this is not [ valid toml",
        ChangeTier::Standard,
    )
    .unwrap();
    let id = proposal.proposal_id.clone();
    amend::sign_with_key(&store, &id, "alice", &alice_secret, &registry).unwrap();

    let outcome = amend::approve(&store, &id, &NullSemanticIndex, &AuditOptions::default())
        .expect("approve");
    assert_eq!(outcome.proposal.state, ProposalState::Rejected);
    assert!(outcome
        .proposal
        .evidence
        .iter()
        .any(|f| f.rule_id == "canary.configuration"));
    assert!(!tmp.path().join("constitution/rules/broken.toml").exists());
}

#[test]
fn rejection_records_the_reason_and_archives() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path());
    let store = Store::open(tmp.path()).unwrap();

    let proposal = propose_style_rule(&store, ChangeTier::Standard);
    let rejected = amend::reject(&store, &proposal.proposal_id, "superseded by style.v2")
        .expect("reject");
    assert_eq!(rejected.state, ProposalState::Rejected);
    assert_eq!(
        rejected.rejection_reason.as_deref(),
        Some("superseded by style.v2")
    );
    assert!(amend::list_proposals(&store).unwrap().is_empty());
}

#[test]
fn terminal_proposals_accept_no_further_transitions() {
    let tmp = TempDir::new().unwrap();
    let (alice_secret, _) = seed(tmp.path());
    let store = Store::open(tmp.path()).unwrap();
    let registry = ruleset(tmp.path()).registry;

    let proposal = propose_style_rule(&store, ChangeTier::Standard);
    let id = proposal.proposal_id.clone();
    amend::reject(&store, &id, "withdrawn").unwrap();

    // The archived copy is no longer addressable for signing or rejection.
    let sign_err =
        amend::sign_with_key(&store, &id, "alice", &alice_secret, &registry).unwrap_err();
    assert!(matches!(sign_err, CovenantError::NotFound(_)));
    let reject_err = amend::reject(&store, &id, "again").unwrap_err();
    assert!(matches!(reject_err, CovenantError::NotFound(_)));
}
