use covenant::core::rules::Severity;
use covenant::core::store::Store;
use covenant::engine::audit::{self, AuditOptions, Verdict};
use covenant::engine::semantic::NullSemanticIndex;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
    fs::write(path, content).expect("write");
}

fn seed(root: &Path, domains_toml: &str) {
    fs::create_dir_all(root.join("constitution/rules")).expect("mkdir");
    write(root, "constitution/domains.toml", domains_toml);
}

fn audit(root: &Path) -> audit::AuditReport {
    let store = Store::open(root).unwrap();
    audit::run_audit(&store, &NullSemanticIndex, &AuditOptions::default()).expect("audit")
}

const THREE_DOMAINS: &str = r#"
[domains.api]
owned_paths = ["api/**"]
allowed_imports = ["services"]

[domains.services]
owned_paths = ["services/**"]

[domains.internal]
owned_paths = ["internal/**"]
"#;

#[test]
fn unlisted_import_is_denied_by_default() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path(), THREE_DOMAINS);
    write(tmp.path(), "api/app.py", "import internal.secrets\n");
    write(tmp.path(), "internal/secrets.py", "TOKEN = None\n");
    write(tmp.path(), "services/db.py", "def connect():\n    pass\n");

    let report = audit(tmp.path());
    assert_eq!(report.verdict, Verdict::Fail);
    let boundary: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.rule_id == "domain.boundary")
        .collect();
    assert_eq!(boundary.len(), 1);
    assert_eq!(boundary[0].file_path, "api/app.py");
    assert_eq!(boundary[0].line, Some(1));
    assert!(boundary[0].blocking);
    assert!(boundary[0].message.contains("'api'"));
    assert!(boundary[0].message.contains("'internal'"));
}

#[test]
fn allow_listed_import_passes() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path(), THREE_DOMAINS);
    write(tmp.path(), "api/app.py", "import services.db\n");
    write(tmp.path(), "services/db.py", "def connect():\n    pass\n");

    let report = audit(tmp.path());
    assert_eq!(report.verdict, Verdict::Pass);
    assert!(report.findings.is_empty());
}

#[test]
fn imports_outside_any_domain_are_invisible() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path(), THREE_DOMAINS);
    // Stdlib imports and un-owned files resolve to no domain.
    write(tmp.path(), "api/app.py", "import os\nimport scripts.tool\n");
    write(tmp.path(), "scripts/tool.py", "def run():\n    pass\n");

    let report = audit(tmp.path());
    assert_eq!(report.verdict, Verdict::Pass);
    assert!(report.findings.is_empty());
}

#[test]
fn active_waiver_downgrades_to_informational() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path(), THREE_DOMAINS);
    write(
        tmp.path(),
        "constitution/waivers.toml",
        r#"
[[waiver]]
source = "api"
target = "internal"
reason = "auth migration in progress"
expires_at = "2099-01-01T00:00:00Z"
"#,
    );
    write(tmp.path(), "api/app.py", "import internal.secrets\n");
    write(tmp.path(), "internal/secrets.py", "TOKEN = None\n");

    let report = audit(tmp.path());
    assert_eq!(report.verdict, Verdict::Pass);
    let boundary: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.rule_id == "domain.boundary")
        .collect();
    assert_eq!(boundary.len(), 1);
    assert_eq!(boundary[0].severity, Severity::Info);
    assert!(!boundary[0].blocking);
    assert!(boundary[0].message.contains("waived"));
}

#[test]
fn expired_waiver_is_treated_as_absent() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path(), THREE_DOMAINS);
    write(
        tmp.path(),
        "constitution/waivers.toml",
        r#"
[[waiver]]
source = "api"
target = "internal"
reason = "long since over"
expires_at = "2020-01-01T00:00:00Z"
"#,
    );
    write(tmp.path(), "api/app.py", "import internal.secrets\n");
    write(tmp.path(), "internal/secrets.py", "TOKEN = None\n");

    let report = audit(tmp.path());
    assert_eq!(report.verdict, Verdict::Fail);
    assert!(report
        .findings
        .iter()
        .any(|f| f.rule_id == "domain.boundary" && f.blocking));
}

#[test]
fn legal_edges_forming_a_cycle_still_fail() {
    let tmp = TempDir::new().unwrap();
    seed(
        tmp.path(),
        r#"
[domains.api]
owned_paths = ["api/**"]
allowed_imports = ["services"]

[domains.services]
owned_paths = ["services/**"]
allowed_imports = ["api"]
"#,
    );
    write(tmp.path(), "api/app.py", "import services.db\n");
    write(tmp.path(), "services/db.py", "import api.app\n");

    let report = audit(tmp.path());
    assert_eq!(report.verdict, Verdict::Fail);
    // Every edge is on the allow-list, so the only finding is the cycle.
    assert!(report
        .findings
        .iter()
        .all(|f| f.rule_id != "domain.boundary"));
    let cycles: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.rule_id == "domain.cycle")
        .collect();
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].file_path, "constitution/domains.toml");
    assert!(cycles[0].message.contains("api -> services -> api"));
}

#[test]
fn cycle_rule_can_be_demoted_through_enforcement() {
    let tmp = TempDir::new().unwrap();
    seed(
        tmp.path(),
        r#"
[domains.api]
owned_paths = ["api/**"]
allowed_imports = ["services"]

[domains.services]
owned_paths = ["services/**"]
allowed_imports = ["api"]
"#,
    );
    write(
        tmp.path(),
        "constitution/enforcement.toml",
        "\"domain.cycle\" = \"reporting\"\n",
    );
    write(tmp.path(), "api/app.py", "import services.db\n");
    write(tmp.path(), "services/db.py", "import api.app\n");

    let report = audit(tmp.path());
    assert_eq!(report.verdict, Verdict::Pass);
    assert!(report
        .findings
        .iter()
        .any(|f| f.rule_id == "domain.cycle" && !f.blocking));
}
