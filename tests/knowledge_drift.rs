use covenant::core::rules::{self, RuleSet};
use covenant::core::store::Store;
use covenant::engine::drift;
use covenant::engine::knowledge;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
    fs::write(path, content).expect("write");
}

fn ruleset(root: &Path) -> RuleSet {
    fs::create_dir_all(root.join("constitution/rules")).expect("mkdir");
    rules::load_ruleset(&root.join("constitution")).expect("load")
}

const DB_MODULE: &str = r#"import os

def connect(dsn):
    handle = os.open(dsn)
    return handle

def close(handle):
    handle.release()
"#;

const USERS_MODULE: &str = r#"import services.db

class UserRepo:
    def fetch(self, user_id):
        conn = services.db.connect(user_id)
        return conn
"#;

#[test]
fn snapshot_build_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "services/db.py", DB_MODULE);
    write(tmp.path(), "api/users.py", USERS_MODULE);
    let ruleset = ruleset(tmp.path());

    let a = knowledge::build_snapshot(tmp.path(), &ruleset).unwrap();
    let b = knowledge::build_snapshot(tmp.path(), &ruleset).unwrap();

    assert_eq!(a, b);
    assert_eq!(a.root_hash, b.root_hash);
    // Byte-identical under serialization, not just structurally equal.
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}

#[test]
fn snapshot_roundtrips_through_sqlite() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "services/db.py", DB_MODULE);
    write(tmp.path(), "api/users.py", USERS_MODULE);
    write(
        tmp.path(),
        "constitution/domains.toml",
        r#"
[domains.api]
owned_paths = ["api/**"]
default_capability = "user-facing"

[domains.services]
owned_paths = ["services/**"]
"#,
    );
    let ruleset = ruleset(tmp.path());
    let store = Store::open(tmp.path()).unwrap();

    let built = knowledge::build_snapshot(tmp.path(), &ruleset).unwrap();
    knowledge::save_snapshot(&store, &built).unwrap();
    let loaded = knowledge::load_snapshot(&store).unwrap().expect("stored");

    assert_eq!(built, loaded);
    assert!(loaded.symbols.contains_key("api.users.UserRepo.fetch"));
    assert_eq!(
        loaded.symbols["api.users.UserRepo"].capability.as_deref(),
        Some("user-facing")
    );
}

#[test]
fn corrupted_symbol_kind_surfaces_as_an_error() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "services/db.py", DB_MODULE);
    let ruleset = ruleset(tmp.path());
    let store = Store::open(tmp.path()).unwrap();

    let built = knowledge::build_snapshot(tmp.path(), &ruleset).unwrap();
    knowledge::save_snapshot(&store, &built).unwrap();

    let conn = covenant::core::db::db_connect(&store.knowledge_db_path()).unwrap();
    conn.execute("UPDATE symbols SET kind = 'gizmo'", []).unwrap();
    drop(conn);

    let err = knowledge::load_snapshot(&store).unwrap_err();
    assert!(matches!(
        err,
        covenant::core::error::CovenantError::Sqlite(_)
    ));
}

#[test]
fn no_snapshot_stored_yet_loads_as_none() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    assert!(knowledge::load_snapshot(&store).unwrap().is_none());
}

#[test]
fn editing_one_function_drifts_exactly_that_symbol() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "services/db.py", DB_MODULE);
    write(tmp.path(), "api/users.py", USERS_MODULE);
    let ruleset = ruleset(tmp.path());

    let prev = knowledge::build_snapshot(tmp.path(), &ruleset).unwrap();

    write(
        tmp.path(),
        "services/db.py",
        &DB_MODULE.replace("handle.release()", "handle.shutdown()"),
    );
    let cur = knowledge::build_snapshot(tmp.path(), &ruleset).unwrap();

    let report = drift::diff(&prev, &cur);
    assert_eq!(report.changed, vec!["services.db.close".to_string()]);
    assert!(report.added.is_empty());
    assert!(report.removed.is_empty());
    assert!(report.reclassified.is_empty());
    assert_ne!(prev.root_hash, cur.root_hash);
}

#[test]
fn reformatting_is_not_drift() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "services/db.py", DB_MODULE);
    let ruleset = ruleset(tmp.path());
    let prev = knowledge::build_snapshot(tmp.path(), &ruleset).unwrap();

    // Same statements, different whitespace and comments.
    write(
        tmp.path(),
        "services/db.py",
        r#"import os


def connect(dsn):
    # acquire
    handle =   os.open(dsn)
    return handle

def close(handle):
    handle.release()
"#,
    );
    let cur = knowledge::build_snapshot(tmp.path(), &ruleset).unwrap();

    assert!(drift::diff(&prev, &cur).is_clean());
    assert_eq!(prev.root_hash, cur.root_hash);
}

#[test]
fn remapping_a_domain_reclassifies_without_structural_change() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "services/db.py", DB_MODULE);
    let prev = {
        let ruleset = ruleset(tmp.path());
        knowledge::build_snapshot(tmp.path(), &ruleset).unwrap()
    };

    write(
        tmp.path(),
        "constitution/domains.toml",
        "[domains.services]\nowned_paths = [\"services/**\"]\n",
    );
    let cur = {
        let ruleset = ruleset(tmp.path());
        knowledge::build_snapshot(tmp.path(), &ruleset).unwrap()
    };

    let report = drift::diff(&prev, &cur);
    assert!(report.changed.is_empty());
    assert!(report.added.is_empty());
    assert!(report.removed.is_empty());
    assert_eq!(
        report.reclassified,
        vec![
            "services.db".to_string(),
            "services.db.close".to_string(),
            "services.db.connect".to_string(),
        ]
    );
}

#[test]
fn added_and_removed_follow_the_file_set() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "services/db.py", DB_MODULE);
    let ruleset = ruleset(tmp.path());
    let prev = knowledge::build_snapshot(tmp.path(), &ruleset).unwrap();

    write(tmp.path(), "services/cache.py", "def get(key):\n    return key\n");
    fs::remove_file(tmp.path().join("services/db.py")).unwrap();
    let cur = knowledge::build_snapshot(tmp.path(), &ruleset).unwrap();

    let report = drift::diff(&prev, &cur);
    assert_eq!(
        report.added,
        vec!["services.cache".to_string(), "services.cache.get".to_string()]
    );
    assert_eq!(
        report.removed,
        vec![
            "services.db".to_string(),
            "services.db.close".to_string(),
            "services.db.connect".to_string(),
        ]
    );
}

#[test]
fn file_turning_unparsable_registers_as_drift() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "services/db.py", DB_MODULE);
    let ruleset = ruleset(tmp.path());
    let prev = knowledge::build_snapshot(tmp.path(), &ruleset).unwrap();

    write(tmp.path(), "services/db.py", "def broken():\n    s = \"\"\"oops\n");
    let cur = knowledge::build_snapshot(tmp.path(), &ruleset).unwrap();

    assert_eq!(cur.unparsed, vec!["services/db.py".to_string()]);
    let report = drift::diff(&prev, &cur);
    assert!(!report.removed.is_empty());
    assert_ne!(prev.root_hash, cur.root_hash);
}
