//! Knowledge Graph Builder and snapshot persistence.
//!
//! The builder walks the governed tree, parses each source file once, and
//! derives Symbols, import edges, and capability assignments. The resulting
//! snapshot is fully determined by tree content: two builds over an unchanged
//! tree are byte-identical (BTreeMap ordering, no wall-clock fields), which
//! is what makes drift detection meaningful.
//!
//! Persistence is a single sqlite database under `.covenant/`. Writes are
//! single-writer (in-process lock) and transactional, so concurrent readers
//! observe either the previous or the new snapshot, never a partial one.

use crate::core::db;
use crate::core::error::CovenantError;
use crate::core::parse::{self, NodeKind, ParsedFile, SyntaxNode};
use crate::core::rules::RuleSet;
use crate::core::store::Store;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Module,
    Class,
    Function,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Module => "module",
            SymbolKind::Class => "class",
            SymbolKind::Function => "function",
        }
    }

    fn from_str(s: &str) -> Option<SymbolKind> {
        match s {
            "module" => Some(SymbolKind::Module),
            "class" => Some(SymbolKind::Class),
            "function" => Some(SymbolKind::Function),
            _ => None,
        }
    }
}

/// One entry in the knowledge graph. Written exclusively by the builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub qualified_name: String,
    pub kind: SymbolKind,
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub domain: Option<String>,
    pub capability: Option<String>,
    pub structural_hash: String,
    pub is_public: bool,
}

/// An import recorded at build time, with both endpoints resolved to domains
/// where possible. Imports of modules outside the tree resolve to no domain
/// and are invisible to the boundary checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportEdge {
    pub from_file: String,
    pub from_domain: Option<String>,
    pub target_module: String,
    pub target_domain: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KnowledgeSnapshot {
    pub root_hash: String,
    pub symbols: BTreeMap<String, Symbol>,
    pub imports: Vec<ImportEdge>,
    /// Files the structural parser could not read. Kept in the snapshot so
    /// an unparseable file still registers as tree content.
    pub unparsed: Vec<String>,
}

impl KnowledgeSnapshot {
    pub fn symbols_in_domain<'a>(&'a self, domain: &'a str) -> impl Iterator<Item = &'a Symbol> {
        self.symbols
            .values()
            .filter(move |s| s.domain.as_deref() == Some(domain))
    }
}

const SKIP_DIRS: &[&str] = &[".git", "target", ".covenant", "__pycache__", "node_modules"];

/// Collect repo-relative paths of every file in the governed tree, sorted.
pub fn collect_files(repo_root: &Path) -> Result<Vec<String>, CovenantError> {
    fn recurse(
        root: &Path,
        dir: &Path,
        out: &mut Vec<String>,
    ) -> Result<(), CovenantError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
                if SKIP_DIRS.contains(&name) {
                    continue;
                }
                recurse(root, &path, out)?;
            } else if path.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    recurse(repo_root, repo_root, &mut files)?;
    files.sort();
    Ok(files)
}

/// Resolve a dotted module to a repo-relative file path, if it names a file
/// inside the tree.
fn resolve_module(files: &BTreeSet<String>, module: &str) -> Option<String> {
    let base = module.replace('.', "/");
    let direct = format!("{}.py", base);
    if files.contains(&direct) {
        return Some(direct);
    }
    let pkg = format!("{}/__init__.py", base);
    if files.contains(&pkg) {
        return Some(pkg);
    }
    None
}

fn record_node(
    node: &SyntaxNode,
    parent_qualified: &str,
    file: &ParsedFile,
    domain: Option<&str>,
    default_capability: Option<&str>,
    symbols: &mut BTreeMap<String, Symbol>,
) {
    let qualified = format!("{}.{}", parent_qualified, node.name);
    let capability = node
        .capability_marker
        .clone()
        .or_else(|| default_capability.map(|s| s.to_string()));
    symbols.insert(
        qualified.clone(),
        Symbol {
            qualified_name: qualified.clone(),
            kind: match node.kind {
                NodeKind::Class => SymbolKind::Class,
                NodeKind::Function => SymbolKind::Function,
            },
            file_path: file.rel_path.clone(),
            line_start: node.line_start,
            line_end: node.line_end,
            domain: domain.map(|s| s.to_string()),
            capability,
            structural_hash: node.structural_hash(),
            is_public: node.is_public,
        },
    );
    for child in &node.children {
        record_node(child, &qualified, file, domain, default_capability, symbols);
    }
}

/// Build a snapshot of the tree under the given constitution. Idempotent:
/// no wall-clock data enters the result.
pub fn build_snapshot(
    repo_root: &Path,
    ruleset: &RuleSet,
) -> Result<KnowledgeSnapshot, CovenantError> {
    let files = collect_files(repo_root)?;
    let file_set: BTreeSet<String> = files.iter().cloned().collect();

    let mut symbols: BTreeMap<String, Symbol> = BTreeMap::new();
    let mut imports: Vec<ImportEdge> = Vec::new();
    let mut unparsed: Vec<String> = Vec::new();

    for rel in &files {
        if !parse::is_parsable_path(rel) {
            continue;
        }
        let content = match fs::read_to_string(repo_root.join(rel)) {
            Ok(c) => c,
            Err(_) => {
                unparsed.push(rel.clone());
                continue;
            }
        };
        let parsed = match parse::parse_source(rel, &content) {
            Ok(p) => p,
            Err(_) => {
                unparsed.push(rel.clone());
                continue;
            }
        };

        let domain = ruleset.domain_for_path(rel);
        let domain_name = domain.map(|d| d.name.as_str());
        let default_capability = domain.and_then(|d| d.default_capability.as_deref());

        let line_count = content.lines().count() as u32;
        let module_capability = parsed
            .module_capability
            .clone()
            .or_else(|| default_capability.map(|s| s.to_string()));
        symbols.insert(
            parsed.module_name.clone(),
            Symbol {
                qualified_name: parsed.module_name.clone(),
                kind: SymbolKind::Module,
                file_path: rel.clone(),
                line_start: 1,
                line_end: line_count.max(1),
                domain: domain_name.map(|s| s.to_string()),
                capability: module_capability,
                structural_hash: parsed.module_hash(),
                is_public: true,
            },
        );

        for node in &parsed.nodes {
            record_node(
                node,
                &parsed.module_name,
                &parsed,
                domain_name,
                default_capability,
                &mut symbols,
            );
        }

        for import in &parsed.imports {
            let target_domain = resolve_module(&file_set, &import.module)
                .and_then(|path| ruleset.domain_for_path(&path))
                .map(|d| d.name.clone());
            imports.push(ImportEdge {
                from_file: rel.clone(),
                from_domain: domain_name.map(|s| s.to_string()),
                target_module: import.module.clone(),
                target_domain,
                line: import.line,
            });
        }
    }

    imports.sort_by(|a, b| {
        (&a.from_file, a.line, &a.target_module).cmp(&(&b.from_file, b.line, &b.target_module))
    });
    unparsed.sort();

    let mut snapshot = KnowledgeSnapshot {
        root_hash: String::new(),
        symbols,
        imports,
        unparsed,
    };
    snapshot.root_hash = compute_root_hash(&snapshot);
    Ok(snapshot)
}

fn compute_root_hash(snapshot: &KnowledgeSnapshot) -> String {
    let mut hasher = Sha256::new();
    for symbol in snapshot.symbols.values() {
        hasher.update(&symbol.qualified_name);
        hasher.update("\u{1}");
        hasher.update(symbol.kind.as_str());
        hasher.update("\u{1}");
        hasher.update(&symbol.structural_hash);
        hasher.update("\u{1}");
        hasher.update(symbol.domain.as_deref().unwrap_or(""));
        hasher.update("\u{1}");
        hasher.update(symbol.capability.as_deref().unwrap_or(""));
        hasher.update("\u{2}");
    }
    for edge in &snapshot.imports {
        hasher.update(&edge.from_file);
        hasher.update("\u{1}");
        hasher.update(&edge.target_module);
        hasher.update("\u{2}");
    }
    for path in &snapshot.unparsed {
        hasher.update(path);
        hasher.update("\u{2}");
    }
    format!("{:x}", hasher.finalize())
}

const KNOWLEDGE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS symbols(
    qualified_name TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    file_path TEXT NOT NULL,
    line_start INTEGER NOT NULL,
    line_end INTEGER NOT NULL,
    domain TEXT,
    capability TEXT,
    structural_hash TEXT NOT NULL,
    is_public INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_symbols_domain ON symbols(domain);
CREATE TABLE IF NOT EXISTS imports(
    from_file TEXT NOT NULL,
    from_domain TEXT,
    target_module TEXT NOT NULL,
    target_domain TEXT,
    line INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS meta(
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

// Snapshot writes are single-writer relative to concurrent readers.
static SNAPSHOT_WRITE_LOCK: Mutex<()> = Mutex::new(());

/// Persist a snapshot, replacing the previous one in a single transaction.
pub fn save_snapshot(store: &Store, snapshot: &KnowledgeSnapshot) -> Result<(), CovenantError> {
    let _guard = SNAPSHOT_WRITE_LOCK.lock().unwrap();
    let mut conn = db::db_connect(&store.knowledge_db_path())?;
    conn.execute_batch(KNOWLEDGE_SCHEMA)?;

    let tx = conn.transaction()?;
    tx.execute("DELETE FROM symbols", [])?;
    tx.execute("DELETE FROM imports", [])?;
    for symbol in snapshot.symbols.values() {
        tx.execute(
            "INSERT INTO symbols(qualified_name, kind, file_path, line_start, line_end, domain, capability, structural_hash, is_public)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                symbol.qualified_name,
                symbol.kind.as_str(),
                symbol.file_path,
                symbol.line_start,
                symbol.line_end,
                symbol.domain,
                symbol.capability,
                symbol.structural_hash,
                symbol.is_public as i64,
            ],
        )?;
    }
    for edge in &snapshot.imports {
        tx.execute(
            "INSERT INTO imports(from_file, from_domain, target_module, target_domain, line)
             VALUES(?1, ?2, ?3, ?4, ?5)",
            params![
                edge.from_file,
                edge.from_domain,
                edge.target_module,
                edge.target_domain,
                edge.line,
            ],
        )?;
    }
    tx.execute(
        "INSERT INTO meta(key, value) VALUES('root_hash', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![snapshot.root_hash],
    )?;
    tx.execute(
        "INSERT INTO meta(key, value) VALUES('unparsed', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![serde_json::to_string(&snapshot.unparsed)?],
    )?;
    tx.execute(
        "INSERT INTO meta(key, value) VALUES('generated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![chrono::Utc::now().to_rfc3339()],
    )?;
    tx.commit()?;
    Ok(())
}

/// Load the stored snapshot, or None when no sync has happened yet.
pub fn load_snapshot(store: &Store) -> Result<Option<KnowledgeSnapshot>, CovenantError> {
    let db_path = store.knowledge_db_path();
    if !db_path.exists() {
        return Ok(None);
    }
    let conn = db::db_connect(&db_path)?;
    conn.execute_batch(KNOWLEDGE_SCHEMA)?;

    let root_hash: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = 'root_hash'", [], |row| {
            row.get(0)
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    let Some(root_hash) = root_hash else {
        return Ok(None);
    };

    let mut symbols = BTreeMap::new();
    let mut stmt = conn.prepare(
        "SELECT qualified_name, kind, file_path, line_start, line_end, domain, capability, structural_hash, is_public
         FROM symbols ORDER BY qualified_name",
    )?;
    let rows = stmt.query_map([], |row| {
        let kind_raw: String = row.get(1)?;
        // A kind this build does not know means the store is corrupt or from
        // an incompatible version; reclassifying it would falsify the graph.
        let kind = SymbolKind::from_str(&kind_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown symbol kind '{}'", kind_raw).into(),
            )
        })?;
        Ok(Symbol {
            qualified_name: row.get(0)?,
            kind,
            file_path: row.get(2)?,
            line_start: row.get::<_, i64>(3)? as u32,
            line_end: row.get::<_, i64>(4)? as u32,
            domain: row.get(5)?,
            capability: row.get(6)?,
            structural_hash: row.get(7)?,
            is_public: row.get::<_, i64>(8)? != 0,
        })
    })?;
    for row in rows {
        let symbol = row?;
        symbols.insert(symbol.qualified_name.clone(), symbol);
    }

    let mut imports = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT from_file, from_domain, target_module, target_domain, line
         FROM imports ORDER BY from_file, line, target_module",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(ImportEdge {
            from_file: row.get(0)?,
            from_domain: row.get(1)?,
            target_module: row.get(2)?,
            target_domain: row.get(3)?,
            line: row.get::<_, i64>(4)? as u32,
        })
    })?;
    for row in rows {
        imports.push(row?);
    }

    let unparsed: Vec<String> = conn
        .query_row("SELECT value FROM meta WHERE key = 'unparsed'", [], |row| {
            row.get::<_, String>(0)
        })
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    Ok(Some(KnowledgeSnapshot {
        root_hash,
        symbols,
        imports,
        unparsed,
    }))
}
