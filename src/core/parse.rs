//! Lightweight structural parser for governed Python sources.
//!
//! The parser extracts the structure the governance engine cares about:
//! class/function nesting, import statements, call sites, and a small set of
//! flagged constructs (e.g. bare `except:`). It is deliberately not a full
//! grammar; it is line-oriented and indentation-aware, which is enough to
//! produce stable qualified names and a normalized structural hash. Bracket
//! and backslash continuations are joined into one logical line before
//! indentation analysis, so multi-line signatures, call arguments, and
//! literals parse like their single-line forms.
//!
//! Structural hashes are computed over the normalized subtree (statement text
//! with collapsed whitespace, comments and blank lines dropped, string
//! bodies ignored), so reformatting a file never registers as drift.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Class,
    Function,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Class => "class",
            NodeKind::Function => "function",
        }
    }
}

/// One named scope (class or function) in a parsed file.
#[derive(Debug, Clone)]
pub struct SyntaxNode {
    pub kind: NodeKind,
    pub name: String,
    pub line_start: u32,
    pub line_end: u32,
    pub is_public: bool,
    pub capability_marker: Option<String>,
    /// Normalized statements that belong directly to this scope.
    pub body: Vec<String>,
    pub children: Vec<SyntaxNode>,
}

impl SyntaxNode {
    /// Hash of the normalized scope: kind, name, and the statements that
    /// belong directly to it. Nested scopes hash separately, so editing one
    /// symbol's body registers drift for exactly that symbol. Indentation
    /// width, blank lines and comments never contribute.
    pub fn structural_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str());
        hasher.update("\u{1}");
        hasher.update(&self.name);
        for stmt in &self.body {
            hasher.update("\u{2}");
            hasher.update(stmt);
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone)]
pub struct ImportStmt {
    pub module: String,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct CallSite {
    pub callee: String,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Construct {
    BareExcept,
    GlobalStatement,
    WildcardImport,
}

impl Construct {
    pub fn as_str(&self) -> &'static str {
        match self {
            Construct::BareExcept => "bare_except",
            Construct::GlobalStatement => "global_statement",
            Construct::WildcardImport => "wildcard_import",
        }
    }

    pub fn from_name(name: &str) -> Option<Construct> {
        match name {
            "bare_except" => Some(Construct::BareExcept),
            "global_statement" => Some(Construct::GlobalStatement),
            "wildcard_import" => Some(Construct::WildcardImport),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConstructSite {
    pub construct: Construct,
    pub line: u32,
}

/// Parse failure with enough context for a Finding.
#[derive(Debug, Clone)]
pub struct ParseFailure {
    pub line: u32,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub rel_path: String,
    pub module_name: String,
    /// Top-level class/function scopes.
    pub nodes: Vec<SyntaxNode>,
    pub imports: Vec<ImportStmt>,
    pub calls: Vec<CallSite>,
    pub constructs: Vec<ConstructSite>,
    /// Normalized module-level statements (outside any scope).
    pub module_body: Vec<String>,
    pub module_capability: Option<String>,
}

impl ParsedFile {
    /// Hash of the module's own statements. Scoped symbols hash separately.
    pub fn module_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for stmt in &self.module_body {
            hasher.update("\u{2}");
            hasher.update(stmt);
        }
        format!("{:x}", hasher.finalize())
    }
}

pub fn is_parsable_path(rel_path: &str) -> bool {
    rel_path.ends_with(".py")
}

/// Derive the dotted module name from a repo-relative path.
pub fn module_name_for_path(rel_path: &str) -> String {
    let trimmed = rel_path.strip_suffix(".py").unwrap_or(rel_path);
    let dotted = trimmed.replace('/', ".");
    dotted
        .strip_suffix(".__init__")
        .map(|s| s.to_string())
        .unwrap_or(dotted)
}

fn def_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap())
}

fn class_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^class\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap())
}

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^import\s+(.+)$").unwrap())
}

fn from_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^from\s+([A-Za-z_][\w.]*)\s+import\s+(.+)$").unwrap())
}

fn call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[^\w.])([A-Za-z_][\w.]*)\s*\(").unwrap())
}

fn capability_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"covenant:capability=([A-Za-z0-9_.\-]+)").unwrap())
}

/// Split a physical line into code and comment, respecting quote state.
fn split_comment(line: &str) -> (String, Option<String>) {
    let mut code = String::new();
    let mut chars = line.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                code.push(c);
                if c == '\\' {
                    if let Some(n) = chars.next() {
                        code.push(n);
                    }
                } else if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '#' {
                    let rest: String = chars.collect();
                    return (code, Some(rest));
                }
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                code.push(c);
            }
        }
    }
    (code, None)
}

/// Net open-bracket count of one code fragment, ignoring bracket characters
/// inside string literals.
fn bracket_delta(code: &str) -> i32 {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut chars = code.chars();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' {
                    chars.next();
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                _ => {}
            },
        }
    }
    depth
}

/// Strip a trailing line-continuation backslash, reporting whether one was
/// present.
fn strip_backslash(code: &str) -> (&str, bool) {
    match code.strip_suffix('\\') {
        Some(rest) => (rest.trim_end(), true),
        None => (code, false),
    }
}

fn indent_width(line: &str) -> Result<usize, String> {
    let mut width = 0usize;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => return Err("tab indentation is not supported".to_string()),
            _ => break,
        }
    }
    Ok(width)
}

fn normalize_stmt(code: &str) -> String {
    code.split_whitespace().collect::<Vec<_>>().join(" ")
}

struct OpenScope {
    indent: usize,
    node: SyntaxNode,
}

/// A logical line still collecting its continuation pieces.
struct OpenLogical {
    line: u32,
    indent: usize,
    code: String,
    depth: i32,
    marker: Option<String>,
}

struct ParseState {
    parsed: ParsedFile,
    stack: Vec<OpenScope>,
    prev_indent: usize,
    prev_opened_block: bool,
    last_code_line: u32,
    pending_marker: Option<String>,
}

impl ParseState {
    /// Consume one complete logical statement. `line_no` is the first
    /// physical line; `end_line` the last one.
    fn statement(
        &mut self,
        line_no: u32,
        end_line: u32,
        indent: usize,
        stmt_raw: &str,
        marker: Option<String>,
    ) -> Result<(), ParseFailure> {
        if indent > self.prev_indent && !self.prev_opened_block {
            return Err(ParseFailure {
                line: line_no,
                message: "unexpected indent".to_string(),
            });
        }

        // Close scopes we have dedented out of.
        while let Some(top) = self.stack.last() {
            if indent <= top.indent {
                let mut done = self.stack.pop().unwrap().node;
                done.line_end = self.last_code_line;
                attach(&mut self.stack, &mut self.parsed, done);
            } else {
                break;
            }
        }

        let stmt = normalize_stmt(stmt_raw);
        self.last_code_line = end_line;
        self.prev_indent = indent;
        self.prev_opened_block = stmt_raw.ends_with(':');

        if let Some(cap) = def_re().captures(stmt_raw) {
            let name = cap[1].to_string();
            let node = SyntaxNode {
                kind: NodeKind::Function,
                is_public: !name.starts_with('_'),
                name,
                line_start: line_no,
                line_end: line_no,
                capability_marker: marker.or(self.pending_marker.take()),
                body: vec![stmt],
                children: Vec::new(),
            };
            self.stack.push(OpenScope { indent, node });
            return Ok(());
        }
        if let Some(cap) = class_re().captures(stmt_raw) {
            let name = cap[1].to_string();
            let node = SyntaxNode {
                kind: NodeKind::Class,
                is_public: !name.starts_with('_'),
                name,
                line_start: line_no,
                line_end: line_no,
                capability_marker: marker.or(self.pending_marker.take()),
                body: vec![stmt],
                children: Vec::new(),
            };
            self.stack.push(OpenScope { indent, node });
            return Ok(());
        }
        self.pending_marker = None;

        if let Some(cap) = from_import_re().captures(stmt_raw) {
            self.parsed.imports.push(ImportStmt {
                module: cap[1].to_string(),
                line: line_no,
            });
            if cap[2].trim() == "*" {
                self.parsed.constructs.push(ConstructSite {
                    construct: Construct::WildcardImport,
                    line: line_no,
                });
            }
        } else if let Some(cap) = import_re().captures(stmt_raw) {
            for piece in cap[1].split(',') {
                let module = piece.trim().split_whitespace().next().unwrap_or("");
                if !module.is_empty() {
                    self.parsed.imports.push(ImportStmt {
                        module: module.to_string(),
                        line: line_no,
                    });
                }
            }
        }

        if stmt_raw.starts_with("except") {
            let after = stmt_raw["except".len()..].trim_start();
            if after.starts_with(':') || after.is_empty() {
                self.parsed.constructs.push(ConstructSite {
                    construct: Construct::BareExcept,
                    line: line_no,
                });
            }
        }
        if stmt_raw.starts_with("global ") {
            self.parsed.constructs.push(ConstructSite {
                construct: Construct::GlobalStatement,
                line: line_no,
            });
        }

        if !stmt_raw.starts_with("def ")
            && !stmt_raw.starts_with("async def")
            && !stmt_raw.starts_with("class ")
            && !stmt_raw.starts_with("import ")
            && !stmt_raw.starts_with("from ")
        {
            for cap in call_re().captures_iter(stmt_raw) {
                self.parsed.calls.push(CallSite {
                    callee: cap[1].to_string(),
                    line: line_no,
                });
            }
        }

        match self.stack.last_mut() {
            Some(top) => top.node.body.push(stmt),
            None => self.parsed.module_body.push(stmt),
        }
        Ok(())
    }
}

/// Parse one source file. Failures are contained: the caller turns them into
/// Findings for AST-gate rules and continues with the other gates.
pub fn parse_source(rel_path: &str, content: &str) -> Result<ParsedFile, ParseFailure> {
    let mut state = ParseState {
        parsed: ParsedFile {
            rel_path: rel_path.to_string(),
            module_name: module_name_for_path(rel_path),
            nodes: Vec::new(),
            imports: Vec::new(),
            calls: Vec::new(),
            constructs: Vec::new(),
            module_body: Vec::new(),
            module_capability: None,
        },
        stack: Vec::new(),
        prev_indent: 0,
        prev_opened_block: false,
        last_code_line: 0,
        pending_marker: None,
    };

    let mut triple: Option<&'static str> = None;
    let mut triple_open_line = 0u32;
    let mut cont: Option<OpenLogical> = None;

    for (idx, raw) in content.lines().enumerate() {
        let line_no = (idx + 1) as u32;

        // Triple-quoted string bodies are opaque to the structural parser.
        if let Some(delim) = triple {
            if raw.contains(delim) {
                triple = None;
            }
            continue;
        }

        let (code_raw, comment) = split_comment(raw);
        let marker = comment
            .as_deref()
            .and_then(|c| capability_re().captures(c))
            .map(|cap| cap[1].to_string());

        // Continuation lines join the open logical line; their own
        // indentation carries no block structure.
        if let Some(open) = cont.as_mut() {
            if open.marker.is_none() {
                open.marker = marker;
            }
            let (piece, backslash) = strip_backslash(code_raw.trim());
            open.depth += bracket_delta(piece);
            if !piece.is_empty() {
                if !open.code.is_empty() {
                    open.code.push(' ');
                }
                open.code.push_str(piece);
            }
            if open.depth > 0 || backslash {
                continue;
            }
            let done = cont.take().unwrap();
            state.statement(done.line, line_no, done.indent, &done.code, done.marker)?;
            continue;
        }

        let code_trimmed_end = code_raw.trim_end();
        if code_trimmed_end.trim().is_empty() {
            if let Some(m) = marker {
                // Standalone marker: applies to the next declaration, or to
                // the module itself when none follows before other code.
                if state.stack.is_empty() && state.parsed.module_capability.is_none() {
                    state.parsed.module_capability = Some(m.clone());
                }
                state.pending_marker = Some(m);
            }
            continue;
        }

        for delim in ["\"\"\"", "'''"] {
            let occurrences = code_trimmed_end.matches(delim).count();
            if occurrences % 2 == 1 {
                triple = Some(if delim == "'''" { "'''" } else { "\"\"\"" });
                triple_open_line = line_no;
                break;
            }
        }

        let indent = indent_width(code_trimmed_end).map_err(|message| ParseFailure {
            line: line_no,
            message,
        })?;
        let (stmt_piece, backslash) = strip_backslash(code_trimmed_end.trim_start());
        let depth = bracket_delta(stmt_piece);
        if triple.is_none() && (depth > 0 || backslash) {
            cont = Some(OpenLogical {
                line: line_no,
                indent,
                code: stmt_piece.to_string(),
                depth,
                marker,
            });
            continue;
        }
        state.statement(line_no, line_no, indent, stmt_piece, marker)?;
    }

    if let Some(open) = cont {
        return Err(ParseFailure {
            line: open.line,
            message: "unterminated bracket or line continuation".to_string(),
        });
    }
    if triple.is_some() {
        return Err(ParseFailure {
            line: triple_open_line,
            message: "unterminated triple-quoted string".to_string(),
        });
    }

    while let Some(open) = state.stack.pop() {
        let mut done = open.node;
        done.line_end = state.last_code_line;
        attach(&mut state.stack, &mut state.parsed, done);
    }

    Ok(state.parsed)
}

fn attach(stack: &mut Vec<OpenScope>, parsed: &mut ParsedFile, node: SyntaxNode) {
    match stack.last_mut() {
        Some(top) => top.node.children.push(node),
        None => parsed.nodes.push(node),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
import os
from api.client import fetch

class UserService:  # covenant:capability=user-management
    def create(self, name):
        record = fetch(name)
        return record

    def _internal(self):
        pass

def handler(event):
    try:
        run(event)
    except:
        pass
"#;

    #[test]
    fn extracts_scopes_imports_and_constructs() {
        let parsed = parse_source("api/users.py", SAMPLE).expect("parse");
        assert_eq!(parsed.module_name, "api.users");
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.nodes[0].name, "UserService");
        assert_eq!(parsed.nodes[0].children.len(), 2);
        assert!(parsed.nodes[0].children[0].is_public);
        assert!(!parsed.nodes[0].children[1].is_public);
        assert_eq!(
            parsed.nodes[0].capability_marker.as_deref(),
            Some("user-management")
        );
        let modules: Vec<&str> = parsed.imports.iter().map(|i| i.module.as_str()).collect();
        assert_eq!(modules, vec!["os", "api.client"]);
        assert_eq!(parsed.constructs.len(), 1);
        assert_eq!(parsed.constructs[0].construct, Construct::BareExcept);
        assert!(parsed.calls.iter().any(|c| c.callee == "fetch"));
    }

    #[test]
    fn structural_hash_ignores_formatting() {
        let a = parse_source("m.py", "def f(x):\n    return x + 1\n").unwrap();
        let b = parse_source(
            "m.py",
            "# comment\n\ndef f(x):\n\n        return   x + 1\n",
        )
        .unwrap();
        assert_eq!(a.nodes[0].structural_hash(), b.nodes[0].structural_hash());
        assert_eq!(a.module_hash(), b.module_hash());

        let c = parse_source("m.py", "def f(x):\n    return x + 2\n").unwrap();
        assert_ne!(a.nodes[0].structural_hash(), c.nodes[0].structural_hash());
    }

    #[test]
    fn bracket_continuations_join_into_one_statement() {
        let src = "def f():\n    x = g(\n        1,\n        2,\n    )\n    return x\n";
        let parsed = parse_source("m.py", src).expect("parse");
        assert_eq!(parsed.nodes.len(), 1);
        assert_eq!(parsed.nodes[0].name, "f");
        // The call is recorded at the logical line's first physical line,
        // and the function body holds two statements, not five.
        assert!(parsed.calls.iter().any(|c| c.callee == "g" && c.line == 2));
        assert_eq!(parsed.nodes[0].body.len(), 3);
    }

    #[test]
    fn multi_line_signatures_parse() {
        let src = "def f(\n    a,\n    b,\n):\n    return a + b\n\nresult = f(\n    1,\n    2,\n)\n";
        let parsed = parse_source("m.py", src).expect("parse");
        assert_eq!(parsed.nodes.len(), 1);
        assert_eq!(parsed.nodes[0].name, "f");
        assert_eq!(parsed.nodes[0].line_start, 1);
        assert!(parsed.calls.iter().any(|c| c.callee == "f" && c.line == 7));
    }

    #[test]
    fn backslash_continuations_join() {
        let src = "total = 1 + \\\n    2 + \\\n    3\n";
        let parsed = parse_source("m.py", src).expect("parse");
        assert_eq!(parsed.module_body, vec!["total = 1 + 2 + 3".to_string()]);
    }

    #[test]
    fn unterminated_bracket_is_a_contained_failure() {
        let err = parse_source("m.py", "x = g(\n    1,\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("unterminated bracket"));
    }

    #[test]
    fn unterminated_string_is_a_contained_failure() {
        let err = parse_source("m.py", "def f():\n    s = \"\"\"oops\n").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn module_names_fold_init_files() {
        assert_eq!(module_name_for_path("api/__init__.py"), "api");
        assert_eq!(module_name_for_path("api/users.py"), "api.users");
    }
}
