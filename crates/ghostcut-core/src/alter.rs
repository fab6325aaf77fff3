//! # ALTER statement analysis
//!
//! Determines, from the user's `ALTER TABLE` clause list, which columns are
//! renamed, which are dropped, and whether the table itself is renamed. The
//! column-mapping logic uses this to decide which original columns still
//! exist in the shadow table and under what name.
//!
//! ## Pipeline
//!
//! ```text
//! statement ─▶ split on top-level ',' ─▶ blank out '...' literals ─▶ matchers
//!                (quote/paren aware)                                  ├─ CHANGE [COLUMN] old new ...
//!                                                                     ├─ DROP [COLUMN] name
//!                                                                     └─ RENAME {TO|AS} ...
//! ```
//!
//! Clauses that match none of the matchers are ignored. The analyzer never
//! fails: an `ALTER` clause list is a large grammar and only these three
//! shapes matter to the migration.
//!
//! ```rust
//! use ghostcut_core::AlterTableParser;
//!
//! let parser = AlterTableParser::parse("CHANGE COLUMN a b INT, DROP COLUMN c");
//! assert_eq!(parser.column_rename_map().get("a").map(String::as_str), Some("b"));
//! assert!(parser.dropped_columns().contains("c"));
//! assert!(parser.has_non_trivial_renames());
//! ```

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use tracing::debug;

/// Pattern: a single-quoted literal
static QUOTED_LITERAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'[^']*'").expect("quoted literal regex pattern is invalid - this is a bug")
});

/// Result of analyzing an `ALTER` statement.
#[derive(Debug, Clone, Default)]
pub struct AlterTableParser {
    column_rename_map: HashMap<String, String>,
    dropped_columns: HashSet<String>,
    is_rename_table: bool,
}

impl AlterTableParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyze a statement with a fresh parser.
    pub fn parse(alter_statement: &str) -> Self {
        let mut parser = Self::new();
        parser.parse_alter_statement(alter_statement);
        parser
    }

    /// Analyze a statement, accumulating into this parser.
    ///
    /// Renames are last-write-wins per original column; the table-rename flag
    /// is sticky.
    pub fn parse_alter_statement(&mut self, alter_statement: &str) {
        for clause in tokenize_alter_statement(alter_statement) {
            let sanitized = sanitize_quotes(&clause);
            self.parse_alter_clause(&sanitized);
        }
    }

    fn parse_alter_clause(&mut self, clause: &str) {
        let words: Vec<&str> = clause.split_whitespace().collect();

        for (old, new) in match_column_renames(&words) {
            debug!(old = %old, new = %new, "ALTER renames column");
            self.column_rename_map.insert(old, new);
        }
        if let Some(dropped) = match_column_drop(&words) {
            debug!(column = %dropped, "ALTER drops column");
            self.dropped_columns.insert(dropped);
        }
        if match_table_rename(&words) {
            self.is_rename_table = true;
        }
    }

    /// All `CHANGE` mappings, including same-name redefinitions.
    pub fn column_rename_map(&self) -> &HashMap<String, String> {
        &self.column_rename_map
    }

    /// Renames where the new name differs from the old one.
    ///
    /// `CHANGE COLUMN x x <type>` only redefines the column type and is not
    /// included.
    pub fn non_trivial_renames(&self) -> HashMap<String, String> {
        self.column_rename_map
            .iter()
            .filter(|(column, renamed)| column != renamed)
            .map(|(column, renamed)| (column.clone(), renamed.clone()))
            .collect()
    }

    /// True when at least one column is renamed to a different name.
    pub fn has_non_trivial_renames(&self) -> bool {
        self.column_rename_map
            .iter()
            .any(|(column, renamed)| column != renamed)
    }

    /// Columns dropped by the statement.
    pub fn dropped_columns(&self) -> &HashSet<String> {
        &self.dropped_columns
    }

    /// True when the statement renames the table.
    pub fn is_rename_table(&self) -> bool {
        self.is_rename_table
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

/// Split a statement into top-level clauses.
///
/// A single terminating delimiter tracks quote/paren state: `'` waits for the
/// closing `'`, `(` waits for `)`. Commas seen while waiting do not split.
/// Empty clauses are dropped and the rest are trimmed.
pub fn tokenize_alter_statement(alter_statement: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut terminator: Option<char> = None;

    for c in alter_statement.chars() {
        match terminator {
            Some(t) if c == t => terminator = None,
            Some(_) => {}
            None if c == '\'' => terminator = Some('\''),
            None if c == '(' => terminator = Some(')'),
            None if c == ',' => {
                push_clause(&mut clauses, &current);
                current.clear();
                continue;
            }
            None => {}
        }
        current.push(c);
    }
    push_clause(&mut clauses, &current);

    clauses
}

fn push_clause(clauses: &mut Vec<String>, raw: &str) {
    if raw.is_empty() {
        return;
    }
    clauses.push(raw.trim().to_string());
}

/// Replace the contents of each `'...'` literal with nothing, keeping the
/// quotes. An unterminated quote is left untouched.
pub fn sanitize_quotes(clause: &str) -> String {
    QUOTED_LITERAL_REGEX.replace_all(clause, "''").into_owned()
}

// ============================================================================
// Clause matchers
// ============================================================================

/// `CHANGE [COLUMN] <old> <new> <more...>`, every occurrence in the clause.
///
/// The new name must be followed by at least one more token (the column
/// definition). When `COLUMN` is present but the remaining tokens are too
/// few, `COLUMN` itself is taken as the old name.
fn match_column_renames(words: &[&str]) -> Vec<(String, String)> {
    let mut renames = Vec::new();
    let mut i = 0;

    while i < words.len() {
        if !words[i].eq_ignore_ascii_case("change") {
            i += 1;
            continue;
        }

        let with_column = words
            .get(i + 1)
            .is_some_and(|w| w.eq_ignore_ascii_case("column"))
            && words.len() > i + 4;
        let old_at = if with_column { i + 2 } else { i + 1 };

        if words.len() > old_at + 2 {
            renames.push((unquote(words[old_at]), unquote(words[old_at + 1])));
            i = old_at + 2;
        } else {
            i += 1;
        }
    }

    renames
}

/// `DROP [COLUMN] <name>` where `<name>` is the last token of the clause.
fn match_column_drop(words: &[&str]) -> Option<String> {
    let drop_at = words
        .iter()
        .position(|w| w.eq_ignore_ascii_case("drop"))?;
    let rest = &words[drop_at + 1..];

    match rest {
        [column, name] if column.eq_ignore_ascii_case("column") => Some(unquote(name)),
        [name] => Some(unquote(name)),
        // a later DROP may still end the clause
        _ => match_column_drop(rest),
    }
}

/// `RENAME {TO|AS} <more...>`
fn match_table_rename(words: &[&str]) -> bool {
    words.windows(3).any(|w| {
        w[0].eq_ignore_ascii_case("rename")
            && (w[1].eq_ignore_ascii_case("to") || w[1].eq_ignore_ascii_case("as"))
    })
}

/// Strip backtick or double-quote identifier quoting.
///
/// Anything that is not a well-formed quoted identifier is returned as is.
fn unquote(token: &str) -> String {
    if token.len() >= 2 && token.starts_with('`') && token.ends_with('`') {
        let inner = &token[1..token.len() - 1];
        if !inner.contains('`') {
            return inner.to_string();
        }
    }
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        let inner = &token[1..token.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped) => out.push(escaped),
                    None => return token.to_string(),
                },
                '"' => return token.to_string(),
                other => out.push(other),
            }
        }
        return out;
    }
    token.to_string()
}
