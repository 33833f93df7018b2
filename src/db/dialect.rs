//! Backend dialect differences.
//!
//! Statements are written once with `?` placeholders and DDL is written once
//! with type tokens; the backend kind renders them for its engine.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Backend variant holding a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Embedded `SQLite` file.
    Embedded,
    /// `PostgreSQL` server.
    Server,
}

/// DDL type tokens and their per-backend rendering.
const DDL_TOKENS: &[(&str, &str, &str)] = &[
    ("$PK", "INTEGER PRIMARY KEY", "BIGSERIAL PRIMARY KEY"),
    ("$BIGINT", "INTEGER", "BIGINT"),
    ("$INT", "INTEGER", "BIGINT"),
    ("$BLOB", "BLOB", "BYTEA"),
    ("$DOUBLE", "REAL", "DOUBLE PRECISION"),
];

impl BackendKind {
    /// Replaces DDL type tokens with this backend's column types.
    pub fn render_ddl(self, ddl: &str) -> String {
        DDL_TOKENS
            .iter()
            .fold(ddl.to_string(), |text, (token, embedded, server)| {
                let replacement = match self {
                    Self::Embedded => embedded,
                    Self::Server => server,
                };
                text.replace(token, replacement)
            })
    }

    /// Renders `?` placeholders for this backend.
    ///
    /// The server backend numbers them (`$1`, `$2`, ...). Placeholders inside
    /// single-quoted literals are left alone.
    pub fn render_placeholders(self, sql: &str) -> Cow<'_, str> {
        if self == Self::Embedded || !sql.contains('?') {
            return Cow::Borrowed(sql);
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut in_literal = false;
        let mut index = 0_usize;
        for ch in sql.chars() {
            match ch {
                '\'' => {
                    in_literal = !in_literal;
                    out.push(ch);
                }
                '?' if !in_literal => {
                    index += 1;
                    out.push('$');
                    out.push_str(&index.to_string());
                }
                _ => out.push(ch),
            }
        }
        Cow::Owned(out)
    }

    /// Short name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::Server => "server",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collapses a statement into a short single-line context for errors.
pub(crate) fn statement_context(sql: &str) -> String {
    const MAX: usize = 96;
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX {
        collapsed
    } else {
        let mut short: String = collapsed.chars().take(MAX).collect();
        short.push_str("...");
        short
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_ddl_embedded() {
        let ddl = "CREATE TABLE t (id $PK, size $BIGINT, flag $INT, data $BLOB, score $DOUBLE)";
        assert_eq!(
            BackendKind::Embedded.render_ddl(ddl),
            "CREATE TABLE t (id INTEGER PRIMARY KEY, size INTEGER, flag INTEGER, data BLOB, score REAL)"
        );
    }

    #[test]
    fn test_render_ddl_server() {
        let ddl = "CREATE TABLE t (id $PK, size $BIGINT, data $BLOB)";
        assert_eq!(
            BackendKind::Server.render_ddl(ddl),
            "CREATE TABLE t (id BIGSERIAL PRIMARY KEY, size BIGINT, data BYTEA)"
        );
    }

    #[test]
    fn test_placeholders_numbered_for_server() {
        let sql = "SELECT * FROM files WHERE name = ? AND note <> '?' AND size > ?";
        assert_eq!(
            BackendKind::Server.render_placeholders(sql),
            "SELECT * FROM files WHERE name = $1 AND note <> '?' AND size > $2"
        );
    }

    #[test]
    fn test_placeholders_untouched_for_embedded() {
        let sql = "SELECT ? + ?";
        assert!(matches!(
            BackendKind::Embedded.render_placeholders(sql),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn test_statement_context_collapses_and_truncates() {
        assert_eq!(
            statement_context("SELECT  *\n   FROM objects"),
            "SELECT * FROM objects"
        );
        let long = "x ".repeat(200);
        assert!(statement_context(&long).ends_with("..."));
    }
}
