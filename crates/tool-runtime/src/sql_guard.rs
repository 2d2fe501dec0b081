//! Read-only gate for model-generated SQL.
//!
//! A query is checked by a sequence of hard gates, each sufficient for
//! rejection: a single statement, read access only, no smuggled content, and
//! finally a full parse whose statement node must be a query. The validator
//! never rewrites the text. An allowed verdict yields a [`ValidatedQuery`],
//! which is the only way to build the [`BoundedQuery`] a backend accepts, so
//! the row cap and statement timeout travel with every executed query.

use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::time::Duration;

/// Keywords that make a statement something other than a plain read.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT",
    "UPDATE",
    "DELETE",
    "DROP",
    "CREATE",
    "ALTER",
    "TRUNCATE",
    "GRANT",
    "REVOKE",
    "COPY",
    "EXECUTE",
    "DO",
    "CALL",
    "SET",
    "RESET",
    "DISCARD",
    "LOAD",
    "VACUUM",
    "ANALYZE",
    "CLUSTER",
    "REINDEX",
    "LOCK",
    "PREPARE",
    "DEALLOCATE",
    "LISTEN",
    "NOTIFY",
    "UNLISTEN",
    "MERGE",
    "REFRESH",
    "SECURITY",
    "IMPORT",
    "INTO",
];

const READ_KEYWORDS: &[&str] = &["SELECT", "WITH"];

/// Look-alike separators that some clients or terminals fold into `;`.
const SEPARATOR_LOOKALIKES: &[char] = &['\u{037E}', '\u{FE54}', '\u{FF1B}'];

/// Why a query was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("empty SQL statement")]
    Empty,
    #[error("unparseable query: {0}")]
    Unparseable(String),
    #[error("multiple statements not allowed")]
    MultipleStatements,
    #[error("only SELECT queries allowed, got: {0}")]
    NotReadOnly(String),
    #[error("forbidden SQL keyword: {0}")]
    ForbiddenKeyword(String),
    #[error("trailing content after statement terminator")]
    TrailingContent,
    #[error("encoded or obfuscated separator: {0}")]
    EncodedSeparator(String),
}

/// Outcome of validating one query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Allowed(ValidatedQuery),
    Rejected(RejectReason),
}

impl ValidationVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ValidationVerdict::Allowed(_))
    }

    pub fn reason(&self) -> Option<&RejectReason> {
        match self {
            ValidationVerdict::Allowed(_) => None,
            ValidationVerdict::Rejected(reason) => Some(reason),
        }
    }

    pub fn into_result(self) -> Result<ValidatedQuery, RejectReason> {
        match self {
            ValidationVerdict::Allowed(query) => Ok(query),
            ValidationVerdict::Rejected(reason) => Err(reason),
        }
    }
}

/// A statement that passed every gate. Only the validator constructs these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedQuery {
    sql: String,
}

impl ValidatedQuery {
    /// Statement text without its terminator.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn bounded(self, limits: QueryLimits) -> BoundedQuery {
        BoundedQuery { sql: self.sql, limits }
    }
}

/// Limits the executing backend must apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    pub max_rows: usize,
    pub statement_timeout: Duration,
}

/// A validated statement paired with the limits it must run under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedQuery {
    sql: String,
    limits: QueryLimits,
}

impl BoundedQuery {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn limits(&self) -> QueryLimits {
        self.limits
    }
}

/// Policy seam for query-generating tools.
pub trait QueryValidator: Send + Sync {
    /// Pure and idempotent: the same text always yields the same verdict.
    fn validate(&self, sql: &str) -> ValidationVerdict;
}

/// PostgreSQL read-only policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnlySqlValidator;

impl QueryValidator for ReadOnlySqlValidator {
    fn validate(&self, sql: &str) -> ValidationVerdict {
        validate(sql)
    }
}

/// Validate `sql` against the read-only policy.
pub fn validate(sql: &str) -> ValidationVerdict {
    match check(sql) {
        Ok(query) => ValidationVerdict::Allowed(query),
        Err(reason) => ValidationVerdict::Rejected(reason),
    }
}

fn check(sql: &str) -> Result<ValidatedQuery, RejectReason> {
    let tokens = lex(sql)?;

    let significant = |t: &&Token<'_>| !matches!(t.kind, Kind::Whitespace | Kind::Comment);
    if !tokens.iter().any(|t| significant(&t)) {
        return Err(RejectReason::Empty);
    }

    let terminator = tokens.iter().position(|t| t.kind == Kind::Terminator);
    let (body, tail) = match terminator {
        Some(idx) => (&tokens[..idx], &tokens[idx + 1..]),
        None => (&tokens[..], &[][..]),
    };

    // Gate 1: a single statement.
    if tail
        .iter()
        .any(|t| !matches!(t.kind, Kind::Whitespace | Kind::Comment | Kind::Terminator))
    {
        return Err(RejectReason::MultipleStatements);
    }

    // Gate 2: read access only.
    let leading = body
        .iter()
        .filter(significant)
        .find(|t| !(t.kind == Kind::Other && t.text == "("));
    match leading {
        None => return Err(RejectReason::Empty),
        Some(token) if token.kind == Kind::Word => {
            let word = token.text.to_ascii_uppercase();
            if FORBIDDEN_KEYWORDS.contains(&word.as_str()) {
                return Err(RejectReason::ForbiddenKeyword(word));
            }
            if !READ_KEYWORDS.contains(&word.as_str()) {
                return Err(RejectReason::NotReadOnly(word));
            }
        }
        Some(token) => return Err(RejectReason::NotReadOnly(token.text.to_string())),
    }
    if let Some(word) = body
        .iter()
        .filter(|t| t.kind == Kind::Word)
        .map(|t| t.text.to_ascii_uppercase())
        .find(|w| FORBIDDEN_KEYWORDS.contains(&w.as_str()))
    {
        return Err(RejectReason::ForbiddenKeyword(word));
    }

    // Gate 3: nothing smuggled around the statement.
    if tail
        .iter()
        .any(|t| matches!(t.kind, Kind::Comment | Kind::Terminator))
    {
        return Err(RejectReason::TrailingContent);
    }
    if let Some(token) = tokens
        .iter()
        .find(|t| matches!(t.kind, Kind::Backslash | Kind::Encoded))
    {
        return Err(RejectReason::EncodedSeparator(describe(token.text)));
    }

    // Gate 4: the syntax tree must hold exactly one query.
    let statement_text = match terminator {
        Some(idx) => &sql[..tokens[idx].start],
        None => sql,
    }
    .trim();
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, statement_text)
        .map_err(|e| RejectReason::Unparseable(e.to_string()))?;
    match statements.as_slice() {
        [Statement::Query(_)] => {}
        [other] => {
            let kind = other
                .to_string()
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase();
            return Err(RejectReason::NotReadOnly(kind));
        }
        _ => return Err(RejectReason::MultipleStatements),
    }

    Ok(ValidatedQuery {
        sql: statement_text.to_string(),
    })
}

fn describe(text: &str) -> String {
    match text.chars().next() {
        Some(c) if text.chars().count() == 1 && (c.is_control() || !c.is_ascii()) => {
            format!("U+{:04X}", c as u32)
        }
        _ => text.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Word,
    Literal,
    Comment,
    Whitespace,
    Terminator,
    Backslash,
    Encoded,
    Other,
}

#[derive(Debug)]
struct Token<'a> {
    kind: Kind,
    text: &'a str,
    start: usize,
}

/// Splits `sql` into tokens, keeping literals and comments opaque.
///
/// Unterminated literals or comments are unparseable.
fn lex(sql: &str) -> Result<Vec<Token<'_>>, RejectReason> {
    let chars: Vec<(usize, char)> = sql.char_indices().collect();
    let offset = |i: usize| chars.get(i).map(|(o, _)| *o).unwrap_or(sql.len());
    let at = |i: usize| chars.get(i).map(|(_, c)| *c);

    let mut tokens = Vec::new();
    let mut i = 0;
    while let Some(c) = at(i) {
        let start = i;
        let kind = match c {
            ' ' | '\t' | '\n' | '\r' | '\x0c' => {
                while matches!(at(i), Some(' ' | '\t' | '\n' | '\r' | '\x0c')) {
                    i += 1;
                }
                Kind::Whitespace
            }
            '-' if at(i + 1) == Some('-') => {
                while !matches!(at(i), None | Some('\n')) {
                    i += 1;
                }
                Kind::Comment
            }
            '/' if at(i + 1) == Some('*') => {
                let mut depth = 0usize;
                loop {
                    match (at(i), at(i + 1)) {
                        (Some('/'), Some('*')) => {
                            depth += 1;
                            i += 2;
                        }
                        (Some('*'), Some('/')) => {
                            depth -= 1;
                            i += 2;
                            if depth == 0 {
                                break;
                            }
                        }
                        (Some(_), _) => i += 1,
                        (None, _) => {
                            return Err(RejectReason::Unparseable(
                                "unterminated block comment".to_string(),
                            ))
                        }
                    }
                }
                Kind::Comment
            }
            '\'' => {
                let escapes = matches!(tokens.last(), Some(Token { kind: Kind::Word, text, start: s })
                    if text.eq_ignore_ascii_case("e") && offset(i) == s + 1);
                i = quoted(&chars, i, '\'', escapes)
                    .ok_or_else(|| RejectReason::Unparseable("unterminated string literal".into()))?;
                Kind::Literal
            }
            '"' => {
                i = quoted(&chars, i, '"', false).ok_or_else(|| {
                    RejectReason::Unparseable("unterminated quoted identifier".into())
                })?;
                Kind::Literal
            }
            '$' if matches!(at(i + 1), Some(d) if d.is_ascii_digit()) => {
                i += 1;
                while matches!(at(i), Some(d) if d.is_ascii_digit()) {
                    i += 1;
                }
                Kind::Other
            }
            '$' => match dollar_tag(&chars, i) {
                Some(tag_len) => {
                    let tag: String = chars[i..i + tag_len].iter().map(|(_, c)| *c).collect();
                    let body_start = offset(i + tag_len);
                    match sql[body_start..].find(&tag) {
                        Some(rel) => {
                            let end = body_start + rel + tag.len();
                            while offset(i) < end {
                                i += 1;
                            }
                            Kind::Literal
                        }
                        None => {
                            return Err(RejectReason::Unparseable(
                                "unterminated dollar-quoted string".to_string(),
                            ))
                        }
                    }
                }
                None => {
                    i += 1;
                    Kind::Other
                }
            },
            ';' => {
                i += 1;
                Kind::Terminator
            }
            '\\' => {
                i += 1;
                Kind::Backslash
            }
            '%' if matches!((at(i + 1), at(i + 2)), (Some('3'), Some('b' | 'B'))) => {
                i += 3;
                Kind::Encoded
            }
            c if SEPARATOR_LOOKALIKES.contains(&c) || c.is_control() => {
                i += 1;
                Kind::Encoded
            }
            c if c.is_alphabetic() || c == '_' => {
                while matches!(at(i), Some(w) if w.is_alphanumeric() || w == '_' || w == '$') {
                    i += 1;
                }
                Kind::Word
            }
            c if c.is_ascii_digit() => {
                while matches!(at(i), Some(d) if d.is_ascii_alphanumeric() || d == '.') {
                    i += 1;
                }
                Kind::Other
            }
            _ => {
                i += 1;
                Kind::Other
            }
        };
        tokens.push(Token {
            kind,
            text: &sql[offset(start)..offset(i)],
            start: offset(start),
        });
    }
    Ok(tokens)
}

/// Returns the index just past a quoted run opened at `open`, honoring
/// doubled quotes and, when `escapes` is set, backslash escapes.
fn quoted(chars: &[(usize, char)], open: usize, quote: char, escapes: bool) -> Option<usize> {
    let mut i = open + 1;
    loop {
        let c = chars.get(i)?.1;
        if escapes && c == '\\' {
            i += 2;
            continue;
        }
        if c == quote {
            if chars.get(i + 1).map(|(_, n)| *n) == Some(quote) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
}

/// Length in chars of a `$tag$` opener starting at `i`, if there is one.
fn dollar_tag(chars: &[(usize, char)], i: usize) -> Option<usize> {
    let mut j = i + 1;
    while let Some((_, c)) = chars.get(j) {
        match c {
            '$' => return Some(j - i + 1),
            c if c.is_alphanumeric() || *c == '_' => {
                if j == i + 1 && c.is_ascii_digit() {
                    return None;
                }
                j += 1;
            }
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(sql: &str) -> RejectReason {
        match validate(sql) {
            ValidationVerdict::Rejected(reason) => reason,
            ValidationVerdict::Allowed(q) => panic!("expected rejection for {sql:?}, allowed {q:?}"),
        }
    }

    fn allowed(sql: &str) -> ValidatedQuery {
        match validate(sql) {
            ValidationVerdict::Allowed(q) => q,
            ValidationVerdict::Rejected(r) => panic!("expected {sql:?} to pass, rejected: {r}"),
        }
    }

    #[test]
    fn test_plain_reads_pass() {
        assert_eq!(allowed("SELECT 1").sql(), "SELECT 1");
        assert_eq!(
            allowed("  select id, name from accounts where id = 3;  ").sql(),
            "select id, name from accounts where id = 3"
        );
        allowed("WITH recent AS (SELECT * FROM provisions) SELECT count(*) FROM recent");
        allowed("(SELECT 1)");
        allowed("-- leading note\nSELECT 1");
        allowed("/* a /* nested */ comment */ SELECT 1");
    }

    #[test]
    fn test_write_keywords_rejected_any_case() {
        for sql in [
            "INSERT INTO t VALUES (1)",
            "update t set a = 1",
            "DeLeTe FROM t",
            "drop table users",
            "ALTER TABLE t ADD COLUMN c int",
            "truncate t",
            "  \n\t DROP TABLE t",
            "/* hi */ -- there\n DROP TABLE t",
        ] {
            assert!(
                matches!(rejected(sql), RejectReason::ForbiddenKeyword(_)),
                "{sql}"
            );
        }
    }

    #[test]
    fn test_drop_table_names_keyword() {
        assert_eq!(
            rejected("DROP TABLE users;"),
            RejectReason::ForbiddenKeyword("DROP".to_string())
        );
        assert_eq!(
            rejected("DROP TABLE users;").to_string(),
            "forbidden SQL keyword: DROP"
        );
    }

    #[test]
    fn test_forbidden_keyword_inside_read() {
        assert_eq!(
            rejected("WITH gone AS (DELETE FROM t RETURNING *) SELECT * FROM gone"),
            RejectReason::ForbiddenKeyword("DELETE".to_string())
        );
        assert_eq!(
            rejected("SELECT * INTO backup FROM accounts"),
            RejectReason::ForbiddenKeyword("INTO".to_string())
        );
        assert_eq!(
            rejected("SELECT * FROM accounts FOR UPDATE"),
            RejectReason::ForbiddenKeyword("UPDATE".to_string())
        );
    }

    #[test]
    fn test_keywords_inside_literals_are_ignored() {
        allowed("SELECT 'DROP TABLE users; --' AS note");
        allowed("SELECT \"delete\" FROM audit");
        allowed("SELECT $$; DELETE FROM t$$ AS body");
        allowed("SELECT $fn$ insert $fn$");
        allowed("SELECT 'it''s; fine'");
        allowed("SELECT E'a\\'; DROP' AS s");
        allowed("SELECT id FROM t WHERE id = $1");
    }

    #[test]
    fn test_non_read_leading_keyword() {
        assert_eq!(
            rejected("EXPLAIN SELECT 1"),
            RejectReason::NotReadOnly("EXPLAIN".to_string())
        );
        assert_eq!(
            rejected("SHOW search_path"),
            RejectReason::NotReadOnly("SHOW".to_string())
        );
    }

    #[test]
    fn test_multiple_statements_rejected() {
        assert_eq!(
            rejected("SELECT 1; SELECT 2"),
            RejectReason::MultipleStatements
        );
        assert_eq!(
            rejected("SELECT 1; DROP TABLE users"),
            RejectReason::MultipleStatements
        );
        assert_eq!(
            rejected("SELECT 1;\n-- gap\nDELETE FROM t;"),
            RejectReason::MultipleStatements
        );
    }

    #[test]
    fn test_trailing_content_rejected() {
        assert_eq!(
            rejected("SELECT 1; -- bye"),
            RejectReason::TrailingContent
        );
        assert_eq!(rejected("SELECT 1;;"), RejectReason::TrailingContent);
        assert_eq!(
            rejected("SELECT 1; /* x */"),
            RejectReason::TrailingContent
        );
    }

    #[test]
    fn test_encoded_separators_rejected() {
        assert_eq!(
            rejected("SELECT 1\u{037E} SELECT 2"),
            RejectReason::EncodedSeparator("U+037E".to_string())
        );
        assert_eq!(
            rejected("SELECT 1\u{FF1B}"),
            RejectReason::EncodedSeparator("U+FF1B".to_string())
        );
        assert_eq!(
            rejected("SELECT 1 %3B SELECT 2"),
            RejectReason::EncodedSeparator("%3B".to_string())
        );
        assert_eq!(
            rejected("SELECT 1 \\g"),
            RejectReason::EncodedSeparator("\\".to_string())
        );
        assert_eq!(
            rejected("SELECT 1\u{0}"),
            RejectReason::EncodedSeparator("U+0000".to_string())
        );
    }

    #[test]
    fn test_empty_and_unparseable() {
        assert_eq!(rejected(""), RejectReason::Empty);
        assert_eq!(rejected("   ;"), RejectReason::Empty);
        assert_eq!(rejected("-- only a comment"), RejectReason::Empty);
        assert!(matches!(
            rejected("SELECT 'unterminated"),
            RejectReason::Unparseable(_)
        ));
        assert!(matches!(
            rejected("SELECT /* open"),
            RejectReason::Unparseable(_)
        ));
        assert!(matches!(
            rejected("SELECT FROM WHERE ("),
            RejectReason::Unparseable(_)
        ));
    }

    #[test]
    fn test_validate_is_idempotent() {
        for sql in ["SELECT 1", "DROP TABLE t", "SELECT 1; SELECT 2", ""] {
            assert_eq!(validate(sql), validate(sql));
            assert_eq!(ReadOnlySqlValidator.validate(sql), validate(sql));
        }
    }

    #[test]
    fn test_bounded_query_carries_limits() {
        let limits = QueryLimits {
            max_rows: 500,
            statement_timeout: Duration::from_secs(30),
        };
        let bounded = allowed("SELECT 1;").bounded(limits);
        assert_eq!(bounded.sql(), "SELECT 1");
        assert_eq!(bounded.limits(), limits);
    }
}
