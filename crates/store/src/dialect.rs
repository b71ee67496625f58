//! REM dialect parser.
//!
//! The first token selects the mode:
//!
//! ```text
//! LOOKUP <key>[, <key2>, ...]
//! FUZZY  <query_text> [THRESHOLD <f>] [LIMIT <n>]
//! SEARCH <query_text> [FROM <table>] [FIELD <name>] [LIMIT <n>] [MIN_SIMILARITY <f>]
//! TRAVERSE <start_key> [DEPTH <n>] [TYPE <rel>]
//! SQL <raw_sql>
//! ```
//!
//! Quoted strings are shell-tokenized; `key=value` kwargs are accepted
//! (`SEARCH "topic" table=resources limit=5`). Anything that does not start
//! with a known keyword falls through to raw SQL mode, which blocklists
//! DROP/TRUNCATE/ALTER/CREATE/GRANT/REVOKE and DELETE without WHERE.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum DialectError {
    #[error("empty query string")]
    Empty,
    #[error("{0} requires a positional argument")]
    MissingArgument(&'static str),
    #[error("LOOKUP requires at least one key")]
    MissingKey,
    #[error("{0} clause requires a value")]
    MissingClauseValue(String),
    #[error("invalid number in {clause}: {value:?}")]
    BadNumber { clause: String, value: String },
    #[error("blocked SQL keyword detected; only SELECT/INSERT/UPDATE queries are allowed")]
    BlockedKeyword,
    #[error("DELETE without WHERE clause is not allowed")]
    BareDelete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemQuery {
    Lookup {
        keys: Vec<String>,
    },
    Fuzzy {
        query_text: String,
        threshold: f64,
        limit: i64,
    },
    Search {
        query_text: String,
        table: Option<String>,
        field: Option<String>,
        limit: i64,
        min_similarity: f64,
    },
    Traverse {
        start_key: String,
        max_depth: i64,
        rel_type: Option<String>,
    },
    Sql {
        sql: String,
    },
}

const DEFAULT_FUZZY_THRESHOLD: f64 = 0.3;
const DEFAULT_MIN_SIMILARITY: f64 = 0.3;
const DEFAULT_LIMIT: i64 = 10;
const DEFAULT_DEPTH: i64 = 1;

/// Parse a dialect string into a [`RemQuery`].
pub fn parse_query(input: &str) -> Result<RemQuery, DialectError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DialectError::Empty);
    }

    // Unmatched quotes: hand the whole string to SQL mode untouched.
    let Some(tokens) = shlex::split(input) else {
        return Ok(RemQuery::Sql { sql: input.to_string() });
    };
    let Some(first) = tokens.first() else {
        return Err(DialectError::Empty);
    };

    match first.to_uppercase().as_str() {
        "SQL" => {
            let raw = input[first.len()..].trim().to_string();
            Ok(RemQuery::Sql { sql: raw })
        }
        "LOOKUP" => parse_lookup(&tokens[1..]),
        "FUZZY" => parse_fuzzy(&tokens[1..]),
        "SEARCH" => parse_search(&tokens[1..]),
        "TRAVERSE" => parse_traverse(&tokens[1..]),
        _ => Ok(RemQuery::Sql { sql: input.to_string() }),
    }
}

/// Reject dangerous statements in raw SQL mode.
pub fn validate_sql(sql: &str) -> Result<(), DialectError> {
    static BLOCKLIST: OnceLock<Regex> = OnceLock::new();
    static BARE_DELETE: OnceLock<Regex> = OnceLock::new();

    let blocklist = BLOCKLIST.get_or_init(|| {
        Regex::new(r"(?i)\b(DROP|TRUNCATE|ALTER|CREATE|GRANT|REVOKE)\b").expect("valid regex")
    });
    let bare_delete = BARE_DELETE.get_or_init(|| {
        Regex::new(r"(?i)\bDELETE\s+FROM\s+\w+\s*(?:;|\s*$)").expect("valid regex")
    });

    if blocklist.is_match(sql) {
        return Err(DialectError::BlockedKeyword);
    }
    if bare_delete.is_match(sql) {
        return Err(DialectError::BareDelete);
    }
    Ok(())
}

// ── Per-mode parsers ──────────────────────────────────────────────────────────

fn parse_lookup(tokens: &[String]) -> Result<RemQuery, DialectError> {
    if tokens.is_empty() {
        return Err(DialectError::MissingKey);
    }
    let raw = tokens.join(" ");
    let keys: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect();
    if keys.is_empty() {
        return Err(DialectError::MissingKey);
    }
    Ok(RemQuery::Lookup { keys })
}

fn parse_fuzzy(tokens: &[String]) -> Result<RemQuery, DialectError> {
    let mut threshold = DEFAULT_FUZZY_THRESHOLD;
    let mut limit = DEFAULT_LIMIT;
    let positional = consume_clauses(tokens, |clause, value| match clause {
        "THRESHOLD" => {
            threshold = parse_f64(clause, value)?;
            Ok(true)
        }
        "LIMIT" => {
            limit = parse_i64(clause, value)?;
            Ok(true)
        }
        _ => Ok(false),
    })?;
    if positional.is_empty() {
        return Err(DialectError::MissingArgument("FUZZY"));
    }
    Ok(RemQuery::Fuzzy { query_text: positional, threshold, limit })
}

fn parse_search(tokens: &[String]) -> Result<RemQuery, DialectError> {
    let mut table = None;
    let mut field = None;
    let mut limit = DEFAULT_LIMIT;
    let mut min_similarity = DEFAULT_MIN_SIMILARITY;
    let positional = consume_clauses(tokens, |clause, value| match clause {
        "FROM" | "TABLE" => {
            table = Some(value.to_string());
            Ok(true)
        }
        "FIELD" => {
            field = Some(value.to_string());
            Ok(true)
        }
        "LIMIT" => {
            limit = parse_i64(clause, value)?;
            Ok(true)
        }
        "MIN_SIMILARITY" => {
            min_similarity = parse_f64(clause, value)?;
            Ok(true)
        }
        _ => Ok(false),
    })?;
    if positional.is_empty() {
        return Err(DialectError::MissingArgument("SEARCH"));
    }
    Ok(RemQuery::Search { query_text: positional, table, field, limit, min_similarity })
}

fn parse_traverse(tokens: &[String]) -> Result<RemQuery, DialectError> {
    let mut max_depth = DEFAULT_DEPTH;
    let mut rel_type = None;
    let positional = consume_clauses(tokens, |clause, value| match clause {
        "DEPTH" | "MAX_DEPTH" => {
            max_depth = parse_i64(clause, value)?;
            Ok(true)
        }
        "TYPE" | "REL_TYPE" => {
            rel_type = Some(value.to_string());
            Ok(true)
        }
        _ => Ok(false),
    })?;
    if positional.is_empty() {
        return Err(DialectError::MissingArgument("TRAVERSE"));
    }
    Ok(RemQuery::Traverse { start_key: positional, max_depth, rel_type })
}

/// Walk tokens, feeding `CLAUSE value` pairs and `key=value` kwargs into the
/// callback; unconsumed tokens accumulate into the positional argument.
fn consume_clauses<F>(tokens: &[String], mut apply: F) -> Result<String, DialectError>
where
    F: FnMut(&str, &str) -> Result<bool, DialectError>,
{
    let mut positional: Vec<&str> = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];

        // key=value kwargs
        if let Some((key, value)) = token.split_once('=') {
            if !key.is_empty() && apply(&key.to_uppercase(), value)? {
                i += 1;
                continue;
            }
        }

        let upper = token.to_uppercase();
        // Clause keywords another mode owns (e.g. DEPTH inside FUZZY) are
        // not consumed here and fall through into the positional text.
        if is_clause_keyword(&upper) {
            match tokens.get(i + 1) {
                Some(value) => {
                    if apply(&upper, value)? {
                        i += 2;
                        continue;
                    }
                }
                None => return Err(DialectError::MissingClauseValue(upper)),
            }
        }

        positional.push(token);
        i += 1;
    }

    Ok(positional.join(" "))
}

fn is_clause_keyword(upper: &str) -> bool {
    matches!(
        upper,
        "THRESHOLD"
            | "LIMIT"
            | "FROM"
            | "TABLE"
            | "FIELD"
            | "MIN_SIMILARITY"
            | "DEPTH"
            | "MAX_DEPTH"
            | "TYPE"
            | "REL_TYPE"
    )
}

fn parse_f64(clause: &str, value: &str) -> Result<f64, DialectError> {
    value.parse().map_err(|_| DialectError::BadNumber {
        clause: clause.to_string(),
        value: value.to_string(),
    })
}

fn parse_i64(clause: &str, value: &str) -> Result<i64, DialectError> {
    value.parse().map_err(|_| DialectError::BadNumber {
        clause: clause.to_string(),
        value: value.to_string(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_single_key() {
        let q = parse_query(r#"LOOKUP "sarah-chen""#).unwrap();
        assert_eq!(q, RemQuery::Lookup { keys: vec!["sarah-chen".to_string()] });
    }

    #[test]
    fn lookup_multiple_keys_split_on_commas() {
        let q = parse_query("LOOKUP sarah-chen, project-x , another").unwrap();
        let RemQuery::Lookup { keys } = q else { panic!("expected lookup") };
        assert_eq!(keys, ["sarah-chen", "project-x", "another"]);
    }

    #[test]
    fn search_with_clauses() {
        let q = parse_query(
            r#"SEARCH "database migration" FROM resources LIMIT 5 MIN_SIMILARITY 0.6"#,
        )
        .unwrap();
        assert_eq!(
            q,
            RemQuery::Search {
                query_text: "database migration".to_string(),
                table: Some("resources".to_string()),
                field: None,
                limit: 5,
                min_similarity: 0.6,
            }
        );
    }

    #[test]
    fn search_with_kwargs() {
        let q = parse_query(r#"SEARCH "topic" table=resources limit=5"#).unwrap();
        let RemQuery::Search { table, limit, .. } = q else { panic!("expected search") };
        assert_eq!(table.as_deref(), Some("resources"));
        assert_eq!(limit, 5);
    }

    #[test]
    fn fuzzy_defaults_apply() {
        let q = parse_query("FUZZY sarah").unwrap();
        assert_eq!(
            q,
            RemQuery::Fuzzy {
                query_text: "sarah".to_string(),
                threshold: 0.3,
                limit: 10,
            }
        );
    }

    #[test]
    fn traverse_with_depth_and_type() {
        let q = parse_query(r#"TRAVERSE "parent-schema" DEPTH 2 TYPE imports"#).unwrap();
        assert_eq!(
            q,
            RemQuery::Traverse {
                start_key: "parent-schema".to_string(),
                max_depth: 2,
                rel_type: Some("imports".to_string()),
            }
        );
    }

    #[test]
    fn unknown_first_token_falls_through_to_sql() {
        let q = parse_query("SELECT 1").unwrap();
        assert_eq!(q, RemQuery::Sql { sql: "SELECT 1".to_string() });
    }

    #[test]
    fn explicit_sql_mode_strips_the_keyword() {
        let q = parse_query("SQL SELECT * FROM kv_store").unwrap();
        assert_eq!(q, RemQuery::Sql { sql: "SELECT * FROM kv_store".to_string() });
    }

    #[test]
    fn unmatched_quotes_fall_through_to_sql() {
        let q = parse_query(r#"SELECT 'oops"#).unwrap();
        assert!(matches!(q, RemQuery::Sql { .. }));
    }

    #[test]
    fn multi_word_positional_without_quotes() {
        let q = parse_query("FUZZY database migration LIMIT 3").unwrap();
        let RemQuery::Fuzzy { query_text, limit, .. } = q else { panic!() };
        assert_eq!(query_text, "database migration");
        assert_eq!(limit, 3);
    }

    #[test]
    fn clause_without_value_errors() {
        let err = parse_query("FUZZY text LIMIT").unwrap_err();
        assert!(matches!(err, DialectError::MissingClauseValue(_)));
    }

    #[test]
    fn bad_number_errors() {
        let err = parse_query("FUZZY text LIMIT lots").unwrap_err();
        assert!(matches!(err, DialectError::BadNumber { .. }));
    }

    #[test]
    fn empty_query_errors() {
        assert!(matches!(parse_query("   "), Err(DialectError::Empty)));
    }

    #[test]
    fn blocklist_rejects_ddl() {
        assert!(matches!(
            validate_sql("DROP TABLE users"),
            Err(DialectError::BlockedKeyword)
        ));
        assert!(matches!(
            validate_sql("select 1; truncate kv_store"),
            Err(DialectError::BlockedKeyword)
        ));
    }

    #[test]
    fn bare_delete_is_rejected_but_scoped_delete_allowed() {
        assert!(matches!(
            validate_sql("DELETE FROM messages"),
            Err(DialectError::BareDelete)
        ));
        assert!(validate_sql("DELETE FROM messages WHERE id = '00000000-0000-0000-0000-000000000000'").is_ok());
        assert!(validate_sql("SELECT * FROM kv_store WHERE entity_key = 'x'").is_ok());
    }
}
