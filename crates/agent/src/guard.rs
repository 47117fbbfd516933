//! Read-only statement policy.
//!
//! Every candidate statement passes through [`check_read_only`] before it
//! can reach the executor. The check is lexical: the statement must be a
//! single SELECT (optionally CTE-prefixed), and no token may be one of the
//! banned mutating/DDL keywords. Tokens are split on identifier boundaries,
//! so column names like `created_at` never trip the `CREATE` ban.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GuardViolation {
    #[error("empty statement")]
    Empty,
    #[error("only SELECT statements are permitted")]
    NotSelect,
    #[error("statement contains banned keyword `{0}`")]
    BannedKeyword(String),
    #[error("multiple statements are not permitted")]
    MultipleStatements,
}

const BANNED: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "REPLACE", "MERGE",
    "GRANT", "REVOKE", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX",
];

pub fn check_read_only(sql: &str) -> Result<(), GuardViolation> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(GuardViolation::Empty);
    }
    if trimmed.contains(';') {
        return Err(GuardViolation::MultipleStatements);
    }

    let first = first_keyword(trimmed);
    if first != "SELECT" && first != "WITH" {
        return Err(GuardViolation::NotSelect);
    }

    for token in tokens(trimmed) {
        let upper = token.to_ascii_uppercase();
        if BANNED.contains(&upper.as_str()) {
            return Err(GuardViolation::BannedKeyword(upper));
        }
    }

    Ok(())
}

fn first_keyword(sql: &str) -> String {
    tokens(sql).next().map(|t| t.to_ascii_uppercase()).unwrap_or_default()
}

fn tokens(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(|c: char| !(c.is_alphanumeric() || c == '_')).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{check_read_only, GuardViolation};

    #[test]
    fn plain_select_is_allowed() {
        assert_eq!(check_read_only("SELECT COUNT(*) FROM lead"), Ok(()));
        assert_eq!(check_read_only("  select code from lead limit 10;  "), Ok(()));
    }

    #[test]
    fn cte_select_is_allowed() {
        assert_eq!(
            check_read_only(
                "WITH recent AS (SELECT code FROM lead) SELECT COUNT(*) FROM recent"
            ),
            Ok(())
        );
    }

    #[test]
    fn mutating_statements_are_rejected() {
        assert_eq!(
            check_read_only("DELETE FROM lead WHERE code = 'L1'"),
            Err(GuardViolation::NotSelect)
        );
        assert_eq!(
            check_read_only("SELECT * FROM lead; DROP TABLE lead"),
            Err(GuardViolation::MultipleStatements)
        );
        assert_eq!(
            check_read_only("SELECT * FROM lead WHERE code IN (SELECT code FROM lead) UNION SELECT 1 FROM x CROSS JOIN (SELECT 2) -- update"),
            Err(GuardViolation::BannedKeyword("UPDATE".to_owned()))
        );
    }

    #[test]
    fn column_names_do_not_trip_keyword_ban() {
        assert_eq!(
            check_read_only("SELECT created_at, updated_at FROM lead"),
            Ok(())
        );
        assert_eq!(check_read_only("SELECT deleted_flag FROM lead"), Ok(()));
    }

    #[test]
    fn pragma_and_cte_smuggled_writes_are_rejected() {
        assert_eq!(
            check_read_only("PRAGMA journal_mode = DELETE"),
            Err(GuardViolation::NotSelect)
        );
        assert_eq!(
            check_read_only("WITH x AS (SELECT 1) UPDATE lead SET status = 'unset'"),
            Err(GuardViolation::BannedKeyword("UPDATE".to_owned()))
        );
    }

    #[test]
    fn empty_statement_is_rejected() {
        assert_eq!(check_read_only("   "), Err(GuardViolation::Empty));
        assert_eq!(check_read_only(";"), Err(GuardViolation::Empty));
    }
}
