use sqlx::Database;

use crate::query::RowLock;

/// A trait that encapsulates all the requirements for a database to work with
/// Trellis.
///
/// Implementing this trait allows Trellis to generate correct SQL syntax and
/// handle database-specific behaviors like placeholder styles and identifier
/// quoting.
pub trait SqlDialect: Database + Sized + Send + Sync
where
    Self::Connection: Send,
{
    /// Returns the placeholder for the `n`-th parameter in a query (e.g., "?" or "$1").
    fn placeholder(n: usize) -> String;
    /// Returns the number of rows affected by a query result.
    fn rows_affected(res: &Self::QueryResult) -> u64;

    /// Returns true if the database supports the `RETURNING` clause.
    fn supports_returning() -> bool {
        true
    }

    /// Returns the case-insensitive LIKE operator.
    fn ilike_operator() -> &'static str {
        "LIKE"
    }

    /// Returns the literal used for a value omitted from an INSERT row.
    fn missing_insert_value() -> &'static str {
        "NULL"
    }

    /// Returns the row-lock clause for a SELECT, or "" when the database has
    /// no per-row locks.
    fn row_lock_clause(_lock: RowLock) -> &'static str {
        ""
    }

    /// Quotes an identifier (table/column name) to prevent SQL injection.
    fn quote_identifier(ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }
}

#[cfg(feature = "sqlite")]
impl SqlDialect for sqlx::Sqlite {
    fn placeholder(_n: usize) -> String {
        "?".to_string()
    }

    fn rows_affected(res: &sqlx::sqlite::SqliteQueryResult) -> u64 {
        res.rows_affected()
    }
}

#[cfg(feature = "postgres")]
impl SqlDialect for sqlx::Postgres {
    fn placeholder(n: usize) -> String {
        format!("${}", n)
    }

    fn rows_affected(res: &sqlx::postgres::PgQueryResult) -> u64 {
        res.rows_affected()
    }

    fn ilike_operator() -> &'static str {
        "ILIKE"
    }

    fn missing_insert_value() -> &'static str {
        "DEFAULT"
    }

    fn row_lock_clause(lock: RowLock) -> &'static str {
        match lock {
            RowLock::ForUpdate => " FOR UPDATE",
            RowLock::ForShare => " FOR SHARE",
        }
    }

    fn quote_identifier(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}
