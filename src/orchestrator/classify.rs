//! Routing for bad-SQL retries: schema-shaped execution errors go back to
//! the schema linker, everything else to the generator. The keyword sets
//! are deliberately explicit so the routing is testable on its own.

/// Which specialist should handle a node whose SQL came back bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadSqlRoute {
    SchemaLinker,
    SqlGenerator,
}

/// SQLite error fragments that mean the schema linking itself was wrong.
const SCHEMA_ERROR_MARKERS: &[&str] = &[
    "no such table",
    "no such column",
    "ambiguous column name",
    "unknown column",
    "has no column named",
];

/// Route by the latest error text. Syntax errors, misuse, and judgment
/// verdicts without schema markers stay with the generator.
pub fn classify_bad_sql(error_text: &str) -> BadSqlRoute {
    let lower = error_text.to_lowercase();
    if SCHEMA_ERROR_MARKERS.iter().any(|m| lower.contains(m)) {
        BadSqlRoute::SchemaLinker
    } else {
        BadSqlRoute::SqlGenerator
    }
}
