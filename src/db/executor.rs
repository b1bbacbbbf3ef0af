use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use serde_json::{Value, json};

use crate::memory::query_tree::ExecutionResult;

/// Default per-query wall clock.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Never pull more rows than this into memory; datasets have tables with
/// hundreds of thousands of rows.
const MAX_RESULT_ROWS: usize = 500;

/// Executes candidate SQL against the dataset's SQLite files. Connections
/// are read-only and opened per call; anything that is not a SELECT (or a
/// WITH-prefixed SELECT) is rejected before it reaches SQLite.
#[derive(Debug, Clone)]
pub struct SqlExecutor {
    data_path: PathBuf,
    timeout: Duration,
}

impl SqlExecutor {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve the SQLite file for a database id. BIRD lays databases out
    /// as `<data_path>/<db_id>/<db_id>.sqlite`; a flat file next to the
    /// data path is accepted as a fallback.
    pub fn database_file(&self, db_id: &str) -> Result<PathBuf> {
        let nested = self.data_path.join(db_id).join(format!("{db_id}.sqlite"));
        if nested.exists() {
            return Ok(nested);
        }
        let flat = self.data_path.join(format!("{db_id}.sqlite"));
        if flat.exists() {
            return Ok(flat);
        }
        anyhow::bail!(
            "database '{db_id}' not found under {}",
            self.data_path.display()
        )
    }

    /// Run one query off the async timeline. SQL-level failures come back
    /// inside the result's `error` field; only infrastructure problems
    /// (missing file, task join) surface as `Err`.
    pub async fn execute(&self, sql: &str, db_id: &str) -> Result<ExecutionResult> {
        let file = match self.database_file(db_id) {
            Ok(f) => f,
            Err(e) => {
                return Ok(ExecutionResult {
                    error: Some(e.to_string()),
                    ..ExecutionResult::default()
                });
            }
        };
        let sql = sql.to_string();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || execute_on_file(&file, &sql, timeout))
            .await
            .context("sql execution task failed")
    }

    /// Synchronous variant for tests and non-async callers.
    pub fn execute_blocking(&self, sql: &str, db_id: &str) -> Result<ExecutionResult> {
        let file = self.database_file(db_id)?;
        Ok(execute_on_file(&file, sql, self.timeout))
    }
}

fn execute_on_file(file: &Path, sql: &str, timeout: Duration) -> ExecutionResult {
    if let Err(reason) = check_read_only(sql) {
        return ExecutionResult {
            error: Some(reason),
            ..ExecutionResult::default()
        };
    }

    let conn = match Connection::open_with_flags(
        file,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    ) {
        Ok(conn) => conn,
        Err(e) => {
            return ExecutionResult {
                error: Some(format!("cannot open database: {e}")),
                ..ExecutionResult::default()
            };
        }
    };

    let started = Instant::now();
    conn.progress_handler(4096, Some(move || started.elapsed() > timeout));

    match run_query(&conn, sql) {
        Ok(mut result) => {
            result.execution_time_ms = Some(started.elapsed().as_millis() as u64);
            result
        }
        Err(e) => {
            let message = if started.elapsed() > timeout {
                format!("query timed out after {} s", timeout.as_secs())
            } else {
                e.to_string()
            };
            ExecutionResult {
                error: Some(message),
                execution_time_ms: Some(started.elapsed().as_millis() as u64),
                ..ExecutionResult::default()
            }
        }
    }
}

fn run_query(conn: &Connection, sql: &str) -> rusqlite::Result<ExecutionResult> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let column_count = columns.len();

    let mut rows = stmt.query([])?;
    let mut data = Vec::new();
    let mut row_count = 0usize;
    while let Some(row) = rows.next()? {
        row_count += 1;
        if data.len() >= MAX_RESULT_ROWS {
            continue;
        }
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(sql_value_to_json(row.get_ref(i)?));
        }
        data.push(Value::Array(values));
    }

    Ok(ExecutionResult {
        columns,
        data,
        row_count,
        error: None,
        execution_time_ms: None,
    })
}

fn sql_value_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => json!(String::from_utf8_lossy(t)),
        ValueRef::Blob(b) => json!(format!("<{} bytes>", b.len())),
    }
}

/// The database under test is shared; candidate SQL must be read-only.
fn check_read_only(sql: &str) -> std::result::Result<(), String> {
    let head = first_keyword(sql);
    match head.as_str() {
        "select" | "with" => Ok(()),
        "" => Err("empty SQL statement".to_string()),
        other => Err(format!(
            "only SELECT statements are allowed, got '{}'",
            other.to_uppercase()
        )),
    }
}

fn first_keyword(sql: &str) -> String {
    let mut rest = sql.trim_start();
    // skip leading line and block comments
    loop {
        if let Some(stripped) = rest.strip_prefix("--") {
            rest = stripped.split_once('\n').map(|(_, r)| r).unwrap_or("").trim_start();
        } else if let Some(stripped) = rest.strip_prefix("/*") {
            rest = stripped.split_once("*/").map(|(_, r)| r).unwrap_or("").trim_start();
        } else {
            break;
        }
    }
    rest.split_whitespace()
        .next()
        .unwrap_or("")
        .trim_start_matches('(')
        .to_ascii_lowercase()
}

#[cfg(test)]
pub(crate) mod test_support {
    use rusqlite::Connection;
    use std::path::{Path, PathBuf};

    /// Build `<dir>/<db_id>/<db_id>.sqlite` with the schools fixture data.
    pub fn create_schools_db(dir: &Path, db_id: &str) -> PathBuf {
        let db_dir = dir.join(db_id);
        std::fs::create_dir_all(&db_dir).expect("mkdir");
        let file = db_dir.join(format!("{db_id}.sqlite"));
        let conn = Connection::open(&file).expect("open");
        conn.execute_batch(
            "CREATE TABLE schools (CDSCode TEXT PRIMARY KEY, County TEXT, School TEXT);
             CREATE TABLE frpm (CDSCode TEXT REFERENCES schools(CDSCode),
                                `Eligible Free Rate (K-12)` REAL);
             INSERT INTO schools VALUES ('001', 'Alameda', 'Oak High');
             INSERT INTO schools VALUES ('002', 'Alameda', 'Bay Middle');
             INSERT INTO schools VALUES ('003', 'Fresno', 'Pine Elementary');
             INSERT INTO frpm VALUES ('001', 0.56);
             INSERT INTO frpm VALUES ('002', 0.82);
             INSERT INTO frpm VALUES ('003', NULL);",
        )
        .expect("seed");
        file
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::create_schools_db;
    use super::{SqlExecutor, check_read_only, first_keyword};
    use std::time::Duration;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sqltree-exec-{name}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    #[test]
    fn select_returns_rows_and_columns() {
        let dir = temp_dir("select");
        create_schools_db(&dir, "california_schools");
        let exec = SqlExecutor::new(&dir);
        let result = exec
            .execute_blocking(
                "SELECT COUNT(*) FROM schools WHERE County = 'Alameda'",
                "california_schools",
            )
            .unwrap();
        assert!(result.succeeded());
        assert_eq!(result.row_count, 1);
        assert_eq!(result.data[0][0], 2);
        assert_eq!(result.columns, vec!["COUNT(*)"]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn sql_errors_are_data_not_err() {
        let dir = temp_dir("error");
        create_schools_db(&dir, "db");
        let exec = SqlExecutor::new(&dir);
        let result = exec.execute_blocking("SELECT missing FROM schools", "db").unwrap();
        assert!(result.error.as_deref().unwrap_or("").contains("no such column"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn zero_rows_is_success() {
        let dir = temp_dir("empty");
        create_schools_db(&dir, "db");
        let exec = SqlExecutor::new(&dir);
        let result = exec
            .execute_blocking(
                "SELECT School FROM schools WHERE County = 'NonExistentCounty'",
                "db",
            )
            .unwrap();
        assert!(result.succeeded());
        assert_eq!(result.row_count, 0);
        assert!(result.data.is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn null_values_survive_as_json_null() {
        let dir = temp_dir("null");
        create_schools_db(&dir, "db");
        let exec = SqlExecutor::new(&dir);
        let result = exec
            .execute_blocking(
                "SELECT `Eligible Free Rate (K-12)` FROM frpm WHERE CDSCode = '003'",
                "db",
            )
            .unwrap();
        assert!(result.succeeded());
        assert!(result.data[0][0].is_null());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn writes_are_rejected_before_sqlite() {
        assert!(check_read_only("SELECT 1").is_ok());
        assert!(check_read_only("WITH t AS (SELECT 1) SELECT * FROM t").is_ok());
        assert!(check_read_only("-- comment\nSELECT 1").is_ok());
        assert!(check_read_only("DROP TABLE schools").is_err());
        assert!(check_read_only("INSERT INTO t VALUES (1)").is_err());
        assert!(check_read_only("").is_err());
    }

    #[test]
    fn first_keyword_skips_comments_and_parens() {
        assert_eq!(first_keyword("/* x */ (SELECT 1)"), "select");
        assert_eq!(first_keyword("-- a\n-- b\nWITH t AS (SELECT 1) SELECT 1"), "with");
    }

    #[test]
    fn missing_database_reports_in_result() {
        let dir = temp_dir("missing");
        let exec = SqlExecutor::new(&dir).with_timeout(Duration::from_secs(1));
        let err = exec.execute_blocking("SELECT 1", "ghost").unwrap_err();
        assert!(err.to_string().contains("ghost"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn async_execute_matches_blocking() {
        let dir = temp_dir("async");
        create_schools_db(&dir, "db");
        let exec = SqlExecutor::new(&dir);
        let result = exec.execute("SELECT COUNT(*) FROM frpm", "db").await.unwrap();
        assert_eq!(result.data[0][0], 3);
        // missing database is a result-level error on the async path
        let missing = exec.execute("SELECT 1", "ghost").await.unwrap();
        assert!(missing.error.is_some());
        let _ = std::fs::remove_dir_all(dir);
    }
}
