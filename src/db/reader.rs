use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::memory::schema::{
    ColumnInfo, DatabaseSchema, ForeignKeyRef, SchemaSource, TableSchema,
};

const SAMPLE_VALUES_PER_COLUMN: usize = 3;
const SAMPLE_ROWS_PER_TABLE: usize = 3;

/// One entry of a BIRD/Spider `tables.json` file.
#[derive(Debug, Deserialize)]
struct DatasetDb {
    db_id: String,
    table_names_original: Vec<String>,
    /// Pairs of (table index, column name); index -1 is the global `*`.
    column_names_original: Vec<(i64, String)>,
    column_types: Vec<String>,
    /// Column indexes; composite keys appear as nested lists.
    #[serde(default)]
    primary_keys: Vec<Value>,
    /// Pairs of (from column index, to column index).
    #[serde(default)]
    foreign_keys: Vec<(usize, usize)>,
}

/// Reads dataset schema descriptions: table/column/type/key structure from
/// `tables.json`, sample values from the SQLite file unless `lazy`.
#[derive(Debug, Clone)]
pub struct SchemaReader {
    data_path: PathBuf,
    tables_json_path: PathBuf,
    dataset_name: String,
    lazy: bool,
}

impl SchemaReader {
    pub fn new(
        data_path: impl Into<PathBuf>,
        tables_json_path: impl Into<PathBuf>,
        dataset_name: &str,
        lazy: bool,
    ) -> Self {
        Self {
            data_path: data_path.into(),
            tables_json_path: tables_json_path.into(),
            dataset_name: dataset_name.to_string(),
            lazy,
        }
    }

    fn load_entry(&self, db_id: &str) -> Result<DatasetDb> {
        let raw = std::fs::read_to_string(&self.tables_json_path).with_context(|| {
            format!("reading tables file {}", self.tables_json_path.display())
        })?;
        let entries: Vec<DatasetDb> =
            serde_json::from_str(&raw).context("tables file is not valid dataset JSON")?;
        entries
            .into_iter()
            .find(|e| e.db_id == db_id)
            .with_context(|| format!("database '{db_id}' not present in tables file"))
    }

    fn sqlite_file(&self, db_id: &str) -> Option<PathBuf> {
        let nested = self.data_path.join(db_id).join(format!("{db_id}.sqlite"));
        if nested.exists() {
            return Some(nested);
        }
        let flat = self.data_path.join(format!("{db_id}.sqlite"));
        flat.exists().then_some(flat)
    }
}

impl SchemaSource for SchemaReader {
    fn describe(&self, db_id: &str) -> Result<DatabaseSchema> {
        let entry = self.load_entry(db_id)?;
        let mut schema = build_structure(&entry)?;
        schema.metadata = json!({
            "data_path": self.data_path.to_string_lossy(),
            "dataset_name": self.dataset_name,
        });

        if !self.lazy
            && let Some(file) = self.sqlite_file(db_id)
        {
            if let Err(e) = attach_samples(&mut schema, &file) {
                tracing::warn!(db_id, error = %e, "sampling failed, keeping bare structure");
            }
        }
        Ok(schema)
    }
}

/// Translate the flat index-based dataset description into per-table schema.
fn build_structure(entry: &DatasetDb) -> Result<DatabaseSchema> {
    if entry.column_names_original.len() != entry.column_types.len() {
        bail!(
            "corrupt schema for '{}': {} columns but {} types",
            entry.db_id,
            entry.column_names_original.len(),
            entry.column_types.len()
        );
    }

    let pk_set = flatten_primary_keys(&entry.primary_keys);
    let mut tables: Vec<TableSchema> = entry
        .table_names_original
        .iter()
        .map(|name| TableSchema {
            name: name.clone(),
            columns: Vec::new(),
            sample_data: Vec::new(),
            metadata: Value::Null,
        })
        .collect();

    // Column index → (table index, name); index entries with table -1 are `*`.
    for (col_idx, (table_idx, col_name)) in entry.column_names_original.iter().enumerate() {
        if *table_idx < 0 {
            continue;
        }
        let table_idx = *table_idx as usize;
        let Some(table) = tables.get_mut(table_idx) else {
            bail!(
                "corrupt schema for '{}': column '{}' references table index {}",
                entry.db_id,
                col_name,
                table_idx
            );
        };
        let is_pk = pk_set.contains(&col_idx);
        table.columns.push(ColumnInfo {
            name: col_name.clone(),
            data_type: entry
                .column_types
                .get(col_idx)
                .map(|t| t.to_uppercase())
                .unwrap_or_else(|| "TEXT".to_string()),
            nullable: !is_pk,
            is_primary_key: is_pk,
            is_foreign_key: false,
            references: None,
            typical_values: Vec::new(),
        });
    }

    // Resolve FK index pairs back to table/column names.
    let locate = |col_idx: usize| -> Option<(usize, String)> {
        let (table_idx, name) = entry.column_names_original.get(col_idx)?;
        if *table_idx < 0 {
            return None;
        }
        Some((*table_idx as usize, name.clone()))
    };
    for (from_idx, to_idx) in &entry.foreign_keys {
        let (Some((from_table, from_col)), Some((to_table, to_col))) =
            (locate(*from_idx), locate(*to_idx))
        else {
            bail!("corrupt foreign key pair ({from_idx}, {to_idx}) in '{}'", entry.db_id);
        };
        let target_table = tables[to_table].name.clone();
        let table = &mut tables[from_table];
        if let Some(col) = table.columns.iter_mut().find(|c| c.name == from_col) {
            col.is_foreign_key = true;
            col.references = Some(ForeignKeyRef {
                table: target_table,
                column: to_col,
            });
        }
    }

    Ok(DatabaseSchema {
        tables,
        metadata: Value::Null,
    })
}

fn flatten_primary_keys(raw: &[Value]) -> Vec<usize> {
    let mut out = Vec::new();
    for entry in raw {
        match entry {
            Value::Number(n) => {
                if let Some(i) = n.as_u64() {
                    out.push(i as usize);
                }
            }
            Value::Array(parts) => {
                for part in parts {
                    if let Some(i) = part.as_u64() {
                        out.push(i as usize);
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Pull a handful of distinct values per column plus a few whole rows.
fn attach_samples(schema: &mut DatabaseSchema, file: &Path) -> Result<()> {
    let conn = Connection::open_with_flags(
        file,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("opening {}", file.display()))?;

    for table in &mut schema.tables {
        for col in &mut table.columns {
            let sql = format!(
                "SELECT DISTINCT `{}` FROM `{}` WHERE `{}` IS NOT NULL LIMIT {}",
                col.name, table.name, col.name, SAMPLE_VALUES_PER_COLUMN
            );
            let Ok(mut stmt) = conn.prepare(&sql) else {
                continue;
            };
            let Ok(mut rows) = stmt.query([]) else {
                continue;
            };
            while let Ok(Some(row)) = rows.next() {
                if let Ok(value) = row.get_ref(0) {
                    col.typical_values.push(value_ref_to_json(value));
                }
            }
        }

        let sql = format!("SELECT * FROM `{}` LIMIT {}", table.name, SAMPLE_ROWS_PER_TABLE);
        let Ok(mut stmt) = conn.prepare(&sql) else {
            continue;
        };
        let names: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let Ok(mut rows) = stmt.query([]) else {
            continue;
        };
        while let Ok(Some(row)) = rows.next() {
            let mut object = Map::new();
            for (i, name) in names.iter().enumerate() {
                if let Ok(value) = row.get_ref(i) {
                    object.insert(name.clone(), value_ref_to_json(value));
                }
            }
            table.sample_data.push(Value::Object(object));
        }
    }
    Ok(())
}

fn value_ref_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => json!(String::from_utf8_lossy(t)),
        ValueRef::Blob(b) => json!(format!("<{} bytes>", b.len())),
    }
}
