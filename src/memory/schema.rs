use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::store::KeyValueStore;

pub const DATABASE_SCHEMA_KEY: &str = "databaseSchema";

const MAX_TYPICAL_VALUES_IN_XML: usize = 3;

/// Reference target of a foreign-key column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "dataType")]
    pub data_type: String,
    pub nullable: bool,
    #[serde(rename = "isPrimaryKey")]
    pub is_primary_key: bool,
    #[serde(rename = "isForeignKey")]
    pub is_foreign_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<ForeignKeyRef>,
    #[serde(rename = "typicalValues", default, skip_serializing_if = "Vec::is_empty")]
    pub typical_values: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(rename = "sampleData", default, skip_serializing_if = "Vec::is_empty")]
    pub sample_data: Vec<Value>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// The whole database description stored under `databaseSchema`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub tables: Vec<TableSchema>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// A resolved foreign-key edge between two tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

/// External source of schema descriptions (dataset loaders implement this).
pub trait SchemaSource {
    fn describe(&self, db_id: &str) -> Result<DatabaseSchema>;
}

/// Facade over the `databaseSchema` key. Authoritative: no other component
/// writes under this key. Cross-table lookups scan linearly, which is fine
/// for the few hundred tables these datasets reach.
#[derive(Clone)]
pub struct DatabaseSchemaManager {
    store: KeyValueStore,
}

impl DatabaseSchemaManager {
    pub fn new(store: KeyValueStore) -> Self {
        Self { store }
    }

    pub fn initialize(&self) -> Result<()> {
        self.store.set_json(DATABASE_SCHEMA_KEY, &DatabaseSchema::default())
    }

    pub fn load_from_source(&self, source: &dyn SchemaSource, db_id: &str) -> Result<()> {
        let schema = source.describe(db_id)?;
        if schema.tables.is_empty() {
            tracing::warn!(db_id, "loaded schema has zero tables");
        }
        self.store.set_json(DATABASE_SCHEMA_KEY, &schema)?;
        tracing::info!(db_id, tables = schema.tables.len(), "database schema loaded");
        Ok(())
    }

    pub fn get(&self) -> Option<DatabaseSchema> {
        self.store.get_json(DATABASE_SCHEMA_KEY).ok().flatten()
    }

    pub fn add_table(&self, table: TableSchema) -> Result<()> {
        let mut schema = self.get().unwrap_or_default();
        if let Some(existing) = schema.tables.iter_mut().find(|t| t.name == table.name) {
            *existing = table;
        } else {
            schema.tables.push(table);
        }
        self.store.set_json(DATABASE_SCHEMA_KEY, &schema)
    }

    pub fn get_table(&self, name: &str) -> Option<TableSchema> {
        self.get()?.tables.into_iter().find(|t| t.name == name)
    }

    pub fn get_all_tables(&self) -> Vec<TableSchema> {
        self.get().map(|s| s.tables).unwrap_or_default()
    }

    pub fn get_columns(&self, table: &str) -> Vec<ColumnInfo> {
        self.get_table(table).map(|t| t.columns).unwrap_or_default()
    }

    pub fn get_primary_keys(&self, table: &str) -> Vec<String> {
        self.get_columns(table)
            .into_iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name)
            .collect()
    }

    pub fn get_foreign_keys(&self, table: &str) -> Vec<Relationship> {
        self.get_columns(table)
            .into_iter()
            .filter_map(|c| {
                let target = c.references?;
                Some(Relationship {
                    from_table: table.to_string(),
                    from_column: c.name,
                    to_table: target.table,
                    to_column: target.column,
                })
            })
            .collect()
    }

    /// Foreign-key edges between two tables, either direction.
    pub fn find_relationships(&self, from_table: &str, to_table: &str) -> Vec<Relationship> {
        let mut edges = Vec::new();
        for rel in self.get_foreign_keys(from_table) {
            if rel.to_table == to_table {
                edges.push(rel);
            }
        }
        for rel in self.get_foreign_keys(to_table) {
            if rel.to_table == from_table {
                edges.push(rel);
            }
        }
        edges
    }

    pub fn search_columns_by_type(&self, data_type: &str) -> Vec<(String, ColumnInfo)> {
        let needle = data_type.to_ascii_lowercase();
        let mut hits = Vec::new();
        for table in self.get_all_tables() {
            for col in &table.columns {
                if col.data_type.to_ascii_lowercase().contains(&needle) {
                    hits.push((table.name.clone(), col.clone()));
                }
            }
        }
        hits
    }

    /// Validate that every FK target resolves inside the schema.
    pub fn check_references(&self) -> Result<()> {
        let schema = self.get().unwrap_or_default();
        for table in &schema.tables {
            for col in &table.columns {
                let Some(target) = &col.references else {
                    continue;
                };
                let Some(target_table) = schema.tables.iter().find(|t| t.name == target.table)
                else {
                    bail!(
                        "{}.{} references missing table {}",
                        table.name,
                        col.name,
                        target.table
                    );
                };
                if target_table.column(&target.column).is_none() {
                    bail!(
                        "{}.{} references missing column {}.{}",
                        table.name,
                        col.name,
                        target.table,
                        target.column
                    );
                }
            }
        }
        Ok(())
    }

    pub fn get_schema_summary(&self) -> SchemaSummary {
        let schema = self.get().unwrap_or_default();
        let total_columns = schema.tables.iter().map(|t| t.columns.len()).sum();
        let total_foreign_keys = schema
            .tables
            .iter()
            .flat_map(|t| &t.columns)
            .filter(|c| c.is_foreign_key)
            .count();
        SchemaSummary {
            table_count: schema.tables.len(),
            total_columns,
            total_foreign_keys,
            metadata: schema.metadata,
        }
    }

    /// Full schema rendered as the XML block agents see, including type,
    /// nullability, key info, and a few typical values per column.
    pub fn to_prompt_xml(&self) -> String {
        let schema = self.get().unwrap_or_default();
        if schema.tables.is_empty() {
            return "<database_schema>No schema loaded</database_schema>".to_string();
        }

        let mut xml = vec!["<database_schema>".to_string()];
        for table in &schema.tables {
            xml.push(format!("  <table name=\"{}\">", table.name));
            for col in &table.columns {
                xml.push(format!("    <column name=\"{}\">", col.name));
                xml.push(format!("      <type>{}</type>", col.data_type));
                xml.push(format!("      <nullable>{}</nullable>", col.nullable));
                if col.is_primary_key {
                    xml.push("      <primary_key>true</primary_key>".to_string());
                }
                if let Some(target) = &col.references {
                    xml.push("      <foreign_key>".to_string());
                    xml.push(format!(
                        "        <references_table>{}</references_table>",
                        target.table
                    ));
                    xml.push(format!(
                        "        <references_column>{}</references_column>",
                        target.column
                    ));
                    xml.push("      </foreign_key>".to_string());
                }
                if !col.typical_values.is_empty() {
                    let rendered: Vec<String> = col
                        .typical_values
                        .iter()
                        .take(MAX_TYPICAL_VALUES_IN_XML)
                        .map(render_value)
                        .collect();
                    xml.push(format!(
                        "      <sample_values>{}</sample_values>",
                        rendered.join(", ")
                    ));
                }
                xml.push("    </column>".to_string());
            }
            xml.push("  </table>".to_string());
        }
        xml.push("</database_schema>".to_string());
        xml.join("\n")
    }

    /// One line per table, for the analyzer which only needs the shape.
    pub fn to_summary_lines(&self) -> String {
        let schema = self.get().unwrap_or_default();
        if schema.tables.is_empty() {
            return "(no tables)".to_string();
        }
        schema
            .tables
            .iter()
            .map(|t| {
                let cols: Vec<&str> = t.columns.iter().map(|c| c.name.as_str()).collect();
                format!("- {}({})", t.name, cols.join(", "))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSummary {
    pub table_count: usize,
    pub total_columns: usize,
    pub total_foreign_keys: usize,
    pub metadata: Value,
}

fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::{ColumnInfo, DatabaseSchema, ForeignKeyRef, TableSchema};
    use serde_json::{Value, json};

    pub fn column(name: &str, data_type: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            is_primary_key: false,
            is_foreign_key: false,
            references: None,
            typical_values: Vec::new(),
        }
    }

    pub fn pk(name: &str, data_type: &str) -> ColumnInfo {
        ColumnInfo {
            is_primary_key: true,
            nullable: false,
            ..column(name, data_type)
        }
    }

    pub fn fk(name: &str, data_type: &str, table: &str, target: &str) -> ColumnInfo {
        ColumnInfo {
            is_foreign_key: true,
            references: Some(ForeignKeyRef {
                table: table.to_string(),
                column: target.to_string(),
            }),
            ..column(name, data_type)
        }
    }

    /// Two-table schools/frpm schema mirroring the dataset used throughout
    /// the tests.
    pub fn schools_schema() -> DatabaseSchema {
        let mut county = column("County", "TEXT");
        county.typical_values = vec![json!("Alameda"), json!("Fresno")];
        DatabaseSchema {
            tables: vec![
                TableSchema {
                    name: "schools".to_string(),
                    columns: vec![pk("CDSCode", "TEXT"), county, column("School", "TEXT")],
                    sample_data: vec![json!({"CDSCode": "01100170000000", "County": "Alameda"})],
                    metadata: Value::Null,
                },
                TableSchema {
                    name: "frpm".to_string(),
                    columns: vec![
                        fk("CDSCode", "TEXT", "schools", "CDSCode"),
                        column("Eligible Free Rate (K-12)", "REAL"),
                    ],
                    sample_data: Vec::new(),
                    metadata: Value::Null,
                },
            ],
            metadata: json!({"data_path": "/tmp/data", "dataset_name": "bird"}),
        }
    }
}
