//! Query result tables and their clean-up passes

use crate::error::{OpsError, Result};
use crate::output::Tabular;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

/// Result column
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Column {
    /// Column name
    #[serde(rename = "ColumnName")]
    pub name: String,
    /// Kusto type name (`string`, `long`, `datetime`, ...)
    #[serde(rename = "ColumnType", default)]
    pub column_type: String,
}

/// One result table
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultTable {
    /// Table name (`Table_0`, ...)
    #[serde(rename = "TableName", default)]
    pub name: String,
    /// Columns in order
    #[serde(rename = "Columns")]
    pub columns: Vec<Column>,
    /// Rows; one value per column
    #[serde(rename = "Rows", default)]
    pub rows: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct V1Response {
    #[serde(rename = "Tables")]
    tables: Vec<ResultTable>,
}

/// Parse a REST v1 response body into its tables
pub fn parse_v1(body: &str) -> Result<Vec<ResultTable>> {
    let parsed: V1Response =
        serde_json::from_str(body).map_err(|e| OpsError::Json(format!("Kusto response: {}", e)))?;
    for table in &parsed.tables {
        if let Some(bad) = table.rows.iter().position(|r| r.len() != table.columns.len()) {
            return Err(OpsError::Json(format!(
                "table '{}' row {} has {} cells for {} columns",
                table.name,
                bad,
                table.rows[bad].len(),
                table.columns.len()
            )));
        }
    }
    Ok(parsed.tables)
}

fn is_empty_cell(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

impl ResultTable {
    /// Create a table
    pub fn new(name: impl Into<String>, columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows,
        }
    }

    /// Drop columns that are null or empty in every row; returns their names
    ///
    /// A table without rows keeps all of its columns.
    pub fn remove_empty_columns(&mut self) -> Vec<String> {
        if self.rows.is_empty() {
            return Vec::new();
        }

        let keep: Vec<bool> = (0..self.columns.len())
            .map(|i| self.rows.iter().any(|row| row.get(i).is_some_and(|v| !is_empty_cell(v))))
            .collect();

        let removed: Vec<String> = self
            .columns
            .iter()
            .zip(&keep)
            .filter(|(_, k)| !**k)
            .map(|(c, _)| c.name.clone())
            .collect();
        if removed.is_empty() {
            return removed;
        }

        let mut flags = keep.iter();
        self.columns.retain(|_| *flags.next().unwrap_or(&true));
        for row in &mut self.rows {
            let mut flags = keep.iter();
            row.retain(|_| *flags.next().unwrap_or(&true));
        }
        tracing::debug!("Removed {} empty column(s): {}", removed.len(), removed.join(", "));
        removed
    }

    /// Rename repeated column names to `name_1`, `name_2`, ...
    pub fn dedupe_column_names(&mut self) {
        let mut used: HashSet<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        let mut seen: HashSet<String> = HashSet::new();

        for column in &mut self.columns {
            if seen.insert(column.name.clone()) {
                continue;
            }
            let base = column.name.clone();
            let mut n = 1;
            let renamed = loop {
                let candidate = format!("{}_{}", base, n);
                if !used.contains(&candidate) {
                    break candidate;
                }
                n += 1;
            };
            used.insert(renamed.clone());
            seen.insert(renamed.clone());
            column.name = renamed;
        }
    }
}

impl Tabular for ResultTable {
    fn columns(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn rows(&self) -> Vec<Vec<Value>> {
        self.rows.clone()
    }
}
