//! Buffered result rows.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, UsageErrorKind, usage_error};
use crate::value::Value;

/// Column-name metadata shared by every row of one result set.
///
/// Wrapped in `Arc` so rows stay cheap to clone for large result sets.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    names: Vec<String>,
    by_name: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Build column info from ordered column names.
    pub fn new(names: Vec<String>) -> Self {
        let by_name = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { names, by_name }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the result set has no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Ordinal of a named column.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Name at an ordinal.
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// All column names in result order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// One materialized row of a buffered result set.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<ColumnInfo>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row over shared column metadata.
    pub fn new(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Number of columns in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Shared column metadata.
    pub fn columns(&self) -> &ColumnInfo {
        &self.columns
    }

    /// Value at an ordinal.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of a named column.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Value at an ordinal, or a usage error naming the ordinal.
    pub fn require(&self, index: usize) -> Result<&Value> {
        self.values.get(index).ok_or_else(|| {
            usage_error(
                UsageErrorKind::ParameterMismatch,
                format!(
                    "column index {} out of range (row has {} columns)",
                    index,
                    self.values.len()
                ),
            )
        })
    }

    /// All values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consume the row, yielding its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}
