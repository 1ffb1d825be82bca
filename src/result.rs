//! Lazy, forward-only result cursors.
//!
//! A [`StatementResult`] wraps the fully-assembled response of one statement
//! execution: the dispatcher already pulled every frame off the wire, so no
//! accessor here performs network reads. Rows are decoded lazily from the
//! buffered frames and the cursor is not restartable.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::pipeline::{ResponseData, ResultSetData};
use crate::protocol::{Column, Warning};

/// One row of a result set.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    /// Value at a column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the named column.
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c.name == name)?;
        self.values.get(idx)
    }

    /// The document of a single-column document result.
    pub fn document(&self) -> &Value {
        self.values.first().unwrap_or(&Value::Null)
    }

    /// Consume the row into its document.
    pub fn into_document(mut self) -> Value {
        if self.values.is_empty() {
            Value::Null
        } else {
            self.values.swap_remove(0)
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}

#[derive(Debug)]
struct CurrentSet {
    columns: Arc<[Column]>,
    rows: VecDeque<Vec<Value>>,
}

impl CurrentSet {
    fn from_data(set: ResultSetData) -> Self {
        Self {
            columns: set.columns.into(),
            rows: set.rows,
        }
    }
}

/// The outcome of one statement execution.
///
/// Carries the affected-item count, generated document ids, the last
/// auto-increment value, warnings, and zero or more result sets consumed
/// through the cursor methods. Multi-resultset responses are traversed with
/// [`StatementResult::next_result`].
#[derive(Debug)]
pub struct StatementResult {
    sets: VecDeque<ResultSetData>,
    current: Option<CurrentSet>,
    had_data: bool,
    affected: u64,
    generated_ids: Vec<String>,
    auto_increment: Option<u64>,
    warnings: Vec<Warning>,
}

impl StatementResult {
    pub(crate) fn new(mut data: ResponseData) -> Self {
        let current = data.result_sets.pop_front().map(CurrentSet::from_data);
        Self {
            had_data: current.is_some(),
            sets: data.result_sets,
            current,
            affected: data.affected,
            generated_ids: data.generated_ids,
            auto_increment: data.auto_increment,
            warnings: data.warnings,
        }
    }

    /// Whether the statement produced a result set at all.
    pub fn has_data(&self) -> bool {
        self.had_data
    }

    /// Whether another row remains in the current result set.
    pub fn has_next(&self) -> bool {
        self.current
            .as_ref()
            .map(|set| !set.rows.is_empty())
            .unwrap_or(false)
    }

    /// The next row. Fails with [`Error::NoMoreRows`] once exhausted.
    pub fn next(&mut self) -> Result<Row> {
        let set = self.current.as_mut().ok_or(Error::NoMoreRows)?;
        let values = set.rows.pop_front().ok_or(Error::NoMoreRows)?;
        Ok(Row {
            columns: Arc::clone(&set.columns),
            values,
        })
    }

    /// The next row, or `None` once exhausted.
    pub fn fetch_one(&mut self) -> Option<Row> {
        self.next().ok()
    }

    /// Drain the remainder of the current result set.
    pub fn fetch_all(&mut self) -> Vec<Row> {
        let mut rows = Vec::new();
        while let Ok(row) = self.next() {
            rows.push(row);
        }
        rows
    }

    /// Drain the remainder of the current result set and count it.
    pub fn count(&mut self) -> usize {
        self.fetch_all().len()
    }

    /// Column metadata of the current result set.
    pub fn columns(&self) -> &[Column] {
        self.current
            .as_ref()
            .map(|set| &*set.columns)
            .unwrap_or(&[])
    }

    /// Advance to the next result set of a multi-resultset response.
    /// Returns false when none remains.
    pub fn next_result(&mut self) -> bool {
        match self.sets.pop_front() {
            Some(set) => {
                self.current = Some(CurrentSet::from_data(set));
                true
            }
            None => {
                self.current = None;
                false
            }
        }
    }

    /// Number of rows/documents affected by the statement.
    pub fn affected_items_count(&self) -> u64 {
        self.affected
    }

    /// Server-generated ids of inserted documents, in insertion order.
    pub fn generated_ids(&self) -> &[String] {
        &self.generated_ids
    }

    /// The first generated id, when exactly that is wanted.
    pub fn first_generated_id(&self) -> Option<&str> {
        self.generated_ids.first().map(String::as_str)
    }

    /// The last auto-increment value assigned by the statement.
    pub fn auto_increment_value(&self) -> Option<u64> {
        self.auto_increment
    }

    pub fn warnings_count(&self) -> usize {
        self.warnings.len()
    }

    /// Warnings attached to the statement, decoded lazily by the caller.
    pub fn warnings(&self) -> impl Iterator<Item = &Warning> {
        self.warnings.iter()
    }
}
