//! Record Model: the in-memory table a run mutates.
//!
//! A [`Table`] is an ordered list of [`Row`]s plus the ordered [`ColumnSet`]
//! that describes them. A row's position is its identity; rows are never
//! reordered or removed, and a value is never removed from a row once set.

use std::{collections::BTreeMap, ops::Range};

use log::warn;

use crate::{
    error::{PipelineError, Result},
    schema::{ColumnSet, backfill_rows},
};

pub type Row = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: ColumnSet,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(columns: ColumnSet, rows: Vec<Row>) -> Self {
        Table { columns, rows }
    }

    /// Builds a table from a header record and positional data records.
    pub fn from_records(headers: Vec<String>, records: Vec<Vec<String>>) -> Result<Self> {
        if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
            return Err(PipelineError::Parse("missing header row".to_string()));
        }
        let columns = ColumnSet::from_headers(headers.iter().cloned());
        if columns.len() != headers.len() {
            return Err(PipelineError::Parse(format!(
                "duplicate column names in header {headers:?}"
            )));
        }
        let rows = records
            .into_iter()
            .enumerate()
            .map(|(idx, record)| {
                if record.len() > headers.len() {
                    warn!(
                        "Data row {} has {} field(s) but the header has {}; extra fields dropped",
                        idx + 1,
                        record.len(),
                        headers.len()
                    );
                }
                headers
                    .iter()
                    .cloned()
                    .zip(record.into_iter().chain(std::iter::repeat(String::new())))
                    .collect::<Row>()
            })
            .collect();
        Ok(Table { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        self.rows.get(row)?.get(column).map(String::as_str)
    }

    /// Clones a contiguous range of rows so a batch can be worked on without
    /// touching the committed table.
    pub fn working_copy(&self, range: Range<usize>) -> Vec<Row> {
        self.rows[range].to_vec()
    }

    /// Replaces rows starting at `offset` with a fully processed batch.
    pub fn commit(&mut self, offset: usize, rows: Vec<Row>) {
        let end = offset + rows.len();
        debug_assert!(end <= self.rows.len(), "batch extends past table end");
        self.rows.splice(offset..end, rows);
    }

    /// Back-fills every row so the table is rectangular over the final columns.
    pub fn finalize(&mut self) {
        backfill_rows(&self.columns, &mut self.rows);
    }

    /// Row values in column order; absent cells render as empty strings.
    pub fn record(&self, idx: usize) -> Vec<String> {
        let row = &self.rows[idx];
        self.columns
            .iter()
            .map(|name| row.get(name).cloned().unwrap_or_default())
            .collect()
    }
}
