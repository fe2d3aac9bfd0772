//! Schema Merger: the table's running, ordered column list.
//!
//! Stages never push column names onto the table directly. They describe the
//! columns they produced as [`ColumnRequest`]s and [`merge_schema`] reconciles
//! those with the existing [`ColumnSet`]:
//!
//! - names already present are left exactly where they are,
//! - new names are appended, or inserted right after an anchor column,
//! - every row processed so far is back-filled with `""` for any column it lacks.
//!
//! Re-merging a column set that is already present is a no-op, so stages can
//! describe their output on every batch without tracking what earlier batches
//! already added.

use std::fmt;

use log::debug;
use serde::Serialize;

use crate::table::{Row, Table};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ColumnSet {
    names: Vec<String>,
}

impl ColumnSet {
    /// Builds a column set from upload headers. Duplicate names keep their first position.
    pub fn from_headers<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = ColumnSet::default();
        for header in headers {
            set.append(header.into());
        }
        set
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|existing| existing == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    fn append(&mut self, name: String) -> Option<SchemaChange> {
        if self.contains(&name) {
            return None;
        }
        self.names.push(name.clone());
        Some(SchemaChange {
            column: name,
            change: SchemaChangeKind::ColumnAppended,
        })
    }

    fn insert_after(&mut self, anchor: &str, name: String) -> Option<SchemaChange> {
        if self.contains(&name) {
            return None;
        }
        match self.position(anchor) {
            Some(idx) => {
                self.names.insert(idx + 1, name.clone());
                Some(SchemaChange {
                    column: name,
                    change: SchemaChangeKind::ColumnInserted {
                        after: anchor.to_string(),
                    },
                })
            }
            None => self.append(name),
        }
    }

    /// Applies column requests in order and returns the changes that actually happened.
    pub fn apply(&mut self, requests: &[ColumnRequest]) -> Vec<SchemaChange> {
        requests
            .iter()
            .filter_map(|request| match &request.placement {
                ColumnPlacement::Append => self.append(request.name.clone()),
                ColumnPlacement::After(anchor) => self.insert_after(anchor, request.name.clone()),
            })
            .collect()
    }
}

impl fmt::Display for ColumnSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.names.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnPlacement {
    Append,
    /// Insert immediately after the named column; appends when the anchor is missing.
    After(String),
}

/// A column a stage wants to exist in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRequest {
    pub name: String,
    pub placement: ColumnPlacement,
}

impl ColumnRequest {
    pub fn append(name: impl Into<String>) -> Self {
        ColumnRequest {
            name: name.into(),
            placement: ColumnPlacement::Append,
        }
    }

    pub fn after(name: impl Into<String>, anchor: impl Into<String>) -> Self {
        ColumnRequest {
            name: name.into(),
            placement: ColumnPlacement::After(anchor.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChangeKind {
    ColumnAppended,
    ColumnInserted { after: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub column: String,
    pub change: SchemaChangeKind,
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.change {
            SchemaChangeKind::ColumnAppended => write!(f, "appended column '{}'", self.column),
            SchemaChangeKind::ColumnInserted { after } => {
                write!(f, "inserted column '{}' after '{after}'", self.column)
            }
        }
    }
}

/// Fills every column in `columns` that a row is missing with an empty string.
/// Returns the number of cells that were added.
pub fn backfill_rows(columns: &ColumnSet, rows: &mut [Row]) -> usize {
    let mut filled = 0;
    for row in rows.iter_mut() {
        for name in columns.iter() {
            if !row.contains_key(name) {
                row.insert(name.to_string(), String::new());
                filled += 1;
            }
        }
    }
    filled
}

/// Merges requested columns into the table and keeps rows `[0, processed)` rectangular.
pub fn merge_schema(
    table: &mut Table,
    requests: &[ColumnRequest],
    processed: usize,
) -> Vec<SchemaChange> {
    let changes = table.columns.apply(requests);
    for change in &changes {
        debug!("Schema change: {change}");
    }
    let upto = processed.min(table.rows.len());
    let filled = backfill_rows(&table.columns, &mut table.rows[..upto]);
    if filled > 0 {
        debug!("Back-filled {filled} empty cell(s) across {upto} processed row(s)");
    }
    changes
}
