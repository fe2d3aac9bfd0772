//! Batch Planner: fixed-size, position-addressed slices of the table.
//!
//! The plan is a pure function of `(total_rows, batch_size, end, processed)`, so
//! asking for the next batch after a partial run with the same `processed`
//! count always yields the same range. No state is kept between calls.

use std::ops::Range;

use crate::error::{PipelineError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub offset: usize,
    pub len: usize,
}

impl Batch {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlanner {
    total_rows: usize,
    batch_size: usize,
    /// Exclusive upper row bound for this invocation; `total_rows` unless limited.
    end: usize,
}

impl BatchPlanner {
    pub fn new(total_rows: usize, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(PipelineError::Configuration(
                "batch size must be at least 1".to_string(),
            ));
        }
        Ok(BatchPlanner {
            total_rows,
            batch_size,
            end: total_rows,
        })
    }

    /// Stops planning at row `end` (clamped to the table).
    pub fn with_end(mut self, end: usize) -> Self {
        self.end = end.min(self.total_rows);
        self
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The batch starting at `processed`, or `None` once every row up to the
    /// end bound is covered.
    pub fn next_batch(&self, processed: usize) -> Option<Batch> {
        let offset = processed.min(self.end);
        let remaining = self.end - offset;
        if remaining == 0 {
            return None;
        }
        Some(Batch {
            offset,
            len: remaining.min(self.batch_size),
        })
    }

    /// All remaining batches from `processed` to the end bound.
    pub fn batches_from(&self, processed: usize) -> impl Iterator<Item = Batch> + '_ {
        std::iter::successors(self.next_batch(processed), move |prev| {
            self.next_batch(prev.end())
        })
    }

    pub fn remaining_batches(&self, processed: usize) -> usize {
        let remaining = self.end.saturating_sub(processed);
        remaining.div_ceil(self.batch_size)
    }
}
