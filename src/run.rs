//! Run Controller: drives the planner and the stage pipeline over a table.
//!
//! [`RunController::run`] returns a lazy stream of [`RunState`] values, one per
//! committed batch. The stream ends after the first terminal state: either
//! every row is processed, or a fatal failure stopped the loop. A terminal
//! failure state carries the `processed_count` and `last_token` needed to
//! start again with [`ResumePoint::from_state`]. Rows committed before the
//! failure stay in the table.
//!
//! Batches run strictly one after another on the calling task. Cancellation
//! is checked between batches and raced against the batch in flight; a batch
//! interrupted mid-way is dropped whole. An optional [`Checkpoint`] sees the
//! table after every commit, so a crash loses at most the batch in flight.

use futures::stream::{self, Stream};
use log::{debug, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    batch::{Batch, BatchPlanner, DEFAULT_BATCH_SIZE},
    error::{ErrorInfo, PipelineError},
    llm::ContinuationToken,
    pipeline::StagePipeline,
    schema::merge_schema,
    table::Table,
};

/// Progress value surfaced after every batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunState {
    pub processed_count: usize,
    pub total_rows: usize,
    pub percent: f64,
    pub columns: Vec<String>,
    pub last_token: Option<ContinuationToken>,
    /// Rows annotated by a best-effort stage failure so far in this run.
    pub annotated_rows: usize,
    pub failure: Option<ErrorInfo>,
}

impl RunState {
    fn snapshot(
        table: &Table,
        processed_count: usize,
        last_token: Option<ContinuationToken>,
        annotated_rows: usize,
        failure: Option<ErrorInfo>,
    ) -> Self {
        let total_rows = table.len();
        let percent = if total_rows == 0 {
            100.0
        } else {
            processed_count as f64 / total_rows as f64 * 100.0
        };
        RunState {
            processed_count,
            total_rows,
            percent,
            columns: table.columns.names().to_vec(),
            last_token,
            annotated_rows,
            failure,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && self.processed_count >= self.total_rows
    }

    pub fn is_terminal(&self) -> bool {
        self.failure.is_some() || self.processed_count >= self.total_rows
    }
}

/// Where a run starts: the committed prefix and the conversation to continue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumePoint {
    pub processed: usize,
    pub token: Option<ContinuationToken>,
}

impl ResumePoint {
    pub fn from_state(state: &RunState) -> Self {
        ResumePoint {
            processed: state.processed_count,
            token: state.last_token.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: usize,
    /// Carry the continuation token from one batch into the next.
    pub chain_batches: bool,
    /// Process at most this many rows past the resume point, then stop.
    pub max_rows: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            batch_size: DEFAULT_BATCH_SIZE,
            chain_batches: true,
            max_rows: None,
        }
    }
}

/// Receives the table and its progress after every committed batch.
pub trait Checkpoint: Send + Sync {
    fn save(&self, table: &Table, state: &RunState) -> anyhow::Result<()>;
}

pub struct RunController<'p> {
    pipeline: StagePipeline<'p>,
    options: RunOptions,
    cancel: CancellationToken,
    checkpoint: Option<&'p dyn Checkpoint>,
}

impl<'p> RunController<'p> {
    pub fn new(pipeline: StagePipeline<'p>, options: RunOptions) -> Self {
        RunController {
            pipeline,
            options,
            cancel: CancellationToken::new(),
            checkpoint: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: &'p dyn Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Pre-run checks: batch size and stage column requirements.
    pub fn prepare(&self, table: &Table) -> Result<BatchPlanner, PipelineError> {
        let planner = BatchPlanner::new(table.len(), self.options.batch_size)?;
        self.pipeline.validate(&table.columns)?;
        Ok(planner)
    }

    pub fn run<'t>(
        &'t self,
        table: &'t mut Table,
        from: ResumePoint,
    ) -> impl Stream<Item = RunState> + 't {
        let run = Run {
            controller: self,
            table,
            planner: None,
            processed: from.processed,
            token: from.token,
            annotated_rows: 0,
            started: false,
            done: false,
        };
        stream::unfold(run, |mut run| async move {
            let state = run.step().await?;
            Some((state, run))
        })
    }

    /// Drives the stream to its end and returns the terminal state.
    pub async fn run_to_end(&self, table: &mut Table, from: ResumePoint) -> RunState {
        use futures::StreamExt;

        let mut last = None;
        let mut states = std::pin::pin!(self.run(table, from));
        while let Some(state) = states.next().await {
            last = Some(state);
        }
        // The stream always yields at least one terminal state.
        last.unwrap_or_else(|| RunState {
            processed_count: 0,
            total_rows: 0,
            percent: 100.0,
            columns: Vec::new(),
            last_token: None,
            annotated_rows: 0,
            failure: None,
        })
    }
}

struct Run<'t, 'p> {
    controller: &'t RunController<'p>,
    table: &'t mut Table,
    planner: Option<BatchPlanner>,
    processed: usize,
    token: Option<ContinuationToken>,
    annotated_rows: usize,
    started: bool,
    done: bool,
}

impl Run<'_, '_> {
    fn terminal(&mut self, failure: Option<ErrorInfo>) -> RunState {
        self.done = true;
        RunState::snapshot(
            self.table,
            self.processed,
            self.token.clone(),
            self.annotated_rows,
            failure,
        )
    }

    async fn step(&mut self) -> Option<RunState> {
        if self.done {
            return None;
        }
        let planner = match self.planner {
            Some(planner) => planner,
            None => match self.controller.prepare(self.table) {
                Ok(planner) => {
                    self.processed = self.processed.min(planner.total_rows());
                    let planner = match self.controller.options.max_rows {
                        Some(limit) => planner.with_end(self.processed.saturating_add(limit)),
                        None => planner,
                    };
                    self.planner = Some(planner);
                    planner
                }
                Err(err) => {
                    warn!("Run not started: {err}");
                    return Some(self.terminal(Some(ErrorInfo::from_error(&err, None))));
                }
            },
        };
        let first_step = !self.started;
        self.started = true;

        let Some(batch) = planner.next_batch(self.processed) else {
            // Nothing left to do in this invocation; report the resume point once.
            return first_step.then(|| self.terminal(None));
        };

        if self.controller.cancel.is_cancelled() {
            let err = PipelineError::Cancelled;
            return Some(self.terminal(Some(ErrorInfo::from_error(&err, Some(batch.offset)))));
        }

        match self.run_batch(batch, planner.total_rows()).await {
            Ok(()) => {
                let state = RunState::snapshot(
                    self.table,
                    self.processed,
                    self.token.clone(),
                    self.annotated_rows,
                    None,
                );
                debug!(
                    "Committed rows {}..{}; columns now {}",
                    batch.offset,
                    batch.end(),
                    self.table.columns
                );
                if let Some(checkpoint) = self.controller.checkpoint
                    && let Err(err) = checkpoint.save(self.table, &state)
                {
                    warn!("Checkpoint after row {} not saved: {err:#}", batch.end());
                }
                if state.is_terminal() {
                    self.done = true;
                }
                Some(state)
            }
            Err(err) => {
                warn!(
                    "Batch at rows {}..{} failed: {err}; {} row(s) remain committed",
                    batch.offset,
                    batch.end(),
                    self.processed
                );
                Some(self.terminal(Some(ErrorInfo::from_error(&err, Some(batch.offset)))))
            }
        }
    }

    async fn run_batch(&mut self, batch: Batch, total_rows: usize) -> Result<(), PipelineError> {
        let controller = self.controller;
        let rows = self.table.working_copy(batch.range());
        let continuation = if controller.options.chain_batches {
            self.token.clone()
        } else {
            None
        };

        let outcome = tokio::select! {
            biased;
            _ = controller.cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = controller.pipeline.run_batch(
                &self.table.columns,
                batch,
                total_rows,
                rows,
                continuation,
            ) => result.map_err(|failure| failure.error)?,
        };

        if !outcome.warnings.is_empty() {
            self.annotated_rows += batch.len;
        }
        self.table.commit(batch.offset, outcome.rows);
        self.processed = batch.end();
        merge_schema(self.table, &outcome.columns, self.processed);
        if outcome.token.is_some() {
            self.token = outcome.token;
        }
        Ok(())
    }
}
