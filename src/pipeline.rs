//! Stage Pipeline: runs one batch through the ordered list of active stages.
//!
//! The batch moves linearly through
//! `Pending → Translating → (Refining)? → (SpellChecking)? → Merged`.
//! A failure in a required stage moves it to `Failed` and the remaining
//! stages are skipped. A failure in a best-effort stage is written into the
//! rows as an annotation and the batch still reaches `Merged`.
//!
//! The pipeline only ever works on a copy of the batch rows. The caller
//! commits the returned rows to the table as one unit.

use log::{debug, warn};

use crate::{
    batch::Batch,
    error::{PipelineError, Result},
    llm::{ClientConfig, Collaborator, ContinuationToken, supports_temperature},
    schema::{ColumnRequest, ColumnSet},
    stage::{Stage, StageContext, StageKind},
    table::Row,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Pending,
    Translating,
    Refining,
    SpellChecking,
    Merged,
    Failed,
}

impl From<StageKind> for BatchPhase {
    fn from(kind: StageKind) -> Self {
        match kind {
            StageKind::Translate => BatchPhase::Translating,
            StageKind::Refine => BatchPhase::Refining,
            StageKind::SpellCheck => BatchPhase::SpellChecking,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub model: String,
    pub temperature: Option<f32>,
}

impl ModelSettings {
    fn effective_temperature(&self) -> Option<f32> {
        self.temperature
            .filter(|_| supports_temperature(&self.model))
    }
}

/// A fully processed batch, ready to be committed.
#[derive(Debug)]
pub struct BatchOutcome {
    pub rows: Vec<Row>,
    pub columns: Vec<ColumnRequest>,
    /// Token from the last chaining stage, or the incoming token when no stage chained.
    pub token: Option<ContinuationToken>,
    pub phases: Vec<BatchPhase>,
    /// Non-fatal failures that were absorbed into row annotations.
    pub warnings: Vec<PipelineError>,
}

#[derive(Debug)]
pub struct BatchFailure {
    pub stage: StageKind,
    pub error: PipelineError,
    pub phases: Vec<BatchPhase>,
}

pub struct StagePipeline<'a> {
    stages: Vec<Box<dyn Stage>>,
    collaborator: &'a dyn Collaborator,
    client: ClientConfig,
    settings: ModelSettings,
}

impl<'a> StagePipeline<'a> {
    pub fn new(
        stages: Vec<Box<dyn Stage>>,
        collaborator: &'a dyn Collaborator,
        client: ClientConfig,
        settings: ModelSettings,
    ) -> Self {
        StagePipeline {
            stages,
            collaborator,
            client,
            settings,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|stage| stage.kind()).collect()
    }

    /// Checks every stage's input column exists, either in the table or as
    /// the output of an earlier stage.
    pub fn validate(&self, columns: &ColumnSet) -> Result<()> {
        let mut available = columns.clone();
        for stage in &self.stages {
            for required in stage.required_columns() {
                if !available.contains(&required) {
                    return Err(PipelineError::Configuration(format!(
                        "{} stage needs column '{required}', which is not in {available}",
                        stage.kind().label()
                    )));
                }
            }
            let produced = stage
                .produced_columns()
                .into_iter()
                .map(ColumnRequest::append)
                .collect::<Vec<_>>();
            available.apply(&produced);
        }
        Ok(())
    }

    pub async fn run_batch(
        &self,
        columns: &ColumnSet,
        batch: Batch,
        total_rows: usize,
        mut rows: Vec<Row>,
        continuation: Option<ContinuationToken>,
    ) -> std::result::Result<BatchOutcome, BatchFailure> {
        let mut working_columns = columns.clone();
        let mut requests = Vec::new();
        let mut token = continuation;
        let mut phases = vec![BatchPhase::Pending];
        let mut warnings = Vec::new();
        let temperature = self.settings.effective_temperature();

        for stage in &self.stages {
            let kind = stage.kind();
            phases.push(kind.into());
            let ctx = StageContext {
                model: &self.settings.model,
                temperature,
                columns: &working_columns,
                offset: batch.offset,
                total_rows,
                continuation: if stage.chains() { token.clone() } else { None },
            };
            let request = stage.build_request(&ctx, &rows);
            debug!(
                "{} rows {}..{}: sending {} row(s)",
                kind.label(),
                batch.offset,
                batch.end(),
                rows.len()
            );

            let result = match self.collaborator.respond(&self.client, &request).await {
                Ok(response) => stage
                    .parse_response(&rows, &response)
                    .map(|parsed| (parsed, response.token)),
                Err(err) => Err(err),
            };

            let produced = match result {
                Ok((parsed, response_token)) => {
                    if stage.chains() {
                        token = Some(response_token);
                    }
                    stage.merge(&mut rows, parsed)
                }
                Err(err) if stage.is_best_effort() && !matches!(err, PipelineError::Cancelled) => {
                    warn!(
                        "{} failed for rows {}..{}; annotating rows instead: {err}",
                        kind.label(),
                        batch.offset,
                        batch.end()
                    );
                    let produced = stage.degrade(&mut rows, &err);
                    warnings.push(err);
                    produced
                }
                Err(error) => {
                    phases.push(BatchPhase::Failed);
                    return Err(BatchFailure {
                        stage: kind,
                        error,
                        phases,
                    });
                }
            };
            working_columns.apply(&produced);
            requests.extend(produced);
        }

        phases.push(BatchPhase::Merged);
        Ok(BatchOutcome {
            rows,
            columns: requests,
            token,
            phases,
            warnings,
        })
    }
}
