//! `translate` and `check` command handlers.
//!
//! Both load the table and settings, drive a [`RunController`] on a
//! current-thread runtime, and always write whatever the table holds at the
//! end. While the run is going, every committed batch is also checkpointed
//! next to the output so a killed process can be resumed. A failed run leaves
//! a partial file plus the arguments that resume it.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use futures::StreamExt;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    cli::{CheckArgs, InputArgs, RunArgs, TranslateArgs},
    config::{ConfigOverrides, StageSelection, TranslatorConfig},
    io_utils::{self, CsvCheckpoint},
    llm::{ClientConfig, ContinuationToken, OpenAiResponses},
    pipeline::StagePipeline,
    printable_delimiter,
    run::{ResumePoint, RunController, RunOptions, RunState},
    stage::Stage,
    table::Table,
};

struct Job<'a> {
    input: &'a InputArgs,
    run: &'a RunArgs,
    overrides: ConfigOverrides,
    selection: StageSelection,
    output_suffix: &'static str,
}

pub fn execute_translate(args: &TranslateArgs) -> Result<()> {
    execute(Job {
        input: &args.input,
        run: &args.run,
        overrides: args.overrides(),
        selection: StageSelection {
            translate: true,
            refine: args.refine,
            spell_check: args.spell_check.clone(),
        },
        output_suffix: "translated",
    })
}

pub fn execute_check(args: &CheckArgs) -> Result<()> {
    execute(Job {
        input: &args.input,
        run: &args.run,
        overrides: args.run.overrides(),
        selection: StageSelection {
            translate: false,
            refine: false,
            spell_check: Some(args.column.clone()),
        },
        output_suffix: "checked",
    })
}

pub fn load_config(path: Option<&Path>, overrides: ConfigOverrides) -> Result<TranslatorConfig> {
    let base = match path {
        Some(path) => TranslatorConfig::load(path)?,
        None => TranslatorConfig::default(),
    };
    let config = base.with_overrides(overrides);
    config.validate()?;
    Ok(config)
}

fn execute(job: Job<'_>) -> Result<()> {
    let config = load_config(job.run.config.as_deref(), job.overrides)?;
    let input = &job.input.input;
    let encoding = io_utils::resolve_encoding(job.input.input_encoding.as_deref())?;
    let delimiter = io_utils::resolve_input_delimiter(input, job.input.delimiter);
    let mut table = io_utils::read_table(input, Some(delimiter), encoding)
        .with_context(|| format!("Reading {input:?}"))?;

    if job.run.start > table.len() {
        bail!(
            "--start {} is past the end of the table ({} row(s))",
            job.run.start,
            table.len()
        );
    }
    let api_key = config.resolve_api_key()?;
    let stages = config.build_stages(&job.selection, &table.columns)?;
    let output = job
        .run
        .output
        .clone()
        .unwrap_or_else(|| io_utils::default_output_path(input, job.output_suffix));
    let from = ResumePoint {
        processed: job.run.start,
        token: job.run.continue_from.clone().map(ContinuationToken::new),
    };

    info!(
        "Processing '{}' ({} row(s), delimiter '{}') with {} in batches of {}",
        input.display(),
        table.len(),
        printable_delimiter(delimiter),
        config.model,
        config.batch_size
    );
    if from.processed > 0 {
        info!("Resuming at row {}", from.processed + 1);
    }

    let options = RunOptions {
        batch_size: config.batch_size,
        chain_batches: config.chain_batches,
        max_rows: job.run.max_rows.map(|limit| limit.get()),
    };
    if let Some(limit) = options.max_rows {
        info!("Processing at most {limit} row(s) in this run");
    }
    let checkpoint = CsvCheckpoint::for_output(&output, delimiter);
    if let Some(checkpoint) = &checkpoint {
        info!(
            "Checkpointing progress to {:?} and {:?}",
            checkpoint.table_path(),
            checkpoint.state_path()
        );
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Starting async runtime")?;
    let state = runtime.block_on(drive(
        &mut table,
        &config,
        stages,
        config.client_config(api_key),
        options,
        checkpoint.as_ref(),
        from,
    ))?;

    table.finalize();
    io_utils::write_table(&output, &table, delimiter)?;
    if let Some(checkpoint) = &checkpoint {
        checkpoint.clear()?;
    }
    report(&state, &output)
}

async fn drive(
    table: &mut Table,
    config: &TranslatorConfig,
    stages: Vec<Box<dyn Stage>>,
    client: ClientConfig,
    options: RunOptions,
    checkpoint: Option<&CsvCheckpoint>,
    from: ResumePoint,
) -> Result<RunState> {
    let cancel = CancellationToken::new();
    let collaborator = OpenAiResponses::new(config.retry_policy())?.with_cancellation(cancel.clone());
    let pipeline = StagePipeline::new(stages, &collaborator, client, config.model_settings());
    let mut controller = RunController::new(pipeline, options).with_cancellation(cancel.clone());
    if let Some(checkpoint) = checkpoint {
        controller = controller.with_checkpoint(checkpoint);
    }
    controller.prepare(table)?;

    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; stopping after the current request");
                cancel.cancel();
            }
        }
    });

    let mut last = None;
    {
        let mut states = std::pin::pin!(controller.run(table, from));
        while let Some(state) = states.next().await {
            if state.failure.is_none() {
                info!(
                    "Processed {}/{} row(s) ({:.1}%)",
                    state.processed_count, state.total_rows, state.percent
                );
            }
            last = Some(state);
        }
    }
    interrupt.abort();
    last.ok_or_else(|| anyhow!("Run produced no progress"))
}

fn resume_hint(state: &RunState, output: &Path) -> String {
    let mut hint = format!("--input {} --start {}", output.display(), state.processed_count);
    if let Some(token) = &state.last_token {
        hint.push_str(&format!(" --continue-from {token}"));
    }
    hint
}

fn report(state: &RunState, output: &Path) -> Result<()> {
    if state.annotated_rows > 0 {
        warn!(
            "{} row(s) carry spell-check failure annotations; review rows marked '*'",
            state.annotated_rows
        );
    }
    match &state.failure {
        None if state.processed_count < state.total_rows => {
            info!(
                "Row limit reached after {}/{} row(s); wrote {:?}",
                state.processed_count, state.total_rows, output
            );
            info!("Continue with: {}", resume_hint(state, output));
            Ok(())
        }
        None => {
            info!(
                "Wrote {} row(s) with columns [{}] to {:?}",
                state.total_rows,
                state.columns.join(", "),
                output
            );
            if let Some(token) = &state.last_token {
                info!("Last continuation token: {token}");
            }
            Ok(())
        }
        Some(failure) => {
            warn!(
                "Stopped after {}/{} row(s); partial output written to {:?}",
                state.processed_count, state.total_rows, output
            );
            if failure.resumable {
                info!("Resume with: {}", resume_hint(state, output));
            }
            Err(anyhow!(failure.message.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorInfo, PipelineError};

    fn failed_state() -> RunState {
        RunState {
            processed_count: 20,
            total_rows: 50,
            percent: 40.0,
            columns: vec!["Japanese".into(), "English".into()],
            last_token: Some(ContinuationToken::new("resp_abc")),
            annotated_rows: 0,
            failure: Some(ErrorInfo::from_error(
                &PipelineError::Transport("timed out".into()),
                Some(20),
            )),
        }
    }

    #[test]
    fn resume_hint_names_start_and_token() {
        let hint = resume_hint(&failed_state(), Path::new("out.csv"));
        assert_eq!(hint, "--input out.csv --start 20 --continue-from resp_abc");
    }

    #[test]
    fn limited_run_is_not_an_error() {
        let state = RunState {
            failure: None,
            ..failed_state()
        };
        assert!(report(&state, Path::new("out.csv")).is_ok());
    }

    #[test]
    fn failed_run_reports_error() {
        let err = report(&failed_state(), Path::new("out.csv")).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
