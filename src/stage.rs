//! Processing stages applied to one batch.
//!
//! Every stage has the same three capabilities:
//!
//! 1. [`Stage::build_request`] turns the batch rows into one structured-output request,
//! 2. [`Stage::parse_response`] validates the model output against the batch without
//!    touching any row,
//! 3. [`Stage::merge`] writes the parsed values into the rows and describes the
//!    columns it produced as [`ColumnRequest`]s for the Schema Merger.
//!
//! Parsing and merging are split so a response that fails validation never
//! leaves a half-written batch behind.

use log::debug;
use serde_json::{Map, Value};

use crate::{
    error::{PipelineError, Result},
    llm::{ContinuationToken, LlmRequest, LlmResponse, ResponseSchema, extract_json, response_items},
    prompts,
    schema::{ColumnRequest, ColumnSet},
    table::Row,
};

pub const ERRORS_COLUMN: &str = "Errors";
pub const MARKER_VALUE: &str = "*";
const ROWS_KEY: &str = "rows";

pub type ParsedItems = Vec<Map<String, Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Translate,
    Refine,
    SpellCheck,
}

impl StageKind {
    pub fn label(&self) -> &'static str {
        match self {
            StageKind::Translate => "Translate",
            StageKind::Refine => "Refine",
            StageKind::SpellCheck => "SpellCheck",
        }
    }
}

/// Everything a stage needs to know about where the batch sits in the run.
#[derive(Debug, Clone)]
pub struct StageContext<'a> {
    pub model: &'a str,
    pub temperature: Option<f32>,
    /// Column list as seen by this stage, including columns added by earlier
    /// stages of the same batch.
    pub columns: &'a ColumnSet,
    pub offset: usize,
    pub total_rows: usize,
    pub continuation: Option<ContinuationToken>,
}

pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Chaining stages send and receive the run's continuation token.
    fn chains(&self) -> bool {
        true
    }

    /// Best-effort stages annotate rows on failure instead of failing the batch.
    fn is_best_effort(&self) -> bool {
        false
    }

    /// Columns that must exist, in the table or from an earlier stage, before the run starts.
    fn required_columns(&self) -> Vec<String>;

    /// Columns this stage can add, used to validate later stages before the run.
    fn produced_columns(&self) -> Vec<String>;

    fn build_request(&self, ctx: &StageContext<'_>, rows: &[Row]) -> LlmRequest;

    fn parse_response(&self, rows: &[Row], response: &LlmResponse) -> Result<ParsedItems>;

    fn merge(&self, rows: &mut [Row], parsed: ParsedItems) -> Vec<ColumnRequest>;

    /// Annotates rows after a non-fatal failure. Only called for best-effort stages.
    fn degrade(&self, _rows: &mut [Row], _err: &PipelineError) -> Vec<ColumnRequest> {
        Vec::new()
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn row_objects(rows: &[Row], fields: &[&str]) -> Value {
    Value::Array(
        rows.iter()
            .map(|row| {
                let object = fields
                    .iter()
                    .filter(|field| row.contains_key(**field))
                    .map(|field| (field.to_string(), Value::String(row[*field].clone())))
                    .collect::<Map<_, _>>();
                Value::Object(object)
            })
            .collect(),
    )
}

/// Extracts the item objects and checks they line up one-to-one with `rows`.
fn parse_row_items(stage: StageKind, rows: &[Row], output: &str) -> Result<ParsedItems> {
    let value =
        extract_json(output).map_err(|err| PipelineError::schema_mismatch(stage.label(), err.to_string()))?;
    let items = response_items(value, ROWS_KEY).ok_or_else(|| {
        PipelineError::schema_mismatch(stage.label(), "response does not contain a row array")
    })?;
    if items.len() != rows.len() {
        return Err(PipelineError::schema_mismatch(
            stage.label(),
            format!("expected {} row(s), received {}", rows.len(), items.len()),
        ));
    }
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| match item {
            Value::Object(map) => Ok(map),
            other => Err(PipelineError::schema_mismatch(
                stage.label(),
                format!("row {idx} is not an object: {other}"),
            )),
        })
        .collect()
}

/// Translates the batch and writes the returned fields back into each row.
#[derive(Debug, Clone)]
pub struct TranslateStage {
    pub source_column: String,
    pub target_column: String,
    pub character_column: Option<String>,
    pub instructions: String,
    pub prompt: String,
}

/// Known columns that at least one batch row carries. Columns added by earlier
/// batches (spell-check annotations, for instance) are left out of the request.
fn batch_columns<'a>(columns: &'a ColumnSet, rows: &[Row]) -> Vec<&'a str> {
    columns
        .iter()
        .filter(|name| rows.iter().any(|row| row.contains_key(*name)))
        .collect()
}

impl TranslateStage {
    fn fields<'a>(&'a self, columns: &'a ColumnSet, rows: &[Row]) -> Vec<&'a str> {
        let mut fields = batch_columns(columns, rows);
        if !fields.contains(&self.target_column.as_str()) {
            fields.push(&self.target_column);
        }
        fields
    }
}

impl Stage for TranslateStage {
    fn kind(&self) -> StageKind {
        StageKind::Translate
    }

    fn required_columns(&self) -> Vec<String> {
        vec![self.source_column.clone()]
    }

    fn produced_columns(&self) -> Vec<String> {
        vec![self.target_column.clone()]
    }

    fn build_request(&self, ctx: &StageContext<'_>, rows: &[Row]) -> LlmRequest {
        let fields = self.fields(ctx.columns, rows);
        let instructions = prompts::translate_instructions(
            &self.instructions,
            &self.source_column,
            &self.target_column,
            self.character_column.as_deref(),
        );
        let prompt = format!(
            "{}\n\n{}",
            self.prompt.trim_end(),
            prompts::row_window(ctx.offset, rows.len(), ctx.total_rows)
        );
        LlmRequest {
            model: ctx.model.to_string(),
            instructions,
            prompt,
            payload: row_objects(rows, &fields),
            schema: ResponseSchema::string_rows("translation", ROWS_KEY, &fields),
            temperature: ctx.temperature,
            continuation: ctx.continuation.clone(),
        }
    }

    fn parse_response(&self, rows: &[Row], response: &LlmResponse) -> Result<ParsedItems> {
        parse_row_items(self.kind(), rows, &response.output_text)
    }

    fn merge(&self, rows: &mut [Row], parsed: ParsedItems) -> Vec<ColumnRequest> {
        for (row, item) in rows.iter_mut().zip(parsed) {
            for (key, value) in item {
                if !row.contains_key(&key) && key != self.target_column {
                    debug!("Ignoring undeclared field '{key}' in translation output");
                    continue;
                }
                row.insert(key, cell_text(&value));
            }
        }
        vec![ColumnRequest::append(self.target_column.clone())]
    }
}

/// Second stylistic pass; its result lands in its own column.
#[derive(Debug, Clone)]
pub struct RefineStage {
    pub target_column: String,
    pub refined_column: String,
    pub instructions: String,
    pub prompt: String,
}

impl RefineStage {
    /// Batch columns minus the output column, with the output column declared last.
    fn fields<'a>(&'a self, columns: &'a ColumnSet, rows: &[Row]) -> Vec<&'a str> {
        let mut fields = batch_columns(columns, rows);
        fields.retain(|name| *name != self.refined_column);
        fields.push(&self.refined_column);
        fields
    }
}

impl Stage for RefineStage {
    fn kind(&self) -> StageKind {
        StageKind::Refine
    }

    fn required_columns(&self) -> Vec<String> {
        vec![self.target_column.clone()]
    }

    fn produced_columns(&self) -> Vec<String> {
        vec![self.refined_column.clone()]
    }

    fn build_request(&self, ctx: &StageContext<'_>, rows: &[Row]) -> LlmRequest {
        let fields = self.fields(ctx.columns, rows);
        let inputs = &fields[..fields.len() - 1];
        LlmRequest {
            model: ctx.model.to_string(),
            instructions: prompts::refine_instructions(
                &self.instructions,
                &self.target_column,
                &self.refined_column,
            ),
            prompt: format!(
                "{}\n\n{}",
                self.prompt.trim_end(),
                prompts::row_window(ctx.offset, rows.len(), ctx.total_rows)
            ),
            payload: row_objects(rows, inputs),
            schema: ResponseSchema::string_rows("refinement", ROWS_KEY, &fields),
            temperature: ctx.temperature,
            continuation: ctx.continuation.clone(),
        }
    }

    fn parse_response(&self, rows: &[Row], response: &LlmResponse) -> Result<ParsedItems> {
        let items = parse_row_items(self.kind(), rows, &response.output_text)?;
        if let Some(idx) = items
            .iter()
            .position(|item| !item.contains_key(&self.refined_column))
        {
            return Err(PipelineError::schema_mismatch(
                self.kind().label(),
                format!("row {idx} is missing the '{}' field", self.refined_column),
            ));
        }
        Ok(items)
    }

    fn merge(&self, rows: &mut [Row], parsed: ParsedItems) -> Vec<ColumnRequest> {
        for (row, mut item) in rows.iter_mut().zip(parsed) {
            let refined = item
                .remove(&self.refined_column)
                .map(|value| cell_text(&value))
                .unwrap_or_default();
            row.insert(self.refined_column.clone(), refined);
        }
        vec![ColumnRequest::append(self.refined_column.clone())]
    }
}

/// Best-effort spelling/grammar check over one column.
#[derive(Debug, Clone)]
pub struct SpellCheckStage {
    pub column: String,
    pub instructions: String,
}

impl SpellCheckStage {
    pub fn marker_column(&self) -> String {
        format!("{}_Marker", self.column)
    }

    fn column_requests(&self, any_flagged: bool) -> Vec<ColumnRequest> {
        let mut requests = vec![ColumnRequest::append(ERRORS_COLUMN)];
        if any_flagged {
            requests.push(ColumnRequest::after(self.marker_column(), self.column.clone()));
        }
        requests
    }
}

pub fn is_clean(errors: &str) -> bool {
    let trimmed = errors.trim().trim_end_matches('.');
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case(prompts::NO_ERRORS_FOUND)
}

impl Stage for SpellCheckStage {
    fn kind(&self) -> StageKind {
        StageKind::SpellCheck
    }

    fn chains(&self) -> bool {
        false
    }

    fn is_best_effort(&self) -> bool {
        true
    }

    fn required_columns(&self) -> Vec<String> {
        vec![self.column.clone()]
    }

    fn produced_columns(&self) -> Vec<String> {
        vec![ERRORS_COLUMN.to_string(), self.marker_column()]
    }

    fn build_request(&self, ctx: &StageContext<'_>, rows: &[Row]) -> LlmRequest {
        let payload = rows
            .iter()
            .enumerate()
            .map(|(id, row)| {
                serde_json::json!({
                    "id": id,
                    "text": row.get(&self.column).cloned().unwrap_or_default(),
                })
            })
            .collect::<Vec<_>>();
        LlmRequest {
            model: ctx.model.to_string(),
            instructions: self.instructions.clone(),
            prompt: format!(
                "Check each item's text for spelling or grammar mistakes. Return exactly one \
                 result per item, in the same order as the input ({} item(s)).",
                rows.len()
            ),
            payload: Value::Array(payload),
            schema: ResponseSchema::string_rows("spell_check", ROWS_KEY, &["errors"]),
            temperature: ctx.temperature,
            continuation: None,
        }
    }

    fn parse_response(&self, rows: &[Row], response: &LlmResponse) -> Result<ParsedItems> {
        let value = extract_json(&response.output_text)?;
        let items = response_items(value, ROWS_KEY).unwrap_or_default();
        if items.len() != rows.len() {
            return Err(PipelineError::LengthMismatch {
                expected: rows.len(),
                actual: items.len(),
            });
        }
        Ok(items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => map,
                Value::String(text) => {
                    let mut map = Map::new();
                    map.insert("errors".to_string(), Value::String(text));
                    map
                }
                other => {
                    let mut map = Map::new();
                    map.insert("errors".to_string(), Value::String(other.to_string()));
                    map
                }
            })
            .collect())
    }

    fn merge(&self, rows: &mut [Row], parsed: ParsedItems) -> Vec<ColumnRequest> {
        let marker = self.marker_column();
        let mut any_flagged = false;
        for (row, item) in rows.iter_mut().zip(parsed) {
            let errors = item.get("errors").map(cell_text).unwrap_or_default();
            let errors = errors.trim();
            if is_clean(errors) {
                row.insert(ERRORS_COLUMN.to_string(), prompts::NO_ERRORS_FOUND.to_string());
            } else {
                row.insert(ERRORS_COLUMN.to_string(), errors.to_string());
                row.insert(marker.clone(), MARKER_VALUE.to_string());
                any_flagged = true;
            }
        }
        self.column_requests(any_flagged)
    }

    fn degrade(&self, rows: &mut [Row], err: &PipelineError) -> Vec<ColumnRequest> {
        let marker = self.marker_column();
        let note = format!("Spell check failed: {err}");
        for row in rows.iter_mut() {
            row.insert(ERRORS_COLUMN.to_string(), note.clone());
            row.insert(marker.clone(), MARKER_VALUE.to_string());
        }
        self.column_requests(!rows.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn rows(values: &[&[(&str, &str)]]) -> Vec<Row> {
        values
            .iter()
            .map(|pairs| {
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .collect()
    }

    fn response(value: Value) -> LlmResponse {
        LlmResponse {
            token: ContinuationToken::new("resp_1"),
            output_text: value.to_string(),
        }
    }

    fn ctx<'a>(columns: &'a ColumnSet) -> StageContext<'a> {
        StageContext {
            model: "gpt-4o",
            temperature: Some(0.5),
            columns,
            offset: 0,
            total_rows: 1,
            continuation: None,
        }
    }

    fn translate() -> TranslateStage {
        TranslateStage {
            source_column: "Japanese".into(),
            target_column: "English".into(),
            character_column: None,
            instructions: "Translate.".into(),
            prompt: "Go.".into(),
        }
    }

    #[test]
    fn translate_declares_target_column_in_schema() {
        let columns = ColumnSet::from_headers(["Japanese"]);
        let batch = rows(&[&[("Japanese", "こんにちは")]]);
        let request = translate().build_request(&ctx(&columns), &batch);
        let required = &request.schema.schema["properties"]["rows"]["items"]["required"];
        assert_eq!(required, &json!(["Japanese", "English"]));
        assert_eq!(request.payload, json!([{ "Japanese": "こんにちは" }]));
        assert!(request.prompt.contains("rows 1 to 1 out of 1"));
    }

    #[test]
    fn translate_schema_skips_columns_added_by_earlier_batches() {
        let columns = ColumnSet::from_headers(["Japanese", "English", "English_Marker", "Errors"]);
        let batch = rows(&[&[("Japanese", "はい")], &[("Japanese", "いいえ")]]);
        let request = translate().build_request(&ctx(&columns), &batch);
        assert_eq!(
            request.schema.schema["properties"]["rows"]["items"]["required"],
            json!(["Japanese", "English"])
        );
        assert_eq!(request.payload, json!([{ "Japanese": "はい" }, { "Japanese": "いいえ" }]));
    }

    #[test]
    fn translate_rejects_row_count_mismatch() {
        let batch = rows(&[&[("Japanese", "a")], &[("Japanese", "b")]]);
        let err = translate()
            .parse_response(&batch, &response(json!({ "rows": [{ "English": "A" }] })))
            .unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch { .. }));
    }

    #[test]
    fn translate_rejects_unparseable_output() {
        let batch = rows(&[&[("Japanese", "a")]]);
        let err = translate()
            .parse_response(
                &batch,
                &LlmResponse {
                    token: ContinuationToken::new("resp_1"),
                    output_text: "Sorry, no.".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch { .. }));
    }

    #[test]
    fn refine_reads_named_field_not_last_key() {
        let stage = RefineStage {
            target_column: "English".into(),
            refined_column: "Refined".into(),
            instructions: "Refine.".into(),
            prompt: "Go.".into(),
        };
        let mut batch = rows(&[&[("Japanese", "はい"), ("English", "Yes")]]);
        let parsed = stage
            .parse_response(
                &batch,
                &response(json!({ "rows": [{ "Refined": "Yeah", "English": "Yes!" }] })),
            )
            .expect("parsed");
        let requests = stage.merge(&mut batch, parsed);
        assert_eq!(batch[0]["Refined"], "Yeah");
        assert_eq!(batch[0]["English"], "Yes");
        assert_eq!(requests, vec![ColumnRequest::append("Refined")]);
    }

    #[test]
    fn refine_schema_declares_output_last() {
        let stage = RefineStage {
            target_column: "English".into(),
            refined_column: "Refined".into(),
            instructions: "Refine.".into(),
            prompt: "Go.".into(),
        };
        let columns = ColumnSet::from_headers(["Japanese", "Refined", "English"]);
        let batch = rows(&[&[("Japanese", "はい"), ("English", "Yes")]]);
        let request = stage.build_request(&ctx(&columns), &batch);
        assert_eq!(
            request.schema.schema["properties"]["rows"]["items"]["required"],
            json!(["Japanese", "English", "Refined"])
        );
    }

    #[test]
    fn spell_check_sends_id_text_projection() {
        let stage = SpellCheckStage {
            column: "English".into(),
            instructions: "Check.".into(),
        };
        let columns = ColumnSet::from_headers(["Japanese", "English"]);
        let batch = rows(&[
            &[("Japanese", "a"), ("English", "Hello")],
            &[("Japanese", "b"), ("English", "Wrold")],
        ]);
        let request = stage.build_request(&ctx(&columns), &batch);
        assert_eq!(
            request.payload,
            json!([{ "id": 0, "text": "Hello" }, { "id": 1, "text": "Wrold" }])
        );
        assert!(request.continuation.is_none());
    }

    #[test]
    fn spell_check_length_mismatch_is_reported() {
        let stage = SpellCheckStage {
            column: "English".into(),
            instructions: "Check.".into(),
        };
        let batch = rows(&[&[("English", "a")], &[("English", "b")]]);
        let err = stage
            .parse_response(&batch, &response(json!({ "rows": [{ "errors": "No errors found" }] })))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::LengthMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn clean_results_are_recognised() {
        assert!(is_clean("No errors found"));
        assert!(is_clean(" no errors found. "));
        assert!(is_clean(""));
        assert!(!is_clean("'Wrold' should be 'World'"));
    }
}
