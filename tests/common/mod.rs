#![allow(dead_code)]

use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use csv_translator::{
    error::{PipelineError, Result},
    llm::{ClientConfig, Collaborator, ContinuationToken, LlmRequest, LlmResponse},
    pipeline::{ModelSettings, StagePipeline},
    prompts::NO_ERRORS_FOUND,
    run::{RunController, RunOptions},
    stage::{RefineStage, SpellCheckStage, Stage, TranslateStage},
    table::Table,
};
use serde_json::{Map, Value, json};
use tempfile::{TempDir, tempdir};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }
}

/// What the scripted collaborator does for one call.
pub enum Reply {
    Output(String),
    Fail(PipelineError),
    /// Never answers; used to exercise cancellation of an in-flight batch.
    Hang,
}

type Script = Box<dyn Fn(usize, &LlmRequest) -> Reply + Send + Sync>;

/// In-memory collaborator: records every request and answers from a script.
pub struct ScriptedCollaborator {
    script: Script,
    calls: Mutex<Vec<(ClientConfig, LlmRequest)>>,
}

impl ScriptedCollaborator {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(usize, &LlmRequest) -> Reply + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call by transforming each sent row.
    pub fn per_row<F>(respond: F) -> Self
    where
        F: Fn(&LlmRequest, &Map<String, Value>) -> Value + Send + Sync + 'static,
    {
        Self::new(move |_, request| Reply::Output(rows_reply(request, &respond)))
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn configs(&self) -> Vec<ClientConfig> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(config, _)| config.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

#[async_trait]
impl Collaborator for ScriptedCollaborator {
    async fn respond(&self, config: &ClientConfig, request: &LlmRequest) -> Result<LlmResponse> {
        let call = {
            let mut calls = self.calls.lock().expect("calls lock");
            calls.push((config.clone(), request.clone()));
            calls.len()
        };
        match (self.script)(call - 1, request) {
            Reply::Output(output_text) => Ok(LlmResponse {
                token: ContinuationToken::new(format!("resp_{call}")),
                output_text,
            }),
            Reply::Fail(err) => Err(err),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Builds `{"rows": [...]}` by mapping each payload item through `respond`.
pub fn rows_reply<F>(request: &LlmRequest, respond: F) -> String
where
    F: Fn(&LlmRequest, &Map<String, Value>) -> Value,
{
    let items = request
        .payload
        .as_array()
        .expect("payload array")
        .iter()
        .map(|item| respond(request, item.as_object().expect("payload object")))
        .collect::<Vec<_>>();
    json!({ "rows": items }).to_string()
}

/// Echoes the sent row with `English` filled from a lookup of `Japanese`.
pub fn translation(item: &Map<String, Value>, lookup: &[(&str, &str)]) -> Value {
    let mut out = item.clone();
    let source = item.get("Japanese").and_then(Value::as_str).unwrap_or("");
    let english = lookup
        .iter()
        .find(|(jp, _)| *jp == source)
        .map(|(_, en)| en.to_string())
        .unwrap_or_else(|| format!("EN:{source}"));
    out.insert("English".into(), Value::String(english));
    Value::Object(out)
}

/// Spell-check answer flagging texts that contain `typo`.
pub fn spell_result(item: &Map<String, Value>) -> Value {
    let text = item.get("text").and_then(Value::as_str).unwrap_or("");
    if text.contains("typo") {
        json!({ "errors": format!("'{text}' contains a typo") })
    } else {
        json!({ "errors": NO_ERRORS_FOUND })
    }
}

pub fn table(headers: &[&str], rows: &[&[&str]]) -> Table {
    Table::from_records(
        headers.iter().map(|h| h.to_string()).collect(),
        rows.iter()
            .map(|row| row.iter().map(|v| v.to_string()).collect())
            .collect(),
    )
    .expect("valid table")
}

/// `n` rows of `{Japanese: "行{i}"}`.
pub fn japanese_table(n: usize) -> Table {
    let records = (0..n).map(|i| vec![format!("行{i}")]).collect();
    Table::from_records(vec!["Japanese".into()], records).expect("valid table")
}

pub fn translate_stage() -> Box<dyn Stage> {
    Box::new(TranslateStage {
        source_column: "Japanese".into(),
        target_column: "English".into(),
        character_column: None,
        instructions: "Translate Japanese to English.".into(),
        prompt: "Translate these rows.".into(),
    })
}

pub fn refine_stage() -> Box<dyn Stage> {
    Box::new(RefineStage {
        target_column: "English".into(),
        refined_column: "Refined".into(),
        instructions: "Refine.".into(),
        prompt: "Refine these rows.".into(),
    })
}

pub fn spell_stage(column: &str) -> Box<dyn Stage> {
    Box::new(SpellCheckStage {
        column: column.into(),
        instructions: "Proofread.".into(),
    })
}

pub fn settings() -> ModelSettings {
    ModelSettings {
        model: "gpt-4o".into(),
        temperature: Some(0.5),
    }
}

pub fn client() -> ClientConfig {
    ClientConfig::new("test-key")
}

pub fn pipeline<'a>(stages: Vec<Box<dyn Stage>>, collaborator: &'a dyn Collaborator) -> StagePipeline<'a> {
    StagePipeline::new(stages, collaborator, client(), settings())
}

pub fn controller<'a>(
    stages: Vec<Box<dyn Stage>>,
    collaborator: &'a dyn Collaborator,
    batch_size: usize,
) -> RunController<'a> {
    RunController::new(
        pipeline(stages, collaborator),
        RunOptions {
            batch_size,
            ..RunOptions::default()
        },
    )
}

/// Local HTTP endpoint that sends `200` headers for every connection and then
/// stalls halfway through the body. Returns its base URL.
pub fn stalled_body_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind local listener");
    let addr = listener.local_addr().expect("listener address");
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                return;
            };
            std::thread::spawn(move || {
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 1000\r\n\r\n{\"id\":",
                );
                let _ = stream.flush();
                std::thread::sleep(Duration::from_secs(10));
            });
        }
    });
    format!("http://{addr}")
}
