//! Run configuration: built-in defaults, an optional YAML file, then CLI flags.
//!
//! ```yaml
//! model: gpt-4o
//! temperature: 0.5
//! batch_size: 10
//! source_column: Japanese
//! target_column: English
//! api_key_env: OPENAI_API_KEY
//! ```

use std::{env, fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    batch::DEFAULT_BATCH_SIZE,
    error::{PipelineError, Result},
    llm::{ClientConfig, DEFAULT_BASE_URL},
    pipeline::ModelSettings,
    prompts,
    retry::RetryPolicy,
    schema::ColumnSet,
    stage::{RefineStage, SpellCheckStage, Stage, TranslateStage},
};

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_TEMPERATURE: f32 = 0.5;
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TranslatorConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub batch_size: usize,
    pub timeout_secs: u64,
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub source_column: String,
    pub target_column: String,
    pub refined_column: String,
    /// Speaker column; detected from the headers when unset.
    pub character_column: Option<String>,
    pub translate_instructions: Option<String>,
    pub translate_prompt: Option<String>,
    pub refine_instructions: Option<String>,
    pub refine_prompt: Option<String>,
    pub spell_check_prompt: Option<String>,
    pub chain_batches: bool,
    pub max_retries: usize,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        TranslatorConfig {
            model: DEFAULT_MODEL.to_string(),
            temperature: Some(DEFAULT_TEMPERATURE),
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_secs: 300,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            source_column: "Japanese".to_string(),
            target_column: "English".to_string(),
            refined_column: "Refined".to_string(),
            character_column: None,
            translate_instructions: None,
            translate_prompt: None,
            refine_instructions: None,
            refine_prompt: None,
            spell_check_prompt: None,
            chain_batches: true,
            max_retries: 5,
        }
    }
}

/// Values given on the command line. `None` leaves the lower layer in place.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub batch_size: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    pub source_column: Option<String>,
    pub target_column: Option<String>,
    pub character_column: Option<String>,
    pub max_retries: Option<usize>,
    pub no_chain: bool,
}

/// Which stages run, in pipeline order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSelection {
    pub translate: bool,
    pub refine: bool,
    /// Column to spell-check.
    pub spell_check: Option<String>,
}

impl TranslatorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            PipelineError::Configuration(format!("reading config file {path:?}: {err}"))
        })?;
        Self::from_yaml(&raw)
            .map_err(|err| PipelineError::Configuration(format!("{path:?}: {err}")))
    }

    pub fn from_yaml(raw: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        let ConfigOverrides {
            model,
            temperature,
            batch_size,
            timeout_secs,
            base_url,
            api_key,
            api_key_env,
            source_column,
            target_column,
            character_column,
            max_retries,
            no_chain,
        } = overrides;
        if let Some(model) = model {
            self.model = model;
        }
        if temperature.is_some() {
            self.temperature = temperature;
        }
        if let Some(size) = batch_size {
            self.batch_size = size;
        }
        if let Some(secs) = timeout_secs {
            self.timeout_secs = secs;
        }
        if let Some(url) = base_url {
            self.base_url = url;
        }
        if api_key.is_some() {
            self.api_key = api_key;
        }
        if let Some(name) = api_key_env {
            self.api_key_env = name;
        }
        if let Some(column) = source_column {
            self.source_column = column;
        }
        if let Some(column) = target_column {
            self.target_column = column;
        }
        if character_column.is_some() {
            self.character_column = character_column;
        }
        if let Some(retries) = max_retries {
            self.max_retries = retries;
        }
        if no_chain {
            self.chain_batches = false;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(PipelineError::Configuration("model must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Configuration(
                "batch size must be at least 1".into(),
            ));
        }
        if let Some(temperature) = self.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            return Err(PipelineError::Configuration(format!(
                "temperature {temperature} is outside 0.0..=2.0"
            )));
        }
        if self.timeout_secs == 0 {
            return Err(PipelineError::Configuration(
                "timeout must be at least one second".into(),
            ));
        }
        for (label, value) in [
            ("source column", &self.source_column),
            ("target column", &self.target_column),
            ("refined column", &self.refined_column),
        ] {
            if value.trim().is_empty() {
                return Err(PipelineError::Configuration(format!("{label} must not be empty")));
            }
        }
        Ok(())
    }

    pub fn resolve_api_key(&self) -> Result<String> {
        self.resolve_api_key_with(|name| env::var(name).ok())
    }

    /// `api_key` first, then the variable named by `api_key_env`.
    pub fn resolve_api_key_with<F>(&self, lookup: F) -> Result<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.api_key
            .clone()
            .or_else(|| lookup(&self.api_key_env))
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "no API key: pass --api-key, set api_key in the config file, or export {}",
                    self.api_key_env
                ))
            })
    }

    pub fn client_config(&self, api_key: String) -> ClientConfig {
        ClientConfig {
            api_key,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            ..RetryPolicy::default()
        }
    }

    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            model: self.model.clone(),
            temperature: self.temperature,
        }
    }

    pub fn build_stages(
        &self,
        selection: &StageSelection,
        columns: &ColumnSet,
    ) -> Result<Vec<Box<dyn Stage>>> {
        let mut stages: Vec<Box<dyn Stage>> = Vec::new();
        if selection.translate {
            let character_column = match &self.character_column {
                Some(column) if !columns.contains(column) => {
                    return Err(PipelineError::Configuration(format!(
                        "character column '{column}' is not in {columns}"
                    )));
                }
                Some(column) => Some(column.clone()),
                None => prompts::detect_character_column(columns.iter()).map(str::to_string),
            };
            stages.push(Box::new(TranslateStage {
                source_column: self.source_column.clone(),
                target_column: self.target_column.clone(),
                character_column,
                instructions: self
                    .translate_instructions
                    .clone()
                    .unwrap_or_else(|| prompts::DEFAULT_TRANSLATE_INSTRUCTIONS.to_string()),
                prompt: self
                    .translate_prompt
                    .clone()
                    .unwrap_or_else(|| prompts::DEFAULT_TRANSLATE_PROMPT.to_string()),
            }));
        }
        if selection.refine {
            stages.push(Box::new(RefineStage {
                target_column: self.target_column.clone(),
                refined_column: self.refined_column.clone(),
                instructions: self
                    .refine_instructions
                    .clone()
                    .unwrap_or_else(|| prompts::DEFAULT_REFINE_INSTRUCTIONS.to_string()),
                prompt: self
                    .refine_prompt
                    .clone()
                    .unwrap_or_else(|| prompts::DEFAULT_REFINE_PROMPT.to_string()),
            }));
        }
        if let Some(column) = &selection.spell_check {
            if column.trim().is_empty() {
                return Err(PipelineError::Configuration(
                    "no column selected for spell checking".into(),
                ));
            }
            stages.push(Box::new(SpellCheckStage {
                column: column.clone(),
                instructions: self
                    .spell_check_prompt
                    .clone()
                    .unwrap_or_else(|| prompts::DEFAULT_SPELL_CHECK_INSTRUCTIONS.to_string()),
            }));
        }
        Ok(stages)
    }
}
