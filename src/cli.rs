use std::{num::NonZeroUsize, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::config::ConfigOverrides;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Translate CSV game dialogue with a language model",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Translate a CSV file batch by batch, optionally refining and spell-checking the result
    Translate(TranslateArgs),
    /// Spell-check one column of a CSV file and mark rows that need attention
    Check(CheckArgs),
    /// Preview the first few rows of a CSV file in a formatted table
    Preview(PreviewArgs),
}

/// Input file options shared by every command.
#[derive(Debug, Args)]
pub struct InputArgs {
    /// Input CSV file (`-` reads stdin)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

/// Model, credential, and run options shared by `translate` and `check`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Output CSV file (defaults to `<input>_translated.<ext>` or `<input>_checked.<ext>`)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    /// YAML configuration file; flags given here take precedence
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
    /// Model name, such as gpt-4o or o3-mini
    #[arg(short = 'm', long)]
    pub model: Option<String>,
    /// Sampling temperature (ignored by models that do not accept one)
    #[arg(short = 't', long)]
    pub temperature: Option<f32>,
    /// Rows per batch
    #[arg(short = 'b', long = "batch-size")]
    pub batch_size: Option<usize>,
    /// Number of leading rows already processed; processing resumes at this row
    #[arg(long, default_value_t = 0)]
    pub start: usize,
    /// Process at most this many rows from the start row, then stop
    #[arg(long = "max-rows")]
    pub max_rows: Option<NonZeroUsize>,
    /// Continuation token printed by an interrupted run
    #[arg(long = "continue-from")]
    pub continue_from: Option<String>,
    /// API key (overrides the config file and environment)
    #[arg(long = "api-key")]
    pub api_key: Option<String>,
    /// Environment variable holding the API key
    #[arg(long = "api-key-env")]
    pub api_key_env: Option<String>,
    /// API base URL
    #[arg(long = "base-url")]
    pub base_url: Option<String>,
    /// Maximum seconds per model call
    #[arg(long = "timeout")]
    pub timeout_secs: Option<u64>,
    /// Attempts per model call for transient failures
    #[arg(long = "max-retries")]
    pub max_retries: Option<usize>,
    /// Start every batch as a fresh conversation
    #[arg(long = "no-chain")]
    pub no_chain: bool,
}

#[derive(Debug, Args)]
pub struct TranslateArgs {
    #[command(flatten)]
    pub input: InputArgs,
    #[command(flatten)]
    pub run: RunArgs,
    /// Column holding the Japanese source text
    #[arg(long = "source-column")]
    pub source_column: Option<String>,
    /// Column receiving the translation
    #[arg(long = "target-column")]
    pub target_column: Option<String>,
    /// Column naming the speaking character (detected when omitted)
    #[arg(long = "character-column")]
    pub character_column: Option<String>,
    /// Run a second refinement pass over each translated batch
    #[arg(long)]
    pub refine: bool,
    /// Spell-check this column after translation
    #[arg(long = "spell-check", value_name = "COLUMN")]
    pub spell_check: Option<String>,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[command(flatten)]
    pub input: InputArgs,
    #[command(flatten)]
    pub run: RunArgs,
    /// Column to spell-check
    #[arg(short = 'C', long = "column")]
    pub column: String,
}

#[derive(Debug, Args)]
pub struct PreviewArgs {
    #[command(flatten)]
    pub input: InputArgs,
    /// Number of rows to display
    #[arg(long, default_value_t = 10)]
    pub rows: usize,
    /// Maximum width of a displayed cell
    #[arg(long = "max-width", default_value_t = crate::render::DEFAULT_CELL_WIDTH)]
    pub max_width: usize,
}

impl RunArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            model: self.model.clone(),
            temperature: self.temperature,
            batch_size: self.batch_size,
            timeout_secs: self.timeout_secs,
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            api_key_env: self.api_key_env.clone(),
            max_retries: self.max_retries,
            no_chain: self.no_chain,
            ..ConfigOverrides::default()
        }
    }
}

impl TranslateArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            source_column: self.source_column.clone(),
            target_column: self.target_column.clone(),
            character_column: self.character_column.clone(),
            ..self.run.overrides()
        }
    }
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}
