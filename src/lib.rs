pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod io_utils;
pub mod llm;
pub mod pipeline;
pub mod poll;
pub mod preview;
pub mod prompts;
pub mod render;
pub mod retry;
pub mod run;
pub mod schema;
pub mod stage;
pub mod table;
pub mod translate_cmd;

use std::{env, sync::OnceLock};

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;

use crate::cli::{Cli, Commands};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("csv_translator", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Translate(args) => translate_cmd::execute_translate(&args),
        Commands::Check(args) => translate_cmd::execute_check(&args),
        Commands::Preview(args) => preview::execute(&args),
    }
}

pub(crate) fn printable_delimiter(delimiter: u8) -> String {
    match delimiter {
        b',' => ",".to_string(),
        b'\t' => "\\t".to_string(),
        b'\n' => "\\n".to_string(),
        other => (other as char).to_string(),
    }
}
