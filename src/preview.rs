use anyhow::{Context, Result};
use log::info;

use crate::{cli::PreviewArgs, io_utils, render};

pub fn execute(args: &PreviewArgs) -> Result<()> {
    let encoding = io_utils::resolve_encoding(args.input.input_encoding.as_deref())?;
    let table = io_utils::read_table(&args.input.input, args.input.delimiter, encoding)
        .with_context(|| format!("Reading {:?}", args.input.input))?;

    print!("{}", render::render_table(&table, args.rows, args.max_width));
    info!(
        "Displayed {} of {} row(s) from {:?}",
        table.len().min(args.rows),
        table.len(),
        args.input.input
    );
    Ok(())
}
