//! Upload and download boundary: CSV text in, [`Table`] out, and back.
//!
//! - **Delimiter resolution**: extension-based (`.tsv` → tab, otherwise comma)
//!   with manual override.
//! - **Encoding**: input decoding via `encoding_rs`, defaulting to UTF-8. Output
//!   is always UTF-8 with a byte-order mark so spreadsheet tools pick it up.
//! - **stdin/stdout**: the `-` path routes through standard streams.
//! - **Checkpoints**: [`CsvCheckpoint`] rewrites `<stem>.partial.<ext>` and
//!   `<stem>.partial.json` next to the output after every committed batch.

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use encoding_rs::{Encoding, UTF_8};
use log::debug;

use crate::{
    error::PipelineError,
    run::{Checkpoint, RunState},
    table::Table,
};

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DEFAULT_TSV_DELIMITER: u8 = b'\t';
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

pub fn is_dash(path: &Path) -> bool {
    path == Path::new("-")
}

pub fn resolve_encoding(label: Option<&str>) -> Result<&'static Encoding> {
    if let Some(value) = label {
        Encoding::for_label(value.trim().as_bytes())
            .ok_or_else(|| anyhow!("Unknown encoding '{value}'"))
    } else {
        Ok(UTF_8)
    }
}

pub fn resolve_input_delimiter(path: &Path, provided: Option<u8>) -> u8 {
    provided.unwrap_or_else(|| match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => DEFAULT_TSV_DELIMITER,
        _ => DEFAULT_CSV_DELIMITER,
    })
}

/// `<stem>_<suffix>.<ext>` next to the input; stdout when the input is stdin.
pub fn default_output_path(input: &Path, suffix: &str) -> PathBuf {
    if is_dash(input) {
        return PathBuf::from("-");
    }
    let stem = input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("output");
    let ext = input
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("csv");
    input.with_file_name(format!("{stem}_{suffix}.{ext}"))
}

pub fn open_csv_reader<R>(reader: R, delimiter: u8) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(true)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(true);
    builder.from_reader(reader)
}

fn decode_bytes(bytes: &[u8], encoding: &'static Encoding) -> Result<String, PipelineError> {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        Err(PipelineError::Parse(format!(
            "text is not valid {}",
            encoding.name()
        )))
    } else {
        Ok(text.into_owned())
    }
}

pub fn decode_record(
    record: &csv::ByteRecord,
    encoding: &'static Encoding,
) -> Result<Vec<String>, PipelineError> {
    record
        .iter()
        .map(|field| decode_bytes(field, encoding))
        .collect()
}

pub fn reader_headers<R>(
    reader: &mut csv::Reader<R>,
    encoding: &'static Encoding,
) -> Result<Vec<String>, PipelineError>
where
    R: Read,
{
    let headers = reader
        .byte_headers()
        .map_err(|err| PipelineError::Parse(err.to_string()))?
        .clone();
    let mut headers = decode_record(&headers, encoding)?;
    if let Some(first) = headers.first_mut()
        && let Some(stripped) = first.strip_prefix('\u{feff}')
    {
        *first = stripped.to_string();
    }
    Ok(headers)
}

/// Parses a whole CSV stream into a [`Table`]. Empty lines are skipped by the
/// reader; a record of empty fields (`,,`) is still a row.
pub fn read_table_from<R>(
    reader: R,
    delimiter: u8,
    encoding: &'static Encoding,
) -> Result<Table, PipelineError>
where
    R: Read,
{
    let mut reader = open_csv_reader(reader, delimiter);
    let headers = reader_headers(&mut reader, encoding)?;
    let mut records = Vec::new();
    for (idx, record) in reader.byte_records().enumerate() {
        let record =
            record.map_err(|err| PipelineError::Parse(format!("row {}: {err}", idx + 2)))?;
        records.push(decode_record(&record, encoding)?);
    }
    Table::from_records(headers, records)
}

pub fn read_table(
    path: &Path,
    delimiter: Option<u8>,
    encoding: &'static Encoding,
) -> Result<Table> {
    let delimiter = resolve_input_delimiter(path, delimiter);
    let source: Box<dyn Read> = if is_dash(path) {
        Box::new(std::io::stdin().lock())
    } else {
        Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Opening input file {path:?}"))?,
        ))
    };
    let table = read_table_from(source, delimiter, encoding)?;
    debug!(
        "Loaded {} row(s) with columns {} from {path:?}",
        table.len(),
        table.columns
    );
    Ok(table)
}

/// Writes the table in final column order, preceded by a UTF-8 BOM.
pub fn write_table_to<W>(mut writer: W, table: &Table, delimiter: u8) -> Result<()>
where
    W: Write,
{
    writer.write_all(UTF8_BOM)?;
    let mut csv_writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .quote_style(csv::QuoteStyle::Necessary)
        .double_quote(true)
        .from_writer(writer);
    csv_writer.write_record(table.columns.iter())?;
    for idx in 0..table.len() {
        csv_writer.write_record(table.record(idx))?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn write_table(path: &Path, table: &Table, delimiter: u8) -> Result<()> {
    let writer: Box<dyn Write> = if is_dash(path) {
        Box::new(std::io::stdout().lock())
    } else {
        Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Creating output file {path:?}"))?,
        ))
    };
    write_table_to(writer, table, delimiter).with_context(|| format!("Writing {path:?}"))
}

/// Writes through a sibling `.tmp` file and renames it over `path`, so a crash
/// mid-write leaves the previous version intact.
fn write_replacing<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let mut tmp_name = OsString::from(path.as_os_str());
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    let mut writer = BufWriter::new(
        File::create(&tmp).with_context(|| format!("Creating checkpoint file {tmp:?}"))?,
    );
    write(&mut writer)?;
    writer
        .into_inner()
        .map_err(|err| err.into_error())
        .and_then(|file| file.sync_all())
        .with_context(|| format!("Flushing {tmp:?}"))?;
    fs::rename(&tmp, path).with_context(|| format!("Replacing {path:?}"))
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            Err(err).with_context(|| format!("Removing {path:?}"))
        }
        _ => Ok(()),
    }
}

/// Per-batch snapshot of a run next to its output file.
///
/// The table goes to `<stem>.partial.<ext>` and the latest [`RunState`] to
/// `<stem>.partial.json`; the state's `processed_count` and `last_token` are
/// the `--start` and `--continue-from` values for the partial table.
#[derive(Debug, Clone)]
pub struct CsvCheckpoint {
    table_path: PathBuf,
    state_path: PathBuf,
    delimiter: u8,
}

impl CsvCheckpoint {
    /// `None` when the output goes to stdout.
    pub fn for_output(output: &Path, delimiter: u8) -> Option<Self> {
        if is_dash(output) {
            return None;
        }
        let stem = output
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("output");
        let ext = output
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("csv");
        Some(CsvCheckpoint {
            table_path: output.with_file_name(format!("{stem}.partial.{ext}")),
            state_path: output.with_file_name(format!("{stem}.partial.json")),
            delimiter,
        })
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Removes both files once the full output has been written.
    pub fn clear(&self) -> Result<()> {
        remove_if_present(&self.table_path)?;
        remove_if_present(&self.state_path)
    }
}

impl Checkpoint for CsvCheckpoint {
    fn save(&self, table: &Table, state: &RunState) -> Result<()> {
        write_replacing(&self.table_path, |writer| {
            write_table_to(writer, table, self.delimiter)
        })?;
        write_replacing(&self.state_path, |writer| {
            serde_json::to_writer_pretty(writer, state)?;
            Ok(())
        })?;
        debug!(
            "Checkpoint at row {} written to {:?}",
            state.processed_count, self.table_path
        );
        Ok(())
    }
}
