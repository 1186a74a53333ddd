//! Delimited-text reader.

use std::io::Read;

use tabload_core::{LoadError, RawRecord, RecordSchema};
use tracing::debug;

use super::{validate_fields, BatchSender};

/// Stream a CSV file into batches of raw field maps. Cells stay strings;
/// type coercion happens in the validator.
pub(crate) fn read_csv(
    input: Box<dyn Read + Send>,
    delimiter: char,
    skip_rows: usize,
    schema: &RecordSchema,
    filename: &str,
    mut sink: BatchSender,
) -> Result<u64, LoadError> {
    let mut reader = ::csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .flexible(true)
        .from_reader(input);

    let headers = reader
        .headers()
        .map_err(|e| LoadError::storage(format!("reading header of {filename}"), e))?
        .clone();

    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(LoadError::MissingHeader {
            source_filename: filename.to_string(),
        });
    }
    validate_fields(headers.iter(), schema, filename)?;

    let header_names: Vec<String> = headers.iter().map(str::to_string).collect();
    for (index, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| LoadError::storage(format!("reading {filename}"), e))?;
        if index < skip_rows {
            continue;
        }
        let mut raw = RawRecord::with_capacity(header_names.len());
        for (i, name) in header_names.iter().enumerate() {
            let cell = record.get(i).unwrap_or("");
            raw.insert(name.clone(), serde_json::Value::String(cell.to_string()));
        }
        sink.push(raw)?;
    }

    let rows = sink.finish()?;
    debug!(file = filename, rows, "finished reading csv");
    Ok(rows)
}
