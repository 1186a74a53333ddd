//! Excel workbook reader.
//!
//! Workbooks need random access, so the whole object is buffered before
//! decoding. Numeric date serials are converted to calendar values for the
//! schema fields declared date-like; everything else passes through for
//! the validator to coerce.

use std::collections::HashMap;
use std::io::Cursor;

use bytes::Bytes;
use calamine::{open_workbook_auto_from_rs, Data, Reader as _};
use chrono::{Duration, NaiveDate};
use tabload_core::{FieldType, LoadError, RawRecord, RecordSchema};
use tracing::debug;

use super::{validate_fields, BatchSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TemporalKind {
    Date,
    DateTime,
}

pub(crate) fn read_excel(
    data: Bytes,
    sheet_name: Option<&str>,
    skip_rows: usize,
    schema: &RecordSchema,
    filename: &str,
    mut sink: BatchSender,
) -> Result<u64, LoadError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(data))
        .map_err(|e| LoadError::storage(format!("opening workbook {filename}"), e))?;

    let sheet = match sheet_name {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| LoadError::MissingHeader {
                source_filename: filename.to_string(),
            })?,
    };
    let range = workbook.worksheet_range(&sheet).map_err(|e| {
        LoadError::Config(format!("sheet {sheet:?} not readable in {filename}: {e}"))
    })?;

    let mut rows = range.rows();
    let headers: Vec<String> = match rows.next() {
        Some(header_row) => header_row.iter().map(header_cell).collect(),
        None => {
            return Err(LoadError::MissingHeader {
                source_filename: filename.to_string(),
            })
        }
    };
    if headers.iter().all(|h| is_default_header(h)) {
        return Err(LoadError::MissingHeader {
            source_filename: filename.to_string(),
        });
    }
    validate_fields(headers.iter().map(String::as_str), schema, filename)?;

    let temporal = temporal_fields(schema);
    for (index, row) in rows.enumerate() {
        if index < skip_rows {
            continue;
        }
        let mut raw = RawRecord::with_capacity(headers.len());
        for (header, cell) in headers.iter().zip(row.iter()) {
            let kind = temporal.get(header.to_lowercase().as_str()).copied();
            raw.insert(header.clone(), cell_value(cell, kind));
        }
        sink.push(raw)?;
    }

    let rows_read = sink.finish()?;
    debug!(file = filename, sheet, rows = rows_read, "finished reading workbook");
    Ok(rows_read)
}

/// File column names (field name and alias, lower-cased) of the schema's
/// date-like fields.
fn temporal_fields(schema: &RecordSchema) -> HashMap<String, TemporalKind> {
    let mut map = HashMap::new();
    for field in &schema.fields {
        let kind = match field.field_type {
            FieldType::Date => TemporalKind::Date,
            FieldType::Datetime => TemporalKind::DateTime,
            _ => continue,
        };
        map.insert(field.name.to_lowercase(), kind);
        if let Some(alias) = &field.alias {
            map.insert(alias.to_lowercase(), kind);
        }
    }
    map
}

fn header_cell(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

/// A header cell that carries no usable name: blank, or a purely numeric
/// auto-generated label.
pub(crate) fn is_default_header(header: &str) -> bool {
    let trimmed = header.trim();
    if trimmed.is_empty() {
        return true;
    }
    let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn cell_value(cell: &Data, temporal: Option<TemporalKind>) -> serde_json::Value {
    match cell {
        Data::Empty => serde_json::Value::Null,
        Data::String(s) => serde_json::Value::String(s.clone()),
        Data::Bool(b) => serde_json::Value::Bool(*b),
        Data::Int(i) => match temporal {
            Some(kind) => serial_to_temporal(*i as f64, kind),
            None => serde_json::Value::from(*i),
        },
        Data::Float(f) => match temporal {
            Some(kind) => serial_to_temporal(*f, kind),
            None => serde_json::Value::from(*f),
        },
        Data::DateTime(dt) => {
            serial_to_temporal(dt.as_f64(), temporal.unwrap_or(TemporalKind::DateTime))
        }
        Data::DateTimeIso(s) | Data::DurationIso(s) => serde_json::Value::String(s.clone()),
        Data::Error(_) => serde_json::Value::Null,
    }
}

/// Convert an Excel date serial to a calendar value.
///
/// The epoch is 1899-12-30 (the serial scheme counts from 1900-01-00 and
/// carries the historical 1900 leap-year slot); whole days plus
/// fractional-day seconds.
pub(crate) fn serial_to_temporal(serial: f64, kind: TemporalKind) -> serde_json::Value {
    let Some(epoch) = NaiveDate::from_ymd_opt(1899, 12, 30) else {
        return serde_json::Value::Null;
    };
    let days = serial.trunc() as i64;
    let fractional = serial - days as f64;
    let date = epoch + Duration::days(days);
    match kind {
        TemporalKind::Date => serde_json::Value::String(date.format("%Y-%m-%d").to_string()),
        TemporalKind::DateTime => {
            let seconds = (fractional * 86400.0) as i64;
            let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
                return serde_json::Value::Null;
            };
            let dt = (midnight + Duration::seconds(seconds)).and_utc();
            serde_json::Value::String(dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_conversion_matches_the_1900_scheme() {
        // Serials after the phantom 1900-02-29 slot line up with the
        // calendar: serial 61 is 1900-03-01.
        assert_eq!(
            serial_to_temporal(61.0, TemporalKind::Date),
            serde_json::json!("1900-03-01")
        );
        // 2024-01-15 is serial 45306; noon adds half a day.
        assert_eq!(
            serial_to_temporal(45306.0, TemporalKind::Date),
            serde_json::json!("2024-01-15")
        );
        assert_eq!(
            serial_to_temporal(45306.5, TemporalKind::DateTime),
            serde_json::json!("2024-01-15T12:00:00Z")
        );
    }

    #[test]
    fn default_headers_are_detected() {
        assert!(is_default_header(""));
        assert!(is_default_header("  "));
        assert!(is_default_header("0"));
        assert!(is_default_header("-3"));
        assert!(!is_default_header("quantity"));
    }

    #[test]
    fn temporal_cells_convert_only_for_date_like_fields() {
        assert_eq!(
            cell_value(&Data::Float(45306.0), Some(TemporalKind::Date)),
            serde_json::json!("2024-01-15")
        );
        assert_eq!(cell_value(&Data::Float(2.5), None), serde_json::json!(2.5));
        assert_eq!(cell_value(&Data::Empty, None), serde_json::Value::Null);
    }
}
