//! Columnar (Parquet) reader.
//!
//! Footer metadata needs random access, so the object is buffered before
//! decoding. Rows are converted to raw field maps with lower-cased column
//! names; the validator handles typing from there.

use bytes::Bytes;
use parquet::file::reader::{FileReader, SerializedFileReader};
use tabload_core::{LoadError, RawRecord, RecordSchema};
use tracing::debug;

use super::{validate_fields, BatchSender};

pub(crate) fn read_parquet(
    data: Bytes,
    schema: &RecordSchema,
    filename: &str,
    mut sink: BatchSender,
) -> Result<u64, LoadError> {
    let reader = SerializedFileReader::new(data)
        .map_err(|e| LoadError::storage(format!("opening parquet file {filename}"), e))?;

    let file_metadata = reader.metadata().file_metadata();
    if file_metadata.num_rows() == 0 {
        return Err(LoadError::NoDataInFile {
            source_filename: filename.to_string(),
        });
    }

    let columns: Vec<String> = file_metadata
        .schema_descr()
        .root_schema()
        .get_fields()
        .iter()
        .map(|f| f.name().to_string())
        .collect();
    if columns.is_empty() || columns.iter().all(|c| c.trim().is_empty()) {
        return Err(LoadError::MissingHeader {
            source_filename: filename.to_string(),
        });
    }
    validate_fields(columns.iter().map(String::as_str), schema, filename)?;

    let rows = reader
        .get_row_iter(None)
        .map_err(|e| LoadError::storage(format!("reading parquet file {filename}"), e))?;
    for row in rows {
        let row = row.map_err(|e| LoadError::storage(format!("reading {filename}"), e))?;
        let mut raw = RawRecord::with_capacity(columns.len());
        for (name, field) in row.get_column_iter() {
            raw.insert(name.to_lowercase(), field.to_json_value());
        }
        sink.push(raw)?;
    }

    let rows_read = sink.finish()?;
    debug!(file = filename, rows = rows_read, "finished reading parquet");
    Ok(rows_read)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::collect_batches;
    use super::*;
    use parquet::data_type::{ByteArray, ByteArrayType, Int64Type};
    use parquet::file::properties::WriterProperties;
    use parquet::file::writer::SerializedFileWriter;
    use parquet::schema::parser::parse_message_type;
    use std::sync::Arc;
    use tabload_core::{FieldDef, FieldType};

    fn record_schema() -> RecordSchema {
        RecordSchema::new(vec![
            FieldDef {
                name: "transaction_id".into(),
                alias: None,
                field_type: FieldType::String { max_length: None },
                optional: false,
            },
            FieldDef {
                name: "quantity".into(),
                alias: None,
                field_type: FieldType::Int,
                optional: false,
            },
        ])
    }

    fn write_parquet(ids: &[&str], quantities: &[i64]) -> Bytes {
        let message = "
            message record {
                required binary transaction_id (UTF8);
                required int64 quantity;
            }
        ";
        let schema = Arc::new(parse_message_type(message).unwrap());
        let mut buffer = Vec::new();
        let mut writer = SerializedFileWriter::new(
            &mut buffer,
            schema,
            Arc::new(WriterProperties::builder().build()),
        )
        .unwrap();
        if !ids.is_empty() {
            let mut row_group = writer.next_row_group().unwrap();

            let mut col = row_group.next_column().unwrap().unwrap();
            let values: Vec<ByteArray> = ids.iter().map(|s| ByteArray::from(*s)).collect();
            col.typed::<ByteArrayType>()
                .write_batch(&values, None, None)
                .unwrap();
            col.close().unwrap();

            let mut col = row_group.next_column().unwrap().unwrap();
            col.typed::<Int64Type>()
                .write_batch(quantities, None, None)
                .unwrap();
            col.close().unwrap();

            row_group.close().unwrap();
        }
        writer.close().unwrap();
        Bytes::from(buffer)
    }

    #[test]
    fn reads_rows_as_lowercased_field_maps() {
        let data = write_parquet(&["T1", "T2"], &[1, 2]);
        let (rows, batches) = collect_batches(move |sink| {
            read_parquet(data, &record_schema(), "t.parquet", sink)
        });
        assert_eq!(rows.unwrap(), 2);
        assert_eq!(
            batches[0][0].get("transaction_id"),
            Some(&serde_json::json!("T1"))
        );
        assert_eq!(batches[0][1].get("quantity"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn empty_file_is_no_data() {
        let data = write_parquet(&[], &[]);
        let (result, _) = collect_batches(move |sink| {
            read_parquet(data, &record_schema(), "t.parquet", sink)
        });
        assert!(matches!(result, Err(LoadError::NoDataInFile { .. })));
    }

    #[test]
    fn schema_mismatch_is_missing_columns() {
        let data = write_parquet(&["T1"], &[1]);
        let mut schema = record_schema();
        schema.fields.push(FieldDef {
            name: "missing_field".into(),
            alias: None,
            field_type: FieldType::Int,
            optional: false,
        });
        let (result, _) =
            collect_batches(move |sink| read_parquet(data, &schema, "t.parquet", sink));
        assert!(matches!(result, Err(LoadError::MissingColumns { .. })));
    }
}
