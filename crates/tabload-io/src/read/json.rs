//! Streaming JSON array reader.
//!
//! Records live in an array addressed by a dotted path from the document
//! root (empty path: the document itself is the array). The array is
//! consumed element by element through serde's visitor seam, so memory
//! stays bounded by the batch size however large the document is.

use std::io::Read;

use serde::de::{DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use tabload_core::{LoadError, RawRecord, RecordSchema};
use tracing::debug;

use super::{validate_fields, BatchSender};

pub(crate) fn read_json(
    input: Box<dyn Read + Send>,
    array_path: &str,
    schema: &RecordSchema,
    filename: &str,
    sink: BatchSender,
) -> Result<u64, LoadError> {
    let segments: Vec<&str> = array_path.split('.').filter(|s| !s.is_empty()).collect();
    let mut state = ReadState {
        sink,
        schema,
        filename,
        fields_validated: false,
        records_seen: false,
        error: None,
    };

    let mut deserializer = serde_json::Deserializer::from_reader(input);
    let outcome = PathSeed {
        segments: &segments,
        state: &mut state,
    }
    .deserialize(&mut deserializer);

    if let Some(err) = state.error.take() {
        return Err(err);
    }
    outcome.map_err(|e| LoadError::storage(format!("parsing {filename}"), e))?;

    if !state.records_seen {
        return Err(LoadError::NoDataInFile {
            source_filename: filename.to_string(),
        });
    }
    let rows = state.sink.finish()?;
    debug!(file = filename, rows, "finished reading json");
    Ok(rows)
}

struct ReadState<'a> {
    sink: BatchSender,
    schema: &'a RecordSchema,
    filename: &'a str,
    fields_validated: bool,
    records_seen: bool,
    error: Option<LoadError>,
}

impl ReadState<'_> {
    /// Flatten and emit one array element. Elements may themselves be
    /// arrays of records; scalars are malformed input.
    fn element(&mut self, value: serde_json::Value) -> Result<(), LoadError> {
        match value {
            serde_json::Value::Object(object) => self.record(flatten_json(&object)),
            serde_json::Value::Array(items) => {
                for item in items {
                    self.element(item)?;
                }
                Ok(())
            }
            other => Err(LoadError::storage(
                format!("parsing {}", self.filename),
                format!("expected a record object in the array, got {other}"),
            )),
        }
    }

    fn record(&mut self, record: RawRecord) -> Result<(), LoadError> {
        if !self.fields_validated {
            validate_fields(
                record.keys().map(String::as_str),
                self.schema,
                self.filename,
            )?;
            self.fields_validated = true;
        }
        self.records_seen = true;
        self.sink.push(record)
    }
}

/// Seed that walks the dotted path, ignoring every sibling value, then
/// streams the target array's elements.
struct PathSeed<'a, 'b> {
    segments: &'a [&'a str],
    state: &'a mut ReadState<'b>,
}

impl<'de> DeserializeSeed<'de> for PathSeed<'_, '_> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        if self.segments.is_empty() {
            deserializer.deserialize_seq(ArrayVisitor { state: self.state })
        } else {
            deserializer.deserialize_map(NavigateVisitor {
                segments: self.segments,
                state: self.state,
            })
        }
    }
}

struct NavigateVisitor<'a, 'b> {
    segments: &'a [&'a str],
    state: &'a mut ReadState<'b>,
}

impl<'de> Visitor<'de> for NavigateVisitor<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "an object containing the key {:?}", self.segments[0])
    }

    fn visit_map<A>(self, mut map: A) -> Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut found = false;
        while let Some(key) = map.next_key::<String>()? {
            if !found && key == self.segments[0] {
                found = true;
                map.next_value_seed(PathSeed {
                    segments: &self.segments[1..],
                    state: &mut *self.state,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        // Path absent: reported as an empty file, matching an empty array.
        Ok(())
    }
}

struct ArrayVisitor<'a, 'b> {
    state: &'a mut ReadState<'b>,
}

impl<'de> Visitor<'de> for ArrayVisitor<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "an array of record objects")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while let Some(value) = seq.next_element::<serde_json::Value>()? {
            if let Err(err) = self.state.element(value) {
                self.state.error = Some(err);
                return Err(serde::de::Error::custom("record stream aborted"));
            }
        }
        Ok(())
    }
}

/// Flatten a nested object into a single-level field map.
///
/// Nested keys are joined with `_` and lower-cased; arrays of objects are
/// flattened with a numeric index segment; scalar arrays are kept as their
/// JSON text form.
pub fn flatten_json(object: &serde_json::Map<String, serde_json::Value>) -> RawRecord {
    let mut out = RawRecord::new();
    flatten_into(&mut out, object, None);
    out
}

fn flatten_into(
    out: &mut RawRecord,
    object: &serde_json::Map<String, serde_json::Value>,
    parent: Option<&str>,
) {
    use serde_json::Value;
    for (key, value) in object {
        let flat_key = match parent {
            Some(p) => format!("{p}_{key}").to_lowercase(),
            None => key.to_lowercase(),
        };
        match value {
            Value::Object(inner) => flatten_into(out, inner, Some(&flat_key)),
            Value::Array(items) => {
                if items.first().is_some_and(|v| v.is_object()) {
                    for (index, item) in items.iter().enumerate() {
                        let indexed = format!("{flat_key}_{index}");
                        match item {
                            Value::Object(inner) => flatten_into(out, inner, Some(&indexed)),
                            other => {
                                out.insert(indexed, other.clone());
                            }
                        }
                    }
                } else {
                    out.insert(flat_key, Value::String(Value::Array(items.clone()).to_string()));
                }
            }
            other => {
                out.insert(flat_key, other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::collect_batches;
    use super::*;
    use serde_json::json;
    use tabload_core::{FieldDef, FieldType};

    fn schema() -> RecordSchema {
        RecordSchema::new(vec![
            FieldDef {
                name: "entry_id".into(),
                alias: None,
                field_type: FieldType::Int,
                optional: false,
            },
            FieldDef {
                name: "entry_amount".into(),
                alias: None,
                field_type: FieldType::Float,
                optional: false,
            },
        ])
    }

    fn run(
        data: &'static str,
        path: &'static str,
    ) -> (Result<u64, LoadError>, Vec<tabload_core::RawBatch>) {
        collect_batches(move |sink| {
            read_json(Box::new(data.as_bytes()), path, &schema(), "t.json", sink)
        })
    }

    #[test]
    fn reads_a_root_array() {
        let data = r#"[{"Entry": {"Id": 1, "Amount": 9.5}}, {"Entry": {"Id": 2, "Amount": 1.25}}]"#;
        let (rows, batches) = run(data, "");
        assert_eq!(rows.unwrap(), 2);
        assert_eq!(batches[0][0].get("entry_id"), Some(&json!(1)));
        assert_eq!(batches[0][1].get("entry_amount"), Some(&json!(1.25)));
    }

    #[test]
    fn navigates_a_dotted_path() {
        let data = r#"{"meta": {"count": 1}, "data": {"items": [{"entry_id": 5, "entry_amount": 2.0}]}}"#;
        let (rows, batches) = run(data, "data.items");
        assert_eq!(rows.unwrap(), 1);
        assert_eq!(batches[0][0].get("entry_id"), Some(&json!(5)));
    }

    #[test]
    fn empty_array_is_no_data() {
        let (result, _) = run("[]", "");
        assert!(matches!(result, Err(LoadError::NoDataInFile { .. })));
    }

    #[test]
    fn missing_path_is_no_data() {
        let (result, _) = run(r#"{"other": []}"#, "data.items");
        assert!(matches!(result, Err(LoadError::NoDataInFile { .. })));
    }

    #[test]
    fn first_record_gates_missing_columns() {
        let data = r#"[{"entry_id": 1}]"#;
        let (result, _) = run(data, "");
        assert!(matches!(result, Err(LoadError::MissingColumns { .. })));
    }

    #[test]
    fn flatten_rules() {
        let object = json!({
            "Entry": {"ID": 1},
            "Tags": ["a", "b"],
            "Lines": [{"Qty": 2}, {"Qty": 3}],
            "Plain": 7.5
        });
        let flat = flatten_json(object.as_object().unwrap());
        assert_eq!(flat.get("entry_id"), Some(&json!(1)));
        assert_eq!(flat.get("tags"), Some(&json!("[\"a\",\"b\"]")));
        assert_eq!(flat.get("lines_0_qty"), Some(&json!(2)));
        assert_eq!(flat.get("lines_1_qty"), Some(&json!(3)));
        assert_eq!(flat.get("plain"), Some(&json!(7.5)));
    }
}
