//! Declared sources and the registry that classifies incoming files.
//!
//! A [`DeclaredSource`] binds a case-insensitive filename glob to a record
//! schema, a target table, the grain that identifies a row, and the
//! per-source validation and audit knobs. The registry resolves a filename
//! to at most one source by combining the file extension's format with the
//! glob match.

use std::path::Path;
use std::sync::Arc;

use glob::{MatchOptions, Pattern};
use serde::Deserialize;

use crate::error::LoadError;
use crate::schema::RecordSchema;

/// Per-format reader options declared on a source.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum SourceFormat {
    Csv {
        #[serde(default = "default_delimiter")]
        delimiter: char,
        #[serde(default)]
        skip_rows: usize,
    },
    Excel {
        #[serde(default)]
        sheet_name: Option<String>,
        #[serde(default)]
        skip_rows: usize,
    },
    Json {
        /// Dotted path from the document root to the record array; empty
        /// means the document itself is the array.
        #[serde(default)]
        array_path: String,
    },
    Parquet,
}

fn default_delimiter() -> char {
    ','
}

/// File format family derived from a filename extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Csv { gzip: bool },
    Excel,
    Json { gzip: bool },
    Parquet,
}

impl FileKind {
    /// Extension table: the compression suffix `.gz` combines with the
    /// prior suffix.
    pub fn for_extension(ext: &str) -> Option<FileKind> {
        match ext {
            ".csv" => Some(FileKind::Csv { gzip: false }),
            ".csv.gz" => Some(FileKind::Csv { gzip: true }),
            ".xlsx" | ".xls" => Some(FileKind::Excel),
            ".json" => Some(FileKind::Json { gzip: false }),
            ".json.gz" => Some(FileKind::Json { gzip: true }),
            ".parquet" => Some(FileKind::Parquet),
            _ => None,
        }
    }

    fn matches_format(&self, format: &SourceFormat) -> bool {
        matches!(
            (self, format),
            (FileKind::Csv { .. }, SourceFormat::Csv { .. })
                | (FileKind::Excel, SourceFormat::Excel { .. })
                | (FileKind::Json { .. }, SourceFormat::Json { .. })
                | (FileKind::Parquet, SourceFormat::Parquet)
        )
    }
}

/// Lower-cased extension of a filename, keeping a trailing `.gz` together
/// with the suffix before it: `Sales.CSV.GZ` gives `.csv.gz`.
pub fn file_extension(filename: &str) -> String {
    let name = basename(filename);
    let lowered = name.to_lowercase();
    let parts: Vec<&str> = lowered.split('.').collect();
    match parts.as_slice() {
        [.., prev, "gz"] if !prev.is_empty() => format!(".{prev}.gz"),
        [.., last] if parts.len() > 1 => format!(".{last}"),
        _ => String::new(),
    }
}

/// Final path segment of a filename or URI.
pub fn basename(filename: &str) -> &str {
    filename
        .split(['?', '#'])
        .next()
        .unwrap_or(filename)
        .rsplit('/')
        .next()
        .unwrap_or(filename)
}

/// One catalog entry: a declared data source.
#[derive(Debug, Clone, Deserialize)]
pub struct DeclaredSource {
    /// Case-insensitive glob matched against the file's basename.
    pub file_pattern: String,
    #[serde(flatten)]
    pub format: SourceFormat,
    pub schema: RecordSchema,
    /// Target table receiving the merged records.
    pub table_name: String,
    /// Schema field names that uniquely identify a row.
    pub grain: Vec<String>,
    /// Optional audit SQL with a `{table}` placeholder; projects one row of
    /// named integer columns, 1 = pass, 0 = fail.
    #[serde(default)]
    pub audit_query: Option<String>,
    /// Tolerated fraction of records failing validation, strict upper bound.
    #[serde(default)]
    pub validation_error_threshold: f64,
    #[serde(default)]
    pub notification_recipients: Option<Vec<String>>,
}

impl DeclaredSource {
    /// Validate the declaration invariants at registration time.
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.grain.is_empty() {
            return Err(LoadError::Config(format!(
                "source {} declares an empty grain",
                self.table_name
            )));
        }
        for grain_field in &self.grain {
            if self.schema.field(grain_field).is_none() {
                return Err(LoadError::Config(format!(
                    "grain column {} is not a schema field of {}; available fields: {}",
                    grain_field,
                    self.table_name,
                    self.schema.field_names().collect::<Vec<_>>().join(", ")
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.validation_error_threshold) {
            return Err(LoadError::Config(format!(
                "source {} validation_error_threshold {} is outside [0, 1]",
                self.table_name, self.validation_error_threshold
            )));
        }
        Ok(())
    }

    /// Case-insensitive glob match against the file's basename.
    pub fn matches_file(&self, filename: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        Pattern::new(&self.file_pattern)
            .map(|p| p.matches_with(basename(filename), options))
            .unwrap_or(false)
    }
}

/// Result of resolving a filename against the registry.
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(Arc<DeclaredSource>),
    /// No reader for the extension, or no declared source matched.
    NoMatch,
    /// More than one source matched; carries the matching table names.
    Ambiguous(Vec<String>),
}

/// Read-only registry of declared sources, shared by all workers.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<DeclaredSource>>,
}

impl SourceRegistry {
    pub fn register(sources: Vec<DeclaredSource>) -> Result<Self, LoadError> {
        for source in &sources {
            source.validate()?;
        }
        Ok(Self {
            sources: sources.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn sources(&self) -> &[Arc<DeclaredSource>] {
        &self.sources
    }

    /// Resolve a filename to at most one declared source.
    pub fn resolve(&self, filename: &str) -> Resolution {
        let Some(kind) = FileKind::for_extension(&file_extension(filename)) else {
            return Resolution::NoMatch;
        };
        let matches: Vec<&Arc<DeclaredSource>> = self
            .sources
            .iter()
            .filter(|s| kind.matches_format(&s.format) && s.matches_file(filename))
            .collect();
        match matches.as_slice() {
            [] => Resolution::NoMatch,
            [one] => Resolution::Resolved(Arc::clone(one)),
            many => Resolution::Ambiguous(many.iter().map(|s| s.table_name.clone()).collect()),
        }
    }
}

/// Load the declarative source catalog from a YAML file.
pub fn load_catalog(path: impl AsRef<Path>) -> Result<Vec<DeclaredSource>, LoadError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        LoadError::Config(format!("cannot read catalog {}: {e}", path.display()))
    })?;
    serde_yaml::from_str(&text)
        .map_err(|e| LoadError::Config(format!("invalid catalog {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType};

    fn source(pattern: &str, table: &str) -> DeclaredSource {
        DeclaredSource {
            file_pattern: pattern.into(),
            format: SourceFormat::Csv {
                delimiter: ',',
                skip_rows: 0,
            },
            schema: RecordSchema::new(vec![FieldDef {
                name: "transaction_id".into(),
                alias: None,
                field_type: FieldType::String { max_length: None },
                optional: false,
            }]),
            table_name: table.into(),
            grain: vec!["transaction_id".into()],
            audit_query: None,
            validation_error_threshold: 0.0,
            notification_recipients: None,
        }
    }

    #[test]
    fn extensions_combine_gz_with_prior_suffix() {
        assert_eq!(file_extension("sales_2024.csv"), ".csv");
        assert_eq!(file_extension("Sales.CSV.GZ"), ".csv.gz");
        assert_eq!(file_extension("s3://bucket/in/data.json.gz"), ".json.gz");
        assert_eq!(file_extension("noext"), "");
    }

    #[test]
    fn resolves_single_match_case_insensitively() {
        let registry = SourceRegistry::register(vec![source("sales_*.csv", "transactions")]).unwrap();
        match registry.resolve("SALES_2024.CSV") {
            Resolution::Resolved(s) => assert_eq!(s.table_name, "transactions"),
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    #[test]
    fn unknown_extension_and_no_pattern_are_no_match() {
        let registry = SourceRegistry::register(vec![source("sales_*.csv", "transactions")]).unwrap();
        assert!(matches!(registry.resolve("sales_2024.txt"), Resolution::NoMatch));
        assert!(matches!(registry.resolve("orders_2024.csv"), Resolution::NoMatch));
    }

    #[test]
    fn overlapping_patterns_are_ambiguous() {
        let registry = SourceRegistry::register(vec![
            source("sales_*.csv", "transactions"),
            source("sales_2024*.csv", "transactions_2024"),
        ])
        .unwrap();
        match registry.resolve("sales_2024.csv") {
            Resolution::Ambiguous(tables) => {
                assert_eq!(tables, vec!["transactions", "transactions_2024"]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn format_gates_resolution() {
        let registry = SourceRegistry::register(vec![source("data_*", "transactions")]).unwrap();
        // Pattern matches but the declared format is CSV, not JSON.
        assert!(matches!(registry.resolve("data_1.json"), Resolution::NoMatch));
        assert!(matches!(
            registry.resolve("data_1.csv.gz"),
            Resolution::Resolved(_)
        ));
    }

    #[test]
    fn grain_must_be_schema_fields() {
        let mut bad = source("x*.csv", "t");
        bad.grain = vec!["missing".into()];
        assert!(SourceRegistry::register(vec![bad]).is_err());
    }
}
