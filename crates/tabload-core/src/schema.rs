//! Declarative record schemas.
//!
//! A [`RecordSchema`] is an ordered list of [`FieldDef`]s. The same
//! declaration is consumed by the DDL generator, the validator, the row
//! fingerprint, and the readers' alias resolution, so a source is described
//! exactly once.

use serde::{Deserialize, Serialize};

/// The typed shape of one schema field.
///
/// Serialised with a `type` tag so catalog files read naturally:
///
/// ```yaml
/// - name: unit_price
///   type: decimal
/// - name: sales_rep
///   type: string
///   max_length: 100
///   optional: true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<u32>,
    },
    Int,
    Float,
    Bool,
    Decimal,
    Date,
    Datetime,
    Email,
}

impl FieldType {
    /// Whether values of this type carry a calendar component.
    ///
    /// Readers use this to decide which raw cells receive date-serial
    /// conversion (Excel) before validation.
    pub fn is_temporal(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::Datetime)
    }
}

/// One field of a record schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    /// Schema field name, also the warehouse column name.
    pub name: String,

    /// External alias: the column name used in the file, when it differs
    /// from the schema field name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    #[serde(flatten)]
    pub field_type: FieldType,

    /// Optional fields accept a missing or null cell and store NULL.
    #[serde(default)]
    pub optional: bool,
}

impl FieldDef {
    /// The name this field goes by in the file: the alias if declared,
    /// else the field name.
    pub fn file_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Ordered field set describing a source's records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordSchema {
    pub fields: Vec<FieldDef>,
}

impl RecordSchema {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Look up a field by schema name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Schema field names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Field indices in ascending lexicographic order of field name.
    ///
    /// This is the iteration order of the row fingerprint; it must not
    /// depend on declaration order or map iteration order.
    pub fn hash_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.fields.len()).collect();
        order.sort_by(|&a, &b| self.fields[a].name.cmp(&self.fields[b].name));
        order
    }

    /// The external alias for a schema field name, falling back to the
    /// field name itself. Used when reporting errors in file terms.
    pub fn alias_for<'a>(&'a self, name: &'a str) -> &'a str {
        self.field(name).map(|f| f.file_name()).unwrap_or(name)
    }
}
