//! Metadata schema and column mapping.
//!
//! Binds the caller's logical metadata field names (camelCase by convention)
//! to physical database column names, and validates metadata values at the
//! two trust boundaries: documents entering the pipeline and rows decoded by
//! the query service. Everything in between trusts a validated map.
//!
//! # Mapping policy
//!
//! | Logical | Physical |
//! |---------|----------|
//! | `filePath` | `file_path` (camelCase → snake_case default) |
//! | `repositoryIndexDbId` | `repository_index_db_id` |
//! | any field with an entry in `column_overrides` | the override |
//!
//! The three fixed columns default to `chunk_content`, `chunk_index`, and
//! `embedding`, each overridable. The document key's column is the mapping
//! of its logical field, not a separate name.
//!
//! All identifiers that reach SQL must match `^[A-Za-z_][A-Za-z0-9_]*$`;
//! they are validated at construction and quoted (doubling embedded quotes)
//! on emission. Values are always bound, never interpolated.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result, ValidationError, ValidationIssue};
use crate::models::Scalar;

const DEFAULT_CONTENT_COLUMN: &str = "chunk_content";
const DEFAULT_INDEX_COLUMN: &str = "chunk_index";
const DEFAULT_EMBEDDING_COLUMN: &str = "embedding";

/// Reserved as the discriminator in polymorphic descriptors; a metadata
/// field with this name would clash with it.
const RESERVED_FIELD: &str = "type";

fn identifier_re() -> &'static Regex {
    static IDENTIFIER_RE: OnceLock<Regex> = OnceLock::new();
    IDENTIFIER_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern compiles")
    })
}

/// Validate one SQL identifier (table or column name).
pub(crate) fn validate_identifier(name: &str, what: &str) -> Result<()> {
    if identifier_re().is_match(name) {
        Ok(())
    } else {
        Err(Error::config(format!(
            "{} '{}' is not a valid SQL identifier (must match ^[A-Za-z_][A-Za-z0-9_]*$)",
            what, name
        )))
    }
}

/// Quote an already-validated identifier for emission into SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Default logical-to-physical mapping: camelCase → snake_case.
pub(crate) fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_lower =
                i > 0 && (chars[i - 1].is_ascii_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = i + 1 < chars.len() && chars[i + 1].is_ascii_lowercase();
            if i > 0 && (prev_lower || (chars[i - 1].is_ascii_uppercase() && next_lower)) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Declared type of a metadata field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    /// RFC 3339 string in the JSON image, `timestamptz` in the database.
    Timestamp,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Timestamp => "timestamp",
        }
    }
}

/// One declared metadata field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    /// Logical field name as it appears in the caller's record.
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Whether the field must be present and non-null. The document key and
    /// every source key are required regardless of this flag.
    #[serde(default)]
    pub required: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Declarative input to [`MetadataSchema::new`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaConfig {
    /// The metadata fields, in declaration order.
    pub fields: Vec<FieldDef>,
    /// Logical name of the field that identifies a document inside its
    /// source scope.
    pub document_key: String,
    /// Logical names of the fields that jointly partition the table
    /// (tenant, repository, dataset…).
    #[serde(default)]
    pub source_keys: Vec<String>,
    /// Logical name → physical column overrides.
    #[serde(default)]
    pub column_overrides: HashMap<String, String>,
    #[serde(default)]
    pub content_column: Option<String>,
    #[serde(default)]
    pub index_column: Option<String>,
    #[serde(default)]
    pub embedding_column: Option<String>,
}

/// Frozen column mapping plus runtime value validation.
///
/// Constructed once per store/query service; immutable afterwards.
#[derive(Debug, Clone)]
pub struct MetadataSchema {
    fields: Vec<FieldDef>,
    columns: HashMap<String, String>,
    document_key: String,
    source_keys: Vec<String>,
    content_column: String,
    index_column: String,
    embedding_column: String,
}

impl MetadataSchema {
    /// Validate the declaration and freeze the mapping.
    ///
    /// Errors (all `Configuration`): document key or a source key absent
    /// from the fields; any logical or physical name failing the identifier
    /// pattern; duplicate logical fields or physical columns; the reserved
    /// field name `type`.
    pub fn new(config: SchemaConfig) -> Result<Self> {
        if config.fields.is_empty() {
            return Err(Error::config("metadata schema declares no fields"));
        }
        if config.document_key.is_empty() {
            return Err(Error::config("document_key must name a metadata field"));
        }

        let mut seen_fields = HashSet::new();
        for field in &config.fields {
            if field.name == RESERVED_FIELD {
                return Err(Error::config(
                    "metadata field name 'type' is reserved for the schema discriminator",
                ));
            }
            validate_identifier(&field.name, "metadata field")?;
            if !seen_fields.insert(field.name.clone()) {
                return Err(Error::config(format!(
                    "duplicate metadata field '{}'",
                    field.name
                )));
            }
        }

        if !seen_fields.contains(&config.document_key) {
            return Err(Error::config(format!(
                "document_key '{}' is not a declared metadata field",
                config.document_key
            )));
        }
        for key in &config.source_keys {
            if !seen_fields.contains(key) {
                return Err(Error::config(format!(
                    "source_key '{}' is not a declared metadata field",
                    key
                )));
            }
        }
        for logical in config.column_overrides.keys() {
            if !seen_fields.contains(logical) {
                return Err(Error::config(format!(
                    "column override for unknown field '{}'",
                    logical
                )));
            }
        }

        let content_column = config
            .content_column
            .unwrap_or_else(|| DEFAULT_CONTENT_COLUMN.to_string());
        let index_column = config
            .index_column
            .unwrap_or_else(|| DEFAULT_INDEX_COLUMN.to_string());
        let embedding_column = config
            .embedding_column
            .unwrap_or_else(|| DEFAULT_EMBEDDING_COLUMN.to_string());

        let mut columns = HashMap::new();
        let mut seen_columns = HashSet::new();
        for fixed in [&content_column, &index_column, &embedding_column] {
            validate_identifier(fixed, "column")?;
            if !seen_columns.insert(fixed.clone()) {
                return Err(Error::config(format!("duplicate physical column '{}'", fixed)));
            }
        }
        for field in &config.fields {
            let physical = config
                .column_overrides
                .get(&field.name)
                .cloned()
                .unwrap_or_else(|| to_snake_case(&field.name));
            validate_identifier(&physical, "column")?;
            if !seen_columns.insert(physical.clone()) {
                return Err(Error::config(format!(
                    "duplicate physical column '{}' (field '{}')",
                    physical, field.name
                )));
            }
            columns.insert(field.name.clone(), physical);
        }

        Ok(Self {
            fields: config.fields,
            columns,
            document_key: config.document_key,
            source_keys: config.source_keys,
            content_column,
            index_column,
            embedding_column,
        })
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Physical column for a logical field, if declared.
    pub fn column_for(&self, field: &str) -> Option<&str> {
        self.columns.get(field).map(String::as_str)
    }

    pub fn document_key_field(&self) -> &str {
        &self.document_key
    }

    pub fn document_key_column(&self) -> &str {
        // The document key is always a declared field; new() guarantees it.
        &self.columns[&self.document_key]
    }

    pub fn source_key_fields(&self) -> &[String] {
        &self.source_keys
    }

    pub fn content_column(&self) -> &str {
        &self.content_column
    }

    pub fn index_column(&self) -> &str {
        &self.index_column
    }

    pub fn embedding_column(&self) -> &str {
        &self.embedding_column
    }

    /// Serialize a caller record to its JSON map and validate it strictly.
    pub fn metadata_map<M: Serialize>(&self, metadata: &M) -> Result<Map<String, Value>> {
        let value = serde_json::to_value(metadata).map_err(|e| {
            Error::from(ValidationError::single(
                "metadata",
                "serializable record",
                "serialization failure",
                e.to_string(),
            ))
        })?;
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(ValidationError::single(
                    "metadata",
                    "object",
                    json_type_name(&other),
                    "metadata must serialize to a JSON object",
                )
                .into());
            }
        };
        self.validate_map(&map)?;
        Ok(map)
    }

    /// Strict validation of a metadata JSON map: unknown fields rejected,
    /// declared types enforced, required fields (plus the document key and
    /// every source key) present and non-null.
    pub fn validate_map(&self, map: &Map<String, Value>) -> Result<()> {
        let mut issues = Vec::new();

        for (name, value) in map {
            match self.fields.iter().find(|f| f.name == *name) {
                None => issues.push(ValidationIssue {
                    path: format!("metadata.{}", name),
                    message: "unknown field".to_string(),
                    expected: "a declared metadata field".to_string(),
                    received: name.clone(),
                }),
                Some(field) => {
                    if !value.is_null() {
                        if let Some(issue) = check_type(field, value) {
                            issues.push(issue);
                        }
                    }
                }
            }
        }

        for field in &self.fields {
            let must_be_present = field.required
                || field.name == self.document_key
                || self.source_keys.contains(&field.name);
            if must_be_present {
                match map.get(&field.name) {
                    Some(v) if !v.is_null() => {}
                    _ => issues.push(ValidationIssue {
                        path: format!("metadata.{}", field.name),
                        message: "required field missing".to_string(),
                        expected: field.field_type.name().to_string(),
                        received: "null".to_string(),
                    }),
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(issues).into())
        }
    }

    /// Convert a validated field value to its bindable scalar.
    pub(crate) fn value_to_scalar(field: &FieldDef, value: &Value) -> Result<Scalar> {
        let scalar = match (field.field_type, value) {
            (FieldType::Text, Value::String(s)) => Scalar::Text(s.clone()),
            (FieldType::Integer, Value::Number(n)) if n.is_i64() => {
                Scalar::Integer(n.as_i64().unwrap_or_default())
            }
            (FieldType::Float, Value::Number(n)) => Scalar::Float(n.as_f64().unwrap_or_default()),
            (FieldType::Boolean, Value::Bool(b)) => Scalar::Boolean(*b),
            (FieldType::Timestamp, Value::String(s)) => {
                let parsed = DateTime::parse_from_rfc3339(s).map_err(|e| {
                    ValidationError::single(
                        format!("metadata.{}", field.name),
                        "RFC 3339 timestamp",
                        s.clone(),
                        e.to_string(),
                    )
                })?;
                Scalar::Timestamp(parsed.with_timezone(&Utc))
            }
            _ => {
                return Err(ValidationError::single(
                    format!("metadata.{}", field.name),
                    field.field_type.name(),
                    json_type_name(value),
                    "value does not match the declared field type",
                )
                .into());
            }
        };
        Ok(scalar)
    }

    /// Extract the document key's value from a validated map, as the string
    /// used in logs, error reports, and the memory store's index.
    pub(crate) fn document_key_string(&self, map: &Map<String, Value>) -> String {
        match map.get(&self.document_key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

fn check_type(field: &FieldDef, value: &Value) -> Option<ValidationIssue> {
    let ok = match field.field_type {
        FieldType::Text => value.is_string(),
        FieldType::Integer => matches!(value, Value::Number(n) if n.is_i64()),
        FieldType::Float => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Timestamp => value
            .as_str()
            .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
    };
    if ok {
        None
    } else {
        Some(ValidationIssue {
            path: format!("metadata.{}", field.name),
            message: "value does not match the declared field type".to_string(),
            expected: field.field_type.name().to_string(),
            received: json_type_name(value),
        })
    }
}

fn json_type_name(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}
