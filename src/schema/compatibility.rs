//! Structural field-diff compatibility checking.
//!
//! Schemas are reduced to a flat field list — name plus whether a
//! default/optional marker is present — and two versions are
//! compared on that reduced shape rather than full schema-language
//! semantics (Avro resolution, protobuf wire compatibility, ...),
//! which this crate does not implement.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{CompatibilityMode, SchemaType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub has_default: bool,
}

/// Extracts the flat field list used for compatibility comparison.
pub fn extract_fields(definition: &str, schema_type: SchemaType) -> Result<Vec<FieldDef>> {
    match schema_type {
        SchemaType::Avro => extract_avro_fields(definition),
        SchemaType::Json => extract_json_schema_fields(definition),
        SchemaType::Protobuf => Ok(extract_protobuf_fields(definition)),
    }
}

fn extract_avro_fields(definition: &str) -> Result<Vec<FieldDef>> {
    let value: Value =
        serde_json::from_str(definition).map_err(|e| Error::InvalidInput(format!("invalid avro schema: {e}")))?;
    let fields = value
        .get("fields")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::InvalidInput("avro schema missing \"fields\" array".into()))?;
    fields
        .iter()
        .map(|f| {
            let name = f
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::InvalidInput("avro field missing \"name\"".into()))?
                .to_string();
            let has_default = f.get("default").is_some();
            Ok(FieldDef { name, has_default })
        })
        .collect()
}

fn extract_json_schema_fields(definition: &str) -> Result<Vec<FieldDef>> {
    let value: Value =
        serde_json::from_str(definition).map_err(|e| Error::InvalidInput(format!("invalid json schema: {e}")))?;
    let properties = value
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let required: Vec<String> = value
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    Ok(properties
        .keys()
        .map(|name| FieldDef {
            name: name.clone(),
            has_default: !required.contains(name),
        })
        .collect())
}

/// Naive line-oriented field scan: a line such as `optional string
/// note = 3;` is optional, anything else declaring a field is
/// required. Good enough to catch additions/removals of required
/// fields, not a full protobuf parser.
fn extract_protobuf_fields(definition: &str) -> Vec<FieldDef> {
    definition
        .lines()
        .filter_map(|line| {
            let line = line.trim().trim_end_matches(';');
            if line.is_empty() || !line.contains('=') || line.starts_with("//") {
                return None;
            }
            let before_eq = line.split('=').next()?.trim();
            let tokens: Vec<&str> = before_eq.split_whitespace().collect();
            let name = (*tokens.last()?).to_string();
            let has_default = before_eq.starts_with("optional") || before_eq.starts_with("repeated");
            Some(FieldDef { name, has_default })
        })
        .collect()
}

/// Every old field must still exist in `new` (readers compiled
/// against the old schema can still find their fields).
fn backward_compatible(old: &[FieldDef], new: &[FieldDef]) -> bool {
    old.iter()
        .filter(|f| !f.has_default)
        .all(|f| new.iter().any(|n| n.name == f.name))
}

/// Every new field absent from `old` must carry a default (readers
/// compiled against the old schema can still decode new data).
fn forward_compatible(old: &[FieldDef], new: &[FieldDef]) -> bool {
    new.iter()
        .filter(|f| !f.has_default)
        .all(|f| old.iter().any(|o| o.name == f.name))
}

/// Whether `new` is compatible with `old` under `mode`.
/// `CompatibilityMode::None` always returns true.
pub fn is_compatible(old: &[FieldDef], new: &[FieldDef], mode: CompatibilityMode) -> bool {
    (!mode.checks_backward() || backward_compatible(old, new))
        && (!mode.checks_forward() || forward_compatible(old, new))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avro_extracts_default_as_optional() {
        let fields = extract_avro_fields(r#"{"fields":[{"name":"id"},{"name":"note","default":""}]}"#).unwrap();
        assert_eq!(fields.len(), 2);
        assert!(!fields[0].has_default);
        assert!(fields[1].has_default);
    }

    #[test]
    fn forward_rejects_new_required_field() {
        let old = vec![FieldDef { name: "id".into(), has_default: false }];
        let new = vec![
            FieldDef { name: "id".into(), has_default: false },
            FieldDef { name: "extra".into(), has_default: false },
        ];
        assert!(!forward_compatible(&old, &new));
    }

    #[test]
    fn backward_rejects_removed_required_field() {
        let old = vec![FieldDef { name: "id".into(), has_default: false }];
        let new: Vec<FieldDef> = vec![];
        assert!(!backward_compatible(&old, &new));
    }

    #[test]
    fn none_mode_always_compatible() {
        let old = vec![FieldDef { name: "id".into(), has_default: false }];
        let new: Vec<FieldDef> = vec![];
        assert!(is_compatible(&old, &new, CompatibilityMode::None));
    }

    #[test]
    fn protobuf_optional_field_is_not_required() {
        let fields = extract_protobuf_fields("message M {\n  required string id = 1;\n  optional string note = 2;\n}");
        assert_eq!(fields.len(), 2);
        assert!(!fields[0].has_default);
        assert!(fields[1].has_default);
    }
}
