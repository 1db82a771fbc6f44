//! Schema Mapper (§4.7): resolves per-source field schema, coerces record
//! values to sink column types, and selects the left/right streams for the
//! joiner.

use serde_json::Value;

use crate::config::{JoinSpec, TableMapping};
use crate::model::{Record, JOINED_SOURCE_ID};

/// Errors local to schema mapper operations (§4.7). Callers translate these
/// into the public `CoreError::SchemaMissingField` / `CoreError::CoercionFailed`
/// kinds at the record boundary where they're caught.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("coercion failed: {0}")]
    CoercionFailed(String),
    #[error("missing source: {0}")]
    MissingSource(String),
}

/// Resolves source streams for a join and coerces/projects records onto the
/// sink's column mapping.
#[derive(Debug, Clone)]
pub struct SchemaMapper {
    join: Option<JoinSpec>,
    mapping: Vec<TableMapping>,
}

impl SchemaMapper {
    pub fn new(join: Option<JoinSpec>, mapping: Vec<TableMapping>) -> Self {
        Self { join, mapping }
    }

    pub fn left_stream(&self) -> Option<&str> {
        self.join.as_ref().map(|j| j.left().stream_id.as_str())
    }

    pub fn right_stream(&self) -> Option<&str> {
        self.join.as_ref().map(|j| j.right().stream_id.as_str())
    }

    /// The mapping entries whose `source_id` matches either join source,
    /// used by the joiner's merge rule (§4.4): "the merged record contains
    /// every field named in the schema mapper's sink_mapping whose
    /// source_id equals either join source".
    pub fn mapping_for_join(&self) -> Vec<&TableMapping> {
        let Some(join) = &self.join else { return Vec::new() };
        let left_id = &join.left().source_id;
        let right_id = &join.right().source_id;
        self.mapping
            .iter()
            .filter(|m| &m.source_id == left_id || &m.source_id == right_id)
            .collect()
    }

    /// Coerce a raw JSON value to `target_type`'s ClickHouse type string.
    /// `Nullable(T)` is stripped for coercion and restored for insertion:
    /// null input against a nullable target yields `Value::Null`, otherwise
    /// the inner type governs coercion.
    pub fn coerce(&self, _source_id: &str, field: &str, raw: Option<&Value>, target_type: &str) -> Result<Value, SchemaError> {
        let (nullable, inner) = parse_nullable(target_type);

        let raw = match raw {
            Some(v) => v,
            None => {
                if nullable {
                    return Ok(Value::Null);
                }
                return Err(SchemaError::UnknownField(field.to_string()));
            }
        };

        if raw.is_null() {
            return if nullable {
                Ok(Value::Null)
            } else {
                Err(SchemaError::CoercionFailed(format!("{field}: null not allowed for {target_type}")))
            };
        }

        coerce_scalar(raw, inner).map_err(|e| SchemaError::CoercionFailed(format!("{field}: {e}")))
    }

    /// Project a record onto `sink_mapping`, preserving its declared order
    /// (§4.7). Each entry's `source_id` must match the record's source
    /// lineage to be included — used by the sink, which projects a record
    /// that originated from a single source (or, post-join, the merged
    /// record whose payload already carries both sides' fields).
    pub fn project(&self, record: &Record) -> Result<Vec<(String, Value)>, SchemaError> {
        let mut row = Vec::with_capacity(self.mapping.len());
        for entry in &self.mapping {
            if !self.source_matches(record, &entry.source_id) {
                return Err(SchemaError::MissingSource(entry.source_id.clone()));
            }
            let raw = record.field(&entry.source_field);
            let coerced = self.coerce(&entry.source_id, &entry.source_field, raw, &entry.destination_type)?;
            row.push((entry.destination_column.clone(), coerced));
        }
        Ok(row)
    }

    /// True when `entry_source_id` is a plausible origin of `record`: either
    /// it matches the record's own `source_id` directly (single-source
    /// pipelines), or the record is joiner output (`source_id ==
    /// JOINED_SOURCE_ID`) and `entry_source_id` names one of the two join
    /// sources that fed it.
    fn source_matches(&self, record: &Record, entry_source_id: &str) -> bool {
        if record.meta.source_id == entry_source_id {
            return true;
        }
        if record.meta.source_id == JOINED_SOURCE_ID {
            if let Some(join) = &self.join {
                return entry_source_id == join.left().source_id || entry_source_id == join.right().source_id;
            }
        }
        false
    }
}

/// Splits `"Nullable(Int32)"` into `(true, "Int32")`, and leaves
/// non-nullable types as `(false, type)`.
fn parse_nullable(target_type: &str) -> (bool, &str) {
    if let Some(inner) = target_type.strip_prefix("Nullable(").and_then(|s| s.strip_suffix(')')) {
        (true, inner)
    } else {
        (false, target_type)
    }
}

fn coerce_scalar(raw: &Value, inner_type: &str) -> Result<Value, String> {
    match inner_type {
        "String" | "LowCardinality(String)" => match raw {
            Value::String(s) => Ok(Value::String(s.clone())),
            other => Ok(Value::String(other.to_string())),
        },
        "Int8" => narrow_int(raw, i8::MIN as i64, i8::MAX as i64),
        "Int16" => narrow_int(raw, i16::MIN as i64, i16::MAX as i64),
        "Int32" => narrow_int(raw, i32::MIN as i64, i32::MAX as i64),
        "Int64" => narrow_int(raw, i64::MIN, i64::MAX),
        "UInt8" => narrow_uint(raw, u8::MAX as u64),
        "UInt16" => narrow_uint(raw, u16::MAX as u64),
        "UInt32" => narrow_uint(raw, u32::MAX as u64),
        "UInt64" => narrow_uint(raw, u64::MAX),
        "Float32" | "Float64" => match raw.as_f64() {
            Some(f) => Ok(Value::from(f)),
            None => Err(format!("expected numeric value, got {raw}")),
        },
        "Bool" | "Boolean" => match raw.as_bool() {
            Some(b) => Ok(Value::Bool(b)),
            None => Err(format!("expected boolean value, got {raw}")),
        },
        // Unrecognized destination types (DateTime, UUID, ...) pass the raw
        // JSON value through; the ClickHouse driver performs its own final
        // validation on insert.
        _ => Ok(raw.clone()),
    }
}

fn narrow_int(raw: &Value, min: i64, max: i64) -> Result<Value, String> {
    let n = raw
        .as_i64()
        .ok_or_else(|| format!("expected integer value, got {raw}"))?;
    if n < min || n > max {
        return Err(format!("value {n} does not fit losslessly in target range [{min}, {max}]"));
    }
    Ok(Value::from(n))
}

fn narrow_uint(raw: &Value, max: u64) -> Result<Value, String> {
    let n = raw
        .as_u64()
        .ok_or_else(|| format!("expected non-negative integer value, got {raw}"))?;
    if n > max {
        return Err(format!("value {n} does not fit losslessly in target range [0, {max}]"));
    }
    Ok(Value::from(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Orientation, JoinSource, DurationSecs};

    fn mapping() -> Vec<TableMapping> {
        vec![
            TableMapping {
                source_id: "left".into(),
                source_field: "age".into(),
                source_type: "string".into(),
                destination_column: "age".into(),
                destination_type: "Int32".into(),
            },
            TableMapping {
                source_id: "left".into(),
                source_field: "name".into(),
                source_type: "string".into(),
                destination_column: "name".into(),
                destination_type: "Nullable(String)".into(),
            },
        ]
    }

    fn mapper() -> SchemaMapper {
        SchemaMapper::new(None, mapping())
    }

    #[test]
    fn rejects_lossy_narrowing() {
        let m = mapper();
        let err = m.coerce("left", "age", Some(&Value::from(99999999999i64)), "Int32").unwrap_err();
        assert!(matches!(err, SchemaError::CoercionFailed(_)));
    }

    #[test]
    fn rejects_non_numeric_for_int_column() {
        let m = mapper();
        let err = m.coerce("left", "age", Some(&Value::String("not-a-number".into())), "Int32").unwrap_err();
        assert!(matches!(err, SchemaError::CoercionFailed(_)));
    }

    #[test]
    fn nullable_missing_field_yields_null() {
        let m = mapper();
        let v = m.coerce("left", "name", None, "Nullable(String)").unwrap();
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn non_nullable_missing_field_is_unknown_field() {
        let m = mapper();
        let err = m.coerce("left", "age", None, "Int32").unwrap_err();
        assert!(matches!(err, SchemaError::UnknownField(_)));
    }

    #[test]
    fn project_preserves_mapping_order() {
        let m = mapper();
        let record = Record::new(
            serde_json::json!({"age": 30, "name": "Ada"}),
            "left",
            "d1",
            chrono::Utc::now(),
        );
        let row = m.project(&record).unwrap();
        assert_eq!(row[0].0, "age");
        assert_eq!(row[1].0, "name");
    }

    fn join_fixture() -> JoinSpec {
        JoinSpec {
            sources: vec![
                JoinSource {
                    source_id: "left".into(),
                    stream_id: "p-left".into(),
                    join_key: "id".into(),
                    time_window: DurationSecs(3600),
                    orientation: Orientation::Left,
                },
                JoinSource {
                    source_id: "right".into(),
                    stream_id: "p-right".into(),
                    join_key: "id".into(),
                    time_window: DurationSecs(3600),
                    orientation: Orientation::Right,
                },
            ],
            output_stream_id: None,
        }
    }

    #[test]
    fn left_and_right_stream_resolve_from_join_spec() {
        let m = SchemaMapper::new(Some(join_fixture()), mapping());
        assert_eq!(m.left_stream(), Some("p-left"));
        assert_eq!(m.right_stream(), Some("p-right"));
    }

    #[test]
    fn no_join_yields_no_streams() {
        let m = mapper();
        assert_eq!(m.left_stream(), None);
        assert_eq!(m.right_stream(), None);
    }

    #[test]
    fn project_rejects_a_record_from_an_unrelated_source() {
        let m = mapper();
        let record = Record::new(serde_json::json!({"age": 30}), "right", "d1", chrono::Utc::now());
        let err = m.project(&record).unwrap_err();
        assert!(matches!(err, SchemaError::MissingSource(_)));
    }

    #[test]
    fn project_accepts_a_joined_record_whose_mapping_source_fed_the_join() {
        let m = SchemaMapper::new(Some(join_fixture()), mapping());
        let record = Record::new(
            serde_json::json!({"age": 30, "name": "Ada"}),
            glassflow_core::model::JOINED_SOURCE_ID,
            "d1",
            chrono::Utc::now(),
        );
        let row = m.project(&record).unwrap();
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn mapping_for_join_filters_by_source_id() {
        let mut entries = mapping();
        entries.push(TableMapping {
            source_id: "unrelated".into(),
            source_field: "x".into(),
            source_type: "string".into(),
            destination_column: "x".into(),
            destination_type: "String".into(),
        });
        let m = SchemaMapper::new(Some(join_fixture()), entries);
        let filtered = m.mapping_for_join();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|e| e.source_id == "left"));
    }

}
