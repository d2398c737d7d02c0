//! Ingestion adapters: CSV and JSON files into schema-conforming batches
//!
//! Adapters deliver a [`RecordBatch`] matching the open file's schema by
//! field index. CSV schema detection samples leading rows and degrades to
//! utf8 whenever samples disagree.

use crate::{LockboxError, Result};
use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
    TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::DateTime;
use std::path::Path;
use std::sync::Arc;

/// Typed accumulator for one column while parsing rows
enum ColumnData {
    Int32(Vec<Option<i32>>),
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Utf8(Vec<Option<String>>),
    Boolean(Vec<Option<bool>>),
    /// Epoch values in the field's time unit
    Timestamp(TimeUnit, Vec<Option<i64>>),
}

impl ColumnData {
    fn for_field(field: &Field) -> Result<Self> {
        Ok(match field.data_type() {
            DataType::Int32 => ColumnData::Int32(Vec::new()),
            DataType::Int64 => ColumnData::Int64(Vec::new()),
            DataType::Float64 => ColumnData::Float64(Vec::new()),
            DataType::Utf8 => ColumnData::Utf8(Vec::new()),
            DataType::Boolean => ColumnData::Boolean(Vec::new()),
            DataType::Timestamp(unit, _) => ColumnData::Timestamp(*unit, Vec::new()),
            other => {
                return Err(LockboxError::UnsupportedType(format!(
                    "{other} ({}) is not supported for ingestion",
                    field.name()
                )))
            }
        })
    }

    fn push_null(&mut self) {
        match self {
            ColumnData::Int32(v) => v.push(None),
            ColumnData::Int64(v) => v.push(None),
            ColumnData::Float64(v) => v.push(None),
            ColumnData::Utf8(v) => v.push(None),
            ColumnData::Boolean(v) => v.push(None),
            ColumnData::Timestamp(_, v) => v.push(None),
        }
    }

    fn push_text(&mut self, value: &str, row: usize, field: &Field) -> Result<()> {
        let type_error = |what: &str| {
            LockboxError::ShapeMismatch(format!(
                "row {row}, column {}: invalid {what}: {value}",
                field.name()
            ))
        };
        match self {
            ColumnData::Int32(v) => {
                v.push(Some(value.parse().map_err(|_| type_error("int32"))?))
            }
            ColumnData::Int64(v) => {
                v.push(Some(value.parse().map_err(|_| type_error("int64"))?))
            }
            ColumnData::Float64(v) => {
                v.push(Some(value.parse().map_err(|_| type_error("float64"))?))
            }
            ColumnData::Utf8(v) => v.push(Some(value.to_string())),
            ColumnData::Boolean(v) => match value {
                "true" => v.push(Some(true)),
                "false" => v.push(Some(false)),
                _ => return Err(type_error("boolean")),
            },
            ColumnData::Timestamp(unit, v) => {
                let parsed =
                    DateTime::parse_from_rfc3339(value).map_err(|_| type_error("timestamp"))?;
                v.push(Some(epoch_in_unit(&parsed, *unit).ok_or_else(|| {
                    type_error("timestamp")
                })?));
            }
        }
        Ok(())
    }

    fn finish(self) -> ArrayRef {
        match self {
            ColumnData::Int32(v) => Arc::new(Int32Array::from(v)),
            ColumnData::Int64(v) => Arc::new(Int64Array::from(v)),
            ColumnData::Float64(v) => Arc::new(Float64Array::from(v)),
            ColumnData::Utf8(v) => Arc::new(StringArray::from(v)),
            ColumnData::Boolean(v) => Arc::new(BooleanArray::from(v)),
            ColumnData::Timestamp(unit, v) => match unit {
                TimeUnit::Second => Arc::new(TimestampSecondArray::from(v)),
                TimeUnit::Millisecond => Arc::new(TimestampMillisecondArray::from(v)),
                TimeUnit::Microsecond => Arc::new(TimestampMicrosecondArray::from(v)),
                TimeUnit::Nanosecond => Arc::new(TimestampNanosecondArray::from(v)),
            },
        }
    }
}

fn epoch_in_unit(dt: &DateTime<chrono::FixedOffset>, unit: TimeUnit) -> Option<i64> {
    match unit {
        TimeUnit::Second => Some(dt.timestamp()),
        TimeUnit::Millisecond => Some(dt.timestamp_millis()),
        TimeUnit::Microsecond => Some(dt.timestamp_micros()),
        TimeUnit::Nanosecond => dt.timestamp_nanos_opt(),
    }
}

/// Read a CSV file and infer a schema from up to `sample` leading records.
pub fn detect_csv_schema(path: impl AsRef<Path>, sample: usize) -> Result<SchemaRef> {
    let mut reader = csv::Reader::from_path(path.as_ref()).map_err(csv_error)?;
    let headers = reader.headers().map_err(csv_error)?.clone();

    let sample = if sample == 0 { 10 } else { sample };
    let mut types: Vec<Option<DataType>> = vec![None; headers.len()];

    for record in reader.records().take(sample) {
        let record = record.map_err(csv_error)?;
        for (i, value) in record.iter().enumerate() {
            if i >= types.len() {
                break;
            }
            let detected = detect_value_type(value);
            types[i] = Some(merge_types(types[i].take(), detected));
        }
    }

    let fields: Vec<Field> = headers
        .iter()
        .zip(types)
        .map(|(name, data_type)| {
            Field::new(name, data_type.unwrap_or(DataType::Utf8), true)
        })
        .collect();
    Ok(Arc::new(Schema::new(fields)))
}

fn detect_value_type(value: &str) -> DataType {
    if value.parse::<i64>().is_ok() {
        return DataType::Int64;
    }
    if value.parse::<f64>().is_ok() {
        return DataType::Float64;
    }
    if DateTime::parse_from_rfc3339(value).is_ok() {
        return DataType::Timestamp(TimeUnit::Second, None);
    }
    if value == "true" || value == "false" {
        return DataType::Boolean;
    }
    DataType::Utf8
}

fn merge_types(current: Option<DataType>, detected: DataType) -> DataType {
    match current {
        None => detected,
        Some(current) if current == detected => current,
        // Conflicting samples degrade to utf8
        Some(_) => DataType::Utf8,
    }
}

/// Load a CSV file (with a header row) into a batch conforming to `schema`.
/// Empty cells become null in nullable columns.
pub fn csv_to_batch(path: impl AsRef<Path>, schema: &SchemaRef) -> Result<RecordBatch> {
    let mut reader = csv::Reader::from_path(path.as_ref()).map_err(csv_error)?;

    let mut columns: Vec<ColumnData> = schema
        .fields()
        .iter()
        .map(|f| ColumnData::for_field(f))
        .collect::<Result<_>>()?;

    // Header was row 1
    for (index, record) in reader.records().enumerate() {
        let row = index + 2;
        let record = record.map_err(csv_error)?;
        if record.len() != schema.fields().len() {
            return Err(LockboxError::ShapeMismatch(format!(
                "row {row}: expected {} fields, got {}",
                schema.fields().len(),
                record.len()
            )));
        }

        for (i, value) in record.iter().enumerate() {
            let field = schema.field(i);
            if value.is_empty() && field.is_nullable() {
                columns[i].push_null();
            } else {
                columns[i].push_text(value, row, field)?;
            }
        }
    }

    let arrays: Vec<ArrayRef> = columns.into_iter().map(ColumnData::finish).collect();
    Ok(RecordBatch::try_new(schema.clone(), arrays)?)
}

/// Load a JSON file into a batch conforming to `schema`. Accepts either an
/// array of objects or newline-delimited objects.
pub fn json_to_batch(path: impl AsRef<Path>, schema: &SchemaRef) -> Result<RecordBatch> {
    let text = std::fs::read_to_string(path.as_ref())?;

    let rows: Vec<serde_json::Map<String, serde_json::Value>> =
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(serde_json::Value::Array(values)) => values
                .into_iter()
                .map(|v| match v {
                    serde_json::Value::Object(map) => Ok(map),
                    _ => Err(LockboxError::ShapeMismatch(
                        "expected an array of JSON objects".to_string(),
                    )),
                })
                .collect::<Result<_>>()?,
            _ => {
                // NDJSON fallback: one object per line
                let mut rows = Vec::new();
                for line in text.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let value: serde_json::Value = serde_json::from_str(line)?;
                    match value {
                        serde_json::Value::Object(map) => rows.push(map),
                        _ => {
                            return Err(LockboxError::ShapeMismatch(
                                "expected one JSON object per line".to_string(),
                            ))
                        }
                    }
                }
                rows
            }
        };

    let mut columns: Vec<ColumnData> = schema
        .fields()
        .iter()
        .map(|f| ColumnData::for_field(f))
        .collect::<Result<_>>()?;

    for (index, row) in rows.iter().enumerate() {
        let row_num = index + 1;
        for (i, field) in schema.fields().iter().enumerate() {
            let value = row.get(field.name());
            match value {
                None | Some(serde_json::Value::Null) => {
                    if field.is_nullable() {
                        columns[i].push_null();
                    } else {
                        return Err(LockboxError::ShapeMismatch(format!(
                            "row {row_num}: missing non-nullable field {}",
                            field.name()
                        )));
                    }
                }
                Some(value) => push_json_value(&mut columns[i], value, row_num, field)?,
            }
        }
    }

    let arrays: Vec<ArrayRef> = columns.into_iter().map(ColumnData::finish).collect();
    Ok(RecordBatch::try_new(schema.clone(), arrays)?)
}

fn push_json_value(
    column: &mut ColumnData,
    value: &serde_json::Value,
    row: usize,
    field: &Field,
) -> Result<()> {
    let type_error = || {
        LockboxError::ShapeMismatch(format!(
            "row {row}, column {}: expected {}, got {value}",
            field.name(),
            field.data_type()
        ))
    };
    match column {
        ColumnData::Int32(v) => match value {
            serde_json::Value::Number(n) => {
                v.push(Some(n.as_i64().ok_or_else(type_error)? as i32))
            }
            serde_json::Value::String(s) => {
                v.push(Some(s.parse().map_err(|_| type_error())?))
            }
            _ => return Err(type_error()),
        },
        ColumnData::Int64(v) => match value {
            serde_json::Value::Number(n) => v.push(Some(n.as_i64().ok_or_else(type_error)?)),
            serde_json::Value::String(s) => {
                v.push(Some(s.parse().map_err(|_| type_error())?))
            }
            _ => return Err(type_error()),
        },
        ColumnData::Float64(v) => match value {
            serde_json::Value::Number(n) => v.push(Some(n.as_f64().ok_or_else(type_error)?)),
            serde_json::Value::String(s) => {
                v.push(Some(s.parse().map_err(|_| type_error())?))
            }
            _ => return Err(type_error()),
        },
        ColumnData::Utf8(v) => match value {
            serde_json::Value::String(s) => v.push(Some(s.clone())),
            other => v.push(Some(other.to_string())),
        },
        ColumnData::Boolean(v) => match value {
            serde_json::Value::Bool(b) => v.push(Some(*b)),
            _ => return Err(type_error()),
        },
        ColumnData::Timestamp(unit, v) => match value {
            serde_json::Value::String(s) => {
                let parsed = DateTime::parse_from_rfc3339(s).map_err(|_| type_error())?;
                v.push(Some(epoch_in_unit(&parsed, *unit).ok_or_else(type_error)?));
            }
            _ => return Err(type_error()),
        },
    }
    Ok(())
}

/// Parse a schema description of the form
/// `[{"name": "id", "type": "int64", "nullable": false}, ...]`.
pub fn schema_from_json(text: &str) -> Result<SchemaRef> {
    #[derive(serde::Deserialize)]
    struct FieldSpec {
        name: String,
        #[serde(rename = "type")]
        data_type: String,
        #[serde(default = "default_nullable")]
        nullable: bool,
    }
    fn default_nullable() -> bool {
        true
    }

    let specs: Vec<FieldSpec> = serde_json::from_str(text)?;
    let fields: Vec<Field> = specs
        .into_iter()
        .map(|spec| {
            let data_type = match spec.data_type.as_str() {
                "int8" => DataType::Int8,
                "int16" => DataType::Int16,
                "int32" => DataType::Int32,
                "int64" => DataType::Int64,
                "uint8" => DataType::UInt8,
                "uint16" => DataType::UInt16,
                "uint32" => DataType::UInt32,
                "uint64" => DataType::UInt64,
                "float32" => DataType::Float32,
                "float64" => DataType::Float64,
                "bool" | "boolean" => DataType::Boolean,
                "string" | "utf8" => DataType::Utf8,
                "binary" => DataType::Binary,
                "date32" => DataType::Date32,
                "timestamp" => DataType::Timestamp(TimeUnit::Microsecond, None),
                "timestamp[s]" => DataType::Timestamp(TimeUnit::Second, None),
                "timestamp[ms]" => DataType::Timestamp(TimeUnit::Millisecond, None),
                "timestamp[us]" => DataType::Timestamp(TimeUnit::Microsecond, None),
                "timestamp[ns]" => DataType::Timestamp(TimeUnit::Nanosecond, None),
                other => {
                    return Err(LockboxError::UnsupportedType(format!(
                        "{other} ({})",
                        spec.name
                    )))
                }
            };
            Ok(Field::new(spec.name, data_type, spec.nullable))
        })
        .collect::<Result<_>>()?;

    Ok(Arc::new(Schema::new(fields)))
}

fn csv_error(e: csv::Error) -> LockboxError {
    LockboxError::InvalidArgument(format!("csv: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_detect_csv_schema() {
        let file = write_temp("id,name,score,active\n1,alice,9.5,true\n2,bob,7.25,false\n");
        let schema = detect_csv_schema(file.path(), 10).unwrap();

        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(2).data_type(), &DataType::Float64);
        assert_eq!(schema.field(3).data_type(), &DataType::Boolean);
        assert!(schema.field(0).is_nullable());
    }

    #[test]
    fn test_detect_conflicting_samples_degrade_to_utf8() {
        let file = write_temp("x\n1\nhello\n");
        let schema = detect_csv_schema(file.path(), 10).unwrap();
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
    }

    #[test]
    fn test_csv_to_batch() {
        let file = write_temp("id,name\n1,alice\n2,\n3,carol\n");
        let schema: SchemaRef = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));

        let batch = csv_to_batch(file.path(), &schema).unwrap();
        assert_eq!(batch.num_rows(), 3);
        let names = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(names.value(0), "alice");
        assert!(names.is_null(1));
    }

    #[test]
    fn test_csv_field_count_mismatch() {
        let file = write_temp("id,name\n1,alice,extra\n");
        let schema: SchemaRef = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        assert!(matches!(
            csv_to_batch(file.path(), &schema),
            Err(LockboxError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_csv_bad_value() {
        let file = write_temp("id\nnot_a_number\n");
        let schema: SchemaRef =
            Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        assert!(matches!(
            csv_to_batch(file.path(), &schema),
            Err(LockboxError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_json_array_to_batch() {
        let file = write_temp(r#"[{"id": 1, "name": "alice"}, {"id": 2, "name": null}]"#);
        let schema: SchemaRef = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));

        let batch = json_to_batch(file.path(), &schema).unwrap();
        assert_eq!(batch.num_rows(), 2);
        let ids = batch.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ids.values(), &[1, 2]);
        let names = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert!(names.is_null(1));
    }

    #[test]
    fn test_ndjson_to_batch() {
        let file = write_temp("{\"id\": 1}\n{\"id\": 2}\n");
        let schema: SchemaRef =
            Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));

        let batch = json_to_batch(file.path(), &schema).unwrap();
        assert_eq!(batch.num_rows(), 2);
    }

    #[test]
    fn test_json_missing_required_field() {
        let file = write_temp(r#"[{"name": "alice"}]"#);
        let schema: SchemaRef =
            Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        assert!(matches!(
            json_to_batch(file.path(), &schema),
            Err(LockboxError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_schema_from_json() {
        let schema = schema_from_json(
            r#"[
                {"name": "id", "type": "int64", "nullable": false},
                {"name": "name", "type": "string"},
                {"name": "when", "type": "timestamp[ms]"}
            ]"#,
        )
        .unwrap();

        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert!(!schema.field(0).is_nullable());
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        assert!(schema.field(1).is_nullable());
        assert_eq!(
            schema.field(2).data_type(),
            &DataType::Timestamp(TimeUnit::Millisecond, None)
        );
    }

    #[test]
    fn test_schema_from_json_rejects_unknown_type() {
        assert!(matches!(
            schema_from_json(r#"[{"name": "x", "type": "decimal"}]"#),
            Err(LockboxError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_timestamp_ingestion() {
        let file = write_temp("ts\n2024-06-01T12:00:00Z\n");
        let schema: SchemaRef = Arc::new(Schema::new(vec![Field::new(
            "ts",
            DataType::Timestamp(TimeUnit::Second, None),
            true,
        )]));

        let batch = csv_to_batch(file.path(), &schema).unwrap();
        let ts = batch
            .column(0)
            .as_any()
            .downcast_ref::<TimestampSecondArray>()
            .unwrap();
        assert_eq!(ts.value(0), 1717243200);
    }
}
