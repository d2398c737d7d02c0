//! Execution of a parsed SELECT over an in-memory record batch
//!
//! Pipeline: row predicate -> stable index sort -> limit -> take. Numeric
//! comparisons coerce both sides to f64; string columns support equality
//! only. Nulls match no predicate, sort last ascending and first descending.

use super::parser::{AggregateFunc, CompareOp, SelectItem, SelectStatement};
use crate::{LockboxError, Result};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, Int8Array, StringArray, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray, TimestampSecondArray, UInt16Array,
    UInt32Array, UInt64Array, UInt8Array,
};
use arrow::compute::take;
use arrow::datatypes::{DataType, Field, FieldRef, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use std::cmp::Ordering;
use std::sync::Arc;

/// Execute a parsed statement against a batch holding every column the
/// statement references.
pub fn execute(batch: &RecordBatch, stmt: &SelectStatement) -> Result<RecordBatch> {
    let mut indices: Vec<usize> = (0..batch.num_rows()).collect();

    if let Some(clause) = &stmt.where_clause {
        let column = batch
            .column_by_name(&clause.column)
            .ok_or_else(|| LockboxError::ColumnNotFound(clause.column.clone()))?;
        let literal_num = clause.value.parse::<f64>().ok();

        let mut kept = Vec::with_capacity(indices.len());
        for &row in &indices {
            if row_matches(column, row, clause.op, &clause.value, literal_num)? {
                kept.push(row);
            }
        }
        indices = kept;
    }

    if stmt.has_aggregates() {
        return execute_aggregates(batch, &indices, &stmt.items);
    }

    if let Some(order) = &stmt.order_by {
        let column = batch
            .column_by_name(&order.column)
            .ok_or_else(|| LockboxError::ColumnNotFound(order.column.clone()))?;
        check_sortable(column)?;
        indices.sort_by(|&a, &b| {
            let ord = compare_rows(column, a, b);
            if order.descending {
                ord.reverse()
            } else {
                ord
            }
        });
    }

    if let Some(limit) = stmt.limit {
        indices.truncate(limit);
    }

    // Resolve output columns in select order
    let mut fields: Vec<FieldRef> = Vec::new();
    let mut columns: Vec<&ArrayRef> = Vec::new();
    for item in &stmt.items {
        match item {
            SelectItem::All => {
                for (i, field) in batch.schema().fields().iter().enumerate() {
                    fields.push(field.clone());
                    columns.push(batch.column(i));
                }
            }
            SelectItem::Column(name) => {
                let index = batch
                    .schema()
                    .index_of(name)
                    .map_err(|_| LockboxError::ColumnNotFound(name.clone()))?;
                fields.push(batch.schema().fields()[index].clone());
                columns.push(batch.column(index));
            }
            SelectItem::Aggregate { .. } => {
                return Err(LockboxError::QueryError(
                    "cannot mix aggregates with plain columns".to_string(),
                ))
            }
        }
    }

    let take_indices = UInt32Array::from(indices.iter().map(|&i| i as u32).collect::<Vec<u32>>());
    let arrays = columns
        .iter()
        .map(|col| Ok(take(col.as_ref(), &take_indices, None)?))
        .collect::<Result<Vec<ArrayRef>>>()?;

    Ok(RecordBatch::try_new(
        Arc::new(Schema::new(fields)),
        arrays,
    )?)
}

/// Evaluate `column[row] op literal`. Nulls never match.
fn row_matches(
    column: &ArrayRef,
    row: usize,
    op: CompareOp,
    literal: &str,
    literal_num: Option<f64>,
) -> Result<bool> {
    if column.is_null(row) {
        return Ok(false);
    }

    if let Some(text) = string_at(column, row) {
        return match op {
            CompareOp::Eq => Ok(text == literal),
            _ => Err(LockboxError::QueryError(format!(
                "string columns only support =, got {op}"
            ))),
        };
    }

    match numeric_at(column, row) {
        Some(value) => {
            let target = match literal_num {
                Some(t) => t,
                None => return Ok(false),
            };
            Ok(match op {
                CompareOp::Eq => value == target,
                CompareOp::Lt => value < target,
                CompareOp::Gt => value > target,
                CompareOp::Le => value <= target,
                CompareOp::Ge => value >= target,
            })
        }
        None => Err(LockboxError::QueryError(format!(
            "unsupported column type in WHERE: {}",
            column.data_type()
        ))),
    }
}

/// Comparator for ORDER BY: nulls greatest, so ascending puts them last and
/// the reversed (descending) comparator puts them first.
fn compare_rows(column: &ArrayRef, a: usize, b: usize) -> Ordering {
    match (column.is_null(a), column.is_null(b)) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            if let (Some(va), Some(vb)) = (string_at(column, a), string_at(column, b)) {
                return va.cmp(vb);
            }
            if let Some(bools) = column.as_any().downcast_ref::<BooleanArray>() {
                return bools.value(a).cmp(&bools.value(b));
            }
            match (numeric_at(column, a), numeric_at(column, b)) {
                (Some(va), Some(vb)) => va.partial_cmp(&vb).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            }
        }
    }
}

fn check_sortable(column: &ArrayRef) -> Result<()> {
    let supported = matches!(column.data_type(), DataType::Utf8 | DataType::Boolean)
        || numeric_type(column.data_type());
    if supported {
        Ok(())
    } else {
        Err(LockboxError::QueryError(format!(
            "unsupported column type in ORDER BY: {}",
            column.data_type()
        )))
    }
}

fn numeric_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Date32
            | DataType::Timestamp(_, _)
    )
}

fn string_at(column: &ArrayRef, row: usize) -> Option<&str> {
    column
        .as_any()
        .downcast_ref::<StringArray>()
        .map(|a| a.value(row))
}

/// Numeric cell value coerced to f64. None for non-numeric types.
fn numeric_at(column: &ArrayRef, row: usize) -> Option<f64> {
    integer_at(column, row)
        .map(|v| v as f64)
        .or_else(|| match column.data_type() {
            DataType::Float32 => column
                .as_any()
                .downcast_ref::<Float32Array>()
                .map(|a| a.value(row) as f64),
            DataType::Float64 => column
                .as_any()
                .downcast_ref::<Float64Array>()
                .map(|a| a.value(row)),
            _ => None,
        })
}

/// Integer-family cell value. None for floats, strings, and booleans.
fn integer_at(column: &ArrayRef, row: usize) -> Option<i64> {
    let any = column.as_any();
    match column.data_type() {
        DataType::Int8 => any.downcast_ref::<Int8Array>().map(|a| a.value(row) as i64),
        DataType::Int16 => any
            .downcast_ref::<Int16Array>()
            .map(|a| a.value(row) as i64),
        DataType::Int32 => any
            .downcast_ref::<Int32Array>()
            .map(|a| a.value(row) as i64),
        DataType::Int64 => any.downcast_ref::<Int64Array>().map(|a| a.value(row)),
        DataType::UInt8 => any
            .downcast_ref::<UInt8Array>()
            .map(|a| a.value(row) as i64),
        DataType::UInt16 => any
            .downcast_ref::<UInt16Array>()
            .map(|a| a.value(row) as i64),
        DataType::UInt32 => any
            .downcast_ref::<UInt32Array>()
            .map(|a| a.value(row) as i64),
        DataType::UInt64 => any
            .downcast_ref::<UInt64Array>()
            .map(|a| a.value(row) as i64),
        DataType::Date32 => any
            .downcast_ref::<Date32Array>()
            .map(|a| a.value(row) as i64),
        DataType::Timestamp(TimeUnit::Second, _) => any
            .downcast_ref::<TimestampSecondArray>()
            .map(|a| a.value(row)),
        DataType::Timestamp(TimeUnit::Millisecond, _) => any
            .downcast_ref::<TimestampMillisecondArray>()
            .map(|a| a.value(row)),
        DataType::Timestamp(TimeUnit::Microsecond, _) => any
            .downcast_ref::<TimestampMicrosecondArray>()
            .map(|a| a.value(row)),
        DataType::Timestamp(TimeUnit::Nanosecond, _) => any
            .downcast_ref::<TimestampNanosecondArray>()
            .map(|a| a.value(row)),
        _ => None,
    }
}

/// Aggregates produce a single row with one column per aggregate: int64 for
/// COUNT, float64 for AVG, the argument's type for SUM/MIN/MAX.
fn execute_aggregates(
    batch: &RecordBatch,
    indices: &[usize],
    items: &[SelectItem],
) -> Result<RecordBatch> {
    let mut fields: Vec<Field> = Vec::with_capacity(items.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(items.len());

    for item in items {
        let (func, column_name) = match item {
            SelectItem::Aggregate { func, column } => (*func, column.as_deref()),
            _ => {
                return Err(LockboxError::QueryError(
                    "cannot mix aggregates with plain columns".to_string(),
                ))
            }
        };

        let label = match column_name {
            Some(name) => format!("{}({})", func.name(), name),
            None => format!("{}(*)", func.name()),
        };

        match func {
            AggregateFunc::Count => {
                let count = match column_name {
                    None => indices.len() as i64,
                    Some(name) => {
                        let column = resolve(batch, name)?;
                        indices.iter().filter(|&&row| !column.is_null(row)).count() as i64
                    }
                };
                fields.push(Field::new(label, DataType::Int64, false));
                arrays.push(Arc::new(Int64Array::from(vec![count])));
            }
            AggregateFunc::Avg => {
                let column = resolve(batch, column_name_required(column_name, func)?)?;
                let mut sum = 0.0;
                let mut count = 0u64;
                for &row in indices {
                    if let Some(value) = non_null_numeric(column, row, func)? {
                        sum += value;
                        count += 1;
                    }
                }
                let avg = if count > 0 { Some(sum / count as f64) } else { None };
                fields.push(Field::new(label, DataType::Float64, true));
                arrays.push(Arc::new(Float64Array::from(vec![avg])));
            }
            AggregateFunc::Sum => {
                let column = resolve(batch, column_name_required(column_name, func)?)?;
                let mut int_sum: Option<i64> = None;
                let mut float_sum: Option<f64> = None;
                for &row in indices {
                    if column.is_null(row) {
                        continue;
                    }
                    if let Some(value) = integer_at(column, row) {
                        int_sum = Some(int_sum.unwrap_or(0) + value);
                    } else if let Some(value) = numeric_at(column, row) {
                        float_sum = Some(float_sum.unwrap_or(0.0) + value);
                    } else {
                        return Err(aggregate_type_error(func, column));
                    }
                }
                let array = scalar_array(column.data_type(), int_sum, float_sum)?;
                fields.push(Field::new(label, column.data_type().clone(), true));
                arrays.push(array);
            }
            AggregateFunc::Min | AggregateFunc::Max => {
                let column = resolve(batch, column_name_required(column_name, func)?)?;
                if column.data_type() == &DataType::Utf8 {
                    let mut best: Option<&str> = None;
                    for &row in indices {
                        if column.is_null(row) {
                            continue;
                        }
                        let value = string_at(column, row).unwrap();
                        best = Some(match best {
                            None => value,
                            Some(current) => {
                                if better(func, value.cmp(current)) {
                                    value
                                } else {
                                    current
                                }
                            }
                        });
                    }
                    fields.push(Field::new(label, DataType::Utf8, true));
                    arrays.push(Arc::new(StringArray::from(vec![best])));
                } else {
                    let mut best_int: Option<i64> = None;
                    let mut best_float: Option<f64> = None;
                    for &row in indices {
                        if column.is_null(row) {
                            continue;
                        }
                        if let Some(value) = integer_at(column, row) {
                            best_int = Some(match best_int {
                                None => value,
                                Some(current) if better(func, value.cmp(&current)) => value,
                                Some(current) => current,
                            });
                        } else if let Some(value) = numeric_at(column, row) {
                            best_float = Some(match best_float {
                                None => value,
                                Some(current)
                                    if better(
                                        func,
                                        value.partial_cmp(&current).unwrap_or(Ordering::Equal),
                                    ) =>
                                {
                                    value
                                }
                                Some(current) => current,
                            });
                        } else {
                            return Err(aggregate_type_error(func, column));
                        }
                    }
                    let array = scalar_array(column.data_type(), best_int, best_float)?;
                    fields.push(Field::new(label, column.data_type().clone(), true));
                    arrays.push(array);
                }
            }
        }
    }

    Ok(RecordBatch::try_new(
        Arc::new(Schema::new(fields)),
        arrays,
    )?)
}

fn resolve<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| LockboxError::ColumnNotFound(name.to_string()))
}

fn column_name_required(name: Option<&str>, func: AggregateFunc) -> Result<&str> {
    name.ok_or_else(|| {
        LockboxError::QueryError(format!("{}() requires a column argument", func.name()))
    })
}

fn non_null_numeric(column: &ArrayRef, row: usize, func: AggregateFunc) -> Result<Option<f64>> {
    if column.is_null(row) {
        return Ok(None);
    }
    numeric_at(column, row)
        .map(Some)
        .ok_or_else(|| aggregate_type_error(func, column))
}

fn aggregate_type_error(func: AggregateFunc, column: &ArrayRef) -> LockboxError {
    LockboxError::QueryError(format!(
        "{}() does not support column type {}",
        func.name(),
        column.data_type()
    ))
}

/// True when `candidate cmp current` makes the candidate the new best.
fn better(func: AggregateFunc, ordering: Ordering) -> bool {
    match func {
        AggregateFunc::Min => ordering == Ordering::Less,
        AggregateFunc::Max => ordering == Ordering::Greater,
        _ => false,
    }
}

/// One-element array of the given type from an integer or float accumulator.
fn scalar_array(
    data_type: &DataType,
    int_val: Option<i64>,
    float_val: Option<f64>,
) -> Result<ArrayRef> {
    let array: ArrayRef = match data_type {
        DataType::Int8 => Arc::new(Int8Array::from(vec![int_val.map(|v| v as i8)])),
        DataType::Int16 => Arc::new(Int16Array::from(vec![int_val.map(|v| v as i16)])),
        DataType::Int32 => Arc::new(Int32Array::from(vec![int_val.map(|v| v as i32)])),
        DataType::Int64 => Arc::new(Int64Array::from(vec![int_val])),
        DataType::UInt8 => Arc::new(UInt8Array::from(vec![int_val.map(|v| v as u8)])),
        DataType::UInt16 => Arc::new(UInt16Array::from(vec![int_val.map(|v| v as u16)])),
        DataType::UInt32 => Arc::new(UInt32Array::from(vec![int_val.map(|v| v as u32)])),
        DataType::UInt64 => Arc::new(UInt64Array::from(vec![int_val.map(|v| v as u64)])),
        DataType::Float32 => Arc::new(Float32Array::from(vec![float_val.map(|v| v as f32)])),
        DataType::Float64 => Arc::new(Float64Array::from(vec![float_val])),
        DataType::Date32 => Arc::new(Date32Array::from(vec![int_val.map(|v| v as i32)])),
        DataType::Timestamp(TimeUnit::Second, _) => {
            Arc::new(TimestampSecondArray::from(vec![int_val]))
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            Arc::new(TimestampMillisecondArray::from(vec![int_val]))
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            Arc::new(TimestampMicrosecondArray::from(vec![int_val]))
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            Arc::new(TimestampNanosecondArray::from(vec![int_val]))
        }
        other => {
            return Err(LockboxError::QueryError(format!(
                "aggregate does not support column type {other}"
            )))
        }
    };
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse;

    fn test_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("score", DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3, 4])),
                Arc::new(StringArray::from(vec![
                    Some("alice"),
                    Some("bob"),
                    Some("carol"),
                    None,
                ])),
                Arc::new(Float64Array::from(vec![
                    Some(10.0),
                    Some(55.0),
                    Some(30.0),
                    None,
                ])),
            ],
        )
        .unwrap()
    }

    fn run(sql: &str) -> RecordBatch {
        execute(&test_batch(), &parse(sql).unwrap()).unwrap()
    }

    #[test]
    fn test_select_star() {
        let out = run("SELECT * FROM data");
        assert_eq!(out.num_rows(), 4);
        assert_eq!(out.num_columns(), 3);
    }

    #[test]
    fn test_where_numeric() {
        let out = run("SELECT id FROM data WHERE score > 20");
        let ids = out.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ids.values(), &[2, 3]);
    }

    #[test]
    fn test_where_string_equality_preserves_case() {
        let out = run("SELECT id FROM data WHERE name = 'bob'");
        let ids = out.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ids.values(), &[2]);

        let none = run("SELECT id FROM data WHERE name = 'BOB'");
        assert_eq!(none.num_rows(), 0);
    }

    #[test]
    fn test_where_string_ordered_op_is_error() {
        let err = execute(
            &test_batch(),
            &parse("SELECT id FROM data WHERE name > 'a'").unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, LockboxError::QueryError(_)));
    }

    #[test]
    fn test_null_rows_never_match() {
        let out = run("SELECT id FROM data WHERE score <= 100");
        let ids = out.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        // Row 4 has a null score
        assert_eq!(ids.values(), &[1, 2, 3]);
    }

    #[test]
    fn test_order_by_desc_limit() {
        let out = run("SELECT name, score FROM data WHERE score > 20 ORDER BY score DESC LIMIT 1");
        assert_eq!(out.num_rows(), 1);
        let names = out.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        let scores = out
            .column(1)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(names.value(0), "bob");
        assert_eq!(scores.value(0), 55.0);
    }

    #[test]
    fn test_nulls_sort_last_asc_first_desc() {
        let asc = run("SELECT id FROM data ORDER BY score ASC");
        let ids = asc.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ids.values(), &[1, 3, 2, 4]);

        let desc = run("SELECT id FROM data ORDER BY score DESC");
        let ids = desc
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(ids.values(), &[4, 2, 3, 1]);
    }

    #[test]
    fn test_projection_order() {
        let out = run("SELECT score, id FROM data LIMIT 2");
        assert_eq!(out.schema().field(0).name(), "score");
        assert_eq!(out.schema().field(1).name(), "id");
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn test_count_and_avg() {
        let out = run("SELECT COUNT(*), AVG(score) FROM data");
        assert_eq!(out.num_rows(), 1);
        let count = out.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(count.value(0), 4);
        let avg = out
            .column(1)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        // (10 + 55 + 30) / 3
        assert!((avg.value(0) - 31.666666).abs() < 0.001);
    }

    #[test]
    fn test_count_column_skips_nulls() {
        let out = run("SELECT COUNT(name) FROM data");
        let count = out.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(count.value(0), 3);
    }

    #[test]
    fn test_sum_min_max_keep_argument_type() {
        let out = run("SELECT SUM(id), MIN(score), MAX(score) FROM data");
        let sum = out.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(sum.value(0), 10);
        assert_eq!(out.schema().field(0).data_type(), &DataType::Int64);

        let min = out
            .column(1)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(min.value(0), 10.0);
        let max = out
            .column(2)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(max.value(0), 55.0);
    }

    #[test]
    fn test_aggregate_with_where() {
        let out = run("SELECT COUNT(*) FROM data WHERE score > 20");
        let count = out.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(count.value(0), 2);
    }

    #[test]
    fn test_avg_of_empty_is_null() {
        let out = run("SELECT AVG(score) FROM data WHERE score > 1000");
        let avg = out
            .column(0)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert!(avg.is_null(0));
    }

    #[test]
    fn test_unparseable_numeric_literal_matches_nothing() {
        let out = run("SELECT id FROM data WHERE score = 'abc'");
        assert_eq!(out.num_rows(), 0);
    }
}
