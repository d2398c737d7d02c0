//! Lockbox command-line interface
//!
//! Usage:
//!   lockbox create data.lbx --schema schema.json --password secret
//!   lockbox write data.lbx --input rows.csv --password secret
//!   lockbox query data.lbx --sql "SELECT * FROM data" --password secret
//!   lockbox info data.lbx --password secret

use arrow::array::{
    Array, BooleanArray, Date32Array, Float32Array, Float64Array, Int32Array, Int64Array,
    StringArray, TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray,
};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use clap::{Parser, Subcommand};
use lockbox::{ingest, Lockbox};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "lockbox")]
#[command(about = "Secure columnar data storage with Apache Arrow")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new lockbox file
    Create {
        /// Lockbox file to create
        file: PathBuf,

        /// JSON schema file: [{"name": ..., "type": ..., "nullable": ...}]
        #[arg(short, long)]
        schema: Option<PathBuf>,

        /// Infer the schema from a CSV file instead
        #[arg(long, conflicts_with = "schema")]
        detect_from: Option<PathBuf>,

        /// Password for encryption
        #[arg(short, long)]
        password: String,

        /// Creator name recorded in the audit trail
        #[arg(long, default_value = "system")]
        created_by: String,
    },

    /// Write data into a lockbox file
    Write {
        /// Lockbox file to write to
        file: PathBuf,

        /// Input data file
        #[arg(short, long)]
        input: PathBuf,

        /// Input format: csv or json
        #[arg(short, long, default_value = "csv")]
        format: String,

        /// Password for encryption
        #[arg(short, long)]
        password: String,
    },

    /// Query data from a lockbox file
    Query {
        /// Lockbox file to query
        file: PathBuf,

        /// Restricted SELECT statement
        #[arg(long, default_value = "SELECT * FROM data")]
        sql: String,

        /// Password for decryption
        #[arg(short, long)]
        password: String,

        /// Output format: table, json, or csv
        #[arg(short, long, default_value = "table")]
        output: String,
    },

    /// Display information about a lockbox file
    Info {
        /// Lockbox file to inspect
        file: PathBuf,

        /// Password
        #[arg(short, long)]
        password: String,

        /// Output format: table or json
        #[arg(short, long, default_value = "table")]
        output: String,
    },

    /// Verify the checksum of every data block
    Validate {
        /// Lockbox file to validate
        file: PathBuf,

        /// Password
        #[arg(short, long)]
        password: String,
    },

    /// Drop corrupted blocks from the directory
    Repair {
        /// Lockbox file to repair
        file: PathBuf,

        /// Password
        #[arg(short, long)]
        password: String,
    },
}

fn main() {
    env_logger::init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> lockbox::Result<()> {
    match cli.command {
        Command::Create {
            file,
            schema,
            detect_from,
            password,
            created_by,
        } => {
            let schema = match (schema, detect_from) {
                (Some(path), _) => {
                    let text = std::fs::read_to_string(path)?;
                    ingest::schema_from_json(&text)?
                }
                (None, Some(path)) => ingest::detect_csv_schema(path, 10)?,
                (None, None) => {
                    return Err(lockbox::LockboxError::InvalidArgument(
                        "either --schema or --detect-from is required".to_string(),
                    ))
                }
            };

            let lb = Lockbox::create(&file, schema.clone(), &password, &created_by)?;
            lb.close()?;

            println!("Created lockbox: {}", file.display());
            println!("Schema fields: {}", schema.fields().len());
            for (i, field) in schema.fields().iter().enumerate() {
                println!(
                    "  {}. {} ({}{})",
                    i + 1,
                    field.name(),
                    field.data_type(),
                    if field.is_nullable() { ", nullable" } else { "" }
                );
            }
        }

        Command::Write {
            file,
            input,
            format,
            password,
        } => {
            let mut lb = Lockbox::open(&file, &password)?;
            let schema = lb.schema();

            let batch = match format.as_str() {
                "csv" => ingest::csv_to_batch(&input, &schema)?,
                "json" => ingest::json_to_batch(&input, &schema)?,
                other => {
                    return Err(lockbox::LockboxError::InvalidArgument(format!(
                        "unknown input format: {other}"
                    )))
                }
            };

            let rows = batch.num_rows();
            lb.write(&batch, &password)?;
            lb.close()?;
            println!("Wrote {rows} rows to {}", file.display());
        }

        Command::Query {
            file,
            sql,
            password,
            output,
        } => {
            let mut lb = Lockbox::open(&file, &password)?;
            let result = lb.query(&sql, &password)?;

            match output.as_str() {
                "table" => print_table(&result),
                "json" => print_json(&result)?,
                "csv" => print_csv(&result)?,
                other => {
                    return Err(lockbox::LockboxError::InvalidArgument(format!(
                        "unknown output format: {other}"
                    )))
                }
            }
            lb.close()?;
        }

        Command::Info {
            file,
            password,
            output,
        } => {
            let lb = Lockbox::open(&file, &password)?;
            let info = lb.info();

            if output == "json" {
                let value = serde_json::json!({
                    "version": info.version,
                    "createdAt": info.created_at.to_rfc3339(),
                    "createdBy": info.created_by,
                    "modifiedAt": info.modified_at.to_rfc3339(),
                    "modifiedBy": info.modified_by,
                    "blockCount": info.block_count,
                    "accessCount": info.access_count,
                    "fields": info.schema.fields().iter().map(|f| {
                        serde_json::json!({
                            "name": f.name(),
                            "type": f.data_type().to_string(),
                            "nullable": f.is_nullable(),
                        })
                    }).collect::<Vec<_>>(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Lockbox file: {}", file.display());
                println!("  Format version: {}", info.version);
                println!("  Created:  {} by {}", info.created_at.to_rfc3339(), info.created_by);
                println!("  Modified: {} by {}", info.modified_at.to_rfc3339(), info.modified_by);
                println!("  Blocks: {}", info.block_count);
                println!("  Access log entries: {}", info.access_count);
                println!("  Schema:");
                for field in info.schema.fields() {
                    println!(
                        "    {} ({}{})",
                        field.name(),
                        field.data_type(),
                        if field.is_nullable() { ", nullable" } else { "" }
                    );
                }
            }
            lb.close()?;
        }

        Command::Validate { file, password } => {
            let lb = Lockbox::open(&file, &password)?;
            lb.validate()?;
            println!("All blocks verified");
            lb.close()?;
        }

        Command::Repair { file, password } => {
            let mut lb = Lockbox::open(&file, &password)?;
            let before = lb.info().block_count;
            lb.repair()?;
            let after = lb.info().block_count;
            println!("Repair complete: dropped {} blocks, kept {}", before - after, after);
            lb.close()?;
        }
    }

    Ok(())
}

fn print_table(batch: &RecordBatch) {
    let schema = batch.schema();
    let headers: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();

    let mut rows: Vec<Vec<String>> = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        rows.push(
            (0..batch.num_columns())
                .map(|col| format_value(batch.column(col).as_ref(), row))
                .collect(),
        );
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, value) in row.iter().enumerate() {
            widths[i] = widths[i].max(value.len());
        }
    }

    let header_line: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:<width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_line.join(" | "));
    println!(
        "{}",
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-")
    );
    for row in &rows {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, v)| format!("{:<width$}", v, width = widths[i]))
            .collect();
        println!("{}", line.join(" | "));
    }
    println!("({} rows)", batch.num_rows());
}

fn print_json(batch: &RecordBatch) -> lockbox::Result<()> {
    let schema = batch.schema();
    let mut rows = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let mut object = serde_json::Map::new();
        for (i, field) in schema.fields().iter().enumerate() {
            object.insert(field.name().clone(), json_value(batch.column(i).as_ref(), row));
        }
        rows.push(serde_json::Value::Object(object));
    }
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

fn print_csv(batch: &RecordBatch) -> lockbox::Result<()> {
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    let schema = batch.schema();
    writer
        .write_record(schema.fields().iter().map(|f| f.name().as_str()))
        .map_err(|e| lockbox::LockboxError::InvalidArgument(format!("csv: {e}")))?;
    for row in 0..batch.num_rows() {
        let record: Vec<String> = (0..batch.num_columns())
            .map(|col| format_value(batch.column(col).as_ref(), row))
            .collect();
        writer
            .write_record(&record)
            .map_err(|e| lockbox::LockboxError::InvalidArgument(format!("csv: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| lockbox::LockboxError::Io(e))?;
    Ok(())
}

fn json_value(column: &dyn Array, row: usize) -> serde_json::Value {
    if column.is_null(row) {
        return serde_json::Value::Null;
    }
    let any = column.as_any();
    match column.data_type() {
        DataType::Int32 => any
            .downcast_ref::<Int32Array>()
            .map(|a| a.value(row).into())
            .unwrap_or(serde_json::Value::Null),
        DataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map(|a| a.value(row).into())
            .unwrap_or(serde_json::Value::Null),
        DataType::Float32 => any
            .downcast_ref::<Float32Array>()
            .map(|a| (a.value(row) as f64).into())
            .unwrap_or(serde_json::Value::Null),
        DataType::Float64 => any
            .downcast_ref::<Float64Array>()
            .map(|a| a.value(row).into())
            .unwrap_or(serde_json::Value::Null),
        DataType::Boolean => any
            .downcast_ref::<BooleanArray>()
            .map(|a| a.value(row).into())
            .unwrap_or(serde_json::Value::Null),
        _ => serde_json::Value::String(format_value(column, row)),
    }
}

fn format_value(column: &dyn Array, row: usize) -> String {
    if column.is_null(row) {
        return "NULL".to_string();
    }
    let any = column.as_any();
    match column.data_type() {
        DataType::Int32 => any
            .downcast_ref::<Int32Array>()
            .map(|a| a.value(row).to_string()),
        DataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map(|a| a.value(row).to_string()),
        DataType::Float32 => any
            .downcast_ref::<Float32Array>()
            .map(|a| a.value(row).to_string()),
        DataType::Float64 => any
            .downcast_ref::<Float64Array>()
            .map(|a| a.value(row).to_string()),
        DataType::Boolean => any
            .downcast_ref::<BooleanArray>()
            .map(|a| a.value(row).to_string()),
        DataType::Utf8 => any
            .downcast_ref::<StringArray>()
            .map(|a| a.value(row).to_string()),
        DataType::Date32 => any.downcast_ref::<Date32Array>().map(|a| {
            chrono::DateTime::from_timestamp(a.value(row) as i64 * 86_400, 0)
                .map(|dt| dt.date_naive().to_string())
                .unwrap_or_else(|| a.value(row).to_string())
        }),
        DataType::Timestamp(unit, _) => Some(format_timestamp(column, row, unit)),
        _ => None,
    }
    .unwrap_or_else(|| "?".to_string())
}

fn format_timestamp(column: &dyn Array, row: usize, unit: &TimeUnit) -> String {
    let any = column.as_any();
    let datetime = match unit {
        TimeUnit::Second => any
            .downcast_ref::<TimestampSecondArray>()
            .and_then(|a| chrono::DateTime::from_timestamp(a.value(row), 0)),
        TimeUnit::Millisecond => any
            .downcast_ref::<TimestampMillisecondArray>()
            .and_then(|a| chrono::DateTime::from_timestamp_millis(a.value(row))),
        TimeUnit::Microsecond => any
            .downcast_ref::<TimestampMicrosecondArray>()
            .and_then(|a| chrono::DateTime::from_timestamp_micros(a.value(row))),
        TimeUnit::Nanosecond => any
            .downcast_ref::<TimestampNanosecondArray>()
            .map(|a| chrono::DateTime::from_timestamp_nanos(a.value(row))),
    };
    datetime
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| "?".to_string())
}
