//! Raw AGOL JSON -> typed survey tables, plus Parquet staging.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agol_core::{Cell, ColumnType, SurveyConfig, SurveySchema, SurveyTable, TypedRow};
use anyhow::{bail, Context, Result};
use arrow_array::{Array, ArrayRef, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Datelike, NaiveDate};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "agol-transform";

/// `NaiveDate::num_days_from_ce` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

pub type Attributes = Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("response has no `features` array")]
    MissingFeatures,
    #[error("feature {index} has no `attributes` object")]
    MissingAttributes { index: usize },
    #[error("date column `{0}` is not declared in the schema")]
    MissingDateColumn(String),
    #[error("feature {row} is missing declared field `{column}`")]
    MissingField { row: usize, column: String },
    #[error("feature {row}: cannot convert `{column}` value {value} to {expected:?}")]
    Unconvertible {
        row: usize,
        column: String,
        expected: ColumnType,
        value: String,
    },
    #[error("feature {row}: `{column}` epoch value {millis} is out of range")]
    DateOutOfRange {
        row: usize,
        column: String,
        millis: i64,
    },
}

/// Resolve a survey's declared tags into column types, keeping file order.
pub fn build_schema(survey: &SurveyConfig) -> SurveySchema {
    SurveySchema::new(
        survey
            .schema
            .iter()
            .map(|(name, tag)| (name.clone(), tag.column_type()))
            .collect(),
    )
}

pub fn processed_path(dir: &Path, survey: &str, run_date: NaiveDate) -> PathBuf {
    dir.join(format!("{survey}_{}.parquet", run_date.format("%Y-%m-%d")))
}

/// Epoch milliseconds to the UTC calendar date, time of day dropped.
pub fn epoch_millis_to_date(millis: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(millis).map(|dt| dt.date_naive())
}

fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

/// `features[*].attributes` of a raw response file.
pub fn read_raw_features(path: &Path) -> Result<Vec<Attributes>, TransformError> {
    let text = fs::read_to_string(path).map_err(|source| TransformError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: JsonValue = serde_json::from_str(&text).map_err(|source| TransformError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    features_from_value(value)
}

pub fn features_from_value(value: JsonValue) -> Result<Vec<Attributes>, TransformError> {
    let JsonValue::Object(mut top) = value else {
        return Err(TransformError::MissingFeatures);
    };
    let Some(JsonValue::Array(features)) = top.remove("features") else {
        return Err(TransformError::MissingFeatures);
    };
    features
        .into_iter()
        .enumerate()
        .map(|(index, feature)| match feature {
            JsonValue::Object(mut feature) => match feature.remove("attributes") {
                Some(JsonValue::Object(attributes)) => Ok(attributes),
                _ => Err(TransformError::MissingAttributes { index }),
            },
            _ => Err(TransformError::MissingAttributes { index }),
        })
        .collect()
}

/// One row per feature. The date column comes out as `ColumnType::Date`;
/// undeclared attributes are dropped.
pub fn build_table(
    schema: &SurveySchema,
    date_column: &str,
    features: &[Attributes],
) -> Result<SurveyTable, TransformError> {
    if !schema.contains(date_column) {
        return Err(TransformError::MissingDateColumn(date_column.to_string()));
    }

    let mut table = SurveyTable::new(
        schema
            .clone()
            .with_column_type(date_column, ColumnType::Date),
    );

    for (row_index, attributes) in features.iter().enumerate() {
        let mut row = TypedRow::new();
        for (column, ty) in &schema.columns {
            let value = attributes
                .get(column)
                .ok_or_else(|| TransformError::MissingField {
                    row: row_index,
                    column: column.clone(),
                })?;
            let cell = if column == date_column {
                date_cell(row_index, column, value)?
            } else {
                coerce(value, *ty).ok_or_else(|| TransformError::Unconvertible {
                    row: row_index,
                    column: column.clone(),
                    expected: *ty,
                    value: value.to_string(),
                })?
            };
            row.insert(column.clone(), cell);
        }
        table.rows.push(row);
    }

    Ok(table)
}

fn coerce(value: &JsonValue, ty: ColumnType) -> Option<Cell> {
    if value.is_null() {
        return Some(ty.null_cell());
    }
    match ty {
        ColumnType::String => match value {
            JsonValue::String(s) => Some(Cell::String(Some(s.clone()))),
            JsonValue::Number(n) => Some(Cell::String(Some(n.to_string()))),
            JsonValue::Bool(b) => Some(Cell::String(Some(b.to_string()))),
            _ => None,
        },
        ColumnType::Int64 => value.as_i64().map(|v| Cell::Int64(Some(v))),
        ColumnType::Float64 => value.as_f64().map(|v| Cell::Float64(Some(v))),
        ColumnType::Date => None,
    }
}

fn date_cell(row: usize, column: &str, value: &JsonValue) -> Result<Cell, TransformError> {
    if value.is_null() {
        return Ok(Cell::Date(None));
    }
    let millis = value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
        .ok_or_else(|| TransformError::Unconvertible {
            row,
            column: column.to_string(),
            expected: ColumnType::Date,
            value: value.to_string(),
        })?;
    let date = epoch_millis_to_date(millis).ok_or_else(|| TransformError::DateOutOfRange {
        row,
        column: column.to_string(),
        millis,
    })?;
    Ok(Cell::Date(Some(date)))
}

/// Load a survey's raw file for the run date and build its typed table.
pub fn transform_survey(
    survey: &SurveyConfig,
    raw_path: &Path,
) -> Result<SurveyTable, TransformError> {
    let schema = build_schema(survey);
    let features = read_raw_features(raw_path)?;
    debug!(survey = %survey.name, features = features.len(), "read raw features");
    build_table(&schema, &survey.date_column, &features)
}

fn arrow_type(ty: ColumnType) -> DataType {
    match ty {
        ColumnType::String => DataType::Utf8,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Date => DataType::Date32,
    }
}

fn column_array(table: &SurveyTable, column: &str, ty: ColumnType) -> Result<ArrayRef> {
    let cells = table.rows.iter().map(|row| row.get(column));
    let mismatch = || format!("column `{column}` holds a value that is not {ty:?}");
    let array: ArrayRef = match ty {
        ColumnType::String => Arc::new(StringArray::from(
            cells
                .map(|cell| match cell {
                    Some(Cell::String(v)) => Ok(v.clone()),
                    None => Ok(None),
                    Some(_) => bail!(mismatch()),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnType::Int64 => Arc::new(Int64Array::from(
            cells
                .map(|cell| match cell {
                    Some(Cell::Int64(v)) => Ok(*v),
                    None => Ok(None),
                    Some(_) => bail!(mismatch()),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnType::Float64 => Arc::new(Float64Array::from(
            cells
                .map(|cell| match cell {
                    Some(Cell::Float64(v)) => Ok(*v),
                    None => Ok(None),
                    Some(_) => bail!(mismatch()),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnType::Date => Arc::new(Date32Array::from(
            cells
                .map(|cell| match cell {
                    Some(Cell::Date(v)) => Ok(v.map(date_to_days)),
                    None => Ok(None),
                    Some(_) => bail!(mismatch()),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
    };
    Ok(array)
}

pub fn to_record_batch(table: &SurveyTable) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(
        table
            .schema
            .columns
            .iter()
            .map(|(name, ty)| ArrowField::new(name, arrow_type(*ty), true))
            .collect::<Vec<_>>(),
    ));
    let arrays = table
        .schema
        .columns
        .iter()
        .map(|(name, ty)| column_array(table, name, *ty))
        .collect::<Result<Vec<_>>>()?;
    RecordBatch::try_new(schema, arrays).context("building survey record batch")
}

pub fn write_parquet(path: &Path, table: &SurveyTable) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let batch = to_record_batch(table)?;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

/// Read a staged file back into a table, checking every declared column is
/// there with the expected Arrow type.
pub fn read_parquet(path: &Path, schema: &SurveySchema) -> Result<SurveyTable> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?
        .build()
        .with_context(|| format!("opening parquet reader {}", path.display()))?;

    let mut table = SurveyTable::new(schema.clone());
    for batch in reader {
        let batch = batch.with_context(|| format!("reading record batch {}", path.display()))?;
        let mut rows = vec![TypedRow::new(); batch.num_rows()];
        for (name, ty) in &schema.columns {
            let array = batch
                .column_by_name(name)
                .with_context(|| format!("{} has no column `{name}`", path.display()))?;
            if array.data_type() != &arrow_type(*ty) {
                bail!(
                    "{}: column `{name}` is {:?}, expected {:?}",
                    path.display(),
                    array.data_type(),
                    arrow_type(*ty)
                );
            }
            for (index, row) in rows.iter_mut().enumerate() {
                row.insert(name.clone(), read_cell(array.as_ref(), index, *ty)?);
            }
        }
        table.rows.extend(rows);
    }
    Ok(table)
}

fn read_cell(array: &dyn Array, index: usize, ty: ColumnType) -> Result<Cell> {
    if array.is_null(index) {
        return Ok(ty.null_cell());
    }
    let any = array.as_any();
    let cell = match ty {
        ColumnType::String => any
            .downcast_ref::<StringArray>()
            .map(|a| Cell::String(Some(a.value(index).to_string()))),
        ColumnType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map(|a| Cell::Int64(Some(a.value(index)))),
        ColumnType::Float64 => any
            .downcast_ref::<Float64Array>()
            .map(|a| Cell::Float64(Some(a.value(index)))),
        ColumnType::Date => match any.downcast_ref::<Date32Array>() {
            Some(a) => Some(Cell::Date(Some(
                days_to_date(a.value(index)).context("date32 value out of range")?,
            ))),
            None => None,
        },
    };
    cell.with_context(|| format!("unexpected array type for {ty:?}"))
}
