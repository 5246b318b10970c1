//! Core data model for the AGOL survey ETL: survey configuration, column types,
//! typed cells/rows/tables and credentials.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "agol-core";

pub const DEFAULT_DATE_COLUMN: &str = "date_collected";

pub const ENV_DW_USER: &str = "AGOL_DW_USER";
pub const ENV_DW_HOST: &str = "AGOL_DW_HOST";
pub const ENV_DW_PASSWORD: &str = "AGOL_DW_PASSWORD";
pub const ENV_DW_PORT: &str = "AGOL_DW_PORT";
pub const ENV_TOKEN: &str = "AGOL_TOKEN";

/// Scalar type of one table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Int64,
    Float64,
    Date,
}

impl ColumnType {
    /// Maps a declared type tag. Unknown tags fall back to `String`; `Date` is
    /// never produced here.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "string" => Self::String,
            "int64" => Self::Int64,
            "float64" => Self::Float64,
            _ => Self::String,
        }
    }

    pub fn null_cell(self) -> Cell {
        match self {
            Self::String => Cell::String(None),
            Self::Int64 => Cell::Int64(None),
            Self::Float64 => Cell::Float64(None),
            Self::Date => Cell::Date(None),
        }
    }
}

/// Raw type tag as written in the configuration file. Non-string scalars are
/// kept as their text form so they fall through to `String` like any other
/// unknown tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypeTag(pub Option<String>);

impl TypeTag {
    pub fn column_type(&self) -> ColumnType {
        self.0
            .as_deref()
            .map(ColumnType::from_tag)
            .unwrap_or(ColumnType::String)
    }
}

impl<'de> Deserialize<'de> for TypeTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TagVisitor;

        impl<'de> Visitor<'de> for TagVisitor {
            type Value = TypeTag;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a column type tag")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<TypeTag, E> {
                Ok(TypeTag(Some(v.to_string())))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<TypeTag, E> {
                Ok(TypeTag(Some(v)))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<TypeTag, E> {
                Ok(TypeTag(Some(v.to_string())))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<TypeTag, E> {
                Ok(TypeTag(Some(v.to_string())))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<TypeTag, E> {
                Ok(TypeTag(Some(v.to_string())))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<TypeTag, E> {
                Ok(TypeTag(Some(v.to_string())))
            }

            fn visit_unit<E: de::Error>(self) -> Result<TypeTag, E> {
                Ok(TypeTag(None))
            }

            fn visit_none<E: de::Error>(self) -> Result<TypeTag, E> {
                Ok(TypeTag(None))
            }
        }

        deserializer.deserialize_any(TagVisitor)
    }
}

/// One configured survey layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SurveyConfig {
    pub name: String,
    pub url: String,
    /// Column declarations in file order.
    pub schema: Vec<(String, TypeTag)>,
    pub table_name: String,
    pub prim_key: String,
    pub update_col: String,
    pub date_column: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SurveyEntry {
    #[serde(default)]
    name: Option<String>,
    url: String,
    #[serde(deserialize_with = "ordered_map")]
    schema: Vec<(String, TypeTag)>,
    table_name: String,
    prim_key: String,
    update_col: String,
    #[serde(default)]
    date_column: Option<String>,
}

impl SurveyEntry {
    fn into_config(self, key: String) -> SurveyConfig {
        SurveyConfig {
            name: self.name.unwrap_or(key),
            url: self.url,
            schema: self.schema,
            table_name: self.table_name,
            prim_key: self.prim_key,
            update_col: self.update_col,
            date_column: self
                .date_column
                .unwrap_or_else(|| DEFAULT_DATE_COLUMN.to_string()),
        }
    }
}

/// Which way a transformed table reaches the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkMode {
    /// Write Parquet, then load the staged file.
    #[default]
    Staged,
    /// Load the in-memory table; no Parquet file.
    Direct,
}

/// What the loader does when the table existence probe fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbePolicy {
    #[default]
    FailFast,
    Warn,
}

/// Top-level run configuration, read once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct EtlConfig {
    pub token: Secret,
    pub db_name: String,
    pub schema: String,
    #[serde(deserialize_with = "surveys_in_order")]
    pub surveys: Vec<SurveyConfig>,
    #[serde(default)]
    pub sink: SinkMode,
    #[serde(default)]
    pub probe_policy: ProbePolicy,
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,
    #[serde(default = "default_processed_dir")]
    pub processed_dir: PathBuf,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_port")]
    pub db_port: u16,
}

fn default_raw_dir() -> PathBuf {
    PathBuf::from("raw_data")
}

fn default_processed_dir() -> PathBuf {
    PathBuf::from("processed_data")
}

fn default_http_timeout_secs() -> u64 {
    60
}

fn default_db_connect_timeout_secs() -> u64 {
    30
}

fn default_db_port() -> u16 {
    5432
}

impl EtlConfig {
    pub fn survey(&self, name: &str) -> Option<&SurveyConfig> {
        self.surveys.iter().find(|s| s.name == name)
    }
}

fn surveys_in_order<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<SurveyConfig>, D::Error> {
    let entries: Vec<(String, SurveyEntry)> = ordered_map(deserializer)?;
    Ok(entries
        .into_iter()
        .map(|(key, entry)| entry.into_config(key))
        .collect())
}

/// Deserializes a map into key/value pairs, keeping the source order.
pub fn ordered_map<'de, D, K, V>(deserializer: D) -> Result<Vec<(K, V)>, D::Error>
where
    D: Deserializer<'de>,
    K: Deserialize<'de>,
    V: Deserialize<'de>,
{
    struct OrderedVisitor<K, V>(PhantomData<(K, V)>);

    impl<'de, K, V> Visitor<'de> for OrderedVisitor<K, V>
    where
        K: Deserialize<'de>,
        V: Deserialize<'de>,
    {
        type Value = Vec<(K, V)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((key, value)) = access.next_entry()? {
                out.push((key, value));
            }
            Ok(out)
        }
    }

    deserializer.deserialize_map(OrderedVisitor(PhantomData))
}

/// Credential string that never prints its value.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),
    #[error("environment variable {name} is not a valid port: {value}")]
    InvalidPort { name: &'static str, value: String },
}

/// Warehouse login read from the environment.
#[derive(Debug, Clone)]
pub struct DbCredentials {
    pub user: String,
    pub host: String,
    pub password: Secret,
    pub port: Option<u16>,
}

impl DbCredentials {
    pub fn from_env() -> Result<Self, CredentialsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CredentialsError> {
        let require = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(CredentialsError::Missing(name))
        };
        let port = match lookup(ENV_DW_PORT) {
            Some(value) => match value.trim().parse::<u16>() {
                Ok(port) => Some(port),
                Err(_) => {
                    return Err(CredentialsError::InvalidPort {
                        name: ENV_DW_PORT,
                        value,
                    })
                }
            },
            None => None,
        };
        Ok(Self {
            user: require(ENV_DW_USER)?,
            host: require(ENV_DW_HOST)?,
            password: Secret::new(require(ENV_DW_PASSWORD)?),
            port,
        })
    }
}

/// Typed, nullable scalar. A null keeps its column type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Cell {
    String(Option<String>),
    Int64(Option<i64>),
    Float64(Option<f64>),
    Date(Option<NaiveDate>),
}

impl Cell {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::String(_) => ColumnType::String,
            Self::Int64(_) => ColumnType::Int64,
            Self::Float64(_) => ColumnType::Float64,
            Self::Date(_) => ColumnType::Date,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Self::String(v) => v.is_none(),
            Self::Int64(v) => v.is_none(),
            Self::Float64(v) => v.is_none(),
            Self::Date(v) => v.is_none(),
        }
    }
}

/// Ordered column declarations of a table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SurveySchema {
    pub columns: Vec<(String, ColumnType)>,
}

impl SurveySchema {
    pub fn new(columns: Vec<(String, ColumnType)>) -> Self {
        Self { columns }
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, ty)| *ty)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column_type(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns a copy with `name` retyped, if declared.
    pub fn with_column_type(mut self, name: &str, ty: ColumnType) -> Self {
        for (column, column_ty) in &mut self.columns {
            if column == name {
                *column_ty = ty;
            }
        }
        self
    }
}

/// One feature's attributes, keyed by column name.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TypedRow {
    pub cells: BTreeMap<String, Cell>,
}

impl TypedRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, cell: Cell) -> Self {
        self.cells.insert(column.into(), cell);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, cell: Cell) {
        self.cells.insert(column.into(), cell);
    }

    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.cells.get(column)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SurveyTable {
    pub schema: SurveySchema,
    pub rows: Vec<TypedRow>,
}

impl SurveyTable {
    pub fn new(schema: SurveySchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
