//! PostgreSQL loading: per-row upserts over one autocommitting connection.

use std::time::Duration;

use agol_core::{Cell, DbCredentials, ProbePolicy, SurveyTable, TypedRow};
use sqlx::postgres::{PgArguments, PgConnectOptions};
use sqlx::query::Query;
use sqlx::{Connection, PgConnection, Postgres};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "agol-warehouse";

/// Where one survey's rows land and how conflicts resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    pub schema: String,
    pub table: String,
    pub prim_key: String,
    pub update_col: String,
}

impl TableTarget {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn probe_sql(target: &TableTarget) -> String {
    format!("SELECT * FROM {} LIMIT 1", target.qualified_name())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpsertError {
    #[error("no columns declared")]
    NoColumns,
    #[error("primary key `{0}` is not a declared column")]
    UnknownPrimaryKey(String),
    #[error("update column `{0}` is not a declared column")]
    UnknownUpdateColumn(String),
    #[error("row is missing declared column `{0}`")]
    MissingColumn(String),
    #[error("row carries undeclared column `{0}`")]
    UndeclaredColumn(String),
}

/// One row's `INSERT .. ON CONFLICT .. DO UPDATE` plus its bound values, in
/// column order.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertStatement {
    pub sql: String,
    pub params: Vec<Cell>,
}

impl UpsertStatement {
    /// Values are looked up by column name; a row whose column set differs
    /// from `columns` is rejected.
    pub fn build(
        target: &TableTarget,
        columns: &[&str],
        row: &TypedRow,
    ) -> Result<Self, UpsertError> {
        if columns.is_empty() {
            return Err(UpsertError::NoColumns);
        }
        if !columns.contains(&target.prim_key.as_str()) {
            return Err(UpsertError::UnknownPrimaryKey(target.prim_key.clone()));
        }
        if !columns.contains(&target.update_col.as_str()) {
            return Err(UpsertError::UnknownUpdateColumn(target.update_col.clone()));
        }
        if let Some(extra) = row.cells.keys().find(|k| !columns.contains(&k.as_str())) {
            return Err(UpsertError::UndeclaredColumn(extra.clone()));
        }

        let params = columns
            .iter()
            .map(|column| {
                row.get(column)
                    .cloned()
                    .ok_or_else(|| UpsertError::MissingColumn(column.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let update_col = quote_ident(&target.update_col);
        let sql = format!(
            "INSERT INTO {} ({column_list}) VALUES ({placeholders}) ON CONFLICT ({}) DO UPDATE SET {update_col} = EXCLUDED.{update_col}",
            target.qualified_name(),
            quote_ident(&target.prim_key),
        );

        Ok(Self { sql, params })
    }

    fn query(&self) -> Query<'_, Postgres, PgArguments> {
        self.params
            .iter()
            .fold(sqlx::query(&self.sql), |query, cell| match cell {
                Cell::String(v) => query.bind(v.clone()),
                Cell::Int64(v) => query.bind(*v),
                Cell::Float64(v) => query.bind(*v),
                Cell::Date(v) => query.bind(*v),
            })
    }
}

pub fn build_statements(
    target: &TableTarget,
    table: &SurveyTable,
) -> Result<Vec<UpsertStatement>, (usize, UpsertError)> {
    let columns: Vec<&str> = table.schema.names().collect();
    table
        .rows
        .iter()
        .enumerate()
        .map(|(index, row)| UpsertStatement::build(target, &columns, row).map_err(|e| (index, e)))
        .collect()
}

pub fn connect_options(
    credentials: &DbCredentials,
    database: &str,
    default_port: u16,
) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&credentials.host)
        .port(credentials.port.unwrap_or(default_port))
        .username(&credentials.user)
        .password(credentials.password.expose())
        .database(database)
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    pub probe_policy: ProbePolicy,
    pub connect_timeout: Duration,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            probe_policy: ProbePolicy::FailFast,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of one survey's load. Rows written before a failure stay
/// committed; `Aborted::committed` says how many.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Loaded { rows: usize },
    Rejected { row: usize, error: String },
    ConnectionFailed { error: String },
    ProbeFailed { error: String },
    Aborted { committed: usize, failed_row: usize, error: String },
}

impl LoadStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }

    pub fn committed(&self) -> usize {
        match self {
            Self::Loaded { rows } => *rows,
            Self::Aborted { committed, .. } => *committed,
            _ => 0,
        }
    }
}

/// Not `Debug`: the connect options hold the password.
#[derive(Clone)]
pub struct WarehouseLoader {
    connect_options: PgConnectOptions,
    options: LoaderOptions,
}

impl WarehouseLoader {
    pub fn new(connect_options: PgConnectOptions, options: LoaderOptions) -> Self {
        Self {
            connect_options,
            options,
        }
    }

    /// Upsert every row of `table`. Failures are logged and reported in the
    /// returned status, never raised.
    pub async fn load(&self, target: &TableTarget, table: &SurveyTable) -> LoadStatus {
        let span = info_span!(
            "warehouse_load",
            table = %target.qualified_name(),
            rows = table.len()
        );
        self.load_inner(target, table).instrument(span).await
    }

    async fn load_inner(&self, target: &TableTarget, table: &SurveyTable) -> LoadStatus {
        let statements = match build_statements(target, table) {
            Ok(statements) => statements,
            Err((row, err)) => {
                error!(row, error = %err, "row does not match declared columns; nothing loaded");
                return LoadStatus::Rejected {
                    row,
                    error: err.to_string(),
                };
            }
        };

        let mut conn = match self.connect().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = %err, "could not connect to warehouse");
                return LoadStatus::ConnectionFailed { error: err };
            }
        };

        let status = self.upsert_all(&mut conn, target, &statements).await;

        if let Err(err) = conn.close().await {
            warn!(error = %err, "closing warehouse connection");
        }
        status
    }

    async fn connect(&self) -> Result<PgConnection, String> {
        match tokio::time::timeout(
            self.options.connect_timeout,
            PgConnection::connect_with(&self.connect_options),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "timed out after {}s",
                self.options.connect_timeout.as_secs()
            )),
        }
    }

    async fn upsert_all(
        &self,
        conn: &mut PgConnection,
        target: &TableTarget,
        statements: &[UpsertStatement],
    ) -> LoadStatus {
        match sqlx::query(&probe_sql(target)).fetch_optional(&mut *conn).await {
            Ok(_) => info!("target table is reachable"),
            Err(err) => {
                error!(error = %err, "target table probe failed");
                if self.options.probe_policy == ProbePolicy::FailFast {
                    return LoadStatus::ProbeFailed {
                        error: err.to_string(),
                    };
                }
                warn!("probe policy is warn; attempting load anyway");
            }
        }

        for (index, statement) in statements.iter().enumerate() {
            if let Err(err) = statement.query().execute(&mut *conn).await {
                error!(row = index, error = %err, "upsert failed; remaining rows skipped");
                return LoadStatus::Aborted {
                    committed: index,
                    failed_row: index,
                    error: err.to_string(),
                };
            }
        }

        info!(rows = statements.len(), "upserted rows");
        LoadStatus::Loaded {
            rows: statements.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agol_core::{ColumnType, Secret, SurveySchema};
    use chrono::NaiveDate;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    fn target() -> TableTarget {
        TableTarget {
            schema: "surveys".into(),
            table: "water_quality".into(),
            prim_key: "id".into(),
            update_col: "value".into(),
        }
    }

    fn row() -> TypedRow {
        TypedRow::new()
            .with("id", Cell::Int64(Some(1)))
            .with("value", Cell::Float64(Some(2.5)))
            .with(
                "date_collected",
                Cell::Date(NaiveDate::from_ymd_opt(2023, 11, 14)),
            )
    }

    const COLUMNS: [&str; 3] = ["id", "value", "date_collected"];

    #[test]
    fn upsert_has_single_conflict_and_set_clause() {
        let stmt = UpsertStatement::build(&target(), &COLUMNS, &row()).expect("statement");
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"surveys\".\"water_quality\" (\"id\", \"value\", \"date_collected\") \
             VALUES ($1, $2, $3) ON CONFLICT (\"id\") DO UPDATE SET \"value\" = EXCLUDED.\"value\""
        );
        assert_eq!(stmt.sql.matches("ON CONFLICT").count(), 1);
        assert_eq!(stmt.sql.matches(" SET ").count(), 1);
        assert!(stmt.sql.contains("ON CONFLICT (\"id\")"));
        assert!(stmt.sql.contains("SET \"value\" ="));
    }

    #[test]
    fn params_follow_declared_column_order() {
        let columns = ["date_collected", "id", "value"];
        let stmt = UpsertStatement::build(&target(), &columns, &row()).expect("statement");
        assert_eq!(
            stmt.params,
            vec![
                Cell::Date(NaiveDate::from_ymd_opt(2023, 11, 14)),
                Cell::Int64(Some(1)),
                Cell::Float64(Some(2.5)),
            ]
        );
    }

    #[test]
    fn mismatched_rows_are_rejected() {
        let mut short = row();
        short.cells.remove("date_collected");
        assert_eq!(
            UpsertStatement::build(&target(), &COLUMNS, &short),
            Err(UpsertError::MissingColumn("date_collected".into()))
        );

        let extra = row().with("notes", Cell::String(None));
        assert_eq!(
            UpsertStatement::build(&target(), &COLUMNS, &extra),
            Err(UpsertError::UndeclaredColumn("notes".into()))
        );

        let mut bad_key = target();
        bad_key.prim_key = "objectid".into();
        assert_eq!(
            UpsertStatement::build(&bad_key, &COLUMNS, &row()),
            Err(UpsertError::UnknownPrimaryKey("objectid".into()))
        );

        let mut bad_update = target();
        bad_update.update_col = "ph".into();
        assert_eq!(
            UpsertStatement::build(&bad_update, &COLUMNS, &row()),
            Err(UpsertError::UnknownUpdateColumn("ph".into()))
        );
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("site"), "\"site\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
        assert_eq!(
            probe_sql(&target()),
            "SELECT * FROM \"surveys\".\"water_quality\" LIMIT 1"
        );
    }

    fn table() -> SurveyTable {
        SurveyTable {
            schema: SurveySchema::new(vec![
                ("id".into(), ColumnType::Int64),
                ("value".into(), ColumnType::Float64),
                ("date_collected".into(), ColumnType::Date),
            ]),
            rows: vec![row()],
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().expect("lock")).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .with_writer(logs.clone())
            .finish();
        (logs, tracing::subscriber::set_default(subscriber))
    }

    fn unreachable_loader() -> WarehouseLoader {
        let creds = DbCredentials {
            user: "etl".into(),
            host: "127.0.0.1".into(),
            password: Secret::new("not-used"),
            port: Some(1),
        };
        WarehouseLoader::new(
            connect_options(&creds, "warehouse", 5432),
            LoaderOptions {
                probe_policy: ProbePolicy::FailFast,
                connect_timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn connection_failure_is_reported_and_logged() {
        let (logs, _guard) = capture_logs();
        let status = unreachable_loader().load(&target(), &table()).await;
        assert!(matches!(status, LoadStatus::ConnectionFailed { .. }));
        assert_eq!(status.committed(), 0);
        assert!(!status.is_success());

        let logged = logs.contents();
        assert!(logged.contains("ERROR"));
        assert!(logged.contains("could not connect to warehouse"));
        assert!(!logged.contains("not-used"));
    }

    #[tokio::test]
    async fn invalid_rows_are_rejected_before_connecting() {
        let mut table = table();
        table.rows.push(TypedRow::new().with("id", Cell::Int64(Some(2))));
        let status = unreachable_loader().load(&target(), &table).await;
        assert!(matches!(status, LoadStatus::Rejected { row: 1, .. }));
    }
}
