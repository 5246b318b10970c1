//! ETL run orchestration: fetch -> transform -> load, one survey at a time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agol_core::{
    ColumnType, DbCredentials, EtlConfig, Secret, SinkMode, SurveyConfig, SurveySchema, SurveyTable,
    ENV_TOKEN,
};
use agol_storage::{HttpClientConfig, HttpFetcher, RawStore, StoredRaw};
use agol_transform::{build_schema, processed_path, read_parquet, transform_survey, write_parquet};
use agol_warehouse::{connect_options, LoadStatus, LoaderOptions, TableTarget, WarehouseLoader};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "agol-sync";

pub const USER_AGENT: &str = concat!("agol-etl/", env!("CARGO_PKG_VERSION"));

/// Parse a YAML configuration. `token_override` replaces the file's token.
pub fn parse_config(text: &str, token_override: Option<String>) -> Result<EtlConfig> {
    let mut config: EtlConfig = serde_yaml::from_str(text).context("parsing etl configuration")?;
    if let Some(token) = token_override.filter(|t| !t.trim().is_empty()) {
        config.token = Secret::new(token);
    }
    Ok(config)
}

pub async fn load_config(path: &Path) -> Result<EtlConfig> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_config(&text, std::env::var(ENV_TOKEN).ok())
        .with_context(|| format!("loading {}", path.display()))
}

/// Everything a run needs, built once at startup and passed to each stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub config: EtlConfig,
    pub credentials: Option<DbCredentials>,
    pub workspace_root: PathBuf,
}

impl RunContext {
    pub fn new(
        config: EtlConfig,
        credentials: Option<DbCredentials>,
        run_date: NaiveDate,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            run_date,
            config,
            credentials,
            workspace_root: workspace_root.into(),
        }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.workspace_root.join(&self.config.raw_dir)
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.workspace_root.join(&self.config.processed_dir)
    }

    pub fn processed_path(&self, survey: &SurveyConfig) -> PathBuf {
        processed_path(&self.processed_dir(), &survey.name, self.run_date)
    }

    pub fn table_target(&self, survey: &SurveyConfig) -> TableTarget {
        TableTarget {
            schema: self.config.schema.clone(),
            table: survey.table_name.clone(),
            prim_key: survey.prim_key.clone(),
            update_col: survey.update_col.clone(),
        }
    }
}

/// Column layout of a survey after transformation.
pub fn transformed_schema(survey: &SurveyConfig) -> SurveySchema {
    build_schema(survey).with_column_type(&survey.date_column, ColumnType::Date)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stages {
    All,
    FetchOnly,
    /// Reads the run date's raw file and writes the Parquet file.
    TransformOnly,
    /// Loads the run date's Parquet file.
    LoadOnly,
}

impl Stages {
    fn loads(self) -> bool {
        matches!(self, Self::All | Self::LoadOnly)
    }
}

#[derive(Debug, Clone)]
pub struct SinkReport {
    pub staged_path: Option<PathBuf>,
    pub load: LoadStatus,
}

/// Destination of a transformed table.
#[async_trait]
pub trait SurveySink: Send + Sync {
    fn mode(&self) -> SinkMode;

    async fn deliver(
        &self,
        ctx: &RunContext,
        survey: &SurveyConfig,
        table: SurveyTable,
    ) -> Result<SinkReport>;
}

/// Writes Parquet, then loads the staged file.
pub struct StagedParquetSink {
    loader: WarehouseLoader,
}

impl StagedParquetSink {
    pub fn new(loader: WarehouseLoader) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl SurveySink for StagedParquetSink {
    fn mode(&self) -> SinkMode {
        SinkMode::Staged
    }

    async fn deliver(
        &self,
        ctx: &RunContext,
        survey: &SurveyConfig,
        table: SurveyTable,
    ) -> Result<SinkReport> {
        let path = ctx.processed_path(survey);
        write_parquet(&path, &table)?;
        info!(path = %path.display(), rows = table.len(), "staged parquet");
        let staged = read_parquet(&path, &table.schema)?;
        let load = self.loader.load(&ctx.table_target(survey), &staged).await;
        Ok(SinkReport {
            staged_path: Some(path),
            load,
        })
    }
}

/// Loads the in-memory table; nothing is written to disk.
pub struct DirectSink {
    loader: WarehouseLoader,
}

impl DirectSink {
    pub fn new(loader: WarehouseLoader) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl SurveySink for DirectSink {
    fn mode(&self) -> SinkMode {
        SinkMode::Direct
    }

    async fn deliver(
        &self,
        ctx: &RunContext,
        survey: &SurveyConfig,
        table: SurveyTable,
    ) -> Result<SinkReport> {
        let load = self.loader.load(&ctx.table_target(survey), &table).await;
        Ok(SinkReport {
            staged_path: None,
            load,
        })
    }
}

pub fn sink_for(mode: SinkMode, loader: WarehouseLoader) -> Box<dyn SurveySink> {
    match mode {
        SinkMode::Staged => Box::new(StagedParquetSink::new(loader)),
        SinkMode::Direct => Box::new(DirectSink::new(loader)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SurveyStatus {
    Fetched,
    Staged,
    Loaded,
    FetchFailed,
    TransformFailed,
    LoadFailed,
    PartiallyLoaded,
}

impl SurveyStatus {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::FetchFailed | Self::TransformFailed | Self::LoadFailed | Self::PartiallyLoaded
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SurveyOutcome {
    pub survey: String,
    pub status: SurveyStatus,
    pub rows: usize,
    pub committed: usize,
    pub raw_path: Option<PathBuf>,
    pub staged_path: Option<PathBuf>,
    pub detail: Option<String>,
}

impl SurveyOutcome {
    fn new(survey: &str) -> Self {
        Self {
            survey: survey.to_string(),
            status: SurveyStatus::Fetched,
            rows: 0,
            committed: 0,
            raw_path: None,
            staged_path: None,
            detail: None,
        }
    }

    fn finish(mut self, status: SurveyStatus) -> Self {
        self.status = status;
        self
    }

    fn fail(mut self, status: SurveyStatus, detail: impl ToString) -> Self {
        self.status = status;
        self.detail = Some(detail.to_string());
        self
    }

    fn with_load(mut self, load: LoadStatus) -> Self {
        self.committed = load.committed();
        match load {
            LoadStatus::Loaded { .. } => self.finish(SurveyStatus::Loaded),
            LoadStatus::Aborted {
                failed_row, error, ..
            } if self.committed > 0 => self.fail(
                SurveyStatus::PartiallyLoaded,
                format!("row {failed_row}: {error}"),
            ),
            LoadStatus::Aborted {
                failed_row, error, ..
            } => self.fail(SurveyStatus::LoadFailed, format!("row {failed_row}: {error}")),
            LoadStatus::Rejected { row, error } => {
                self.fail(SurveyStatus::LoadFailed, format!("row {row}: {error}"))
            }
            LoadStatus::ConnectionFailed { error } => {
                self.fail(SurveyStatus::LoadFailed, format!("connection: {error}"))
            }
            LoadStatus::ProbeFailed { error } => {
                self.fail(SurveyStatus::LoadFailed, format!("table probe: {error}"))
            }
        }
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{}: {:?} rows={} committed={}",
            self.survey, self.status, self.rows, self.committed
        );
        if let Some(detail) = &self.detail {
            line.push_str(&format!(" ({detail})"));
        }
        line
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub surveys: Vec<SurveyOutcome>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.surveys.iter().any(|s| s.status.is_failure())
    }
}

pub struct EtlPipeline {
    ctx: RunContext,
    raw_store: RawStore,
    http: HttpFetcher,
    loader: Option<WarehouseLoader>,
    sink: Option<Box<dyn SurveySink>>,
}

impl EtlPipeline {
    pub fn new(ctx: RunContext) -> Result<Self> {
        let raw_store = RawStore::new(ctx.raw_dir());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(ctx.config.http_timeout_secs),
            user_agent: Some(USER_AGENT.to_string()),
        })?;
        let loader = ctx.credentials.as_ref().map(|credentials| {
            WarehouseLoader::new(
                connect_options(credentials, &ctx.config.db_name, ctx.config.db_port),
                LoaderOptions {
                    probe_policy: ctx.config.probe_policy,
                    connect_timeout: Duration::from_secs(ctx.config.db_connect_timeout_secs),
                },
            )
        });
        let sink = loader
            .clone()
            .map(|loader| sink_for(ctx.config.sink, loader));
        Ok(Self {
            ctx,
            raw_store,
            http,
            loader,
            sink,
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn SurveySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Run the selected stages for every configured survey (or only the named
    /// ones). A failing survey is logged and recorded; later surveys still run.
    pub async fn run(&self, stages: Stages, only: &[String]) -> Result<RunSummary> {
        let surveys = self.selected_surveys(only)?;
        if stages.loads() {
            let ready = match stages {
                Stages::LoadOnly => self.loader.is_some(),
                _ => self.sink.is_some(),
            };
            if !ready {
                bail!(
                    "warehouse credentials are required to load; \
                     set AGOL_DW_USER, AGOL_DW_HOST and AGOL_DW_PASSWORD"
                );
            }
        }

        let started_at = Utc::now();
        info!(
            run_id = %self.ctx.run_id,
            run_date = %self.ctx.run_date,
            surveys = surveys.len(),
            ?stages,
            "--------------- AGOL survey ETL run ---------------"
        );

        let mut outcomes = Vec::with_capacity(surveys.len());
        for survey in surveys {
            let span = info_span!("survey", run_id = %self.ctx.run_id, survey = %survey.name);
            let outcome = self.run_survey(survey, stages).instrument(span).await;
            if outcome.status.is_failure() {
                error!(
                    survey = %outcome.survey,
                    status = ?outcome.status,
                    detail = ?outcome.detail,
                    "survey failed"
                );
            } else {
                info!(
                    survey = %outcome.survey,
                    status = ?outcome.status,
                    rows = outcome.rows,
                    "survey finished"
                );
            }
            outcomes.push(outcome);
        }

        Ok(RunSummary {
            run_id: self.ctx.run_id,
            run_date: self.ctx.run_date,
            started_at,
            finished_at: Utc::now(),
            surveys: outcomes,
        })
    }

    fn selected_surveys(&self, only: &[String]) -> Result<Vec<&SurveyConfig>> {
        if let Some(unknown) = only.iter().find(|name| self.ctx.config.survey(name).is_none()) {
            bail!("survey `{unknown}` is not configured");
        }
        Ok(self
            .ctx
            .config
            .surveys
            .iter()
            .filter(|s| only.is_empty() || only.contains(&s.name))
            .collect())
    }

    async fn run_survey(&self, survey: &SurveyConfig, stages: Stages) -> SurveyOutcome {
        let mut outcome = SurveyOutcome::new(&survey.name);

        if matches!(stages, Stages::All | Stages::FetchOnly) {
            match self.fetch(survey).await {
                Ok(stored) => outcome.raw_path = Some(stored.path),
                Err(err) => return outcome.fail(SurveyStatus::FetchFailed, format!("{err:#}")),
            }
            if stages == Stages::FetchOnly {
                return outcome.finish(SurveyStatus::Fetched);
            }
        }

        if stages == Stages::LoadOnly {
            return self.load_staged(survey, outcome).await;
        }

        let raw_path = self.raw_store.raw_path(&survey.name, self.ctx.run_date);
        outcome.raw_path = Some(raw_path.clone());
        let table = match transform_survey(survey, &raw_path) {
            Ok(table) => table,
            Err(err) => return outcome.fail(SurveyStatus::TransformFailed, err),
        };
        outcome.rows = table.len();
        info!(rows = table.len(), "transformed survey");

        if stages == Stages::TransformOnly {
            let path = self.ctx.processed_path(survey);
            return match write_parquet(&path, &table) {
                Ok(()) => {
                    outcome.staged_path = Some(path);
                    outcome.finish(SurveyStatus::Staged)
                }
                Err(err) => outcome.fail(SurveyStatus::TransformFailed, format!("{err:#}")),
            };
        }

        let Some(sink) = &self.sink else {
            return outcome.fail(SurveyStatus::LoadFailed, "no sink configured");
        };
        info!(sink = ?sink.mode(), "delivering table");
        match sink.deliver(&self.ctx, survey, table).await {
            Ok(report) => {
                outcome.staged_path = report.staged_path;
                outcome.with_load(report.load)
            }
            Err(err) => outcome.fail(SurveyStatus::LoadFailed, format!("{err:#}")),
        }
    }

    async fn fetch(&self, survey: &SurveyConfig) -> Result<StoredRaw> {
        let fetched = match self.http.fetch_json(&survey.url, &self.ctx.config.token).await {
            Ok(fetched) => fetched,
            Err(err) => {
                error!(survey = %survey.name, error = %err, "fetch failed; nothing saved");
                return Err(err).with_context(|| format!("querying {}", survey.name));
            }
        };
        info!(status = %fetched.status, bytes = fetched.byte_size, "layer response received");
        let stored = self
            .raw_store
            .persist(&survey.name, self.ctx.run_date, &fetched.body)
            .await?;
        info!(
            path = %stored.path.display(),
            sha256 = %stored.content_hash,
            bytes = stored.byte_size,
            "saved raw response"
        );
        Ok(stored)
    }

    async fn load_staged(
        &self,
        survey: &SurveyConfig,
        mut outcome: SurveyOutcome,
    ) -> SurveyOutcome {
        let Some(loader) = &self.loader else {
            return outcome.fail(SurveyStatus::LoadFailed, "no warehouse credentials");
        };
        let path = self.ctx.processed_path(survey);
        let table = match read_parquet(&path, &transformed_schema(survey)) {
            Ok(table) => table,
            Err(err) => {
                warn!(path = %path.display(), "staged file unusable");
                return outcome.fail(SurveyStatus::LoadFailed, format!("{err:#}"));
            }
        };
        outcome.rows = table.len();
        outcome.staged_path = Some(path);
        let load = loader.load(&self.ctx.table_target(survey), &table).await;
        outcome.with_load(load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use agol_core::Cell;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use tempfile::tempdir;
    use tracing_subscriber::fmt::MakeWriter;

    fn config_yaml(base: &str) -> String {
        format!(
            r#"
token: file-token
db_name: warehouse
schema: surveys
sink: direct
surveys:
  water_quality:
    url: {base}/water
    table_name: water_quality
    prim_key: id
    update_col: value
    schema:
      id: int64
      value: float64
      date_collected: int64
  litter:
    url: {base}/litter
    table_name: litter
    prim_key: id
    update_col: bags
    schema:
      id: int64
      bags: int64
      date_collected: int64
"#
        )
    }

    async fn spawn_server() -> String {
        let router = Router::new()
            .route(
                "/water",
                get(|| async {
                    Json(json!({
                        "features": [
                            {"attributes": {"id": 1, "value": 2.5, "date_collected": 1700000000000i64}},
                            {"attributes": {"id": 2, "value": 3.0, "date_collected": 1700100000000i64}}
                        ]
                    }))
                }),
            )
            .route(
                "/litter",
                get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn context(base: &str, root: &Path) -> RunContext {
        let config = parse_config(&config_yaml(base), None).expect("config");
        RunContext::new(
            config,
            None,
            NaiveDate::from_ymd_opt(2024, 5, 9).expect("date"),
            root,
        )
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

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(String, SurveyTable)>>,
    }

    #[async_trait]
    impl SurveySink for Arc<RecordingSink> {
        fn mode(&self) -> SinkMode {
            SinkMode::Direct
        }

        async fn deliver(
            &self,
            _ctx: &RunContext,
            survey: &SurveyConfig,
            table: SurveyTable,
        ) -> Result<SinkReport> {
            let rows = table.len();
            self.delivered
                .lock()
                .expect("lock")
                .push((survey.name.clone(), table));
            Ok(SinkReport {
                staged_path: None,
                load: LoadStatus::Loaded { rows },
            })
        }
    }

    #[test]
    fn token_override_replaces_file_token() {
        let config =
            parse_config(&config_yaml("http://x"), Some("env-token".into())).expect("config");
        assert_eq!(config.token.expose(), "env-token");
        let config = parse_config(&config_yaml("http://x"), Some("  ".into())).expect("config");
        assert_eq!(config.token.expose(), "file-token");
        assert_eq!(config.sink, SinkMode::Direct);
    }

    #[tokio::test]
    async fn fetch_failure_does_not_stop_later_surveys() {
        let (logs, _guard) = capture_logs();
        let dir = tempdir().expect("tempdir");
        let base = spawn_server().await;
        let ctx = context(&base, dir.path());
        let pipeline = EtlPipeline::new(ctx).expect("pipeline");

        let summary = pipeline.run(Stages::FetchOnly, &[]).await.expect("run");
        let statuses: Vec<_> = summary.surveys.iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![SurveyStatus::Fetched, SurveyStatus::FetchFailed]);
        assert!(summary.has_failures());

        let raw_dir = dir.path().join("raw_data");
        assert!(raw_dir.join("water_quality_2024-05-09.json").exists());
        assert!(!raw_dir.join("litter_2024-05-09.json").exists());
        assert!(summary.surveys[1]
            .detail
            .as_deref()
            .is_some_and(|d| d.contains("503")));

        let logged = logs.contents();
        let failure = logged
            .lines()
            .find(|line| line.contains("fetch failed"))
            .expect("fetch failure logged");
        assert!(failure.contains("ERROR"));
        assert!(failure.contains("survey=litter"));
        assert!(failure.contains("503"));
        assert!(!logged.contains("file-token"));
    }

    #[tokio::test]
    async fn full_run_hands_typed_table_to_sink() {
        let dir = tempdir().expect("tempdir");
        let base = spawn_server().await;
        let sink = Arc::new(RecordingSink::default());
        let pipeline = EtlPipeline::new(context(&base, dir.path()))
            .expect("pipeline")
            .with_sink(Box::new(sink.clone()));

        let summary = pipeline
            .run(Stages::All, &["water_quality".to_string()])
            .await
            .expect("run");
        assert_eq!(summary.surveys.len(), 1);
        assert_eq!(summary.surveys[0].status, SurveyStatus::Loaded);
        assert_eq!(summary.surveys[0].committed, 2);
        assert!(!summary.has_failures());

        let delivered = sink.delivered.lock().expect("lock");
        let (name, table) = &delivered[0];
        assert_eq!(name, "water_quality");
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.rows[1].get("date_collected"),
            Some(&Cell::Date(NaiveDate::from_ymd_opt(2023, 11, 16)))
        );
    }

    #[tokio::test]
    async fn transform_only_stages_parquet_and_isolates_bad_surveys() {
        let dir = tempdir().expect("tempdir");
        let ctx = context("http://unused", dir.path());
        let raw_dir = ctx.raw_dir();
        std::fs::create_dir_all(&raw_dir).expect("raw dir");
        std::fs::write(
            raw_dir.join("water_quality_2024-05-09.json"),
            r#"{"features": [{"attributes": {"id": 1, "value": 1.5, "date_collected": 0}}]}"#,
        )
        .expect("write water");
        std::fs::write(
            raw_dir.join("litter_2024-05-09.json"),
            r#"{"features": [{"attributes": {"id": 1, "date_collected": 0}}]}"#,
        )
        .expect("write litter");

        let pipeline = EtlPipeline::new(ctx).expect("pipeline");
        let summary = pipeline.run(Stages::TransformOnly, &[]).await.expect("run");

        assert_eq!(summary.surveys[0].status, SurveyStatus::Staged);
        assert_eq!(summary.surveys[0].rows, 1);
        let staged = summary.surveys[0].staged_path.clone().expect("staged path");
        assert!(staged.ends_with("processed_data/water_quality_2024-05-09.parquet"));
        let schema = transformed_schema(&pipeline.context().config.surveys[0]);
        let table = read_parquet(&staged, &schema).expect("read staged");
        assert_eq!(table.len(), 1);

        assert_eq!(summary.surveys[1].status, SurveyStatus::TransformFailed);
        assert!(summary.surveys[1]
            .detail
            .as_deref()
            .is_some_and(|d| d.contains("bags")));
    }

    #[tokio::test]
    async fn loading_without_credentials_is_refused() {
        let dir = tempdir().expect("tempdir");
        let pipeline = EtlPipeline::new(context("http://unused", dir.path())).expect("pipeline");
        assert!(pipeline.run(Stages::All, &[]).await.is_err());
        assert!(pipeline.run(Stages::LoadOnly, &[]).await.is_err());
    }

    #[tokio::test]
    async fn unknown_survey_filter_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let pipeline = EtlPipeline::new(context("http://unused", dir.path())).expect("pipeline");
        let err = pipeline
            .run(Stages::FetchOnly, &["nope".to_string()])
            .await
            .expect_err("unknown survey");
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn sink_follows_configured_mode() {
        let creds = DbCredentials {
            user: "etl".into(),
            host: "localhost".into(),
            password: Secret::new("pw"),
            port: None,
        };
        let loader = WarehouseLoader::new(
            connect_options(&creds, "warehouse", 5432),
            LoaderOptions::default(),
        );
        assert_eq!(sink_for(SinkMode::Staged, loader.clone()).mode(), SinkMode::Staged);
        assert_eq!(sink_for(SinkMode::Direct, loader).mode(), SinkMode::Direct);
    }

    #[test]
    fn partial_loads_are_failures() {
        let outcome = SurveyOutcome::new("litter").with_load(LoadStatus::Aborted {
            committed: 3,
            failed_row: 3,
            error: "value too long".into(),
        });
        assert_eq!(outcome.status, SurveyStatus::PartiallyLoaded);
        assert_eq!(outcome.committed, 3);
        assert!(outcome.summary_line().contains("row 3: value too long"));

        let outcome = SurveyOutcome::new("litter").with_load(LoadStatus::ConnectionFailed {
            error: "refused".into(),
        });
        assert_eq!(outcome.status, SurveyStatus::LoadFailed);
    }
}
