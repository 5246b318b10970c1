//! Raw artifact storage + authenticated HTTP fetch for AGOL survey layers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agol_core::Secret;
use anyhow::Context;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "agol-storage";

#[derive(Debug, Clone)]
pub struct StoredRaw {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Dated raw JSON dumps, one file per survey per run date.
#[derive(Debug, Clone)]
pub struct RawStore {
    root: PathBuf,
}

impl RawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn raw_path(&self, survey: &str, run_date: NaiveDate) -> PathBuf {
        self.root.join(format!("{survey}_{}.json", run_date.format("%Y-%m-%d")))
    }

    /// Write the response as pretty JSON via temp file + atomic rename. A file
    /// from an earlier run on the same date is replaced.
    pub async fn persist(
        &self,
        survey: &str,
        run_date: NaiveDate,
        body: &JsonValue,
    ) -> anyhow::Result<StoredRaw> {
        let bytes = pretty_json(body).context("serializing raw response")?;
        let path = self.raw_path(survey, run_date);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating raw directory {}", self.root.display()))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp raw file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp raw file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp raw file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp raw file {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredRaw {
            content_hash: Self::sha256_hex(&bytes),
            byte_size: bytes.len(),
            path,
        })
    }
}

/// Four-space indented JSON, the layout raw dumps have always used.
fn pretty_json(body: &JsonValue) -> serde_json::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    body.serialize(&mut serializer)?;
    Ok(buf)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedJson {
    pub status: StatusCode,
    pub body: JsonValue,
    pub byte_size: usize,
}

/// Fetch failures. `Request` errors have their URL stripped because the query
/// string carries the API token.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(reqwest::Error),
    #[error("http status {status}")]
    HttpStatus { status: u16 },
    #[error("response body is not json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("service error {code:?}: {message}")]
    Api { code: Option<i64>, message: String },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.without_url())
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// One `GET <url>?f=pjson&token=<token>`. Anything but a 200 carrying a
    /// JSON document without a top-level `error` object is a failure.
    pub async fn fetch_json(&self, url: &str, token: &Secret) -> Result<FetchedJson, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let resp = self
                .client
                .get(url)
                .query(&[("f", "pjson"), ("token", token.expose())])
                .send()
                .await?;

            let status = resp.status();
            if status != StatusCode::OK {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                });
            }

            let bytes = resp.bytes().await?;
            let body: JsonValue = serde_json::from_slice(&bytes)?;
            if let Some(err) = api_error(&body) {
                return Err(err);
            }

            info!(bytes = bytes.len(), "fetched layer");
            Ok(FetchedJson {
                status,
                body,
                byte_size: bytes.len(),
            })
        }
        .instrument(span)
        .await
    }
}

/// AGOL answers bad tokens and missing layers with a 200 and an `error` object.
fn api_error(body: &JsonValue) -> Option<FetchError> {
    let err = body.get("error")?.as_object()?;
    let code = err.get("code").and_then(JsonValue::as_i64);
    let message = err
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or("unknown error")
        .to_string();
    Some(FetchError::Api { code, message })
}
