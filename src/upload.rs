/// Push one day's counters for one workstation to the aggregation service.
///
/// Outcomes: 200 is `Success`, 401 is `Unauthorized` (the caller stops
/// uploading), anything else including transport errors is `Retryable`.
/// There is no internal retry; the next pass uploads the latest totals again.
use crate::config::{TrackerConfig, UploadConfig};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Longest response body kept in the upload log.
const MAX_RESPONSE_CHARS: usize = 200;

/// Result of one upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    Retryable,
    Unauthorized,
}

/// Where and as whom to upload.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub endpoint: String,
    pub route: String,
    pub secret: Option<String>,
    pub workstation_id: String,
    pub total_field: String,
    pub timeout: Duration,
}

impl UploadTarget {
    pub fn url(&self) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), self.route)
    }

    /// JSON body for one day: counters flattened beside the key fields.
    pub fn payload(&self, day: &str, counters: &BTreeMap<String, u64>, total: u64) -> Value {
        let mut body = Map::new();
        body.insert("day".into(), Value::from(day));
        body.insert(
            "workstation_id".into(),
            Value::from(self.workstation_id.as_str()),
        );
        for (name, n) in counters {
            body.insert(name.clone(), Value::from(*n));
        }
        body.insert(self.total_field.clone(), Value::from(total));
        if let Some(ref secret) = self.secret {
            body.insert("secret".into(), Value::from(secret.as_str()));
        }
        Value::Object(body)
    }
}

/// One line of the upload audit trail.
#[derive(Debug, Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    url: &'a str,
    data: Value,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Daily-rotated JSON-lines record of every upload attempt.
pub struct UploadLog {
    writer: Option<RollingFileAppender>,
}

impl UploadLog {
    /// Open `<dir>/<tracker>-uploads.<date>.log`, keeping `max_files` days.
    pub fn open(dir: &Path, tracker: &str, max_files: usize) -> Result<Self, UploadError> {
        std::fs::create_dir_all(dir).map_err(UploadError::LogDir)?;
        let writer = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(format!("{tracker}-uploads"))
            .filename_suffix("log")
            .max_log_files(max_files.max(1))
            .build(dir)
            .map_err(UploadError::Log)?;
        Ok(Self {
            writer: Some(writer),
        })
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    fn append(&mut self, entry: &LogEntry<'_>) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let line = match serde_json::to_string(entry) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode upload log entry");
                return;
            }
        };
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            tracing::warn!(error = %e, "failed to write upload log");
        }
    }
}

impl std::fmt::Debug for UploadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadLog")
            .field("enabled", &self.writer.is_some())
            .finish()
    }
}

/// HTTP client bound to one target and its upload log.
#[derive(Debug)]
pub struct UploadClient {
    http: reqwest::Client,
    target: UploadTarget,
    log: UploadLog,
}

impl UploadClient {
    pub fn new(target: UploadTarget, log: UploadLog) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(target.timeout)
            .build()
            .map_err(UploadError::Client)?;
        Ok(Self { http, target, log })
    }

    /// Client for `tracker`, or `None` when no endpoint is configured.
    pub fn for_tracker(
        tracker: &TrackerConfig,
        upload: &UploadConfig,
        workstation_id: &str,
    ) -> Result<Option<Self>, UploadError> {
        let Some(ref endpoint) = upload.endpoint else {
            return Ok(None);
        };
        let target = UploadTarget {
            endpoint: endpoint.clone(),
            route: tracker.route.clone(),
            secret: upload.secret.clone(),
            workstation_id: workstation_id.to_string(),
            total_field: tracker.total_field.clone(),
            timeout: Duration::from_secs(upload.timeout_secs.max(1)),
        };
        let log = UploadLog::open(&upload.log_dir, &tracker.name, upload.retention_days)?;
        Self::new(target, log).map(Some)
    }

    pub fn target(&self) -> &UploadTarget {
        &self.target
    }

    /// Upload one day's counters and total. Never errors; see `UploadOutcome`.
    pub async fn upload(
        &mut self,
        day: &str,
        counters: &BTreeMap<String, u64>,
        total: u64,
    ) -> UploadOutcome {
        let url = self.target.url();
        let body = self.target.payload(day, counters, total);

        let mut logged = body.clone();
        if let Value::Object(ref mut map) = logged {
            map.remove("secret");
        }
        let mut entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            url: &url,
            data: logged,
            status: String::new(),
            response: None,
            error: None,
        };

        let outcome = match self.http.post(&url).json(&body).send().await {
            Ok(resp) => {
                let code = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                entry.response = Some(truncate(&text));
                match code {
                    200 => {
                        entry.status = "success".to_string();
                        tracing::debug!(day, url = %url, "upload succeeded");
                        UploadOutcome::Success
                    }
                    401 => {
                        entry.status = "unauthorized".to_string();
                        tracing::error!(
                            url = %url,
                            "upload rejected with 401, check the configured secret"
                        );
                        UploadOutcome::Unauthorized
                    }
                    other => {
                        entry.status = format!("error_http_{other}");
                        tracing::warn!(day, url = %url, status = other, "upload failed");
                        UploadOutcome::Retryable
                    }
                }
            }
            Err(e) => {
                entry.status = "error_exception".to_string();
                entry.error = Some(e.to_string());
                tracing::warn!(day, url = %url, error = %e, "upload failed");
                UploadOutcome::Retryable
            }
        };

        self.log.append(&entry);
        outcome
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(MAX_RESPONSE_CHARS).collect()
}

/// Errors setting up an upload client.
#[derive(Debug)]
pub enum UploadError {
    Client(reqwest::Error),
    LogDir(std::io::Error),
    Log(tracing_appender::rolling::InitError),
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::Client(e) => write!(f, "failed to build HTTP client: {e}"),
            UploadError::LogDir(e) => write!(f, "failed to create upload log directory: {e}"),
            UploadError::Log(e) => write!(f, "failed to open upload log: {e}"),
        }
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UploadError::Client(e) => Some(e),
            UploadError::LogDir(e) => Some(e),
            UploadError::Log(e) => Some(e),
        }
    }
}
