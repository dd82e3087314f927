/// One tracker's poll loop: scan, persist, announce, upload, sleep.
///
/// A `Tracker` owns all of its mutable state (matcher, counter store, upload
/// client). Several trackers run side by side as separate tokio tasks; the
/// only value they share is the read-only `Shutdown` flag.
use crate::config::{TrackerConfig, WatchConfig};
use crate::extract::{day_key, utc_today};
use crate::patterns::{PatternError, PatternMatcher};
use crate::scan::{ScanReport, Scanner};
use crate::signals::Shutdown;
use crate::store::{CounterStore, StoreError};
use crate::upload::{UploadClient, UploadOutcome};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

pub struct Tracker {
    config: TrackerConfig,
    projects_dir: PathBuf,
    poll_interval: Duration,
    matcher: PatternMatcher,
    store: CounterStore,
    client: Option<UploadClient>,
    /// Days whose latest counters have not reached the server yet.
    pending: BTreeSet<String>,
}

impl Tracker {
    /// Compile patterns and open (and lock) the tracker's counter store.
    pub fn new(
        config: TrackerConfig,
        watch: &WatchConfig,
        client: Option<UploadClient>,
    ) -> Result<Self, TrackerError> {
        let matcher = PatternMatcher::new(&config.patterns, &config.filtered, config.filter_mode)
            .map_err(TrackerError::Pattern)?;
        let store = CounterStore::open(&config.data_dir(watch), &matcher.names())
            .map_err(TrackerError::Store)?;

        Ok(Self {
            config,
            projects_dir: watch.projects_dir.clone(),
            poll_interval: Duration::from_secs(watch.poll_interval_secs.max(1)),
            matcher,
            store,
            client,
            pending: BTreeSet::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn uploads_enabled(&self) -> bool {
        self.client.is_some()
    }

    pub fn store(&self) -> &CounterStore {
        &self.store
    }

    pub fn pending_days(&self) -> &BTreeSet<String> {
        &self.pending
    }

    /// Poll until `shutdown` is requested. A pass in progress always completes.
    pub async fn run(mut self, shutdown: Shutdown) -> Result<(), TrackerError> {
        tracing::info!(
            tracker = %self.config.name,
            projects_dir = %self.projects_dir.display(),
            data_dir = %self.store.dir().display(),
            interval_secs = self.poll_interval.as_secs(),
            uploads = self.client.is_some(),
            "tracker started"
        );

        if self.client.is_some() {
            let today = day_key(utc_today());
            self.upload_day(&today).await;
        }

        while !shutdown.is_requested() {
            self.pass().await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.wait() => break,
            }
        }

        self.store.save().map_err(TrackerError::Store)?;
        for name in self.store.names() {
            tracing::info!(
                tracker = %self.config.name,
                pattern = %name,
                total = self.store.tally().pattern_total(name),
                "final total"
            );
        }
        if !self.pending_days().is_empty() {
            tracing::warn!(
                tracker = %self.config.name,
                days = ?self.pending_days(),
                "stopping with uploads still pending"
            );
        }
        tracing::info!(tracker = %self.config.name, "tracker stopped");
        Ok(())
    }

    /// One scan over the projects directory. New messages are saved and
    /// announced; every touched day, plus any day whose earlier upload
    /// failed, is uploaded.
    pub async fn pass(&mut self) -> ScanReport {
        let scanner = Scanner::new(&self.matcher, self.config.role);
        let report = scanner.scan_tree(&self.projects_dir, self.store.tally_mut());

        if report.new_messages > 0 {
            if let Err(e) = self.store.save() {
                tracing::warn!(tracker = %self.config.name, error = %e, "failed to save counter store");
            }
            self.announce(&report);
            if self.client.is_some() {
                self.pending.extend(report.days_touched.iter().cloned());
            }
        }

        self.upload_pending().await;
        report
    }

    async fn upload_pending(&mut self) {
        let days: Vec<String> = self.pending.iter().cloned().collect();
        for day in days {
            if self.client.is_none() {
                break;
            }
            self.upload_day(&day).await;
        }
    }

    async fn upload_day(&mut self, day: &str) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        let counters = self.store.counters_for(day);
        let total = self.store.total(day);

        let outcome = client.upload(day, &counters, total).await;
        match outcome {
            UploadOutcome::Success => {
                self.pending.remove(day);
            }
            UploadOutcome::Retryable => {
                tracing::debug!(tracker = %self.config.name, day = %day, "upload failed, retrying next pass");
                self.pending.insert(day.to_string());
            }
            UploadOutcome::Unauthorized => {
                tracing::error!(
                    tracker = %self.config.name,
                    "server rejected the secret, uploads disabled until restart"
                );
                self.client = None;
                self.pending.clear();
            }
        }
    }

    fn announce(&self, report: &ScanReport) {
        for hit in &report.notable {
            let names: Vec<&str> = hit.names.iter().map(String::as_str).collect();
            println!(
                "[{}] {} in {}: \"{}\"",
                self.config.name,
                names.join(", "),
                hit.project,
                hit.excerpt
            );
        }
        if let Some(summary) = report.summary() {
            println!("[{}] Updated: {}", self.config.name, summary);
        }
        tracing::debug!(
            tracker = %self.config.name,
            files = report.files,
            new_messages = report.new_messages,
            "pass complete"
        );
    }
}

/// Errors that stop a tracker from starting or shutting down cleanly.
#[derive(Debug)]
pub enum TrackerError {
    Pattern(PatternError),
    Store(StoreError),
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::Pattern(e) => write!(f, "{e}"),
            TrackerError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TrackerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrackerError::Pattern(e) => Some(e),
            TrackerError::Store(e) => Some(e),
        }
    }
}
