/// One-shot historical scan, independent of the watcher's counter store.
use crate::config::TrackerConfig;
use crate::patterns::{PatternError, PatternMatcher};
use crate::scan::{Scanner, Tally};
use crate::upload::{UploadClient, UploadOutcome};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// Everything a backfill found for one tracker.
#[derive(Debug)]
pub struct BackfillReport {
    pub tracker: String,
    pub total_field: String,
    pub names: Vec<String>,
    pub files: usize,
    pub tally: Tally,
}

/// Scan `projects_dir` from scratch with `tracker`'s patterns.
pub fn backfill(tracker: &TrackerConfig, projects_dir: &Path) -> Result<BackfillReport, PatternError> {
    let matcher = PatternMatcher::new(&tracker.patterns, &tracker.filtered, tracker.filter_mode)?;
    let mut tally = Tally::default();
    let scan = Scanner::new(&matcher, tracker.role).scan_tree(projects_dir, &mut tally);

    tracing::info!(
        tracker = %tracker.name,
        files = scan.files,
        messages = scan.new_messages,
        "backfill scan complete"
    );

    Ok(BackfillReport {
        tracker: tracker.name.clone(),
        total_field: tracker.total_field.clone(),
        names: matcher.names(),
        files: scan.files,
        tally,
    })
}

impl BackfillReport {
    pub fn is_empty(&self) -> bool {
        self.tally.totals.is_empty()
    }

    /// All-time count per pattern.
    pub fn totals(&self) -> BTreeMap<String, u64> {
        self.names
            .iter()
            .map(|n| (n.clone(), self.tally.pattern_total(n)))
            .collect()
    }

    /// Projects with matching messages on `day`, by name.
    pub fn projects_on(&self, day: &str) -> Option<&BTreeMap<String, u64>> {
        self.tally.project_days.get(day)
    }

    /// `{tracker, totals, daily: {day: {pattern..., <total_field>}}, by_date: {day: {project: n}}}`
    pub fn to_json(&self) -> Value {
        let mut daily = Map::new();
        for day in self.tally.days() {
            let mut row = Map::new();
            for (name, n) in self.tally.counters_for(&day, &self.names) {
                row.insert(name, Value::from(n));
            }
            row.insert(self.total_field.clone(), Value::from(self.tally.total(&day)));
            daily.insert(day, Value::Object(row));
        }

        serde_json::json!({
            "tracker": self.tracker,
            "totals": self.totals(),
            "daily": daily,
            "by_date": self.tally.project_days,
        })
    }

    /// Human-readable table: one line per day (with a project breakdown when
    /// more than one project matched), then per-pattern totals.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Daily counts ({}):", self.tracker);
        let _ = writeln!(out, "{}", "-".repeat(50));
        for day in self.tally.days() {
            let cells: Vec<String> = self
                .names
                .iter()
                .map(|n| format!("{}={:3}", n, self.tally.count(n, &day)))
                .collect();
            let _ = write!(
                out,
                "{}: {}, total={}",
                day,
                cells.join(", "),
                self.tally.total(&day)
            );
            if let Some(projects) = self.projects_on(&day).filter(|p| p.len() > 1) {
                let parts: Vec<String> = projects.iter().map(|(p, n)| format!("{p}: {n}")).collect();
                let _ = write!(out, " ({})", parts.join(", "));
            }
            let _ = writeln!(out);
        }
        let _ = writeln!(out, "{}", "-".repeat(50));
        for (name, n) in self.totals() {
            let _ = writeln!(out, "Total '{name}': {n}");
        }
        out
    }
}

/// Tally of a backfill upload run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub successful: usize,
    pub failed: usize,
    pub unauthorized: bool,
}

impl std::fmt::Display for UploadSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Upload complete: {} successful, {} failed",
            self.successful, self.failed
        )
    }
}

/// Upload every counted day in order, including days where nothing matched,
/// so the server has every day's message total. Stops at the first 401.
pub async fn upload_report(report: &BackfillReport, client: &mut UploadClient) -> UploadSummary {
    let mut summary = UploadSummary::default();
    for day in report.tally.days() {
        let counters = report.tally.counters_for(&day, &report.names);
        let total = report.tally.total(&day);
        match client.upload(&day, &counters, total).await {
            UploadOutcome::Success => {
                tracing::info!(day = %day, "uploaded");
                summary.successful += 1;
            }
            UploadOutcome::Retryable => summary.failed += 1,
            UploadOutcome::Unauthorized => {
                summary.failed += 1;
                summary.unauthorized = true;
                break;
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::{UploadLog, UploadTarget};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fixture() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("-Users-alice-code-app");
        std::fs::create_dir_all(&dir).unwrap();
        let mut f = std::fs::File::create(dir.join("s.jsonl")).unwrap();
        for line in [
            r#"{"type":"assistant","uuid":"a1","timestamp":"2025-05-01T12:00:00Z","message":{"content":[{"type":"text","text":"You're absolutely right!"}]}}"#,
            r#"{"type":"assistant","uuid":"a2","timestamp":"2025-05-01T13:00:00Z","message":{"content":[{"type":"text","text":"You are right."}]}}"#,
            r#"{"type":"assistant","uuid":"a3","timestamp":"2025-05-02T13:00:00Z","message":{"content":[{"type":"text","text":"Reading."}]}}"#,
            r#"{"type":"assistant","uuid":"a4","timestamp":"2025-05-03T13:00:00Z","message":{"content":[{"type":"text","text":"Excellent! Tests pass."}]}}"#,
        ] {
            writeln!(f, "{line}").unwrap();
        }
        tmp
    }

    fn client(server: &MockServer) -> UploadClient {
        UploadClient::new(
            UploadTarget {
                endpoint: server.uri(),
                route: "/api/set".to_string(),
                secret: Some("s".to_string()),
                workstation_id: "desk".to_string(),
                total_field: "total_messages".to_string(),
                timeout: Duration::from_secs(5),
            },
            UploadLog::disabled(),
        )
        .unwrap()
    }

    #[test]
    fn scans_from_scratch() {
        let tmp = fixture();
        let report = backfill(&TrackerConfig::absolutely_right(), tmp.path()).unwrap();
        assert_eq!(report.files, 1);
        let totals = report.totals();
        assert_eq!(totals["absolutely"], 1);
        assert_eq!(totals["right"], 1);
        assert_eq!(totals["excellent"], 1);
        assert_eq!(totals["perfect"], 0);
        assert_eq!(
            report.tally.days(),
            vec!["2025-05-01", "2025-05-02", "2025-05-03"]
        );
    }

    #[test]
    fn json_document_shape() {
        let tmp = fixture();
        let report = backfill(&TrackerConfig::absolutely_right(), tmp.path()).unwrap();
        let doc = report.to_json();
        assert_eq!(doc["tracker"], "absolutely-right");
        assert_eq!(doc["totals"]["absolutely"], 1);
        assert_eq!(doc["daily"]["2025-05-01"]["total_messages"], 2);
        assert_eq!(doc["daily"]["2025-05-02"]["absolutely"], 0);
        assert_eq!(doc["daily"]["2025-05-02"]["total_messages"], 1);
    }

    #[test]
    fn table_lists_every_day() {
        let tmp = fixture();
        let report = backfill(&TrackerConfig::absolutely_right(), tmp.path()).unwrap();
        let table = report.render_table();
        assert!(table.contains("2025-05-01: absolutely=  1"));
        assert!(table.contains("2025-05-02:"));
        assert!(table.contains("Total 'right': 1"));
    }

    #[test]
    fn project_breakdown_per_day() {
        let tmp = fixture();
        let other = tmp.path().join("-Users-alice-code-site");
        std::fs::create_dir_all(&other).unwrap();
        std::fs::write(
            other.join("s.jsonl"),
            r#"{"type":"assistant","uuid":"b1","timestamp":"2025-05-01T15:00:00Z","message":{"content":[{"type":"text","text":"Perfect!"}]}}"#,
        )
        .unwrap();

        let report = backfill(&TrackerConfig::absolutely_right(), tmp.path()).unwrap();
        let doc = report.to_json();
        assert_eq!(doc["by_date"]["2025-05-01"]["code-app"], 2);
        assert_eq!(doc["by_date"]["2025-05-01"]["code-site"], 1);
        assert_eq!(doc["by_date"]["2025-05-03"]["code-app"], 1);
        assert!(doc["by_date"].get("2025-05-02").is_none());

        let table = report.render_table();
        assert!(table.contains("total=3 (code-app: 2, code-site: 1)"));
        let single = table.lines().find(|l| l.starts_with("2025-05-03")).unwrap();
        assert!(!single.contains('('));
    }

    #[test]
    fn repeated_runs_start_fresh() {
        let tmp = fixture();
        let first = backfill(&TrackerConfig::absolutely_right(), tmp.path()).unwrap();
        let second = backfill(&TrackerConfig::absolutely_right(), tmp.path()).unwrap();
        assert_eq!(first.totals(), second.totals());
        assert_eq!(second.tally.total("2025-05-01"), 2);
    }

    #[test]
    fn ignores_watch_state_on_disk() {
        let tmp = fixture();
        let state = crate::store::CounterStore::open(
            &tmp.path().join(".state"),
            &["absolutely".to_string()],
        );
        let mut store = state.unwrap();
        store.tally_mut().seen.insert("a1".to_string());
        store.save().unwrap();

        let report = backfill(&TrackerConfig::absolutely_right(), tmp.path()).unwrap();
        assert_eq!(report.totals()["absolutely"], 1);
    }

    #[test]
    fn empty_tree_is_empty_report() {
        let tmp = TempDir::new().unwrap();
        let report = backfill(&TrackerConfig::absolutely_right(), tmp.path()).unwrap();
        assert!(report.is_empty());
        assert!(report.tally.days().is_empty());
    }

    #[tokio::test]
    async fn uploads_every_counted_day() {
        let tmp = fixture();
        let report = backfill(&TrackerConfig::absolutely_right(), tmp.path()).unwrap();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/set"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let summary = upload_report(&report, &mut client(&server)).await;
        assert_eq!(
            summary,
            UploadSummary {
                successful: 3,
                failed: 0,
                unauthorized: false
            }
        );
        assert_eq!(summary.to_string(), "Upload complete: 3 successful, 0 failed");

        let quiet_day = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| serde_json::from_slice::<Value>(&r.body).unwrap())
            .find(|body| body["day"] == "2025-05-02")
            .unwrap();
        assert_eq!(quiet_day["total_messages"], 1);
        assert_eq!(quiet_day["absolutely"], 0);
    }

    #[tokio::test]
    async fn stops_at_first_unauthorized() {
        let tmp = fixture();
        let report = backfill(&TrackerConfig::absolutely_right(), tmp.path()).unwrap();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let summary = upload_report(&report, &mut client(&server)).await;
        assert!(summary.unauthorized);
        assert_eq!(summary.failed, 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
