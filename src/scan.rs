/// Deduplicating scan over a projects directory of JSONL session logs.
///
/// Layout: `<root>/<project>/<session>.jsonl`, one JSON record per line.
/// Every message id is counted at most once per `Tally`; re-scanning the same
/// files with the same tally adds nothing.
use crate::extract::{self, LogMessage, Role};
use crate::patterns::PatternMatcher;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::BufRead;
use std::path::{Path, PathBuf};

/// Longest excerpt kept for console notifications.
const EXCERPT_CHARS: usize = 100;

/// In-memory dedup domain: seen ids plus the counters they produced.
#[derive(Debug, Default, Clone)]
pub struct Tally {
    pub seen: HashSet<String>,
    /// pattern -> day -> messages matching that pattern
    pub patterns: BTreeMap<String, BTreeMap<String, u64>>,
    /// day -> messages counted
    pub totals: BTreeMap<String, u64>,
    /// project -> messages matching any pattern
    pub projects: BTreeMap<String, u64>,
    /// day -> project -> messages matching any pattern
    pub project_days: BTreeMap<String, BTreeMap<String, u64>>,
}

impl Tally {
    /// Apply one message. Returns `false` (and changes nothing) if its id was
    /// already counted.
    pub fn record(&mut self, msg: &LogMessage, matched: &BTreeSet<String>, project: &str) -> bool {
        if !self.seen.insert(msg.id.clone()) {
            return false;
        }

        let day = msg.day_key();
        *self.totals.entry(day.clone()).or_insert(0) += 1;

        for name in matched {
            *self
                .patterns
                .entry(name.clone())
                .or_default()
                .entry(day.clone())
                .or_insert(0) += 1;
        }

        if !matched.is_empty() {
            *self.projects.entry(project.to_string()).or_insert(0) += 1;
            *self
                .project_days
                .entry(day)
                .or_default()
                .entry(project.to_string())
                .or_insert(0) += 1;
        }

        true
    }

    /// Count for one pattern on one day.
    pub fn count(&self, pattern: &str, day: &str) -> u64 {
        self.patterns
            .get(pattern)
            .and_then(|days| days.get(day))
            .copied()
            .unwrap_or(0)
    }

    /// Total messages counted on one day.
    pub fn total(&self, day: &str) -> u64 {
        self.totals.get(day).copied().unwrap_or(0)
    }

    /// Flat `pattern -> count` map for one day, including zero counts for
    /// every name in `names`.
    pub fn counters_for(&self, day: &str, names: &[String]) -> BTreeMap<String, u64> {
        let mut counters: BTreeMap<String, u64> =
            names.iter().map(|n| (n.clone(), self.count(n, day))).collect();
        for (name, days) in &self.patterns {
            if let Some(&n) = days.get(day) {
                counters.insert(name.clone(), n);
            }
        }
        counters
    }

    /// Every day with at least one counted message, ascending.
    pub fn days(&self) -> Vec<String> {
        let mut days: BTreeSet<String> = self.totals.keys().cloned().collect();
        for per_day in self.patterns.values() {
            days.extend(per_day.keys().cloned());
        }
        days.into_iter().collect()
    }

    /// All-time total for one pattern.
    pub fn pattern_total(&self, pattern: &str) -> u64 {
        self.patterns
            .get(pattern)
            .map(|days| days.values().sum())
            .unwrap_or(0)
    }
}

/// A message that matched at least one pattern during a scan.
#[derive(Debug, Clone)]
pub struct Notable {
    pub project: String,
    pub names: BTreeSet<String>,
    pub excerpt: String,
}

/// What one scan pass found.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub files: usize,
    pub new_messages: u64,
    pub new_matches: BTreeMap<String, u64>,
    pub days_touched: BTreeSet<String>,
    pub notable: Vec<Notable>,
}

impl ScanReport {
    /// `name: +n` summary of new matches, or `None` when nothing matched.
    pub fn summary(&self) -> Option<String> {
        if self.new_matches.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .new_matches
            .iter()
            .map(|(name, n)| format!("{name}: +{n}"))
            .collect();
        Some(parts.join(", "))
    }
}

/// Walks a projects directory and folds new messages into a `Tally`.
pub struct Scanner<'a> {
    matcher: &'a PatternMatcher,
    role: Role,
}

impl<'a> Scanner<'a> {
    pub fn new(matcher: &'a PatternMatcher, role: Role) -> Self {
        Self { matcher, role }
    }

    /// Scan every `<root>/<project>/*.jsonl` file. Never fails: missing
    /// directories and unreadable files are logged and skipped.
    pub fn scan_tree(&self, root: &Path, tally: &mut Tally) -> ScanReport {
        let mut report = ScanReport::default();

        if !root.is_dir() {
            tracing::warn!(path = %root.display(), "projects directory not found, nothing to scan");
            return report;
        }

        for (project, file) in session_files(root) {
            report.files += 1;
            if let Err(e) = self.scan_file(&file, &project, tally, &mut report) {
                tracing::warn!(error = %e, path = %file.display(), "failed to read session log");
            }
        }

        report
    }

    /// Scan a single JSONL file on behalf of `project`.
    pub fn scan_file(
        &self,
        path: &Path,
        project: &str,
        tally: &mut Tally,
        report: &mut ScanReport,
    ) -> std::io::Result<()> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);

        // Raw bytes per line: a line that isn't valid UTF-8 is just malformed.
        for line in reader.split(b'\n') {
            let line = line?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let record: Value = match serde_json::from_slice(&line) {
                Ok(v) => v,
                Err(_) => continue, // skip malformed lines
            };
            let Some(msg) = extract::extract(&record, self.role) else {
                continue;
            };
            if tally.seen.contains(&msg.id) {
                continue;
            }

            let matched = self
                .matcher
                .matches_any(msg.segments.iter().map(String::as_str));
            tally.record(&msg, &matched, project);

            report.new_messages += 1;
            report.days_touched.insert(msg.day_key());
            for name in &matched {
                *report.new_matches.entry(name.clone()).or_insert(0) += 1;
            }
            if !matched.is_empty() {
                report.notable.push(Notable {
                    project: project.to_string(),
                    excerpt: excerpt(&msg.segments),
                    names: matched,
                });
            }
        }

        Ok(())
    }
}

/// `(project display name, file)` for every session log, sorted by path.
/// Hidden project directories are skipped.
pub fn session_files(root: &Path) -> Vec<(String, PathBuf)> {
    let root_str = root.to_string_lossy();
    let pattern = format!(
        "{}/*/*.jsonl",
        glob::Pattern::escape(root_str.trim_end_matches('/'))
    );
    let entries = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::warn!(error = %e, pattern = %pattern, "invalid session glob");
            return Vec::new();
        }
    };

    let mut files: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read session path");
                None
            }
        })
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let dir_name = path.parent()?.file_name()?.to_string_lossy().into_owned();
            if dir_name.starts_with('.') {
                return None;
            }
            Some((project_display_name(&dir_name), path))
        })
        .collect();
    files.sort_by(|a, b| a.1.cmp(&b.1));
    files
}

/// Readable project name from an encoded directory name:
/// `-Users-alice-code-myapp` -> `code-myapp`.
pub fn project_display_name(dir_name: &str) -> String {
    for prefix in ["-Users-", "-home-", "-var-"] {
        if dir_name.starts_with(prefix) {
            let parts: Vec<&str> = dir_name.splitn(4, '-').collect();
            if parts.len() > 3 {
                return parts[3].to_string();
            }
            break;
        }
    }
    dir_name.to_string()
}

fn excerpt(segments: &[String]) -> String {
    let joined = segments.join(" ");
    let flat: String = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(EXCERPT_CHARS).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::FilterMode;
    use std::io::Write;
    use tempfile::TempDir;

    fn matcher() -> PatternMatcher {
        let patterns = [
            ("absolutely", r"You(?:'re| are) absolutely right"),
            ("right", r"You(?:'re| are) right"),
            ("perfect", r"Perfect!"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        PatternMatcher::new(&patterns, &BTreeMap::new(), FilterMode::default()).unwrap()
    }

    fn write_session(root: &Path, project: &str, file: &str, lines: &[&str]) -> PathBuf {
        let dir = root.join(project);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file);
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        path
    }

    const ABSOLUTELY: &str = r#"{"type":"assistant","uuid":"a1","timestamp":"2025-05-01T12:00:00Z","message":{"content":[{"type":"text","text":"You're absolutely right!"}]}}"#;
    const PLAIN: &str = r#"{"type":"assistant","uuid":"a2","timestamp":"2025-05-01T12:01:00Z","message":{"content":[{"type":"text","text":"Reading the file."}]}}"#;
    const USER: &str = r#"{"type":"user","uuid":"u1","timestamp":"2025-05-01T12:02:00Z","message":{"content":"You're right, perfect!"}}"#;

    #[test]
    fn counts_matches_and_totals_per_day() {
        let tmp = TempDir::new().unwrap();
        write_session(tmp.path(), "-Users-alice-code-app", "s1.jsonl", &[ABSOLUTELY, PLAIN, USER]);

        let m = matcher();
        let mut tally = Tally::default();
        let report = Scanner::new(&m, Role::Assistant).scan_tree(tmp.path(), &mut tally);

        assert_eq!(report.files, 1);
        assert_eq!(report.new_messages, 2);
        assert_eq!(tally.total("2025-05-01"), 2);
        assert_eq!(tally.count("absolutely", "2025-05-01"), 1);
        assert_eq!(tally.count("right", "2025-05-01"), 0);
        assert_eq!(tally.projects.get("code-app"), Some(&1));
        assert_eq!(tally.project_days["2025-05-01"]["code-app"], 1);
        assert_eq!(report.summary().as_deref(), Some("absolutely: +1"));
        assert_eq!(report.notable.len(), 1);
        assert_eq!(report.notable[0].project, "code-app");
    }

    #[test]
    fn second_scan_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        write_session(tmp.path(), "proj", "s1.jsonl", &[ABSOLUTELY, PLAIN]);
        write_session(tmp.path(), "proj", "s2.jsonl", &[ABSOLUTELY]);

        let m = matcher();
        let scanner = Scanner::new(&m, Role::Assistant);
        let mut tally = Tally::default();
        let first = scanner.scan_tree(tmp.path(), &mut tally);
        assert_eq!(first.new_messages, 2);
        let snapshot = tally.clone();

        let second = scanner.scan_tree(tmp.path(), &mut tally);
        assert_eq!(second.new_messages, 0);
        assert!(second.new_matches.is_empty());
        assert!(second.days_touched.is_empty());
        assert_eq!(tally.patterns, snapshot.patterns);
        assert_eq!(tally.totals, snapshot.totals);
    }

    #[test]
    fn appended_lines_are_picked_up_incrementally() {
        let tmp = TempDir::new().unwrap();
        write_session(tmp.path(), "proj", "s1.jsonl", &[ABSOLUTELY]);

        let m = matcher();
        let scanner = Scanner::new(&m, Role::Assistant);
        let mut tally = Tally::default();
        scanner.scan_tree(tmp.path(), &mut tally);

        write_session(tmp.path(), "proj", "s1.jsonl", &[PLAIN]);
        let report = scanner.scan_tree(tmp.path(), &mut tally);
        assert_eq!(report.new_messages, 1);
        assert_eq!(tally.total("2025-05-01"), 2);
    }

    #[test]
    fn pattern_counted_once_per_message_across_segments() {
        let tmp = TempDir::new().unwrap();
        let line = r#"{"type":"assistant","uuid":"m1","timestamp":"2025-05-02T08:00:00Z","message":{"content":[
            {"type":"text","text":"You're absolutely right."},
            {"type":"text","text":"You're absolutely right, again. Perfect!"},
            {"type":"text","text":"Perfect!"}]}}"#
            .replace('\n', "");
        write_session(tmp.path(), "proj", "s.jsonl", &[&line]);

        let m = matcher();
        let mut tally = Tally::default();
        Scanner::new(&m, Role::Assistant).scan_tree(tmp.path(), &mut tally);

        assert_eq!(tally.count("absolutely", "2025-05-02"), 1);
        assert_eq!(tally.count("perfect", "2025-05-02"), 1);
        assert_eq!(tally.total("2025-05-02"), 1);
    }

    #[test]
    fn duplicate_id_across_files_counted_once() {
        let tmp = TempDir::new().unwrap();
        write_session(tmp.path(), "a", "s.jsonl", &[ABSOLUTELY]);
        write_session(tmp.path(), "b", "s.jsonl", &[ABSOLUTELY]);

        let m = matcher();
        let mut tally = Tally::default();
        let report = Scanner::new(&m, Role::Assistant).scan_tree(tmp.path(), &mut tally);
        assert_eq!(report.new_messages, 1);
        assert_eq!(tally.count("absolutely", "2025-05-01"), 1);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        write_session(
            tmp.path(),
            "proj",
            "s.jsonl",
            &["not json", "", "{broken", ABSOLUTELY, "[1,2,3]"],
        );

        let m = matcher();
        let mut tally = Tally::default();
        let report = Scanner::new(&m, Role::Assistant).scan_tree(tmp.path(), &mut tally);
        assert_eq!(report.new_messages, 1);
    }

    #[test]
    fn invalid_utf8_line_does_not_hide_later_records() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("proj");
        std::fs::create_dir_all(&dir).unwrap();
        let mut bytes = b"garbage \xff\xfe line\n".to_vec();
        bytes.extend_from_slice(ABSOLUTELY.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        std::fs::write(dir.join("s.jsonl"), bytes).unwrap();

        let m = matcher();
        let mut tally = Tally::default();
        let report = Scanner::new(&m, Role::Assistant).scan_tree(tmp.path(), &mut tally);
        assert_eq!(report.new_messages, 1);
        assert_eq!(tally.count("absolutely", "2025-05-01"), 1);
    }

    #[test]
    fn user_role_reads_string_content() {
        let tmp = TempDir::new().unwrap();
        write_session(tmp.path(), "proj", "s.jsonl", &[ABSOLUTELY, USER]);

        let m = matcher();
        let mut tally = Tally::default();
        Scanner::new(&m, Role::User).scan_tree(tmp.path(), &mut tally);
        assert_eq!(tally.total("2025-05-01"), 1);
        assert_eq!(tally.count("right", "2025-05-01"), 1);
        assert_eq!(tally.count("perfect", "2025-05-01"), 1);
        assert_eq!(tally.count("absolutely", "2025-05-01"), 0);
    }

    #[test]
    fn missing_root_is_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let m = matcher();
        let mut tally = Tally::default();
        let report =
            Scanner::new(&m, Role::Assistant).scan_tree(&tmp.path().join("missing"), &mut tally);
        assert_eq!(report.files, 0);
        assert_eq!(report.new_messages, 0);
    }

    #[test]
    fn hidden_projects_and_other_files_ignored() {
        let tmp = TempDir::new().unwrap();
        write_session(tmp.path(), ".cache", "s.jsonl", &[ABSOLUTELY]);
        write_session(tmp.path(), "proj", "notes.txt", &[ABSOLUTELY]);
        write_session(tmp.path(), "proj", "s.jsonl", &[PLAIN]);

        let files = session_files(tmp.path());
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "proj");
    }

    #[test]
    fn seen_ids_from_a_previous_run_are_skipped() {
        let tmp = TempDir::new().unwrap();
        write_session(tmp.path(), "proj", "s.jsonl", &[ABSOLUTELY, PLAIN]);

        let m = matcher();
        let mut tally = Tally::default();
        tally.seen.insert("a1".to_string());
        let report = Scanner::new(&m, Role::Assistant).scan_tree(tmp.path(), &mut tally);
        assert_eq!(report.new_messages, 1);
        assert_eq!(tally.count("absolutely", "2025-05-01"), 0);
    }

    #[test]
    fn project_display_names() {
        assert_eq!(project_display_name("-Users-alice-code-myapp"), "code-myapp");
        assert_eq!(project_display_name("-home-bob-work"), "work");
        assert_eq!(project_display_name("-var-x"), "-var-x");
        assert_eq!(project_display_name("plain"), "plain");
    }

    #[test]
    fn counters_for_includes_zeroes() {
        let mut tally = Tally::default();
        tally
            .patterns
            .entry("absolutely".into())
            .or_default()
            .insert("2025-01-01".into(), 3);
        let names = vec!["absolutely".to_string(), "right".to_string()];
        let counters = tally.counters_for("2025-01-01", &names);
        assert_eq!(counters["absolutely"], 3);
        assert_eq!(counters["right"], 0);
    }

    #[test]
    fn long_excerpts_are_truncated() {
        let long = "word ".repeat(60);
        let e = excerpt(&[long]);
        assert!(e.ends_with("..."));
        assert_eq!(e.chars().count(), EXCERPT_CHARS + 3);
    }
}
