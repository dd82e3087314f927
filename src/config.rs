use crate::extract::Role;
use crate::patterns::FilterMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from absolutelyright.toml.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    pub watch: WatchConfig,
    pub upload: UploadConfig,
    pub trackers: Vec<TrackerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch: WatchConfig::default(),
            upload: UploadConfig::default(),
            trackers: vec![
                TrackerConfig::absolutely_right(),
                TrackerConfig::things_i_tell_claude(),
            ],
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. If the file doesn't exist,
    /// returns compiled defaults. Returns an error only if the file exists
    /// but can't be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: e,
                })?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Reject configurations that would make two trackers share state.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = std::collections::BTreeSet::new();
        let mut dirs = std::collections::BTreeSet::new();
        for tracker in &self.trackers {
            if !names.insert(tracker.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "tracker '{}' is defined more than once",
                    tracker.name
                )));
            }
            if !dirs.insert(tracker.data_subdir.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "tracker '{}' reuses data_subdir '{}'",
                    tracker.name, tracker.data_subdir
                )));
            }
        }
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("CLAUDE_PROJECTS").filter(|v| !v.is_empty()) {
            self.watch.projects_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("ABSOLUTELYRIGHT_DATA_DIR").filter(|v| !v.is_empty()) {
            self.watch.data_dir = PathBuf::from(dir);
        }
        if let Some(interval) = lookup("CHECK_INTERVAL") {
            match interval.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.watch.poll_interval_secs = secs,
                _ => tracing::warn!(value = %interval, "ignoring invalid CHECK_INTERVAL"),
            }
        }
        if let Some(id) = lookup("WORKSTATION_ID").filter(|v| !v.is_empty()) {
            self.watch.workstation_id = Some(id);
        }
        if let Some(secret) = lookup("ABSOLUTELYRIGHT_CLIENT_SECRET").filter(|v| !v.is_empty()) {
            self.upload.secret = Some(secret);
        }
    }

    /// Apply CLI overrides. CLI values take precedence over file/env values
    /// when present.
    pub fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(ref url) = overrides.upload {
            self.upload.endpoint = Some(url.clone());
        }
        if let Some(ref secret) = overrides.secret {
            self.upload.secret = Some(secret.clone());
        }
    }

    /// Expand `~/` in every configured path.
    pub fn expand_paths(&mut self) {
        self.watch.projects_dir = expand_home(&self.watch.projects_dir);
        self.watch.data_dir = expand_home(&self.watch.data_dir);
        self.upload.log_dir = expand_home(&self.upload.log_dir);
    }

    /// Look up a tracker by name.
    pub fn tracker(&self, name: &str) -> Option<&TrackerConfig> {
        self.trackers.iter().find(|t| t.name == name)
    }

    /// Trackers selected on the command line, or every enabled tracker.
    pub fn select_trackers(&self, names: &[String]) -> Result<Vec<TrackerConfig>, ConfigError> {
        if names.is_empty() {
            return Ok(self.trackers.iter().filter(|t| t.enabled).cloned().collect());
        }
        names
            .iter()
            .map(|name| {
                self.tracker(name)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownTracker(name.clone()))
            })
            .collect()
    }

    /// Copy of this config with the upload secret masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.upload.secret.is_some() {
            copy.upload.secret = Some("<redacted>".to_string());
        }
        copy
    }
}

/// CLI values that can override config file settings.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub upload: Option<String>,
    pub secret: Option<String>,
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
    UnknownTracker(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config file {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
            ConfigError::UnknownTracker(name) => write!(f, "unknown tracker '{name}'"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) | ConfigError::UnknownTracker(_) => None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WatchConfig {
    pub projects_dir: PathBuf,
    pub data_dir: PathBuf,
    pub poll_interval_secs: u64,
    pub workstation_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct UploadConfig {
    pub endpoint: Option<String>,
    pub secret: Option<String>,
    pub timeout_secs: u64,
    pub log_dir: PathBuf,
    pub retention_days: usize,
}

/// One tracked concern: which role to read, which patterns to count,
/// where to keep local state and where to upload.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct TrackerConfig {
    pub name: String,
    pub enabled: bool,
    pub role: Role,
    pub data_subdir: String,
    pub route: String,
    pub total_field: String,
    pub filter_mode: FilterMode,
    pub patterns: BTreeMap<String, String>,
    pub filtered: BTreeMap<String, String>,
}

impl TrackerConfig {
    /// Assistant affirmations ("You're absolutely right" and friends).
    pub fn absolutely_right() -> Self {
        let patterns = [
            ("absolutely", r"You(?:'re| are) absolutely right"),
            ("right", r"You(?:'re| are) right"),
            ("perfect", r"Perfect!"),
            ("excellent", r"Excellent!"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            name: "absolutely-right".to_string(),
            enabled: true,
            role: Role::Assistant,
            data_subdir: String::new(),
            route: "/api/set".to_string(),
            total_field: "total_messages".to_string(),
            filter_mode: FilterMode::default(),
            patterns,
            filtered: BTreeMap::new(),
        }
    }

    /// Words the user types into prompts. Ships without patterns and disabled;
    /// enable it in the config file with a `[trackers.patterns]` table.
    pub fn things_i_tell_claude() -> Self {
        Self {
            name: "things-i-tell-claude".to_string(),
            enabled: false,
            role: Role::User,
            data_subdir: "prompt_words".to_string(),
            route: "/api/things-i-tell-claude/set".to_string(),
            total_field: "total_user_messages".to_string(),
            filter_mode: FilterMode::default(),
            patterns: BTreeMap::new(),
            filtered: BTreeMap::new(),
        }
    }

    /// Directory holding this tracker's local counter store.
    pub fn data_dir(&self, watch: &WatchConfig) -> PathBuf {
        if self.data_subdir.is_empty() {
            watch.data_dir.clone()
        } else {
            watch.data_dir.join(&self.data_subdir)
        }
    }
}

// --- Default implementations ---

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            projects_dir: PathBuf::from("~/.claude/projects"),
            data_dir: PathBuf::from("~/.absolutelyright"),
            poll_interval_secs: 2,
            workstation_id: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            secret: None,
            timeout_secs: 5,
            log_dir: PathBuf::from("~/.absolutelyright/logs"),
            retention_days: 7,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            role: Role::Assistant,
            data_subdir: String::new(),
            route: "/api/set".to_string(),
            total_field: "total_messages".to_string(),
            filter_mode: FilterMode::default(),
            patterns: BTreeMap::new(),
            filtered: BTreeMap::new(),
        }
    }
}

/// Expand a leading `~/` to the current user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
