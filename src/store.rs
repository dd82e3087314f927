/// Durable per-tracker state: processed message ids and daily counters.
///
/// Layout under the tracker's data directory:
///   processed_ids.json              JSON array of counted message ids
///   daily_<pattern>_counts.json     {"YYYY-MM-DD": n} per pattern
///   daily_total_messages.json       {"YYYY-MM-DD": n}
///   project_counts.json             {"project": n}
///   lock                            held for the lifetime of the store
///
/// Files are replaced atomically (temp file in the same directory, then rename)
/// so a crash mid-save never leaves a truncated file behind.
use crate::scan::Tally;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const PROCESSED_IDS: &str = "processed_ids.json";
const TOTALS: &str = "daily_total_messages.json";
const PROJECTS: &str = "project_counts.json";
const LOCK: &str = "lock";

/// One tracker's persisted tally. Holds an exclusive lock on the directory.
#[derive(Debug)]
pub struct CounterStore {
    dir: PathBuf,
    names: Vec<String>,
    tally: Tally,
    _lock: File,
}

impl CounterStore {
    /// Open (creating if needed) the store in `dir` for the given pattern names.
    ///
    /// Missing files load as empty. Corrupt files are logged and load as empty.
    /// Fails with `StoreError::Locked` if another process owns the directory.
    pub fn open(dir: &Path, names: &[String]) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let lock = acquire_lock(&dir.join(LOCK))?;

        let mut tally = Tally {
            seen: load_json::<Vec<String>>(&dir.join(PROCESSED_IDS))
                .into_iter()
                .collect(),
            totals: load_json(&dir.join(TOTALS)),
            projects: load_json(&dir.join(PROJECTS)),
            ..Default::default()
        };
        for name in names {
            let counts: BTreeMap<String, u64> = load_json(&pattern_file(dir, name));
            tally.patterns.insert(name.clone(), counts);
        }

        tracing::debug!(
            dir = %dir.display(),
            processed_ids = tally.seen.len(),
            "loaded counter store"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            names: names.to_vec(),
            tally,
            _lock: lock,
        })
    }

    /// Directory this store lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pattern names this store tracks, in stable order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn tally(&self) -> &Tally {
        &self.tally
    }

    pub fn tally_mut(&mut self) -> &mut Tally {
        &mut self.tally
    }

    /// Flat `pattern -> count` map for one day.
    pub fn counters_for(&self, day: &str) -> BTreeMap<String, u64> {
        self.tally.counters_for(day, &self.names)
    }

    /// Total messages counted on one day.
    pub fn total(&self, day: &str) -> u64 {
        self.tally.total(day)
    }

    /// Write every file atomically.
    pub fn save(&self) -> Result<(), StoreError> {
        let mut ids: Vec<&String> = self.tally.seen.iter().collect();
        ids.sort();
        self.write_json(&self.dir.join(PROCESSED_IDS), &ids)?;

        for name in &self.names {
            let empty = BTreeMap::new();
            let counts = self.tally.patterns.get(name).unwrap_or(&empty);
            self.write_json(&pattern_file(&self.dir, name), counts)?;
        }
        self.write_json(&self.dir.join(TOTALS), &self.tally.totals)?;
        self.write_json(&self.dir.join(PROJECTS), &self.tally.projects)?;
        Ok(())
    }

    fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialize {
            path: path.to_path_buf(),
            source: e,
        })?;
        let io_err = |e: std::io::Error| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

fn pattern_file(dir: &Path, name: &str) -> PathBuf {
    let safe: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    dir.join(format!("daily_{safe}_counts.json"))
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to read state file, starting empty");
            return T::default();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "corrupt state file, starting empty");
            T::default()
        }
    }
}

fn acquire_lock(path: &Path) -> Result<File, StoreError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            Err(StoreError::Locked(path.to_path_buf()))
        }
        Err(e) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Errors from counter store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Another process already owns this data directory.
    Locked(PathBuf),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Locked(path) => write!(
                f,
                "counter store is in use by another process (lock {})",
                path.display()
            ),
            StoreError::Io { path, source } => {
                write!(f, "counter store I/O error at {}: {}", path.display(), source)
            }
            StoreError::Serialize { path, source } => {
                write!(f, "failed to serialize {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Locked(_) => None,
            StoreError::Io { source, .. } => Some(source),
            StoreError::Serialize { source, .. } => Some(source),
        }
    }
}
