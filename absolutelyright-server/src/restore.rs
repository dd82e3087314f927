/// Load a `by-workstation` JSON dump back into a counters table.
use crate::db::CounterTable;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// One workstation's entry in a dump: `{workstation_id, history: [{day, ...}]}`.
#[derive(Debug, Deserialize)]
pub struct WorkstationDump {
    pub workstation_id: String,
    #[serde(default)]
    pub history: Vec<Map<String, Value>>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub workstations: usize,
    pub rows: usize,
    pub skipped: usize,
}

impl std::fmt::Display for RestoreSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Imported {} records from {} workstations",
            self.rows, self.workstations
        )?;
        if self.skipped > 0 {
            write!(f, " ({} skipped)", self.skipped)?;
        }
        Ok(())
    }
}

pub fn load_dump(path: &Path) -> Result<Vec<WorkstationDump>, RestoreError> {
    let contents = std::fs::read_to_string(path).map_err(|e| RestoreError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&contents).map_err(|e| RestoreError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Write every history entry through `table`'s upsert in one transaction.
/// Unless `keep_existing`, the table is emptied first.
pub fn restore(
    conn: &mut Connection,
    table: &CounterTable,
    dump: &[WorkstationDump],
    keep_existing: bool,
) -> Result<RestoreSummary, RestoreError> {
    let tx = conn.transaction()?;
    if !keep_existing {
        let cleared = table.clear(&tx)?;
        tracing::info!(table = table.table, cleared, "cleared existing rows");
    }

    let mut summary = RestoreSummary {
        workstations: dump.len(),
        ..Default::default()
    };
    for ws in dump {
        for entry in &ws.history {
            let Some(day) = entry.get("day").and_then(Value::as_str) else {
                tracing::warn!(workstation_id = %ws.workstation_id, "skipping history entry without a day");
                summary.skipped += 1;
                continue;
            };
            let counters = table.counters_from(entry);
            let total = table.total_from(entry);
            table.upsert(&tx, day, &ws.workstation_id, &counters, total)?;
            summary.rows += 1;
        }
        tracing::info!(
            table = table.table,
            workstation_id = %ws.workstation_id,
            days = ws.history.len(),
            "restored workstation"
        );
    }

    tx.commit()?;
    Ok(summary)
}

#[derive(Debug)]
pub enum RestoreError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Db(rusqlite::Error),
}

impl From<rusqlite::Error> for RestoreError {
    fn from(e: rusqlite::Error) -> Self {
        RestoreError::Db(e)
    }
}

impl std::fmt::Display for RestoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            RestoreError::Parse { path, source } => {
                write!(f, "{} is not a by-workstation dump: {}", path.display(), source)
            }
            RestoreError::Db(e) => write!(f, "database error: {e}"),
        }
    }
}

impl std::error::Error for RestoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RestoreError::Read { source, .. } => Some(source),
            RestoreError::Parse { source, .. } => Some(source),
            RestoreError::Db(e) => Some(e),
        }
    }
}
