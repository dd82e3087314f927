use rusqlite::{params, Connection, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Shape of one counters table: `(day, workstation_id)` key, a JSON column of
/// named counters, and an integer total.
#[derive(Debug)]
pub struct CounterTable {
    pub table: &'static str,
    pub counters_column: &'static str,
    /// Column name, and the field name used in payloads and responses.
    pub total_field: &'static str,
    /// Payload keys that are never counters.
    pub reserved: &'static [&'static str],
    /// Old payload keys accepted in place of a counter name.
    pub aliases: &'static [(&'static str, &'static str)],
}

pub const DAY_COUNTS: CounterTable = CounterTable {
    table: "day_counts",
    counters_column: "patterns",
    total_field: "total_messages",
    reserved: &["day", "workstation_id", "secret", "total_messages", "count", "right_count"],
    aliases: &[("count", "absolutely"), ("right_count", "right")],
};

pub const PROMPT_WORD_COUNTS: CounterTable = CounterTable {
    table: "prompt_word_counts",
    counters_column: "words",
    total_field: "total_user_messages",
    reserved: &["day", "workstation_id", "secret", "total_user_messages"],
    aliases: &[],
};

/// One stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRow {
    pub day: String,
    pub workstation_id: String,
    pub counters: BTreeMap<String, u64>,
    pub total: u64,
}

impl CounterTable {
    /// Counters from an upload's extra fields: non-negative integers only,
    /// reserved keys skipped, legacy aliases mapped onto their names.
    pub fn counters_from(&self, fields: &Map<String, Value>) -> BTreeMap<String, u64> {
        let mut counters = BTreeMap::new();
        for (old, name) in self.aliases {
            if let Some(n) = fields.get(*old).and_then(Value::as_u64) {
                counters.insert(name.to_string(), n);
            }
        }
        for (key, value) in fields {
            if self.reserved.contains(&key.as_str()) {
                continue;
            }
            if let Some(n) = value.as_u64() {
                counters.insert(key.clone(), n);
            }
        }
        counters
    }

    /// The total field from an upload, 0 when absent or not a count.
    pub fn total_from(&self, fields: &Map<String, Value>) -> u64 {
        fields
            .get(self.total_field)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Insert or replace the row for `(day, workstation_id)`.
    pub fn upsert(
        &self,
        conn: &Connection,
        day: &str,
        workstation_id: &str,
        counters: &BTreeMap<String, u64>,
        total: u64,
    ) -> Result<()> {
        let json = serde_json::to_string(counters)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let total = i64::try_from(total).unwrap_or(i64::MAX);
        let sql = format!(
            "INSERT INTO {t} (day, workstation_id, {c}, {n}) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(day, workstation_id) DO UPDATE SET {c} = excluded.{c}, {n} = excluded.{n}",
            t = self.table,
            c = self.counters_column,
            n = self.total_field,
        );
        conn.execute(&sql, params![day, workstation_id, json, total])?;
        Ok(())
    }

    /// Delete every row.
    pub fn clear(&self, conn: &Connection) -> Result<usize> {
        conn.execute(&format!("DELETE FROM {}", self.table), [])
    }

    /// Rows for one day, or every row when `day` is `None`, ordered by day
    /// then workstation.
    pub fn rows(&self, conn: &Connection, day: Option<&str>) -> Result<Vec<CounterRow>> {
        let base = format!(
            "SELECT day, workstation_id, {c}, {n} FROM {t}",
            t = self.table,
            c = self.counters_column,
            n = self.total_field,
        );
        let map_row = |row: &rusqlite::Row<'_>| -> Result<CounterRow> {
            let counters: Option<String> = row.get(2)?;
            let total: Option<i64> = row.get(3)?;
            Ok(CounterRow {
                day: row.get(0)?,
                workstation_id: row.get(1)?,
                counters: decode_counters(counters.as_deref().unwrap_or("{}")),
                total: total.and_then(|t| u64::try_from(t).ok()).unwrap_or(0),
            })
        };

        match day {
            Some(day) => {
                let mut stmt =
                    conn.prepare(&format!("{base} WHERE day = ?1 ORDER BY workstation_id"))?;
                let rows = stmt.query_map([day], map_row)?;
                rows.collect()
            }
            None => {
                let mut stmt = conn.prepare(&format!("{base} ORDER BY day, workstation_id"))?;
                let rows = stmt.query_map([], map_row)?;
                rows.collect()
            }
        }
    }

    /// One day's counters summed across workstations, flattened with the total.
    pub fn today(&self, conn: &Connection, day: &str) -> Result<Map<String, Value>> {
        let rows = self.rows(conn, Some(day))?;
        let (counters, total) = sum_rows(rows.iter());
        Ok(self.flatten(None, &counters, total))
    }

    /// `[{day, counters..., total}]` summed across workstations, day ascending.
    pub fn history(&self, conn: &Connection) -> Result<Vec<Map<String, Value>>> {
        let rows = self.rows(conn, None)?;
        let mut by_day: BTreeMap<&str, Vec<&CounterRow>> = BTreeMap::new();
        for row in &rows {
            by_day.entry(row.day.as_str()).or_default().push(row);
        }
        Ok(by_day
            .into_iter()
            .map(|(day, rows)| {
                let (counters, total) = sum_rows(rows.into_iter());
                self.flatten(Some(day), &counters, total)
            })
            .collect())
    }

    /// `[{workstation_id, history: [{day, total, counters...}]}]`, workstations
    /// ascending, each history day ascending.
    pub fn by_workstation(&self, conn: &Connection) -> Result<Vec<Value>> {
        let rows = self.rows(conn, None)?;
        let mut grouped: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        for row in &rows {
            grouped
                .entry(row.workstation_id.as_str())
                .or_default()
                .push(Value::Object(self.flatten(Some(row.day.as_str()), &row.counters, row.total)));
        }
        Ok(grouped
            .into_iter()
            .map(|(workstation_id, history)| {
                serde_json::json!({"workstation_id": workstation_id, "history": history})
            })
            .collect())
    }

    fn flatten(
        &self,
        day: Option<&str>,
        counters: &BTreeMap<String, u64>,
        total: u64,
    ) -> Map<String, Value> {
        let mut out = Map::new();
        if let Some(day) = day {
            out.insert("day".into(), Value::from(day));
        }
        for (name, n) in counters {
            out.insert(name.clone(), Value::from(*n));
        }
        out.insert(self.total_field.into(), Value::from(total));
        out
    }
}

fn sum_rows<'a, I>(rows: I) -> (BTreeMap<String, u64>, u64)
where
    I: Iterator<Item = &'a CounterRow>,
{
    let mut counters: BTreeMap<String, u64> = BTreeMap::new();
    let mut total = 0u64;
    for row in rows {
        for (name, n) in &row.counters {
            let slot = counters.entry(name.clone()).or_insert(0);
            *slot = slot.saturating_add(*n);
        }
        total = total.saturating_add(row.total);
    }
    (counters, total)
}

/// Stored counters JSON. Anything malformed reads as no counters; non-integer
/// values are dropped.
pub fn decode_counters(json: &str) -> BTreeMap<String, u64> {
    match serde_json::from_str::<Map<String, Value>>(json) {
        Ok(map) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_u64().map(|n| (k, n)))
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "malformed counters JSON, reading as empty");
            BTreeMap::new()
        }
    }
}

/// Opens (or creates) the counts database at the given path.
///
/// Creates both counters tables if they don't already exist.
pub fn open_or_create(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.busy_timeout(Duration::from_secs(5))?;

    for table in [&DAY_COUNTS, &PROMPT_WORD_COUNTS] {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                day            TEXT NOT NULL,
                workstation_id TEXT NOT NULL,
                {c}            TEXT NOT NULL DEFAULT '{{}}',
                {n}            INTEGER DEFAULT 0,
                PRIMARY KEY (day, workstation_id)
            );",
            t = table.table,
            c = table.counters_column,
            n = table.total_field,
        ))?;
    }

    Ok(conn)
}
