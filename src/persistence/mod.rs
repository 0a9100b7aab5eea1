//! SQLite persistence for engine state.
//!
//! Persists state that must survive restarts:
//! - Daily risk counters and the per-symbol last trade day
//! - Per-position protection state
//! - Decision records for every evaluated symbol

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::decision::DecisionRecord;
use crate::risk::{DailyRiskState, DailyStateStore, OpenPositionState, PositionStateStore, Reservation};

/// SQLite-based persistence manager. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct PersistenceManager {
    conn: Arc<Mutex<Connection>>,
}

impl PersistenceManager {
    /// Create a new persistence manager, initializing the database if needed.
    ///
    /// Pass `":memory:"` for a throwaway database.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create database directory {:?}", parent))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", path);
        Ok(manager)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection lock poisoned"))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            -- Daily risk counters, one row per trading day
            CREATE TABLE IF NOT EXISTS daily_risk_state (
                trading_day TEXT PRIMARY KEY,
                spent_today_usd TEXT NOT NULL,
                new_positions_today INTEGER NOT NULL,
                symbols_traded_today TEXT NOT NULL,
                pending_entries TEXT NOT NULL,
                last_trade_time TEXT,
                updated_at TEXT NOT NULL
            );

            -- Last trading day each symbol was entered (cooldown)
            CREATE TABLE IF NOT EXISTS symbol_last_trade (
                symbol TEXT PRIMARY KEY,
                trading_day TEXT NOT NULL
            );

            -- Protection state of open positions
            CREATE TABLE IF NOT EXISTS position_states (
                symbol TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Decision records
            CREATE TABLE IF NOT EXISTS decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                verdict TEXT NOT NULL,
                reasons TEXT NOT NULL,
                record_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_timestamp ON decisions(timestamp);
            CREATE INDEX IF NOT EXISTS idx_decisions_symbol ON decisions(symbol);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Append decision records from one cycle.
    pub fn record_decisions(&self, records: &[DecisionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for record in records {
            let verdict = serde_json::to_value(record.verdict)?;
            let reasons = serde_json::to_string(&record.reasons)?;
            tx.execute(
                "INSERT INTO decisions (cycle_id, timestamp, symbol, verdict, reasons, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    i64::try_from(record.cycle_id).unwrap_or(i64::MAX),
                    record.timestamp.to_rfc3339(),
                    record.symbol,
                    verdict.as_str().unwrap_or_default(),
                    reasons,
                    serde_json::to_string(record)?,
                ],
            )?;
        }
        tx.commit()?;

        debug!(count = records.len(), "Recorded decisions");
        Ok(())
    }

    /// Most recent decision records, newest first.
    pub fn latest_decisions(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT record_json FROM decisions ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            let json = row?;
            match serde_json::from_str::<DecisionRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable decision record: {}", e),
            }
        }
        Ok(records)
    }

    /// Count of stored decisions per verdict.
    pub fn verdict_counts(&self) -> Result<BTreeMap<String, u64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT verdict, COUNT(*) FROM decisions GROUP BY verdict")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (verdict, count) = row?;
            counts.insert(verdict, count.max(0) as u64);
        }
        Ok(counts)
    }
}

impl DailyStateStore for PersistenceManager {
    fn load_daily_state(&self) -> Result<Option<DailyRiskState>> {
        let conn = self.conn()?;

        let row = conn
            .query_row(
                "SELECT trading_day, spent_today_usd, new_positions_today, symbols_traded_today,
                        pending_entries, last_trade_time
                 FROM daily_risk_state ORDER BY trading_day DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((day, spent, count, traded, pending, last_trade_time)) = row else {
            return Ok(None);
        };

        let mut symbol_last_trade = BTreeMap::new();
        let mut stmt = conn.prepare("SELECT symbol, trading_day FROM symbol_last_trade")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (symbol, last_day) = row?;
            symbol_last_trade.insert(symbol, parse_day(&last_day)?);
        }

        let state = DailyRiskState {
            trading_day: parse_day(&day)?,
            spent_today_usd: parse_decimal(&spent)?,
            new_positions_today: u32::try_from(count).context("Invalid new_positions_today")?,
            symbols_traded_today: serde_json::from_str::<BTreeSet<String>>(&traded)?,
            symbol_last_trade,
            pending_entries: serde_json::from_str::<BTreeMap<String, Reservation>>(&pending)?,
            last_trade_time: last_trade_time.as_deref().map(parse_timestamp).transpose()?,
        };

        debug!(
            trading_day = %state.trading_day,
            spent = %state.spent_today_usd,
            positions = state.new_positions_today,
            "Loaded daily risk state"
        );
        Ok(Some(state))
    }

    fn save_daily_state(&self, state: &DailyRiskState) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO daily_risk_state
             (trading_day, spent_today_usd, new_positions_today, symbols_traded_today,
              pending_entries, last_trade_time, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                state.trading_day.to_string(),
                state.spent_today_usd.to_string(),
                i64::from(state.new_positions_today),
                serde_json::to_string(&state.symbols_traded_today)?,
                serde_json::to_string(&state.pending_entries)?,
                state.last_trade_time.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;

        // Released approvals remove entries, so the table mirrors the map exactly
        tx.execute("DELETE FROM symbol_last_trade", [])?;
        for (symbol, day) in &state.symbol_last_trade {
            tx.execute(
                "INSERT INTO symbol_last_trade (symbol, trading_day) VALUES (?1, ?2)",
                params![symbol, day.to_string()],
            )?;
        }

        tx.commit()?;
        debug!(trading_day = %state.trading_day, "Saved daily risk state");
        Ok(())
    }
}

impl PositionStateStore for PersistenceManager {
    fn load_position_states(&self) -> Result<Vec<OpenPositionState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT symbol, state_json FROM position_states ORDER BY symbol")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut states = Vec::new();
        for row in rows {
            let (symbol, json) = row?;
            let state: OpenPositionState = serde_json::from_str(&json)
                .with_context(|| format!("Invalid stored protection state for {}", symbol))?;
            states.push(state);
        }

        debug!(count = states.len(), "Loaded position protection states");
        Ok(states)
    }

    fn save_position_state(&self, state: &OpenPositionState) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO position_states (symbol, state_json, updated_at)
             VALUES (?1, ?2, ?3)",
            params![
                state.symbol,
                serde_json::to_string(state)?,
                state.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn delete_position_state(&self, symbol: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM position_states WHERE symbol = ?1", params![symbol])?;
        Ok(())
    }
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("Invalid decimal in database: {:?}", s))
}

fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("Invalid date in database: {:?}", s))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in database: {:?}", s))?
        .with_timezone(&Utc))
}
