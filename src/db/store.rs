//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;
use crate::check::{CheckDefinition, CheckKind, CheckTarget, NotificationRoutes, Placement};

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const CHECK_COLUMNS: &str = "id, name, description, kind, enabled, interval, timeout, retries, \
     threshold_timeout, placement_type, placement_id, grp, shared, runbook, priority, channels, \
     target, created_at, updated_at";

const RESULT_COLUMNS: &str = "check_id, agent_id, seq, time, ingested_at, status, message, \
     response_time, name_lookup, connect, app_connect, pre_transfer, redirect, start_transfer, \
     download, min_resp_time, avg_resp_time, max_resp_time, packet_loss_percent, ssl_expire_date, meta";

const ALERT_COLUMNS: &str = "id, check_id, agent_id, agent_name, from_status, to_status, at, message";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| DbError::Migration(format!("Pragmas failed: {}", e)))?;

        // Run migrations inline (embedded SQL)
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;

        Ok(())
    }

    // --- Checks ---

    /// Insert a check definition and return its ID.
    pub fn insert_check(&self, def: &CheckDefinition) -> Result<i64, DbError> {
        let (placement_type, placement_id) = placement_columns(&def.placement);
        let channels = serde_json::to_string(&def.channels)?;
        let target = serde_json::to_string(&def.target)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO checks (name, description, kind, enabled, interval, timeout, retries,
                threshold_timeout, placement_type, placement_id, grp, shared, runbook, priority,
                channels, target, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                def.name,
                def.description,
                def.kind().as_str(),
                def.enabled,
                def.interval,
                def.timeout,
                def.retries,
                def.threshold_timeout,
                placement_type,
                placement_id,
                def.group,
                def.shared,
                def.runbook,
                def.priority,
                channels,
                target,
                fmt_db_time(&def.created_at),
                fmt_db_time(&def.updated_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Update an existing, non-deleted check.
    pub fn update_check(&self, def: &CheckDefinition) -> Result<(), DbError> {
        let (placement_type, placement_id) = placement_columns(&def.placement);
        let channels = serde_json::to_string(&def.channels)?;
        let target = serde_json::to_string(&def.target)?;

        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE checks SET name=?1, description=?2, kind=?3, enabled=?4, interval=?5, timeout=?6,
                retries=?7, threshold_timeout=?8, placement_type=?9, placement_id=?10, grp=?11,
                shared=?12, runbook=?13, priority=?14, channels=?15, target=?16, updated_at=?17
             WHERE id=?18 AND deleted=0",
            params![
                def.name,
                def.description,
                def.kind().as_str(),
                def.enabled,
                def.interval,
                def.timeout,
                def.retries,
                def.threshold_timeout,
                placement_type,
                placement_id,
                def.group,
                def.shared,
                def.runbook,
                def.priority,
                channels,
                target,
                fmt_db_time(&def.updated_at),
                def.id,
            ],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Soft-delete a check. Its results are kept.
    pub fn delete_check(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE checks SET deleted=1 WHERE id=?1 AND deleted=0",
            params![id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all non-deleted checks.
    pub fn get_checks(&self) -> Result<Vec<CheckDefinition>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM checks WHERE deleted=0 ORDER BY id",
            CHECK_COLUMNS
        ))?;
        let checks = stmt
            .query_map([], check_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(checks)
    }

    /// A check by id, including soft-deleted ones, for history views.
    pub fn get_check_any(&self, id: i64) -> Result<CheckDefinition, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM checks WHERE id=?1", CHECK_COLUMNS),
            params![id],
            check_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    // --- Agents ---

    pub fn add_agent(&self, agent: &mut Agent) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO agents (name, description, server, port, enabled, shared, region_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                agent.name,
                agent.description,
                agent.server,
                agent.port,
                agent.enabled,
                agent.shared,
                agent.region_id,
            ],
        )
        .map_err(map_constraint)?;
        agent.id = conn.last_insert_rowid();
        Ok(agent.id)
    }

    pub fn update_agent(&self, agent: &Agent) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "UPDATE agents SET name=?1, description=?2, server=?3, port=?4, enabled=?5,
                    shared=?6, region_id=?7 WHERE id=?8",
                params![
                    agent.name,
                    agent.description,
                    agent.server,
                    agent.port,
                    agent.enabled,
                    agent.shared,
                    agent.region_id,
                    agent.id,
                ],
            )
            .map_err(map_constraint)?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn get_agents(&self) -> Result<Vec<Agent>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, server, port, enabled, shared, region_id FROM agents ORDER BY id",
        )?;
        let agents = stmt
            .query_map([], agent_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(agents)
    }

    pub fn get_agent(&self, id: i64) -> Result<Agent, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, description, server, port, enabled, shared, region_id FROM agents WHERE id=?1",
            params![id],
            agent_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    pub fn delete_agent(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM agents WHERE id=?1", params![id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Regions ---

    pub fn add_region(&self, region: &mut Region) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO regions (name, description, enabled, shared, country_id) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                region.name,
                region.description,
                region.enabled,
                region.shared,
                region.country_id,
            ],
        )
        .map_err(map_constraint)?;
        region.id = conn.last_insert_rowid();
        Ok(region.id)
    }

    pub fn update_region(&self, region: &Region) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "UPDATE regions SET name=?1, description=?2, enabled=?3, shared=?4, country_id=?5 WHERE id=?6",
                params![
                    region.name,
                    region.description,
                    region.enabled,
                    region.shared,
                    region.country_id,
                    region.id,
                ],
            )
            .map_err(map_constraint)?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn get_regions(&self) -> Result<Vec<Region>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, enabled, shared, country_id FROM regions ORDER BY id",
        )?;
        let regions = stmt
            .query_map([], region_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(regions)
    }

    pub fn get_region(&self, id: i64) -> Result<Region, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, description, enabled, shared, country_id FROM regions WHERE id=?1",
            params![id],
            region_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    pub fn delete_region(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM regions WHERE id=?1", params![id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Countries ---

    pub fn add_country(&self, country: &mut Country) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO countries (name, description, enabled, shared) VALUES (?1, ?2, ?3, ?4)",
            params![country.name, country.description, country.enabled, country.shared],
        )
        .map_err(map_constraint)?;
        country.id = conn.last_insert_rowid();
        Ok(country.id)
    }

    pub fn update_country(&self, country: &Country) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE countries SET name=?1, description=?2, enabled=?3, shared=?4 WHERE id=?5",
            params![
                country.name,
                country.description,
                country.enabled,
                country.shared,
                country.id,
            ],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn get_countries(&self) -> Result<Vec<Country>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, name, description, enabled, shared FROM countries ORDER BY id")?;
        let countries = stmt
            .query_map([], country_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(countries)
    }

    pub fn get_country(&self, id: i64) -> Result<Country, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, description, enabled, shared FROM countries WHERE id=?1",
            params![id],
            country_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    pub fn delete_country(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM countries WHERE id=?1", params![id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Status pages ---

    pub fn add_status_page(&self, page: &mut StatusPage) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO status_pages (name, slug, description, custom_style) VALUES (?1, ?2, ?3, ?4)",
            params![page.name, page.slug, page.description, page.custom_style],
        )
        .map_err(map_constraint)?;
        page.id = tx.last_insert_rowid();
        write_page_checks(&tx, page.id, &page.checks)?;
        tx.commit()?;
        Ok(page.id)
    }

    pub fn update_status_page(&self, page: &StatusPage) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let n = tx
            .execute(
                "UPDATE status_pages SET name=?1, slug=?2, description=?3, custom_style=?4 WHERE id=?5",
                params![page.name, page.slug, page.description, page.custom_style, page.id],
            )
            .map_err(map_constraint)?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        tx.execute("DELETE FROM status_page_checks WHERE page_id=?1", params![page.id])?;
        write_page_checks(&tx, page.id, &page.checks)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_status_pages(&self) -> Result<Vec<StatusPage>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, slug, description, custom_style FROM status_pages ORDER BY id",
        )?;
        let mut pages = stmt
            .query_map([], status_page_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        for page in &mut pages {
            page.checks = read_page_checks(&conn, page.id)?;
        }
        Ok(pages)
    }

    pub fn get_status_page(&self, id: i64) -> Result<StatusPage, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut page = conn
            .query_row(
                "SELECT id, name, slug, description, custom_style FROM status_pages WHERE id=?1",
                params![id],
                status_page_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;
        page.checks = read_page_checks(&conn, page.id)?;
        Ok(page)
    }

    pub fn get_status_page_by_slug(&self, slug: &str) -> Result<StatusPage, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut page = conn
            .query_row(
                "SELECT id, name, slug, description, custom_style FROM status_pages WHERE slug=?1",
                params![slug],
                status_page_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;
        page.checks = read_page_checks(&conn, page.id)?;
        Ok(page)
    }

    pub fn delete_status_page(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM status_pages WHERE id=?1", params![id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Channels ---

    pub fn add_channel(&self, channel: &mut Channel) -> Result<i64, DbError> {
        let config = serde_json::to_string(&channel.config)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO channels (name, kind, config) VALUES (?1, ?2, ?3)",
            params![channel.name, channel.config.kind().as_str(), config],
        )?;
        channel.id = conn.last_insert_rowid();
        Ok(channel.id)
    }

    pub fn update_channel(&self, channel: &Channel) -> Result<(), DbError> {
        let config = serde_json::to_string(&channel.config)?;
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE channels SET name=?1, kind=?2, config=?3 WHERE id=?4",
            params![channel.name, channel.config.kind().as_str(), config, channel.id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn get_channels(&self) -> Result<Vec<Channel>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, name, config FROM channels ORDER BY id")?;
        let channels = stmt
            .query_map([], channel_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(channels)
    }

    pub fn get_channel(&self, id: i64) -> Result<Channel, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, config FROM channels WHERE id=?1",
            params![id],
            channel_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    pub fn delete_channel(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM channels WHERE id=?1", params![id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Results ---

    /// Append results in batch.
    pub fn add_results(&self, results: &[CheckResult]) -> Result<(), DbError> {
        if results.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO check_results ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                RESULT_COLUMNS
            ))?;

            for r in results {
                let t = &r.timings;
                let meta = if r.meta.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&r.meta)?)
                };
                stmt.execute(params![
                    r.check_id,
                    r.agent_id,
                    r.seq as i64,
                    fmt_db_time(&r.time),
                    fmt_db_time(&r.ingested_at),
                    r.status.code(),
                    r.message,
                    t.response_time,
                    t.name_lookup,
                    t.connect,
                    t.app_connect,
                    t.pre_transfer,
                    t.redirect,
                    t.start_transfer,
                    t.download,
                    t.min_resp_time,
                    t.avg_resp_time,
                    t.max_resp_time,
                    t.packet_loss_percent,
                    r.ssl_expire_date.as_ref().map(fmt_db_time),
                    meta,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Most recent results of a check, newest first.
    pub fn recent_results(&self, check_id: i64, limit: usize) -> Result<Vec<CheckResult>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM check_results WHERE check_id=?1 ORDER BY ingested_at DESC, id DESC LIMIT ?2",
            RESULT_COLUMNS
        ))?;
        let results = stmt
            .query_map(params![check_id, limit as i64], result_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(results)
    }

    /// Results of a check ingested within `[start, end)`, oldest first.
    pub fn results_between(
        &self,
        check_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CheckResult>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM check_results
             WHERE check_id=?1 AND ingested_at >= ?2 AND ingested_at < ?3
             ORDER BY ingested_at ASC, id ASC",
            RESULT_COLUMNS
        ))?;
        let results = stmt
            .query_map(
                params![check_id, fmt_db_time(&start), fmt_db_time(&end)],
                result_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(results)
    }

    /// The last `window` results of every (check, agent) pair of active
    /// checks, oldest first within each pair.
    pub fn recent_results_per_key(&self, window: usize) -> Result<Vec<CheckResult>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {cols} FROM (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY check_id, agent_id ORDER BY ingested_at DESC, id DESC
                ) AS rn
                FROM check_results
                WHERE check_id IN (SELECT id FROM checks WHERE deleted=0)
             )
             WHERE rn <= ?1
             ORDER BY check_id, agent_id, ingested_at ASC, id ASC",
            cols = RESULT_COLUMNS
        ))?;
        let results = stmt
            .query_map(params![window as i64], result_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(results)
    }

    /// Newest result of a check across all agents.
    pub fn latest_result(&self, check_id: i64) -> Result<Option<CheckResult>, DbError> {
        Ok(self.recent_results(check_id, 1)?.into_iter().next())
    }

    /// Highest stored dispatch sequence number.
    pub fn max_result_seq(&self) -> Result<u64, DbError> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM check_results", [], |r| r.get(0))?;
        Ok(max.unwrap_or(0).max(0) as u64)
    }

    // --- Alert history ---

    /// Record a fired alert and return its ID.
    pub fn add_alert(&self, alert: &mut AlertRecord) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alerts (check_id, agent_id, agent_name, from_status, to_status, at, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                alert.check_id,
                alert.agent_id,
                alert.agent_name,
                alert.from.code(),
                alert.to.code(),
                fmt_db_time(&alert.at),
                alert.message,
            ],
        )?;
        alert.id = conn.last_insert_rowid();
        Ok(alert.id)
    }

    /// Alerts of a check, newest first.
    pub fn alerts_for_check(&self, check_id: i64, limit: usize) -> Result<Vec<AlertRecord>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM alerts WHERE check_id=?1 ORDER BY at DESC, id DESC LIMIT ?2",
            ALERT_COLUMNS
        ))?;
        let alerts = stmt
            .query_map(params![check_id, limit as i64], alert_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(alerts)
    }

    /// Delete alerts older than a cutoff. Returns the number removed.
    pub fn delete_alerts_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM alerts WHERE at < ?1",
            params![fmt_db_time(&cutoff)],
        )?;
        Ok(n)
    }

    /// Delete results ingested before a cutoff. Returns the number removed.
    pub fn delete_results_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM check_results WHERE ingested_at < ?1",
            params![fmt_db_time(&cutoff)],
        )?;
        Ok(n)
    }
}

fn write_page_checks(conn: &Connection, page_id: i64, checks: &[i64]) -> Result<(), DbError> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO status_page_checks (page_id, check_id, position) VALUES (?1, ?2, ?3)",
    )?;
    for (pos, check_id) in checks.iter().enumerate() {
        stmt.execute(params![page_id, check_id, pos as i64])?;
    }
    Ok(())
}

fn read_page_checks(conn: &Connection, page_id: i64) -> Result<Vec<i64>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT check_id FROM status_page_checks WHERE page_id=?1 ORDER BY position",
    )?;
    let ids = stmt
        .query_map(params![page_id], |r| r.get(0))?
        .collect::<SqlResult<Vec<i64>>>()?;
    Ok(ids)
}

fn map_constraint(e: rusqlite::Error) -> DbError {
    match &e {
        rusqlite::Error::SqliteFailure(err, msg) if err.code == ErrorCode::ConstraintViolation => {
            DbError::Conflict(msg.clone().unwrap_or_else(|| err.to_string()))
        }
        _ => DbError::Sqlite(e),
    }
}

fn placement_columns(p: &Placement) -> (&'static str, Option<i64>) {
    match *p {
        Placement::Agent(id) => ("agent", Some(id)),
        Placement::Region(id) => ("region", Some(id)),
        Placement::Country(id) => ("country", Some(id)),
        Placement::All => ("all", None),
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> SqlResult<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp {:?}", raw)))
}

fn check_from_row(row: &Row<'_>) -> SqlResult<CheckDefinition> {
    let kind_raw: String = row.get(3)?;
    let kind: CheckKind = kind_raw
        .parse()
        .map_err(|_| conversion_error(3, format!("unknown kind {:?}", kind_raw)))?;

    let placement_type: String = row.get(9)?;
    let placement_id: Option<i64> = row.get(10)?;
    let placement = match (placement_type.as_str(), placement_id) {
        ("agent", Some(id)) => Placement::Agent(id),
        ("region", Some(id)) => Placement::Region(id),
        ("country", Some(id)) => Placement::Country(id),
        ("all", _) => Placement::All,
        (other, _) => return Err(conversion_error(9, format!("bad placement {:?}", other))),
    };

    let channels: NotificationRoutes = json_column(row, 15)?;
    let target: CheckTarget = json_column(row, 16)?;
    if target.kind() != kind {
        return Err(conversion_error(16, format!("target is not a {} target", kind)));
    }

    Ok(CheckDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        enabled: row.get(4)?,
        interval: row.get(5)?,
        timeout: row.get(6)?,
        retries: row.get(7)?,
        threshold_timeout: row.get(8)?,
        placement,
        group: row.get(11)?,
        shared: row.get(12)?,
        runbook: row.get(13)?,
        priority: row.get(14)?,
        channels,
        target,
        created_at: time_column(row, 17)?,
        updated_at: time_column(row, 18)?,
    })
}

fn agent_from_row(row: &Row<'_>) -> SqlResult<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        server: row.get(3)?,
        port: row.get(4)?,
        enabled: row.get(5)?,
        shared: row.get(6)?,
        region_id: row.get(7)?,
    })
}

fn region_from_row(row: &Row<'_>) -> SqlResult<Region> {
    Ok(Region {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        enabled: row.get(3)?,
        shared: row.get(4)?,
        country_id: row.get(5)?,
    })
}

fn country_from_row(row: &Row<'_>) -> SqlResult<Country> {
    Ok(Country {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        enabled: row.get(3)?,
        shared: row.get(4)?,
    })
}

fn status_page_from_row(row: &Row<'_>) -> SqlResult<StatusPage> {
    Ok(StatusPage {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        description: row.get(3)?,
        custom_style: row.get(4)?,
        checks: Vec::new(),
    })
}

fn channel_from_row(row: &Row<'_>) -> SqlResult<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        config: json_column(row, 2)?,
    })
}

fn result_from_row(row: &Row<'_>) -> SqlResult<CheckResult> {
    let code: u8 = row.get(5)?;
    let status = CheckStatus::from_code(code)
        .ok_or_else(|| conversion_error(5, format!("unknown status {}", code)))?;
    let seq: i64 = row.get(2)?;
    let ssl_raw: Option<String> = row.get(19)?;
    let meta_raw: Option<String> = row.get(20)?;
    let meta = match meta_raw {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(20, Type::Text, Box::new(e)))?,
        None => ResultMeta::default(),
    };

    Ok(CheckResult {
        check_id: row.get(0)?,
        agent_id: row.get(1)?,
        seq: seq.max(0) as u64,
        time: time_column(row, 3)?,
        ingested_at: time_column(row, 4)?,
        status,
        message: row.get(6)?,
        timings: Timings {
            response_time: row.get(7)?,
            name_lookup: row.get(8)?,
            connect: row.get(9)?,
            app_connect: row.get(10)?,
            pre_transfer: row.get(11)?,
            redirect: row.get(12)?,
            start_transfer: row.get(13)?,
            download: row.get(14)?,
            min_resp_time: row.get(15)?,
            avg_resp_time: row.get(16)?,
            max_resp_time: row.get(17)?,
            packet_loss_percent: row.get(18)?,
        },
        ssl_expire_date: ssl_raw.as_deref().and_then(parse_db_time),
        meta,
    })
}

fn status_column(row: &Row<'_>, idx: usize) -> SqlResult<CheckStatus> {
    let code: u8 = row.get(idx)?;
    CheckStatus::from_code(code).ok_or_else(|| conversion_error(idx, format!("unknown status {}", code)))
}

fn alert_from_row(row: &Row<'_>) -> SqlResult<AlertRecord> {
    Ok(AlertRecord {
        id: row.get(0)?,
        check_id: row.get(1)?,
        agent_id: row.get(2)?,
        agent_name: row.get(3)?,
        from: status_column(row, 4)?,
        to: status_column(row, 5)?,
        at: time_column(row, 6)?,
        message: row.get(7)?,
    })
}

/// Format a timestamp the way it is stored.
pub fn fmt_db_time(t: &DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    // Try various formats
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
