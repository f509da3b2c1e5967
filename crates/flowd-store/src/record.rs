//! Row mapping shared by the flow, run, node and thread tables.
//!
//! Each of these tables has the same shape: a few indexed columns used for
//! filtering and ordering plus the full entity serialized as JSON in `body`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Params};
use serde::de::DeserializeOwned;
use serde::Serialize;

use flowd_core::error::{FlowdError, Result};
use flowd_core::types::{Flow, Node, Run, Thread};

pub(crate) fn db_err(e: impl std::fmt::Display) -> FlowdError {
    FlowdError::Database(e.to_string())
}

/// SQLite `OFFSET` for a page, clamped to the signed range.
pub(crate) fn sql_offset(page: &flowd_core::types::PageRequest) -> i64 {
    i64::try_from(page.offset()).unwrap_or(i64::MAX)
}

/// Fixed-width RFC 3339 so text comparison matches time order.
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) trait Record: Serialize + DeserializeOwned {
    const TABLE: &'static str;
    const ENTITY: &'static str;

    fn key(&self) -> &str;
    /// Account id for flows, owning flow or run id for the rest.
    fn parent(&self) -> &str;
    fn status(&self) -> Option<&'static str>;
    fn created_at(&self) -> &DateTime<Utc>;
    fn touch(&mut self, _now: DateTime<Utc>) {}
}

impl Record for Flow {
    const TABLE: &'static str = "flows";
    const ENTITY: &'static str = "flow";

    fn key(&self) -> &str {
        self.id.as_str()
    }
    fn parent(&self) -> &str {
        &self.account_id
    }
    fn status(&self) -> Option<&'static str> {
        Some(self.status.as_str())
    }
    fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

impl Record for Run {
    const TABLE: &'static str = "runs";
    const ENTITY: &'static str = "run";

    fn key(&self) -> &str {
        self.id.as_str()
    }
    fn parent(&self) -> &str {
        self.flow_id.as_str()
    }
    fn status(&self) -> Option<&'static str> {
        Some(self.status.as_str())
    }
    fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

impl Record for Node {
    const TABLE: &'static str = "nodes";
    const ENTITY: &'static str = "node";

    fn key(&self) -> &str {
        self.id.as_str()
    }
    fn parent(&self) -> &str {
        self.run_id.as_str()
    }
    fn status(&self) -> Option<&'static str> {
        Some(self.status.as_str())
    }
    fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

impl Record for Thread {
    const TABLE: &'static str = "threads";
    const ENTITY: &'static str = "thread";

    fn key(&self) -> &str {
        self.id.as_str()
    }
    fn parent(&self) -> &str {
        self.run_id.as_str()
    }
    fn status(&self) -> Option<&'static str> {
        None
    }
    fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }
}

pub(crate) fn insert<T: Record>(conn: &Connection, record: &T) -> Result<()> {
    let body = serde_json::to_string(record)?;
    conn.execute(
        &format!(
            "INSERT INTO {} (id, parent, status, created_at, body) VALUES (?1, ?2, ?3, ?4, ?5)",
            T::TABLE
        ),
        params![record.key(), record.parent(), record.status(), ts(record.created_at()), body],
    )
    .map_err(db_err)?;
    Ok(())
}

pub(crate) fn write<T: Record>(conn: &Connection, record: &T) -> Result<()> {
    let body = serde_json::to_string(record)?;
    let changed = conn
        .execute(
            &format!("UPDATE {} SET status = ?2, body = ?3 WHERE id = ?1", T::TABLE),
            params![record.key(), record.status(), body],
        )
        .map_err(db_err)?;
    if changed == 0 {
        return Err(FlowdError::not_found(T::ENTITY, record.key()));
    }
    Ok(())
}

pub(crate) fn fetch<T: Record>(conn: &Connection, id: &str) -> Result<Option<T>> {
    let body: Option<String> = conn
        .query_row(
            &format!("SELECT body FROM {} WHERE id = ?1", T::TABLE),
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    body.map(|b| serde_json::from_str(&b).map_err(FlowdError::from))
        .transpose()
}

/// Run a query whose first column is a JSON body and decode every row.
pub(crate) fn query_bodies<T: DeserializeOwned, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(db_err)?;

    let mut out = Vec::new();
    for body in rows {
        let body = body.map_err(db_err)?;
        out.push(serde_json::from_str(&body)?);
    }
    Ok(out)
}
