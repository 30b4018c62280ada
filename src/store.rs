//! # Tenant Storage Environment
//!
//! One SQLite database per tenant, WAL mode, living at
//! `{dbDir}/tenants/{tenantId}/events.db`. The environment enforces the
//! single-writer invariant with one owned write connection behind a mutex,
//! and serves readers from a small checked-out pool of read-only connections.
//!
//! ## Schema
//!
//! ```text
//! meta         key TEXT PK, value INTEGER            schema version record
//! events       lev_id INTEGER PK AUTOINCREMENT,      primary record: packed
//!              id BLOB UNIQUE, pubkey, created_at,   bytes plus canonical
//!              kind, packed BLOB, json TEXT          JSON, both stored
//! tags         lev_id, letter, value, created_at     per-letter tag index
//! tenants      tenant_id TEXT PK, record TEXT        directory records
//!                                                    (default env only)
//! ```
//!
//! Secondary indices: unique on `id`, `(pubkey, created_at)`,
//! `(kind, created_at)`, `(created_at)`, `(letter, value, created_at)` on
//! tags, and `(created_at, id)` as the reconciliation index.
//!
//! ## Invariants
//!
//! - `lev_id` strictly increases per tenant; SQLite AUTOINCREMENT guarantees
//!   no reuse even across deletes.
//! - The event-by-id index is unique; [`insert_event`] re-checks existence
//!   inside its transaction so a racing duplicate resolves to `Duplicate`
//!   rather than a constraint error.
//! - Deleting an event removes its tag rows in the same transaction.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use tracing::info;

use crate::config::DbParams;
use crate::error::Result;
use crate::event::VerifiedEvent;
use crate::filter::{Filter, FilterGroup, Prefix};
use crate::types::TenantId;

/// Current schema version, written into `meta` on first open.
const SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS events (
    lev_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    id         BLOB NOT NULL,
    pubkey     BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    kind       INTEGER NOT NULL,
    packed     BLOB NOT NULL,
    json       TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS events_id ON events(id);
CREATE INDEX IF NOT EXISTS events_pubkey_created ON events(pubkey, created_at);
CREATE INDEX IF NOT EXISTS events_kind_created ON events(kind, created_at);
CREATE INDEX IF NOT EXISTS events_created ON events(created_at);
CREATE TABLE IF NOT EXISTS tags (
    lev_id     INTEGER NOT NULL,
    letter     TEXT NOT NULL,
    value      TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS tags_letter_value_created ON tags(letter, value, created_at);
CREATE INDEX IF NOT EXISTS tags_lev ON tags(lev_id);
CREATE TABLE IF NOT EXISTS tenants (
    tenant_id TEXT PRIMARY KEY,
    record    TEXT NOT NULL
);
"#;

/// The reconciliation index, created in the same transaction as the schema
/// version record.
const CREATE_RECONCILE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS events_created_id ON events(created_at, id)";

// =============================================================================
// Environment
// =============================================================================

/// A per-tenant storage environment handle. Shared across all workers via
/// `Arc`; internally synchronized per the single-writer, multi-reader model.
pub struct TenantEnv {
    tenant: TenantId,
    dir: PathBuf,
    db_path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    max_readers: usize,
    mmap_size: u64,
}

impl TenantEnv {
    /// Opens (creating if needed) the environment for `tenant` under
    /// `tenants_root`. Runs schema initialization transactionally: if the
    /// meta record is absent, the schema version and reconciliation index are
    /// installed together.
    pub fn open(tenants_root: &Path, tenant: &TenantId, params: &DbParams) -> Result<Arc<Self>> {
        let dir = tenants_root.join(tenant.as_str());
        std::fs::create_dir_all(&dir)?;
        let db_path = dir.join("events.db");

        let mmap_size = if params.no_read_ahead { 0 } else { params.mapsize };

        let mut conn = Connection::open(&db_path)?;
        tune_connection(&conn, mmap_size)?;

        {
            let tx = conn.transaction()?;
            tx.execute_batch(CREATE_SCHEMA)?;
            let version: Option<i64> = tx
                .query_row("SELECT value FROM meta WHERE key = 'version'", [], |r| r.get(0))
                .optional()?;
            if version.is_none() {
                tx.execute(
                    "INSERT INTO meta (key, value) VALUES ('version', ?1)",
                    params![SCHEMA_VERSION],
                )?;
                tx.execute_batch(CREATE_RECONCILE_INDEX)?;
                info!(tenant = %tenant, path = %db_path.display(), "initialized tenant environment");
            }
            tx.commit()?;
        }

        Ok(Arc::new(Self {
            tenant: tenant.clone(),
            dir,
            db_path,
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
            max_readers: params.maxreaders.max(1),
            mmap_size,
        }))
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Directory holding this environment's files; the change watcher points
    /// here because WAL commits touch the `-wal` sibling, not the main file.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Locks the write connection. One writer per environment at a time.
    pub fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().expect("writer mutex poisoned")
    }

    /// Checks out a read-only connection, opening a new one when the pool is
    /// empty. In WAL mode each fresh read sees the latest committed state.
    pub fn reader(&self) -> Result<ReadGuard<'_>> {
        let pooled = self.readers.lock().expect("reader pool poisoned").pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => {
                let conn = Connection::open_with_flags(
                    &self.db_path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(Duration::from_secs(5))?;
                if self.mmap_size > 0 {
                    let _: i64 = conn.query_row(
                        &format!("PRAGMA mmap_size={}", self.mmap_size),
                        [],
                        |r| r.get(0),
                    )?;
                }
                conn
            }
        };
        Ok(ReadGuard {
            env: self,
            conn: Some(conn),
        })
    }
}

fn tune_connection(conn: &Connection, mmap_size: u64) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    if mmap_size > 0 {
        let _: i64 = conn.query_row(&format!("PRAGMA mmap_size={mmap_size}"), [], |r| r.get(0))?;
    }
    Ok(())
}

/// A checked-out read connection, returned to the pool on drop.
pub struct ReadGuard<'a> {
    env: &'a TenantEnv,
    conn: Option<Connection>,
}

impl Deref for ReadGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut pool = self.env.readers.lock().expect("reader pool poisoned");
            if pool.len() < self.env.max_readers {
                pool.push(conn);
            }
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

/// A committed event as read back from the environment.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub lev_id: u64,
    pub created_at: u64,
    pub packed: Vec<u8>,
    pub json: String,
}

/// Outcome of a durable append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Committed under this fresh sequence number.
    Stored(u64),
    /// An event with this id already exists; nothing was written.
    Duplicate,
}

// =============================================================================
// Write Operations
// =============================================================================

/// Appends a verified event: one read-write transaction that re-checks id
/// existence, inserts the primary record, and populates every tag row.
pub fn insert_event(conn: &mut Connection, ev: &VerifiedEvent) -> Result<InsertOutcome> {
    let tx = conn.transaction()?;

    let existing: Option<i64> = tx
        .query_row(
            "SELECT lev_id FROM events WHERE id = ?1",
            params![&ev.event.id[..]],
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Ok(InsertOutcome::Duplicate);
    }

    tx.execute(
        "INSERT INTO events (id, pubkey, created_at, kind, packed, json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            &ev.event.id[..],
            &ev.event.pubkey[..],
            ev.event.created_at as i64,
            ev.event.kind as i64,
            &ev.packed,
            &ev.json,
        ],
    )?;
    let lev_id = tx.last_insert_rowid() as u64;

    for tag in &ev.event.tags {
        let name = match tag.first() {
            Some(name) if name.len() == 1 => name,
            _ => continue,
        };
        let value = tag.get(1).map(String::as_str).unwrap_or("");
        tx.execute(
            "INSERT INTO tags (lev_id, letter, value, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![lev_id as i64, name, value, ev.event.created_at as i64],
        )?;
    }

    tx.commit()?;
    Ok(InsertOutcome::Stored(lev_id))
}

/// Removes an event and all of its secondary index entries atomically.
/// Returns false when no such event exists.
pub fn delete_event(conn: &mut Connection, id: &[u8; 32]) -> Result<bool> {
    let tx = conn.transaction()?;
    let lev: Option<i64> = tx
        .query_row("SELECT lev_id FROM events WHERE id = ?1", params![&id[..]], |r| r.get(0))
        .optional()?;
    let Some(lev) = lev else {
        return Ok(false);
    };
    tx.execute("DELETE FROM tags WHERE lev_id = ?1", params![lev])?;
    tx.execute("DELETE FROM events WHERE lev_id = ?1", params![lev])?;
    tx.commit()?;
    Ok(true)
}

// =============================================================================
// Read Operations
// =============================================================================

/// Looks up an event by id, returning its sequence number.
pub fn lookup_event_by_id(conn: &Connection, id: &[u8; 32]) -> Result<Option<u64>> {
    let lev: Option<i64> = conn
        .query_row("SELECT lev_id FROM events WHERE id = ?1", params![&id[..]], |r| r.get(0))
        .optional()?;
    Ok(lev.map(|l| l as u64))
}

/// Highest committed sequence number, zero when the store is empty.
pub fn max_lev_id(conn: &Connection) -> Result<u64> {
    let max: Option<i64> = conn.query_row("SELECT MAX(lev_id) FROM events", [], |r| r.get(0))?;
    Ok(max.unwrap_or(0) as u64)
}

/// All events committed after `after`, in insertion order. Used by the live
/// monitor for both the handoff-gap rescan and change processing.
pub fn events_after(conn: &Connection, after: u64) -> Result<Vec<StoredEvent>> {
    let mut stmt = conn.prepare(
        "SELECT lev_id, created_at, packed, json FROM events
         WHERE lev_id > ?1 ORDER BY lev_id ASC",
    )?;
    let rows = stmt.query_map(params![after as i64], row_to_stored)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    Ok(StoredEvent {
        lev_id: row.get::<_, i64>(0)? as u64,
        created_at: row.get::<_, i64>(1)? as u64,
        packed: row.get(2)?,
        json: row.get(3)?,
    })
}

// =============================================================================
// Backfill Access Paths
// =============================================================================

/// The index a backfill scan iterates for one filter. Selection prefers the
/// most selective constraint present; every returned row is still re-checked
/// against the full filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPath {
    /// Direct id-index range scans. Result sets are small; one page returns
    /// everything.
    Ids,
    /// The tag index, driven by the filter's tag constraint at this position.
    Tag(usize),
    /// The (pubkey, created_at) index.
    Authors,
    /// The (kind, created_at) index.
    Kinds,
    /// The plain created_at index.
    CreatedAt,
}

pub fn choose_path(filter: &Filter) -> AccessPath {
    if !filter.ids.is_empty() {
        AccessPath::Ids
    } else if !filter.tags.is_empty() {
        AccessPath::Tag(0)
    } else if !filter.authors.is_empty() {
        AccessPath::Authors
    } else if !filter.kinds.is_empty() {
        AccessPath::Kinds
    } else {
        AccessPath::CreatedAt
    }
}

/// One page of a backfill scan: up to `rows` candidates in descending
/// `(created_at, lev_id)` order, bounded by the filter's time window, by the
/// backfill high-water mark `max_lev`, and by the resumption `cursor`.
///
/// For [`AccessPath::Ids`] the cursor is ignored and the page holds every
/// candidate; the caller treats that path as exhausted after one page.
pub fn backfill_page(
    conn: &Connection,
    filter: &Filter,
    path: AccessPath,
    cursor: Option<(u64, u64)>,
    max_lev: u64,
    rows: usize,
) -> Result<Vec<StoredEvent>> {
    match path {
        AccessPath::Ids => ids_page(conn, filter, max_lev),
        AccessPath::Tag(i) => {
            let (letter, values) = &filter.tags[i];
            let mut sql = String::from(
                "SELECT DISTINCT e.lev_id, e.created_at, e.packed, e.json
                 FROM tags t JOIN events e ON e.lev_id = t.lev_id
                 WHERE t.letter = ? AND e.lev_id <= ?",
            );
            let mut args: Vec<SqlValue> = vec![
                SqlValue::Text((*letter as char).to_string()),
                SqlValue::Integer(max_lev as i64),
            ];
            sql.push_str(&in_clause("t.value", values.len()));
            args.extend(values.iter().map(|v| SqlValue::Text(v.clone())));
            scan_page(conn, sql, args, filter, cursor, rows, "e")
        }
        AccessPath::Authors => {
            let mut sql = String::from(
                "SELECT e.lev_id, e.created_at, e.packed, e.json FROM events e
                 WHERE e.lev_id <= ?",
            );
            let mut args: Vec<SqlValue> = vec![SqlValue::Integer(max_lev as i64)];
            sql.push_str(&prefix_ranges("e.pubkey", &filter.authors, &mut args));
            scan_page(conn, sql, args, filter, cursor, rows, "e")
        }
        AccessPath::Kinds => {
            let mut sql = String::from(
                "SELECT e.lev_id, e.created_at, e.packed, e.json FROM events e
                 WHERE e.lev_id <= ?",
            );
            let mut args: Vec<SqlValue> = vec![SqlValue::Integer(max_lev as i64)];
            sql.push_str(&in_clause("e.kind", filter.kinds.len()));
            args.extend(filter.kinds.iter().map(|k| SqlValue::Integer(*k as i64)));
            scan_page(conn, sql, args, filter, cursor, rows, "e")
        }
        AccessPath::CreatedAt => {
            let sql = String::from(
                "SELECT e.lev_id, e.created_at, e.packed, e.json FROM events e
                 WHERE e.lev_id <= ?",
            );
            let args: Vec<SqlValue> = vec![SqlValue::Integer(max_lev as i64)];
            scan_page(conn, sql, args, filter, cursor, rows, "e")
        }
    }
}

fn ids_page(conn: &Connection, filter: &Filter, max_lev: u64) -> Result<Vec<StoredEvent>> {
    let mut out: Vec<StoredEvent> = Vec::new();
    for prefix in &filter.ids {
        let mut stmt = conn.prepare(
            "SELECT lev_id, created_at, packed, json FROM events
             WHERE id BETWEEN ?1 AND ?2 AND lev_id <= ?3",
        )?;
        let rows = stmt.query_map(
            params![
                &prefix.range_lo()[..],
                &prefix.range_hi()[..],
                max_lev as i64
            ],
            row_to_stored,
        )?;
        for row in rows {
            let row = row?;
            if !out.iter().any(|e| e.lev_id == row.lev_id) {
                out.push(row);
            }
        }
    }
    out.sort_by(|a, b| (b.created_at, b.lev_id).cmp(&(a.created_at, a.lev_id)));
    Ok(out)
}

fn scan_page(
    conn: &Connection,
    mut sql: String,
    mut args: Vec<SqlValue>,
    filter: &Filter,
    cursor: Option<(u64, u64)>,
    rows: usize,
    alias: &str,
) -> Result<Vec<StoredEvent>> {
    if let Some(since) = filter.since {
        sql.push_str(&format!(" AND {alias}.created_at >= ?"));
        args.push(SqlValue::Integer(since as i64));
    }
    if let Some(until) = filter.until {
        sql.push_str(&format!(" AND {alias}.created_at <= ?"));
        args.push(SqlValue::Integer(until as i64));
    }
    if let Some((created_at, lev_id)) = cursor {
        sql.push_str(&format!(
            " AND ({alias}.created_at < ? OR ({alias}.created_at = ? AND {alias}.lev_id < ?))"
        ));
        args.push(SqlValue::Integer(created_at as i64));
        args.push(SqlValue::Integer(created_at as i64));
        args.push(SqlValue::Integer(lev_id as i64));
    }
    sql.push_str(&format!(
        " ORDER BY {alias}.created_at DESC, {alias}.lev_id DESC LIMIT ?"
    ));
    args.push(SqlValue::Integer(rows as i64));

    let mut stmt = conn.prepare(&sql)?;
    let mapped = stmt.query_map(params_from_iter(args), row_to_stored)?;
    mapped.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

fn in_clause(column: &str, n: usize) -> String {
    let placeholders = vec!["?"; n.max(1)].join(",");
    format!(" AND {column} IN ({placeholders})")
}

fn prefix_ranges(column: &str, prefixes: &[Prefix], args: &mut Vec<SqlValue>) -> String {
    let clauses: Vec<String> = prefixes
        .iter()
        .map(|p| {
            args.push(SqlValue::Blob(p.range_lo().to_vec()));
            args.push(SqlValue::Blob(p.range_hi().to_vec()));
            format!("{column} BETWEEN ? AND ?")
        })
        .collect();
    format!(" AND ({})", clauses.join(" OR "))
}

// =============================================================================
// Reconciliation Snapshot
// =============================================================================

/// The `(created_at, id)` items of every event matching the group, ascending,
/// capped at `limit`. This is the set a reconciliation session is sealed over.
pub fn reconcile_items(
    conn: &Connection,
    group: &FilterGroup,
    limit: usize,
) -> Result<Vec<(u64, [u8; 32])>> {
    use crate::event::PackedEvent;

    let mut stmt = conn.prepare(
        "SELECT created_at, id, packed FROM events ORDER BY created_at ASC, id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let packed: Vec<u8> = row.get(2)?;
        if !group.matches(&PackedEvent::new(&packed)) {
            continue;
        }
        let created_at = row.get::<_, i64>(0)? as u64;
        let id: Vec<u8> = row.get(1)?;
        let id: [u8; 32] = id.as_slice().try_into().expect("stored id is 32 bytes");
        out.push((created_at, id));
        if out.len() >= limit {
            break;
        }
    }
    Ok(out)
}

// =============================================================================
// Directory Records
// =============================================================================

/// Loads every tenant directory record (only meaningful in the default env).
pub fn load_tenant_records(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT tenant_id, record FROM tenants")?;
    let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Inserts or replaces one tenant directory record.
pub fn save_tenant_record(conn: &Connection, tenant_id: &str, record: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO tenants (tenant_id, record) VALUES (?1, ?2)",
        params![tenant_id, record],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    fn open_env(dir: &Path) -> Arc<TenantEnv> {
        TenantEnv::open(dir, &TenantId::default_tenant(), &DbParams::default()).unwrap()
    }

    fn verified(id_byte: u8, created_at: u64, kind: u64, tags: Vec<Vec<String>>) -> VerifiedEvent {
        let event = Event {
            id: [id_byte; 32],
            pubkey: [0xEE; 32],
            created_at,
            kind,
            tags,
            content: String::new(),
            sig: [0; 64],
        };
        let packed = event.pack();
        let json = event.to_json();
        VerifiedEvent {
            event,
            packed,
            json,
        }
    }

    #[test]
    fn lev_ids_strictly_increase() {
        let dir = tempfile::TempDir::new().unwrap();
        let env = open_env(dir.path());
        let mut conn = env.writer();

        let a = insert_event(&mut conn, &verified(1, 100, 1, vec![])).unwrap();
        let b = insert_event(&mut conn, &verified(2, 50, 1, vec![])).unwrap();
        match (a, b) {
            (InsertOutcome::Stored(la), InsertOutcome::Stored(lb)) => assert!(la < lb),
            other => panic!("unexpected outcomes: {other:?}"),
        }
    }

    #[test]
    fn duplicate_insert_is_detected() {
        let dir = tempfile::TempDir::new().unwrap();
        let env = open_env(dir.path());
        let mut conn = env.writer();

        assert!(matches!(
            insert_event(&mut conn, &verified(7, 100, 1, vec![])).unwrap(),
            InsertOutcome::Stored(_)
        ));
        assert_eq!(
            insert_event(&mut conn, &verified(7, 100, 1, vec![])).unwrap(),
            InsertOutcome::Duplicate
        );
    }

    #[test]
    fn delete_removes_tag_rows_atomically() {
        let dir = tempfile::TempDir::new().unwrap();
        let env = open_env(dir.path());
        let mut conn = env.writer();

        let tags = vec![vec!["e".to_string(), "cafe".to_string()]];
        insert_event(&mut conn, &verified(9, 100, 1, tags)).unwrap();

        assert!(delete_event(&mut conn, &[9; 32]).unwrap());
        assert!(!delete_event(&mut conn, &[9; 32]).unwrap());

        let tag_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM tags", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tag_rows, 0);
        assert!(lookup_event_by_id(&conn, &[9; 32]).unwrap().is_none());
    }

    #[test]
    fn reopen_preserves_schema_version_and_data() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let env = open_env(dir.path());
            let mut conn = env.writer();
            insert_event(&mut conn, &verified(3, 100, 1, vec![])).unwrap();
        }
        let env = open_env(dir.path());
        let reader = env.reader().unwrap();
        assert_eq!(max_lev_id(&reader).unwrap(), 1);
        let version: i64 = reader
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn backfill_pages_descend_with_cursor() {
        let dir = tempfile::TempDir::new().unwrap();
        let env = open_env(dir.path());
        {
            let mut conn = env.writer();
            for (id, ts) in [(1u8, 100u64), (2, 300), (3, 200), (4, 400)] {
                insert_event(&mut conn, &verified(id, ts, 1, vec![])).unwrap();
            }
        }
        let reader = env.reader().unwrap();
        let filter = Filter::default();
        let max_lev = max_lev_id(&reader).unwrap();

        let page1 =
            backfill_page(&reader, &filter, AccessPath::CreatedAt, None, max_lev, 2).unwrap();
        assert_eq!(page1.iter().map(|e| e.created_at).collect::<Vec<_>>(), vec![400, 300]);

        let last = &page1[1];
        let cursor = Some((last.created_at, last.lev_id));
        let page2 =
            backfill_page(&reader, &filter, AccessPath::CreatedAt, cursor, max_lev, 2).unwrap();
        assert_eq!(page2.iter().map(|e| e.created_at).collect::<Vec<_>>(), vec![200, 100]);
    }

    #[test]
    fn access_path_selection_order() {
        let mut f = Filter::default();
        assert_eq!(choose_path(&f), AccessPath::CreatedAt);
        f.kinds = vec![1];
        assert_eq!(choose_path(&f), AccessPath::Kinds);
        f.authors = vec![Prefix::parse("ab").unwrap()];
        assert_eq!(choose_path(&f), AccessPath::Authors);
        f.tags = vec![(b'e', vec!["x".to_string()])];
        assert_eq!(choose_path(&f), AccessPath::Tag(0));
        f.ids = vec![Prefix::parse("cd").unwrap()];
        assert_eq!(choose_path(&f), AccessPath::Ids);
    }
}
