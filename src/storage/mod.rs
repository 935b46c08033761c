//! # Storage Module - Local State Store
//!
//! SQLite persistence for the node list and message history.
//!
//! ## Features
//!
//! - **Upserts**: node updates are field-merged inside one `IMMEDIATE` transaction; messages
//!   are deduplicated on their id and only ever have their ack status patched
//! - **Per-thread connections**: each thread lazily opens its own connection on first use;
//!   there is no store-wide lock and the handle is freely `Clone + Send + Sync`
//! - **WAL journaling**: readers on other threads never block the writer
//! - **Busy retries**: `SQLITE_BUSY` / `SQLITE_LOCKED` are retried with exponential backoff
//! - **Lazy cursors**: [`NodeCursor`] and [`MessageCursor`] page through results by keyset
//!
//! ## Schema
//!
//! ```text
//! nodes(id PK, num, long_name, short_name, hw_model, role, lat, lon, alt, battery,
//!       voltage, channel_util, air_util_tx, uptime_seconds, snr, hops_away, last_heard)
//! messages(id PK, channel, from_node, to_node, text, timestamp, ack_status, rx_snr, outgoing,
//!          from_name)
//! ```
//!
//! Databases created before `from_name` existed get the column added on open.
//!
//! `last_heard` is stored in Unix seconds, message `timestamp` in Unix milliseconds.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshclient::model::{NodeEntry, NodeId};
//! use meshclient::storage::{StateStore, StoreSettings};
//!
//! fn main() -> Result<(), meshclient::error::StorageError> {
//!     let store = StateStore::open("mesh_client.db", StoreSettings::default())?;
//!     let mut update = NodeEntry::new(NodeId::new("!a1b2c3d4"));
//!     update.long_name = Some("Base Camp".into());
//!     let merged = store.upsert_node(&update)?;
//!     println!("{}", merged.display_name());
//!     for node in store.list_nodes() {
//!         println!("{}", node?.id);
//!     }
//!     Ok(())
//! }
//! ```

mod cursor;

pub use cursor::{MessageCursor, NodeCursor};

use crate::error::StorageError;
use crate::model::{AckStatus, Battery, Message, MessageId, NodeEntry, NodeId, Position};
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id             TEXT PRIMARY KEY,
        num            INTEGER,
        long_name      TEXT,
        short_name     TEXT,
        hw_model       INTEGER,
        role           INTEGER,
        lat            REAL,
        lon            REAL,
        alt            INTEGER,
        battery        INTEGER,
        voltage        REAL,
        channel_util   REAL,
        air_util_tx    REAL,
        uptime_seconds INTEGER,
        snr            REAL,
        hops_away      INTEGER,
        last_heard     INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_nodes_last_heard ON nodes (last_heard);

    CREATE TABLE IF NOT EXISTS messages (
        id         TEXT PRIMARY KEY,
        channel    INTEGER NOT NULL,
        from_node  TEXT NOT NULL,
        to_node    TEXT NOT NULL,
        text       TEXT NOT NULL,
        timestamp  INTEGER NOT NULL,
        ack_status TEXT NOT NULL DEFAULT 'unacknowledged',
        rx_snr     REAL,
        outgoing   INTEGER NOT NULL DEFAULT 0,
        from_name  TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_messages_channel_ts ON messages (channel, timestamp, id);
"#;

const NODE_COLUMNS: &str = "id, num, long_name, short_name, hw_model, role, lat, lon, alt, battery, \
     voltage, channel_util, air_util_tx, uptime_seconds, snr, hops_away, last_heard";

const MESSAGE_COLUMNS: &str =
    "id, channel, from_node, to_node, text, timestamp, ack_status, rx_snr, outgoing, from_name";

thread_local! {
    static CONNECTIONS: RefCell<HashMap<PathBuf, Connection>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// SQLite's own busy handler wait before it reports `SQLITE_BUSY`.
    pub busy_timeout: Duration,
    /// Extra attempts after the busy handler gives up.
    pub max_retries: u32,
    /// First retry delay; doubles on every attempt.
    pub retry_backoff: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            busy_timeout: Duration::from_secs(5),
            max_retries: 5,
            retry_backoff: Duration::from_millis(20),
        }
    }
}

/// Outcome of [`StateStore::upsert_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct MessageUpsert {
    /// The row as stored after the upsert.
    pub message: Message,
    pub inserted: bool,
    pub status_changed: bool,
}

impl MessageUpsert {
    /// Whether observers have something new to see.
    pub fn is_news(&self) -> bool {
        self.inserted || self.status_changed
    }
}

/// Outcome of [`StateStore::set_ack_status`].
#[derive(Debug, Clone, PartialEq)]
pub enum AckUpdate {
    /// No message with that id is stored.
    Unknown,
    Unchanged(Message),
    Changed(Message),
}

/// Handle to the database file. Cloning is cheap; every thread gets its own connection.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: Arc<PathBuf>,
    settings: StoreSettings,
}

fn open_connection(path: &Path, settings: &StoreSettings) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(settings.busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    trace!(
        "opened sqlite connection to {} on {:?}",
        path.display(),
        std::thread::current().name()
    );
    Ok(conn)
}

/// Bring a database written by an older build up to the current schema.
fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let has_from_name = conn
        .prepare("SELECT 1 FROM pragma_table_info('messages') WHERE name = 'from_name'")?
        .exists([])?;
    if !has_from_name {
        debug!("adding messages.from_name column");
        conn.execute_batch("ALTER TABLE messages ADD COLUMN from_name TEXT")?;
    }
    Ok(())
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

fn classify(err: rusqlite::Error) -> StorageError {
    match err {
        rusqlite::Error::FromSqlConversionFailure(col, _, cause) => {
            StorageError::Corrupt(format!("column {}: {}", col, cause))
        }
        other => StorageError::Sqlite(other),
    }
}

fn corrupt(col: usize, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, Type::Text, detail.into())
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeEntry> {
    let id: String = row.get(0)?;
    let lat: Option<f64> = row.get(6)?;
    let lon: Option<f64> = row.get(7)?;
    let last_heard = match row.get::<_, Option<i64>>(16)? {
        Some(secs) => Some(
            DateTime::<Utc>::from_timestamp(secs, 0)
                .ok_or_else(|| corrupt(16, format!("last_heard {} out of range", secs)))?,
        ),
        None => None,
    };
    Ok(NodeEntry {
        id: NodeId::new(id),
        num: row.get::<_, Option<i64>>(1)?.map(|n| n as u32),
        long_name: row.get(2)?,
        short_name: row.get(3)?,
        hw_model: row.get(4)?,
        role: row.get(5)?,
        position: match (lat, lon) {
            (Some(latitude), Some(longitude)) => Some(Position {
                latitude,
                longitude,
                altitude: row.get(8)?,
            }),
            _ => None,
        },
        battery: row
            .get::<_, Option<i64>>(9)?
            .map(|raw| Battery::from_raw(raw.clamp(0, u32::MAX as i64) as u32)),
        voltage: row.get::<_, Option<f64>>(10)?.map(|v| v as f32),
        channel_utilization: row.get::<_, Option<f64>>(11)?.map(|v| v as f32),
        air_util_tx: row.get::<_, Option<f64>>(12)?.map(|v| v as f32),
        uptime_seconds: row.get::<_, Option<i64>>(13)?.map(|v| v as u32),
        snr: row.get::<_, Option<f64>>(14)?.map(|v| v as f32),
        hops_away: row.get::<_, Option<i64>>(15)?.map(|v| v as u32),
        last_heard,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let ms: i64 = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(Message {
        id: MessageId::new(row.get::<_, String>(0)?),
        channel: row.get::<_, i64>(1)? as u32,
        from: NodeId::new(row.get::<_, String>(2)?),
        to: NodeId::new(row.get::<_, String>(3)?),
        text: row.get(4)?,
        timestamp: DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| corrupt(5, format!("timestamp {} out of range", ms)))?,
        ack_status: status.parse::<AckStatus>().map_err(|e| corrupt(6, e))?,
        rx_snr: row.get::<_, Option<f64>>(7)?.map(|v| v as f32),
        outgoing: row.get(8)?,
        from_name: row.get(9)?,
    })
}

fn write_node(conn: &Connection, n: &NodeEntry) -> rusqlite::Result<()> {
    let sql = format!(
        "INSERT INTO nodes ({NODE_COLUMNS}) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17) \
         ON CONFLICT(id) DO UPDATE SET \
            num = excluded.num, long_name = excluded.long_name, \
            short_name = excluded.short_name, hw_model = excluded.hw_model, \
            role = excluded.role, lat = excluded.lat, lon = excluded.lon, alt = excluded.alt, \
            battery = excluded.battery, voltage = excluded.voltage, \
            channel_util = excluded.channel_util, air_util_tx = excluded.air_util_tx, \
            uptime_seconds = excluded.uptime_seconds, snr = excluded.snr, \
            hops_away = excluded.hops_away, last_heard = excluded.last_heard"
    );
    conn.prepare_cached(&sql)?.execute(params![
        n.id.as_str(),
        n.num.map(i64::from),
        n.long_name,
        n.short_name,
        n.hw_model,
        n.role,
        n.position.map(|p| p.latitude),
        n.position.map(|p| p.longitude),
        n.position.and_then(|p| p.altitude),
        n.battery.map(|b| i64::from(b.to_raw())),
        n.voltage.map(f64::from),
        n.channel_utilization.map(f64::from),
        n.air_util_tx.map(f64::from),
        n.uptime_seconds.map(i64::from),
        n.snr.map(f64::from),
        n.hops_away.map(i64::from),
        n.last_heard.map(|t| t.timestamp()),
    ])?;
    Ok(())
}

fn read_node(conn: &Connection, id: &NodeId) -> rusqlite::Result<Option<NodeEntry>> {
    conn.prepare_cached(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"))?
        .query_row(params![id.as_str()], node_from_row)
        .optional()
}

fn read_message(conn: &Connection, id: &MessageId) -> rusqlite::Result<Option<Message>> {
    conn.prepare_cached(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?
        .query_row(params![id.as_str()], message_from_row)
        .optional()
}

/// Patch the ack status. Never regresses to unacknowledged and never overrides a recorded
/// acknowledgment. Returns whether the row changed.
fn patch_ack(conn: &Connection, id: &MessageId, status: AckStatus) -> rusqlite::Result<bool> {
    if !status.is_outcome() {
        return Ok(false);
    }
    let changed = conn
        .prepare_cached(
            "UPDATE messages SET ack_status = ?2 \
             WHERE id = ?1 AND ack_status <> ?2 AND ack_status <> 'acknowledged'",
        )?
        .execute(params![id.as_str(), status.as_str()])?;
    Ok(changed == 1)
}

impl StateStore {
    /// Open (creating if needed) the database at `path` and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>, settings: StoreSettings) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = StateStore {
            path: Arc::new(path),
            settings,
        };
        store.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            migrate(conn)
        })?;
        debug!("State store ready at {}", store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` on this thread's connection, retrying transient lock contention.
    pub(crate) fn with_conn<T>(
        &self,
        mut op: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StorageError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = CONNECTIONS.with(|cell| {
                let mut conns = cell.borrow_mut();
                let conn = match conns.entry(self.path.to_path_buf()) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(e) => e.insert(open_connection(&self.path, &self.settings)?),
                };
                op(conn)
            });
            match result {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) && attempt <= self.settings.max_retries => {
                    let delay = self
                        .settings
                        .retry_backoff
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    debug!("database busy (attempt {}), retrying in {:?}", attempt, delay);
                    std::thread::sleep(delay);
                }
                Err(e) if is_transient(&e) => {
                    warn!("database still busy after {} attempts", attempt);
                    return Err(StorageError::Busy {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => return Err(classify(e)),
            }
        }
    }

    /// Drop the calling thread's connection now rather than at thread exit.
    pub fn close_thread_connection(&self) {
        let _ = CONNECTIONS.try_with(|cell| {
            if let Ok(mut conns) = cell.try_borrow_mut() {
                conns.remove(self.path.as_path());
            }
        });
    }

    /// Merge `update` into the stored entry (creating it if unseen) and return the result.
    pub fn upsert_node(&self, update: &NodeEntry) -> Result<NodeEntry, StorageError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let merged = match read_node(&tx, &update.id)? {
                Some(mut stored) => {
                    stored.merge_from(update);
                    stored
                }
                None => update.clone(),
            };
            write_node(&tx, &merged)?;
            tx.commit()?;
            Ok(merged)
        })
    }

    /// Insert the message unless its id is already stored; for a known id only an ack outcome
    /// is applied.
    pub fn upsert_message(&self, message: &Message) -> Result<MessageUpsert, StorageError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx
                .prepare_cached(&format!(
                    "INSERT OR IGNORE INTO messages ({MESSAGE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ))?
                .execute(params![
                    message.id.as_str(),
                    i64::from(message.channel),
                    message.from.as_str(),
                    message.to.as_str(),
                    message.text,
                    message.timestamp.timestamp_millis(),
                    message.ack_status.as_str(),
                    message.rx_snr.map(f64::from),
                    message.outgoing,
                    message.from_name,
                ])?
                == 1;
            let status_changed = !inserted && patch_ack(&tx, &message.id, message.ack_status)?;
            let stored = read_message(&tx, &message.id)?
                .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            tx.commit()?;
            Ok(MessageUpsert {
                message: stored,
                inserted,
                status_changed,
            })
        })
    }

    pub fn set_ack_status(&self, id: &MessageId, status: AckStatus) -> Result<AckUpdate, StorageError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = patch_ack(&tx, id, status)?;
            let stored = read_message(&tx, id)?;
            tx.commit()?;
            Ok(match stored {
                None => AckUpdate::Unknown,
                Some(m) if changed => AckUpdate::Changed(m),
                Some(m) => AckUpdate::Unchanged(m),
            })
        })
    }

    pub fn node(&self, id: &NodeId) -> Result<Option<NodeEntry>, StorageError> {
        self.with_conn(|conn| read_node(conn, id))
    }

    pub fn message(&self, id: &MessageId) -> Result<Option<Message>, StorageError> {
        self.with_conn(|conn| read_message(conn, id))
    }

    /// All nodes, most recently heard first; never-heard nodes last, ties by id.
    pub fn list_nodes(&self) -> NodeCursor {
        NodeCursor::new(self.clone())
    }

    /// Messages on `channel` with `timestamp >= since`, oldest first, ties by id.
    pub fn list_messages(&self, channel: u32, since: DateTime<Utc>) -> MessageCursor {
        MessageCursor::new(self.clone(), channel, since)
    }
}
