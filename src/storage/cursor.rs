//! Keyset-paginated cursors over the store.
//!
//! A cursor holds no statement between pages: each page is a fresh query on the calling
//! thread's connection, resumed after the last key seen. Rows committed after the cursor
//! passed their position are not revisited.

use super::{message_from_row, node_from_row, StateStore, MESSAGE_COLUMNS, NODE_COLUMNS};
use crate::error::StorageError;
use crate::model::{Message, NodeEntry};
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::collections::VecDeque;

const DEFAULT_PAGE: usize = 256;

/// Sort key standing in for "never heard"; sorts after every real timestamp.
const NEVER_HEARD: i64 = -1;

pub struct NodeCursor {
    store: StateStore,
    page_size: usize,
    after: (i64, String),
    buffered: VecDeque<NodeEntry>,
    exhausted: bool,
}

impl NodeCursor {
    pub(super) fn new(store: StateStore) -> Self {
        NodeCursor {
            store,
            page_size: DEFAULT_PAGE,
            after: (i64::MAX, String::new()),
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn page_size(mut self, rows: usize) -> Self {
        self.page_size = rows.max(1);
        self
    }

    fn fetch(&mut self) -> Result<(), StorageError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes \
             WHERE COALESCE(last_heard, {NEVER_HEARD}) < ?1 \
                OR (COALESCE(last_heard, {NEVER_HEARD}) = ?1 AND id > ?2) \
             ORDER BY COALESCE(last_heard, {NEVER_HEARD}) DESC, id ASC \
             LIMIT ?3"
        );
        let (key, id) = &self.after;
        let limit = self.page_size as i64;
        let page = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![key, id, limit], node_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            let key = last.last_heard.map(|t| t.timestamp()).unwrap_or(NEVER_HEARD);
            self.after = (key, last.id.as_str().to_string());
        }
        self.buffered.extend(page);
        Ok(())
    }
}

impl Iterator for NodeCursor {
    type Item = Result<NodeEntry, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffered.pop_front().map(Ok)
    }
}

pub struct MessageCursor {
    store: StateStore,
    channel: u32,
    page_size: usize,
    after: (i64, String),
    buffered: VecDeque<Message>,
    exhausted: bool,
}

impl MessageCursor {
    pub(super) fn new(store: StateStore, channel: u32, since: DateTime<Utc>) -> Self {
        MessageCursor {
            store,
            channel,
            page_size: DEFAULT_PAGE,
            // Strictly-after `since - 1ms` with an empty id admits every row at `since`.
            after: (since.timestamp_millis().saturating_sub(1), String::new()),
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn page_size(mut self, rows: usize) -> Self {
        self.page_size = rows.max(1);
        self
    }

    fn fetch(&mut self) -> Result<(), StorageError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE channel = ?1 AND (timestamp > ?2 OR (timestamp = ?2 AND id > ?3)) \
             ORDER BY timestamp ASC, id ASC \
             LIMIT ?4"
        );
        let (ts, id) = &self.after;
        let channel = i64::from(self.channel);
        let limit = self.page_size as i64;
        let page = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![channel, ts, id, limit], message_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after = (last.timestamp.timestamp_millis(), last.id.as_str().to_string());
        }
        self.buffered.extend(page);
        Ok(())
    }
}

impl Iterator for MessageCursor {
    type Item = Result<Message, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffered.pop_front().map(Ok)
    }
}
