//! Glink Storage -- rusqlite wrapper for chats, users and messages.
//!
//! Durable state only: own identity, known peers, chat membership and the
//! message log. Messages are keyed by (author, chat, index), so inserting
//! a message twice is a no-op. WAL mode + busy_timeout.

use glink_protocol::{ChatInfo, ChatMessage, ChatsClock, Cid, VectorClock};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Current schema version.
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },
    #[error("lock poisoned")]
    LockPoisoned,
    #[error("own uid is not set")]
    IdentityNotSet,
    #[error("unknown chat {0}")]
    UnknownChat(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Own identity: uid and display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLightInfo {
    pub uid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    pub uid: String,
    pub name: String,
    pub endpoint: Option<String>,
}

/// Storage trait consumed by the sync engine.
pub trait Storage: Send + Sync {
    fn own_info(&self) -> Result<Option<UserLightInfo>>;
    fn set_own_uid(&self, uid: &str) -> Result<()>;
    /// Requires the own uid to be set.
    fn set_own_name(&self, name: &str) -> Result<()>;

    /// Create a chat with its initial participants. Re-saving a known chat
    /// only adds missing participants.
    fn save_new_chat(&self, chat: &ChatInfo) -> Result<()>;
    /// Append a participant. Returns false if already a member.
    fn add_participant(&self, cid: &str, uid: &str) -> Result<bool>;
    fn chat_info(&self, cid: &str) -> Result<Option<ChatInfo>>;
    /// All chats, most recently active first.
    fn list_chats(&self) -> Result<Vec<ChatInfo>>;

    /// Insert keyed by (uid, cid, index). Returns false if already stored.
    fn save_message(&self, msg: &ChatMessage) -> Result<bool>;
    fn messages(&self, cid: &str, from_index: u32, to_index: u32) -> Result<Vec<ChatMessage>>;
    /// Highest index stored for (cid, author), 0 if none.
    fn last_index(&self, cid: &str, uid: &str) -> Result<u32>;

    fn is_known_uid(&self, uid: &str) -> Result<bool>;
    /// Insert or refresh a peer. A `None` endpoint keeps the stored one.
    fn save_new_uid(&self, uid: &str, name: &str, endpoint: Option<&str>) -> Result<()>;
    fn name_by_uid(&self, uid: &str) -> Result<Option<String>>;
    fn list_users(&self) -> Result<Vec<UserRow>>;

    /// Max index per author for each of `cids`. Chats without messages are absent.
    fn vector_clock(&self, cids: &[Cid]) -> Result<ChatsClock>;
    /// Highest index per (cid, author) such that every index from 1 up to
    /// it is stored. An author whose index 1 is missing maps to 0.
    fn contiguous_clock(&self, cids: &[Cid]) -> Result<ChatsClock>;
    /// Every message whose index exceeds the cursor of its (cid, author) entry.
    fn messages_after(&self, cursors: &ChatsClock) -> Result<Vec<ChatMessage>>;

    /// All messages of a chat.
    fn chat_messages(&self, cid: &str) -> Result<Vec<ChatMessage>> {
        self.messages(cid, 0, u32::MAX)
    }
}

/// SQLite-backed storage.
/// Connection wrapped in Mutex for Send + Sync (rusqlite Connection is !Sync).
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteStorage {
    /// Database file, `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;

        let storage = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path.to_path_buf()),
        };
        storage.ensure_schema()?;
        tracing::debug!(db = %db_path.display(), "storage: opened");
        Ok(storage)
    }

    /// Private in-memory database (tests, throwaway nodes).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let storage = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.db()?;
        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            conn.execute_batch(include_str!("schema_v1.sql"))?;
            tracing::info!(version = SCHEMA_VERSION, "storage: initialised schema");
        }

        let version: u32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);

        if version != SCHEMA_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: version,
            });
        }
        Ok(())
    }

    fn now_micros() -> i64 {
        chrono::Utc::now().timestamp_micros()
    }

    fn members(conn: &Connection, cid: &str) -> Result<Vec<String>> {
        let mut stmt =
            conn.prepare_cached("SELECT uid FROM chat_member WHERE cid = ?1 ORDER BY position")?;
        let rows = stmt
            .query_map(params![cid], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_member(conn: &Connection, cid: &str, uid: &str) -> Result<bool> {
        let changes = conn.execute(
            "INSERT OR IGNORE INTO chat_member (cid, uid, position)
             VALUES (?1, ?2, (SELECT COALESCE(MAX(position) + 1, 0) FROM chat_member WHERE cid = ?1))",
            params![cid, uid],
        )?;
        Ok(changes > 0)
    }

    fn chat_exists(conn: &Connection, cid: &str) -> Result<bool> {
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM chat WHERE cid = ?1",
            params![cid],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        uid: row.get(0)?,
        cid: row.get(1)?,
        index: row.get(2)?,
        text: row.get(3)?,
    })
}

impl Storage for SqliteStorage {
    fn own_info(&self) -> Result<Option<UserLightInfo>> {
        let conn = self.db()?;
        let uid: Option<String> = conn
            .query_row("SELECT uid FROM node WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        let Some(uid) = uid else {
            return Ok(None);
        };
        let name: Option<String> = conn
            .query_row(
                "SELECT name FROM user WHERE uid = ?1",
                params![uid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(Some(UserLightInfo {
            uid,
            name: name.unwrap_or_default(),
        }))
    }

    fn set_own_uid(&self, uid: &str) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO node (id, uid) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET uid = excluded.uid",
            params![uid],
        )?;
        Ok(())
    }

    fn set_own_name(&self, name: &str) -> Result<()> {
        let conn = self.db()?;
        let uid: String = conn
            .query_row("SELECT uid FROM node WHERE id = 1", [], |row| row.get(0))
            .optional()?
            .ok_or(StorageError::IdentityNotSet)?;
        conn.execute(
            "INSERT INTO user (uid, name) VALUES (?1, ?2)
             ON CONFLICT(uid) DO UPDATE SET name = excluded.name",
            params![uid, name],
        )?;
        Ok(())
    }

    fn save_new_chat(&self, chat: &ChatInfo) -> Result<()> {
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO chat (cid, name, group_flag, last_event_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![chat.cid, chat.name, chat.group, Self::now_micros()],
        )?;
        for uid in &chat.participants {
            Self::insert_member(&tx, &chat.cid, uid)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn add_participant(&self, cid: &str, uid: &str) -> Result<bool> {
        let conn = self.db()?;
        if !Self::chat_exists(&conn, cid)? {
            return Err(StorageError::UnknownChat(cid.to_string()));
        }
        let added = Self::insert_member(&conn, cid, uid)?;
        if added {
            conn.execute(
                "UPDATE chat SET last_event_time = ?1 WHERE cid = ?2",
                params![Self::now_micros(), cid],
            )?;
        }
        Ok(added)
    }

    fn chat_info(&self, cid: &str) -> Result<Option<ChatInfo>> {
        let conn = self.db()?;
        let row = conn
            .query_row(
                "SELECT cid, name, group_flag FROM chat WHERE cid = ?1",
                params![cid],
                |row| {
                    Ok(ChatInfo {
                        cid: row.get(0)?,
                        name: row.get(1)?,
                        participants: Vec::new(),
                        group: row.get(2)?,
                    })
                },
            )
            .optional()?;
        match row {
            Some(mut info) => {
                info.participants = Self::members(&conn, cid)?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    fn list_chats(&self) -> Result<Vec<ChatInfo>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT cid, name, group_flag FROM chat ORDER BY last_event_time DESC, cid",
        )?;
        let mut chats = stmt
            .query_map([], |row| {
                Ok(ChatInfo {
                    cid: row.get(0)?,
                    name: row.get(1)?,
                    participants: Vec::new(),
                    group: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for chat in &mut chats {
            chat.participants = Self::members(&conn, &chat.cid)?;
        }
        Ok(chats)
    }

    fn save_message(&self, msg: &ChatMessage) -> Result<bool> {
        let conn = self.db()?;
        let now = Self::now_micros();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO message (uid, cid, msg_index, text, create_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![msg.uid, msg.cid, msg.index, msg.text, now],
        )? > 0;
        if inserted {
            conn.execute(
                "UPDATE chat SET last_event_time = ?1 WHERE cid = ?2",
                params![now, msg.cid],
            )?;
        }
        Ok(inserted)
    }

    fn messages(&self, cid: &str, from_index: u32, to_index: u32) -> Result<Vec<ChatMessage>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare_cached(
            "SELECT uid, cid, msg_index, text FROM message
             WHERE cid = ?1 AND msg_index >= ?2 AND msg_index <= ?3
             ORDER BY create_time, uid, msg_index",
        )?;
        let rows = stmt
            .query_map(params![cid, from_index, to_index], message_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn last_index(&self, cid: &str, uid: &str) -> Result<u32> {
        let conn = self.db()?;
        let index: u32 = conn.query_row(
            "SELECT COALESCE(MAX(msg_index), 0) FROM message WHERE cid = ?1 AND uid = ?2",
            params![cid, uid],
            |row| row.get(0),
        )?;
        Ok(index)
    }

    fn is_known_uid(&self, uid: &str) -> Result<bool> {
        let conn = self.db()?;
        let known: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM user WHERE uid = ?1",
            params![uid],
            |row| row.get(0),
        )?;
        Ok(known)
    }

    fn save_new_uid(&self, uid: &str, name: &str, endpoint: Option<&str>) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO user (uid, name, endpoint) VALUES (?1, ?2, ?3)
             ON CONFLICT(uid) DO UPDATE SET
               name = excluded.name,
               endpoint = COALESCE(excluded.endpoint, user.endpoint)",
            params![uid, name, endpoint],
        )?;
        Ok(())
    }

    fn name_by_uid(&self, uid: &str) -> Result<Option<String>> {
        let conn = self.db()?;
        let name = conn
            .query_row(
                "SELECT name FROM user WHERE uid = ?1",
                params![uid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    fn list_users(&self) -> Result<Vec<UserRow>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare("SELECT uid, name, endpoint FROM user ORDER BY name, uid")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UserRow {
                    uid: row.get(0)?,
                    name: row.get(1)?,
                    endpoint: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn vector_clock(&self, cids: &[Cid]) -> Result<ChatsClock> {
        let conn = self.db()?;
        let mut stmt = conn.prepare_cached(
            "SELECT uid, MAX(msg_index) FROM message WHERE cid = ?1 GROUP BY uid",
        )?;
        let mut clock = ChatsClock::new();
        for cid in cids {
            let rows = stmt
                .query_map(params![cid], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if !rows.is_empty() {
                clock.insert(cid.clone(), rows.into_iter().collect());
            }
        }
        Ok(clock)
    }

    fn contiguous_clock(&self, cids: &[Cid]) -> Result<ChatsClock> {
        let conn = self.db()?;
        let mut stmt = conn.prepare_cached(
            "SELECT uid, msg_index FROM message WHERE cid = ?1 ORDER BY uid, msg_index",
        )?;
        let mut clock = ChatsClock::new();
        for cid in cids {
            let mut prefix = VectorClock::new();
            let rows = stmt.query_map(params![cid], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?;
            for row in rows {
                let (uid, index) = row?;
                let top = prefix.entry(uid).or_insert(0);
                if index == *top + 1 {
                    *top = index;
                }
            }
            if !prefix.is_empty() {
                clock.insert(cid.clone(), prefix);
            }
        }
        Ok(clock)
    }

    fn messages_after(&self, cursors: &ChatsClock) -> Result<Vec<ChatMessage>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare_cached(
            "SELECT uid, cid, msg_index, text FROM message
             WHERE cid = ?1 AND uid = ?2 AND msg_index > ?3
             ORDER BY msg_index",
        )?;
        let mut out = Vec::new();
        for (cid, clock) in cursors {
            for (uid, cursor) in clock {
                let rows = stmt.query_map(params![cid, uid, cursor], message_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }
}
