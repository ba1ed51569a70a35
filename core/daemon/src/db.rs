//! SQLite persistence for botfleet-daemon.
//!
//! Implements [`AccountStore`] and [`ActivitySessionStore`]. Every call opens its
//! own connection (WAL, busy timeout), so one `Db` can be shared across the
//! connection threads and the liveness monitor without extra locking.

use botfleet_daemon_protocol::LevelSnapshot;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{
    params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior,
};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::bot::{Bot, BotStatus};
use crate::error::{FleetError, Result};
use crate::store::{
    timestamp, Account, AccountStore, ActivitySession, ActivitySessionStore, ActivityXp,
    SessionWrite,
};

// Shared by every query that needs "the account's active session".
const ACTIVE_PREDICATE: &str = "(stopped_at IS NULL OR stopped_at <= started_at)";

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let level_columns = LevelSnapshot::SKILLS
            .iter()
            .map(|skill| format!("{} INTEGER NOT NULL DEFAULT 0", skill))
            .collect::<Vec<_>>()
            .join(",\n                    ");

        self.with_connection(|conn| {
            conn.execute_batch(&format!(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS accounts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL DEFAULT '',
                    email TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL DEFAULT 'active'
                 );
                 CREATE TABLE IF NOT EXISTS levels (
                    account_id INTEGER PRIMARY KEY REFERENCES accounts(id),
                    {level_columns}
                 );
                 CREATE TABLE IF NOT EXISTS activity (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    account_id INTEGER NOT NULL REFERENCES accounts(id),
                    command TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    stopped_at TEXT,
                    pid INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE INDEX IF NOT EXISTS activity_account_started
                    ON activity(account_id, started_at);
                 CREATE TABLE IF NOT EXISTS activity_xp (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    activity_id INTEGER NOT NULL REFERENCES activity(id),
                    skill TEXT NOT NULL,
                    xp_gained INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(activity_id, skill)
                 );
                 COMMIT;"
            ))
            .map_err(sql_err("Failed to initialize schema"))?;

            // A database that already holds two open rows for one account cannot
            // take the index; the ledger transaction still guards new writes.
            if let Err(err) = conn.execute(
                "CREATE UNIQUE INDEX IF NOT EXISTS activity_one_open_per_account \
                 ON activity(account_id) WHERE stopped_at IS NULL",
                [],
            ) {
                warn!(error = %err, "Failed to create open-session index");
            }
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| FleetError::io("Failed to create daemon data dir", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(sql_err("Failed to open sqlite db"))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sql_err("Failed to enable WAL"))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(sql_err("Failed to set synchronous"))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(sql_err("Failed to set busy_timeout"))?;

        Ok(conn)
    }

    fn query_bots(&self, sql: &str, status: BotStatus, context: &'static str) -> Result<Vec<Bot>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(sql).map_err(sql_err(context))?;
            let rows = stmt
                .query_map([], |row| {
                    let account_id: i64 = row.get(0)?;
                    let email: String = row.get(1)?;
                    let username: String = row.get(2)?;
                    let command: Option<String> = row.get(3)?;
                    let pid: u32 = row.get(4)?;
                    Ok(Bot::from_session(
                        account_id,
                        email,
                        username,
                        command.as_deref().unwrap_or_default(),
                        pid,
                    ))
                })
                .map_err(sql_err(context))?;

            let mut bots = Vec::new();
            for row in rows {
                let mut bot = row.map_err(sql_err(context))?;
                bot.status = status.clone();
                bots.push(bot);
            }
            Ok(bots)
        })
    }
}

impl AccountStore for Db {
    fn get_account(&self, id: i64) -> Result<Option<Account>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, username, email, status FROM accounts WHERE id = ?1",
                params![id],
                account_from_row,
            )
            .optional()
            .map_err(sql_err("Failed to query account"))
        })
    }

    fn get_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, username, email, status FROM accounts WHERE email = ?1",
                params![email],
                account_from_row,
            )
            .optional()
            .map_err(sql_err("Failed to query account by email"))
        })
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, username, email, status FROM accounts ORDER BY id ASC")
                .map_err(sql_err("Failed to prepare accounts query"))?;
            let rows = stmt
                .query_map([], account_from_row)
                .map_err(sql_err("Failed to read account rows"))?;

            let mut accounts = Vec::new();
            for row in rows {
                accounts.push(row.map_err(sql_err("Failed to decode account row"))?);
            }
            Ok(accounts)
        })
    }

    fn upsert_account(&self, email: &str, username: &str, status: &str) -> Result<Account> {
        self.with_connection(|conn| {
            // An empty username never clobbers a known one.
            conn.execute(
                "INSERT INTO accounts (email, username, status) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(email) DO UPDATE SET \
                    username = CASE WHEN excluded.username = '' \
                        THEN accounts.username ELSE excluded.username END, \
                    status = excluded.status",
                params![email, username, status],
            )
            .map_err(sql_err("Failed to upsert account"))?;

            conn.query_row(
                "SELECT id, username, email, status FROM accounts WHERE email = ?1",
                params![email],
                account_from_row,
            )
            .map_err(sql_err("Failed to reload upserted account"))
        })
    }

    fn upsert_levels(&self, account_id: i64, levels: &LevelSnapshot) -> Result<()> {
        let columns = LevelSnapshot::SKILLS.join(", ");
        let placeholders = (2..=LevelSnapshot::SKILL_COUNT + 1)
            .map(|index| format!("?{}", index))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = LevelSnapshot::SKILLS
            .iter()
            .map(|skill| format!("{skill} = excluded.{skill}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO levels (account_id, {columns}) VALUES (?1, {placeholders}) \
             ON CONFLICT(account_id) DO UPDATE SET {updates}"
        );

        let values = std::iter::once(account_id).chain(levels.values());
        self.with_connection(|conn| {
            conn.execute(&sql, params_from_iter(values))
                .map_err(sql_err("Failed to upsert levels"))?;
            Ok(())
        })
    }

    fn get_levels(&self, account_id: i64) -> Result<Option<LevelSnapshot>> {
        let sql = format!(
            "SELECT {} FROM levels WHERE account_id = ?1",
            LevelSnapshot::SKILLS.join(", ")
        );
        self.with_connection(|conn| {
            conn.query_row(&sql, params![account_id], |row| {
                let mut values = [0i64; LevelSnapshot::SKILL_COUNT];
                for (index, value) in values.iter_mut().enumerate() {
                    *value = row.get(index)?;
                }
                Ok(LevelSnapshot::from_values(values))
            })
            .optional()
            .map_err(sql_err("Failed to query levels"))
        })
    }
}

impl ActivitySessionStore for Db {
    fn insert_session(
        &self,
        account_id: i64,
        command: &str,
        pid: u32,
        started_at: &str,
    ) -> Result<i64> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO activity (account_id, command, started_at, stopped_at, pid) \
                 VALUES (?1, ?2, ?3, NULL, ?4)",
                params![account_id, command, started_at, pid],
            )
            .map_err(sql_err("Failed to insert activity session"))?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn update_or_open_session(
        &self,
        account_id: i64,
        command: &str,
        pid: u32,
        started_at: &str,
    ) -> Result<SessionWrite> {
        self.with_connection(|conn| {
            // IMMEDIATE takes the write lock up front, so two callers cannot both
            // see "no open row" and insert.
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err("Failed to start session transaction"))?;

            let open_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM activity \
                     WHERE account_id = ?1 AND stopped_at IS NULL \
                     ORDER BY started_at DESC, id DESC LIMIT 1",
                    params![account_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err("Failed to query open session"))?;

            let write = match open_id {
                Some(id) => {
                    tx.execute(
                        "UPDATE activity SET command = ?1, pid = ?2 WHERE id = ?3",
                        params![command, pid, id],
                    )
                    .map_err(sql_err("Failed to update open session"))?;
                    SessionWrite::Updated(id)
                }
                None => {
                    tx.execute(
                        "INSERT INTO activity (account_id, command, started_at, stopped_at, pid) \
                         VALUES (?1, ?2, ?3, NULL, ?4)",
                        params![account_id, command, started_at, pid],
                    )
                    .map_err(sql_err("Failed to insert activity session"))?;
                    SessionWrite::Opened(tx.last_insert_rowid())
                }
            };

            tx.commit()
                .map_err(sql_err("Failed to commit session transaction"))?;
            debug!(account_id, pid, write = ?write, "Session recorded");
            Ok(write)
        })
    }

    fn close_latest_open_session(&self, account_id: i64, stopped_at: &str) -> Result<bool> {
        let sql = format!(
            "SELECT id, started_at FROM activity WHERE account_id = ?1 AND {ACTIVE_PREDICATE} \
             ORDER BY started_at DESC, id DESC LIMIT 1"
        );
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err("Failed to start session transaction"))?;

            let latest: Option<(i64, String)> = tx
                .query_row(&sql, params![account_id], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()
                .map_err(sql_err("Failed to query active session"))?;
            let Some((id, started_at)) = latest else {
                return Ok(false);
            };

            let stopped_at = closing_timestamp(&started_at, stopped_at);
            tx.execute(
                "UPDATE activity SET stopped_at = ?1 WHERE id = ?2",
                params![stopped_at, id],
            )
            .map_err(sql_err("Failed to close activity session"))?;
            tx.commit()
                .map_err(sql_err("Failed to commit session close"))?;
            Ok(true)
        })
    }

    fn latest_open_session(&self, account_id: i64) -> Result<Option<ActivitySession>> {
        let sql = format!(
            "SELECT id, account_id, command, started_at, stopped_at, pid FROM activity \
             WHERE account_id = ?1 AND {ACTIVE_PREDICATE} \
             ORDER BY started_at DESC, id DESC LIMIT 1"
        );
        self.with_connection(|conn| {
            conn.query_row(&sql, params![account_id], session_from_row)
                .optional()
                .map_err(sql_err("Failed to query active session"))
        })
    }

    fn list_sessions(
        &self,
        account_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ActivitySession>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, account_id, command, started_at, stopped_at, pid FROM activity \
                     WHERE ?1 IS NULL OR account_id = ?1 \
                     ORDER BY started_at DESC, id DESC LIMIT ?2",
                )
                .map_err(sql_err("Failed to prepare activity query"))?;
            let rows = stmt
                .query_map(params![account_id, limit], session_from_row)
                .map_err(sql_err("Failed to read activity rows"))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row.map_err(sql_err("Failed to decode activity row"))?);
            }
            Ok(sessions)
        })
    }

    fn upsert_xp(&self, activity_id: i64, skill: &str, xp_gained: i64) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO activity_xp (activity_id, skill, xp_gained) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(activity_id, skill) DO UPDATE SET xp_gained = excluded.xp_gained",
                params![activity_id, skill, xp_gained],
            )
            .map_err(sql_err("Failed to upsert activity xp"))?;
            Ok(())
        })
    }

    fn list_xp(&self, activity_id: i64) -> Result<Vec<ActivityXp>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, activity_id, skill, xp_gained FROM activity_xp \
                     WHERE activity_id = ?1 ORDER BY skill ASC",
                )
                .map_err(sql_err("Failed to prepare activity xp query"))?;
            let rows = stmt
                .query_map(params![activity_id], |row| {
                    Ok(ActivityXp {
                        id: row.get(0)?,
                        activity_id: row.get(1)?,
                        skill: row.get(2)?,
                        xp_gained: row.get(3)?,
                    })
                })
                .map_err(sql_err("Failed to read activity xp rows"))?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(sql_err("Failed to decode activity xp row"))?);
            }
            Ok(entries)
        })
    }

    fn list_active_bots(&self) -> Result<Vec<Bot>> {
        let sql = format!(
            "SELECT a.id, a.email, a.username, s.command, s.pid \
             FROM accounts a \
             JOIN activity s ON s.id = ( \
                SELECT id FROM activity WHERE account_id = a.id AND {ACTIVE_PREDICATE} \
                ORDER BY started_at DESC, id DESC LIMIT 1) \
             ORDER BY a.id ASC"
        );
        self.query_bots(&sql, BotStatus::Started, "Failed to query active bots")
    }

    fn list_inactive_bots(&self) -> Result<Vec<Bot>> {
        let sql = format!(
            "SELECT a.id, a.email, a.username, \
                (SELECT command FROM activity WHERE account_id = a.id \
                 ORDER BY started_at DESC, id DESC LIMIT 1), \
                0 \
             FROM accounts a \
             WHERE NOT EXISTS ( \
                SELECT 1 FROM activity WHERE account_id = a.id AND {ACTIVE_PREDICATE}) \
             ORDER BY a.id ASC"
        );
        self.query_bots(&sql, BotStatus::Stopped, "Failed to query inactive bots")
    }
}

fn sql_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> FleetError {
    move |err| FleetError::persistence(context, err)
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        status: row.get(3)?,
    })
}

/// A stop time that is always after `started_at`. A clock reading at or before
/// the start would leave the row matching `ACTIVE_PREDICATE`.
fn closing_timestamp(started_at: &str, stopped_at: &str) -> String {
    if stopped_at > started_at {
        return stopped_at.to_string();
    }
    match DateTime::parse_from_rfc3339(started_at) {
        Ok(started) => {
            debug!(started_at, stopped_at, "Session starts in the future; closing just after start");
            timestamp(started.with_timezone(&Utc) + Duration::microseconds(1))
        }
        Err(err) => {
            warn!(started_at, error = %err, "Unparseable session start; closing at current time");
            stopped_at.to_string()
        }
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ActivitySession> {
    Ok(ActivitySession {
        id: row.get(0)?,
        account_id: row.get(1)?,
        command: row.get(2)?,
        started_at: row.get(3)?,
        stopped_at: row.get(4)?,
        pid: row.get(5)?,
    })
}
