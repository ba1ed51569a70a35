//! Persistence interfaces consumed by the fleet core.
//!
//! The core never talks to SQLite directly. It calls these traits, which
//! [`crate::db::Db`] implements. Rows are plain records; nothing here is cached
//! across requests.

use botfleet_daemon_protocol::LevelSnapshot;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::bot::Bot;
use crate::error::Result;

pub const ACCOUNT_STATUS_ACTIVE: &str = "active";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub status: String,
}

/// One continuous run of a script for an account.
///
/// A session is active while `stopped_at` is unset, or not later than
/// `started_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivitySession {
    pub id: i64,
    pub account_id: i64,
    pub command: String,
    pub started_at: String,
    pub stopped_at: Option<String>,
    pub pid: u32,
}

/// Latest known XP gained for one skill within one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityXp {
    pub id: i64,
    pub activity_id: i64,
    pub skill: String,
    pub xp_gained: i64,
}

/// Result of the update-else-insert session write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionWrite {
    Updated(i64),
    Opened(i64),
}

impl SessionWrite {
    pub fn session_id(&self) -> i64 {
        match self {
            SessionWrite::Updated(id) | SessionWrite::Opened(id) => *id,
        }
    }
}

pub trait AccountStore: Send + Sync {
    fn get_account(&self, id: i64) -> Result<Option<Account>>;

    fn get_account_by_email(&self, email: &str) -> Result<Option<Account>>;

    fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Insert or update by email (unique). Returns the stored row.
    fn upsert_account(&self, email: &str, username: &str, status: &str) -> Result<Account>;

    /// Overwrites the whole snapshot for the account.
    fn upsert_levels(&self, account_id: i64, levels: &LevelSnapshot) -> Result<()>;

    fn get_levels(&self, account_id: i64) -> Result<Option<LevelSnapshot>>;
}

pub trait ActivitySessionStore: Send + Sync {
    /// Always inserts a new open row.
    fn insert_session(
        &self,
        account_id: i64,
        command: &str,
        pid: u32,
        started_at: &str,
    ) -> Result<i64>;

    /// Atomically updates the most recent `stopped_at IS NULL` row for the
    /// account, or inserts a new open row when none matched.
    fn update_or_open_session(
        &self,
        account_id: i64,
        command: &str,
        pid: u32,
        started_at: &str,
    ) -> Result<SessionWrite>;

    /// Sets `stopped_at` on the most recent active row. Returns whether a row changed.
    fn close_latest_open_session(&self, account_id: i64, stopped_at: &str) -> Result<bool>;

    /// Most recent active row for the account.
    fn latest_open_session(&self, account_id: i64) -> Result<Option<ActivitySession>>;

    fn list_sessions(&self, account_id: Option<i64>, limit: usize)
        -> Result<Vec<ActivitySession>>;

    fn upsert_xp(&self, activity_id: i64, skill: &str, xp_gained: i64) -> Result<()>;

    fn list_xp(&self, activity_id: i64) -> Result<Vec<ActivityXp>>;

    /// Accounts joined with their active session, one bot per account.
    fn list_active_bots(&self) -> Result<Vec<Bot>>;

    /// Accounts with no active session.
    fn list_inactive_bots(&self) -> Result<Vec<Bot>>;
}

/// RFC 3339 UTC with fixed microsecond precision, so text order is time order.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}
