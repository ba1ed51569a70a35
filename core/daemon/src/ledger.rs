//! Activity session bookkeeping.
//!
//! Every session write for the fleet goes through [`ActivitySessionLedger`], which
//! keeps at most one open session per account and owns the XP semantics
//! (overwrite-latest per session and skill).

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{now_timestamp, ActivitySessionStore, SessionWrite};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct XpWrite {
    pub written: usize,
    pub failed: usize,
}

pub struct ActivitySessionLedger {
    store: Arc<dyn ActivitySessionStore>,
}

impl ActivitySessionLedger {
    pub fn new(store: Arc<dyn ActivitySessionStore>) -> Self {
        Self { store }
    }

    /// Inserts a new open session. Callers check for an existing one first;
    /// started bots go through [`Self::record_or_update`] instead.
    #[allow(dead_code)]
    pub fn open(&self, account_id: i64, command: &str, pid: u32) -> Result<i64> {
        let id = self
            .store
            .insert_session(account_id, command, pid, &now_timestamp())?;
        info!(account_id, activity_id = id, pid, command = %command, "Activity session opened");
        Ok(id)
    }

    /// Closes the account's most recent active session. `false` when none was open.
    pub fn close_latest_open(&self, account_id: i64) -> Result<bool> {
        let closed = self
            .store
            .close_latest_open_session(account_id, &now_timestamp())?;
        if closed {
            info!(account_id, "Activity session closed");
        } else {
            debug!(account_id, "No open activity session to close");
        }
        Ok(closed)
    }

    /// Refreshes the open session's command and pid, or opens one.
    pub fn record_or_update(
        &self,
        account_id: i64,
        command: &str,
        pid: u32,
    ) -> Result<SessionWrite> {
        let write = self
            .store
            .update_or_open_session(account_id, command, pid, &now_timestamp())?;
        if let SessionWrite::Opened(activity_id) = write {
            info!(account_id, activity_id, pid, command = %command, "Activity session opened");
        }
        Ok(write)
    }

    pub fn active_session_id(&self, account_id: i64) -> Result<Option<i64>> {
        Ok(self
            .store
            .latest_open_session(account_id)?
            .map(|session| session.id))
    }

    /// Stores the latest cumulative XP per skill. Individual failures are logged
    /// and counted, never returned.
    pub fn record_xp(&self, activity_id: i64, gained: &BTreeMap<String, i64>) -> XpWrite {
        let mut outcome = XpWrite::default();
        for (skill, xp) in gained {
            match self.store.upsert_xp(activity_id, skill, *xp) {
                Ok(()) => outcome.written += 1,
                Err(err) => {
                    warn!(activity_id, skill = %skill, error = %err, "Failed to record XP");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::store::{AccountStore, ACCOUNT_STATUS_ACTIVE};

    fn ledger() -> (tempfile::TempDir, Arc<Db>, ActivitySessionLedger, i64) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Db::new(temp_dir.path().join("fleet.db")).expect("db init"));
        let account = db
            .upsert_account("bot@example.com", "Lumberjack", ACCOUNT_STATUS_ACTIVE)
            .expect("account");
        let ledger = ActivitySessionLedger::new(db.clone());
        (temp_dir, db, ledger, account.id)
    }

    fn open_sessions(db: &Db, account_id: i64) -> usize {
        db.list_sessions(Some(account_id), 1000)
            .expect("sessions")
            .iter()
            .filter(|session| session.stopped_at.is_none())
            .count()
    }

    #[test]
    fn record_or_update_opens_then_updates() {
        let (_temp_dir, db, ledger, account_id) = ledger();

        let first = ledger
            .record_or_update(account_id, "chop.js", 100)
            .expect("first");
        let second = ledger
            .record_or_update(account_id, "chop.js oak", 200)
            .expect("second");

        assert!(matches!(first, SessionWrite::Opened(_)));
        assert_eq!(second, SessionWrite::Updated(first.session_id()));
        assert_eq!(open_sessions(&db, account_id), 1);
        assert_eq!(
            ledger.active_session_id(account_id).expect("active"),
            Some(first.session_id())
        );
    }

    #[test]
    fn close_then_record_opens_fresh_session() {
        let (_temp_dir, db, ledger, account_id) = ledger();
        let first = ledger.open(account_id, "chop.js", 100).expect("open");

        assert!(ledger.close_latest_open(account_id).expect("close"));
        assert!(!ledger.close_latest_open(account_id).expect("close again"));
        assert_eq!(ledger.active_session_id(account_id).expect("active"), None);

        let next = ledger
            .record_or_update(account_id, "chop.js", 101)
            .expect("reopen");
        assert_ne!(next.session_id(), first);
        assert_eq!(open_sessions(&db, account_id), 1);
    }

    #[test]
    fn xp_is_overwritten_not_accumulated() {
        let (_temp_dir, db, ledger, account_id) = ledger();
        let activity_id = ledger.open(account_id, "chop.js", 100).expect("open");

        let mut gained = BTreeMap::new();
        gained.insert("Woodcutting".to_string(), 100);
        assert_eq!(ledger.record_xp(activity_id, &gained).written, 1);
        gained.insert("Woodcutting".to_string(), 250);
        ledger.record_xp(activity_id, &gained);

        let rows = db.list_xp(activity_id).expect("xp rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].xp_gained, 250);
    }

    #[test]
    fn interleaved_writers_never_leave_two_open_sessions() {
        let (_temp_dir, db, ledger, account_id) = ledger();
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..6u32)
            .map(|worker| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for round in 0..15u32 {
                        ledger
                            .record_or_update(account_id, "chop.js", worker * 1000 + round)
                            .expect("record");
                        if (worker + round) % 4 == 0 {
                            ledger.close_latest_open(account_id).expect("close");
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }

        assert!(open_sessions(&db, account_id) <= 1);
    }
}
