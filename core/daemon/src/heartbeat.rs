//! Heartbeat reconciliation.
//!
//! A heartbeat is the push half of the fleet's liveness picture. Applying one
//! updates the registry first and persistence second; a persistence failure is
//! returned to the caller but never rolls back the in-memory update.

use botfleet_daemon_protocol::Heartbeat;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::bot::Bot;
use crate::error::{FleetError, Result};
use crate::ledger::ActivitySessionLedger;
use crate::registry::BotRegistry;
use crate::store::{AccountStore, ACCOUNT_STATUS_ACTIVE};

/// How a heartbeat's status compares with the previous one from the same sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusChange {
    /// No earlier heartbeat is on record for this sender.
    FirstReport,
    Unchanged,
    Changed { previous: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum XpDisposition {
    /// The heartbeat carried no XP.
    Empty,
    /// XP was dropped because the account has no open session.
    NoOpenSession,
    Recorded { written: usize, failed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HeartbeatOutcome {
    /// First contact from an unknown sender.
    Registered { bot_id: String },
    Applied {
        account_id: i64,
        status_change: StatusChange,
        activity_id: Option<i64>,
        xp: XpDisposition,
    },
}

pub struct HeartbeatReconciler {
    registry: Arc<BotRegistry>,
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<ActivitySessionLedger>,
    // Last heartbeat per email; advisory, used only for change detection.
    latest: Mutex<HashMap<String, Heartbeat>>,
}

impl HeartbeatReconciler {
    pub fn new(
        registry: Arc<BotRegistry>,
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<ActivitySessionLedger>,
    ) -> Self {
        Self {
            registry,
            accounts,
            ledger,
            latest: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(&self, heartbeat: &Heartbeat) -> Result<HeartbeatOutcome> {
        if self.registry.find_by_email(&heartbeat.email).is_none() {
            return self.register_sender(heartbeat);
        }

        let bot = self.registry.update_from_heartbeat(heartbeat);
        let status_change = self.remember(heartbeat);
        if let StatusChange::Changed { previous } = &status_change {
            info!(
                email = %heartbeat.email,
                previous = %previous,
                status = %heartbeat.status,
                "Bot status changed"
            );
        }

        let account = self
            .accounts
            .get_account_by_email(&heartbeat.email)?
            .ok_or_else(|| FleetError::not_found("account", &heartbeat.email))?;
        self.accounts.upsert_levels(account.id, &heartbeat.stats)?;

        let activity_id = self.resolve_session(account.id, heartbeat, bot.as_ref());
        let xp = match (heartbeat.gained_xp.is_empty(), activity_id) {
            (true, _) => XpDisposition::Empty,
            (false, None) => {
                debug!(account_id = account.id, "No open session; XP skipped");
                XpDisposition::NoOpenSession
            }
            (false, Some(activity_id)) => {
                let write = self.ledger.record_xp(activity_id, &heartbeat.gained_xp);
                XpDisposition::Recorded {
                    written: write.written,
                    failed: write.failed,
                }
            }
        };

        Ok(HeartbeatOutcome::Applied {
            account_id: account.id,
            status_change,
            activity_id,
            xp,
        })
    }

    /// Number of senders with a heartbeat on record.
    pub fn tracked_senders(&self) -> usize {
        self.latest().len()
    }

    /// Registers an unknown sender: one bot, one account, nothing else. The bot
    /// is only registered once its account row exists.
    fn register_sender(&self, heartbeat: &Heartbeat) -> Result<HeartbeatOutcome> {
        match self.accounts.upsert_account(
            &heartbeat.email,
            &heartbeat.username,
            ACCOUNT_STATUS_ACTIVE,
        ) {
            Ok(account) => {
                let bot_id = account.id.to_string();
                if self.registry.ensure(Bot::from_heartbeat(&bot_id, heartbeat)) {
                    info!(
                        bot_id = %bot_id,
                        email = %heartbeat.email,
                        "Registered bot from heartbeat"
                    );
                }
                Ok(HeartbeatOutcome::Registered { bot_id })
            }
            Err(err) => {
                // Nothing is registered, so the sender's next heartbeat retries
                // first contact.
                warn!(
                    email = %heartbeat.email,
                    error = %err,
                    "Failed to upsert account for new sender"
                );
                Err(err)
            }
        }
    }

    /// Finds the account's open session. A sender reporting a live pid with no
    /// session gets one, so the liveness monitor can see it.
    fn resolve_session(
        &self,
        account_id: i64,
        heartbeat: &Heartbeat,
        bot: Option<&Bot>,
    ) -> Option<i64> {
        match self.ledger.active_session_id(account_id) {
            Ok(Some(activity_id)) => Some(activity_id),
            Ok(None) if heartbeat.pid != 0 => {
                let command = bot.map(Bot::command).unwrap_or_default();
                match self.ledger.record_or_update(account_id, &command, heartbeat.pid) {
                    Ok(write) => Some(write.session_id()),
                    Err(err) => {
                        warn!(
                            account_id,
                            pid = heartbeat.pid,
                            error = %err,
                            "Failed to adopt session"
                        );
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(err) => {
                warn!(account_id, error = %err, "Failed to resolve open session");
                None
            }
        }
    }

    fn remember(&self, heartbeat: &Heartbeat) -> StatusChange {
        let previous = self
            .latest()
            .insert(heartbeat.email.clone(), heartbeat.clone());
        match previous {
            None => StatusChange::FirstReport,
            Some(previous) if previous.status == heartbeat.status => StatusChange::Unchanged,
            Some(previous) => StatusChange::Changed {
                previous: previous.status,
            },
        }
    }

    fn latest(&self) -> MutexGuard<'_, HashMap<String, Heartbeat>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
