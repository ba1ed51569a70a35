//! Thread-safe directory of known bots.
//!
//! The registry is the only owner of in-memory [`Bot`] values. Readers get
//! point-in-time clones; every mutation happens under the write lock. Process
//! work (launching or stopping a client) never runs with the lock held.

use botfleet_daemon_protocol::Heartbeat;
use std::collections::HashSet;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tracing::{debug, info, warn};

use crate::bot::{Bot, BotStatus};
use crate::error::{FleetError, Result};
use crate::process::ProcessHandle;

pub struct BotRegistry {
    bots: RwLock<Vec<Bot>>,
    // Ids with a start or restart in flight.
    in_flight: Mutex<HashSet<String>>,
    processes: Arc<dyn ProcessHandle>,
}

/// Releases an in-flight claim when the start or restart finishes.
struct InFlight<'a> {
    registry: &'a BotRegistry,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.registry.in_flight().remove(&self.id);
    }
}

impl BotRegistry {
    pub fn new(processes: Arc<dyn ProcessHandle>) -> Self {
        Self {
            bots: RwLock::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            processes,
        }
    }

    pub fn processes(&self) -> &dyn ProcessHandle {
        self.processes.as_ref()
    }

    /// Registers a bot without starting it. Ids are unique.
    pub fn add(&self, bot: Bot) -> Result<()> {
        let mut bots = self.write();
        if bots.iter().any(|existing| existing.id == bot.id) {
            return Err(FleetError::AlreadyActive(bot.id));
        }
        debug!(bot_id = %bot.id, email = %bot.email, "Bot registered");
        bots.push(bot);
        Ok(())
    }

    /// Inserts the bot unless one with the same id or email is already known.
    /// Returns whether it was inserted.
    pub fn ensure(&self, bot: Bot) -> bool {
        let mut bots = self.write();
        if bots
            .iter()
            .any(|existing| existing.id == bot.id || existing.email == bot.email)
        {
            return false;
        }
        info!(bot_id = %bot.id, email = %bot.email, pid = bot.pid, "Adopted running bot");
        bots.push(bot);
        true
    }

    /// Evicts the bot, then stops its process. `false` when no bot matched.
    ///
    /// A failed stop is logged and the bot is still evicted.
    pub fn remove(&self, id: &str) -> bool {
        let mut bots = self.write();
        let index = bots.iter().position(|bot| bot.id == id);
        let removed = index.map(|index| bots.remove(index));
        drop(bots);
        let Some(mut bot) = removed else {
            return false;
        };

        if let Err(err) = bot.stop(self.processes()) {
            warn!(bot_id = %id, pid = bot.pid, error = %err, "Failed to stop bot process");
        }
        true
    }

    /// Drops the bot whose process `dead_pid` is gone, without touching any
    /// process. A bot already running under another pid is kept.
    pub fn evict_dead(&self, id: &str, dead_pid: u32) -> Option<Bot> {
        let mut bots = self.write();
        let index = bots
            .iter()
            .position(|bot| bot.id == id && (bot.pid == dead_pid || bot.pid == 0))?;
        Some(bots.remove(index))
    }

    pub fn find(&self, id: &str) -> Option<Bot> {
        self.read().iter().find(|bot| bot.id == id).cloned()
    }

    pub fn find_by_email(&self, email: &str) -> Option<Bot> {
        self.read().iter().find(|bot| bot.email == email).cloned()
    }

    pub fn list(&self) -> Vec<Bot> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Applies a heartbeat to the bot with the same email. A zero pid leaves the
    /// known pid in place. Returns the updated copy.
    pub fn update_from_heartbeat(&self, heartbeat: &Heartbeat) -> Option<Bot> {
        let mut bots = self.write();
        let bot = bots.iter_mut().find(|bot| bot.email == heartbeat.email)?;
        bot.status = BotStatus::parse(&heartbeat.status);
        if heartbeat.pid != 0 {
            bot.pid = heartbeat.pid;
        }
        if !heartbeat.username.is_empty() {
            bot.username = heartbeat.username.clone();
        }
        Some(bot.clone())
    }

    /// Starts the registered bot. A running bot is left alone.
    pub fn start(&self, id: &str) -> Result<Bot> {
        self.with_bot_mut(id, |bot, processes| bot.start(processes))
    }

    pub fn restart(&self, id: &str) -> Result<Bot> {
        self.with_bot_mut(id, |bot, processes| bot.restart(processes))
    }

    /// Runs `op` on a copy of the bot outside the lock, then commits the
    /// resulting pid and status. One start or restart per id at a time; a bot
    /// removed while its client was launching has that client stopped.
    fn with_bot_mut(
        &self,
        id: &str,
        op: impl FnOnce(&mut Bot, &dyn ProcessHandle) -> Result<()>,
    ) -> Result<Bot> {
        let _claim = self.claim(id)?;
        let mut bot = self
            .find(id)
            .ok_or_else(|| FleetError::not_found("bot", id))?;
        let result = op(&mut bot, self.processes());

        let mut bots = self.write();
        let committed = bots.iter_mut().find(|entry| entry.id == id).map(|entry| {
            entry.pid = bot.pid;
            entry.status = bot.status.clone();
            entry.clone()
        });
        drop(bots);

        match committed {
            Some(entry) => result.map(|()| entry),
            None => {
                if bot.pid != 0 {
                    warn!(bot_id = %id, pid = bot.pid, "Bot removed during launch; stopping client");
                    if let Err(err) = self.processes.stop(bot.pid) {
                        warn!(bot_id = %id, pid = bot.pid, error = %err, "Failed to stop bot process");
                    }
                }
                result?;
                Err(FleetError::not_found("bot", id))
            }
        }
    }

    fn claim(&self, id: &str) -> Result<InFlight<'_>> {
        if !self.in_flight().insert(id.to_string()) {
            return Err(FleetError::AlreadyActive(id.to_string()));
        }
        Ok(InFlight {
            registry: self,
            id: id.to_string(),
        })
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Bot>> {
        self.bots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Bot>> {
        self.bots.write().unwrap_or_else(PoisonError::into_inner)
    }
}
