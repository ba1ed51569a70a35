//! Liveness monitor.
//!
//! The pull half of the fleet's liveness picture. On a fixed interval the
//! monitor takes every account with an active session, probes the session's pid
//! and reconciles:
//!
//! - alive: make sure the registry knows the bot (adopts bots started elsewhere)
//! - dead: close the account's latest open session and drop the stale bot
//! - probe error: leave everything as is until the next cycle
//!
//! The process table outranks persisted sessions, which outrank the registry.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::ledger::ActivitySessionLedger;
use crate::registry::BotRegistry;
use crate::store::{now_timestamp, ActivitySessionStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub checked: usize,
    pub alive: usize,
    pub adopted: usize,
    pub closed: usize,
    pub skipped: usize,
    pub probe_errors: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSnapshot {
    pub running: bool,
    pub interval_secs: u64,
    pub cycles: u64,
    pub last_run_at: Option<String>,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct MonitorStats {
    cycles: u64,
    last_run_at: Option<String>,
    last_report: Option<CycleReport>,
    last_error: Option<String>,
}

pub struct LivenessMonitor {
    sessions: Arc<dyn ActivitySessionStore>,
    registry: Arc<BotRegistry>,
    ledger: Arc<ActivitySessionLedger>,
    interval: Duration,
    running: AtomicBool,
    stats: Mutex<MonitorStats>,
}

impl LivenessMonitor {
    pub fn new(
        sessions: Arc<dyn ActivitySessionStore>,
        registry: Arc<BotRegistry>,
        ledger: Arc<ActivitySessionLedger>,
        interval: Duration,
    ) -> Self {
        Self {
            sessions,
            registry,
            ledger,
            interval,
            running: AtomicBool::new(false),
            stats: Mutex::new(MonitorStats::default()),
        }
    }

    /// Runs cycles on a background thread until [`LivenessMonitor::stop`].
    pub fn spawn(self: Arc<Self>) -> Result<JoinHandle<()>> {
        self.running.store(true, Ordering::SeqCst);
        let monitor = Arc::clone(&self);
        let spawned = thread::Builder::new()
            .name("liveness-monitor".to_string())
            .spawn(move || loop {
                thread::sleep(monitor.interval);
                if !monitor.is_running() {
                    debug!("Liveness monitor stopped");
                    break;
                }
                if let Err(err) = monitor.run_cycle() {
                    warn!(error = %err, "Liveness cycle failed");
                }
            });

        match spawned {
            Ok(handle) => {
                info!(interval_secs = self.interval.as_secs(), "Liveness monitor started");
                Ok(handle)
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(FleetError::io("Failed to spawn liveness monitor", err))
            }
        }
    }

    /// Prevents the next cycle. A cycle already in progress completes.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn run_cycle(&self) -> Result<CycleReport> {
        let result = self.reconcile();
        let mut stats = self.stats();
        stats.cycles += 1;
        stats.last_run_at = Some(now_timestamp());
        match &result {
            Ok(report) => {
                stats.last_report = Some(*report);
                stats.last_error = None;
            }
            Err(err) => stats.last_error = Some(err.to_string()),
        }
        result
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let stats = self.stats();
        MonitorSnapshot {
            running: self.is_running(),
            interval_secs: self.interval.as_secs(),
            cycles: stats.cycles,
            last_run_at: stats.last_run_at.clone(),
            last_report: stats.last_report,
            last_error: stats.last_error.clone(),
        }
    }

    fn reconcile(&self) -> Result<CycleReport> {
        let candidates = self.sessions.list_active_bots()?;
        let processes = self.registry.processes();
        let mut report = CycleReport::default();

        for bot in candidates {
            report.checked += 1;
            let Some(account_id) = bot.account_id() else {
                warn!(bot_id = %bot.id, "Skipping bot with non-numeric id");
                report.skipped += 1;
                continue;
            };

            match processes.is_alive(bot.pid) {
                Ok(true) => {
                    report.alive += 1;
                    if self.registry.ensure(bot) {
                        report.adopted += 1;
                    }
                }
                Ok(false) => {
                    match self.ledger.close_latest_open(account_id) {
                        Ok(true) => {
                            report.closed += 1;
                            info!(
                                account_id,
                                pid = bot.pid,
                                email = %bot.email,
                                "Closed session for dead bot"
                            );
                        }
                        Ok(false) => {}
                        Err(err) => {
                            warn!(account_id, error = %err, "Failed to close dead session");
                            continue;
                        }
                    }
                    self.registry.evict_dead(&bot.id, bot.pid);
                }
                Err(err) => {
                    report.probe_errors += 1;
                    warn!(
                        account_id,
                        pid = bot.pid,
                        error = %err,
                        "Liveness probe failed; session left open"
                    );
                }
            }
        }

        if report.closed > 0 || report.adopted > 0 || report.probe_errors > 0 {
            info!(
                checked = report.checked,
                alive = report.alive,
                adopted = report.adopted,
                closed = report.closed,
                probe_errors = report.probe_errors,
                "Liveness cycle reconciled"
            );
        } else {
            debug!(checked = report.checked, "Liveness cycle clean");
        }
        Ok(report)
    }

    fn stats(&self) -> MutexGuard<'_, MonitorStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::Bot;
    use crate::db::Db;
    use crate::process::testing::FakeProcesses;
    use crate::store::{AccountStore, ACCOUNT_STATUS_ACTIVE};
    use std::time::Instant;

    struct Harness {
        _temp_dir: tempfile::TempDir,
        db: Arc<Db>,
        processes: Arc<FakeProcesses>,
        registry: Arc<BotRegistry>,
        ledger: Arc<ActivitySessionLedger>,
        monitor: Arc<LivenessMonitor>,
    }

    fn harness(interval: Duration) -> Harness {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Db::new(temp_dir.path().join("fleet.db")).expect("db init"));
        let processes = Arc::new(FakeProcesses::new());
        let registry = Arc::new(BotRegistry::new(processes.clone()));
        let ledger = Arc::new(ActivitySessionLedger::new(db.clone()));
        let monitor = Arc::new(LivenessMonitor::new(
            db.clone(),
            registry.clone(),
            ledger.clone(),
            interval,
        ));
        Harness {
            _temp_dir: temp_dir,
            db,
            processes,
            registry,
            ledger,
            monitor,
        }
    }

    fn session(h: &Harness, email: &str, pid: u32) -> i64 {
        let account = h
            .db
            .upsert_account(email, "", ACCOUNT_STATUS_ACTIVE)
            .expect("account");
        h.ledger.open(account.id, "chop.js", pid).expect("open");
        account.id
    }

    #[test]
    fn cycle_closes_exactly_the_dead_session() {
        let h = harness(Duration::from_secs(10));
        let live = session(&h, "live@example.com", 501);
        let dead = session(&h, "dead@example.com", 502);
        h.processes.set_alive(501);

        let report = h.monitor.run_cycle().expect("cycle");
        assert_eq!(report.checked, 2);
        assert_eq!(report.alive, 1);
        assert_eq!(report.closed, 1);

        assert_eq!(h.ledger.active_session_id(dead).expect("dead"), None);
        assert!(h.ledger.active_session_id(live).expect("live").is_some());
        let active = h.db.list_active_bots().expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, live.to_string());
    }

    #[test]
    fn probe_error_leaves_session_open() {
        let h = harness(Duration::from_secs(10));
        let account_id = session(&h, "flaky@example.com", 601);
        h.processes.fail_probe(601);

        let report = h.monitor.run_cycle().expect("cycle");
        assert_eq!(report.probe_errors, 1);
        assert_eq!(report.closed, 0);
        assert!(h.ledger.active_session_id(account_id).expect("query").is_some());
    }

    #[test]
    fn alive_sessions_are_adopted_once() {
        let h = harness(Duration::from_secs(10));
        let account_id = session(&h, "elsewhere@example.com", 701);
        h.processes.set_alive(701);

        assert_eq!(h.monitor.run_cycle().expect("first").adopted, 1);
        assert_eq!(h.monitor.run_cycle().expect("second").adopted, 0);

        let bot = h.registry.find(&account_id.to_string()).expect("adopted bot");
        assert_eq!(bot.pid, 701);
        assert_eq!(bot.script, "chop.js");
    }

    #[test]
    fn dead_bot_is_dropped_from_registry() {
        let h = harness(Duration::from_secs(10));
        let account_id = session(&h, "gone@example.com", 801);
        let mut bot = Bot::new(account_id.to_string(), "gone@example.com", "", "chop.js", vec![]);
        bot.pid = 801;
        h.registry.add(bot).expect("add");

        let report = h.monitor.run_cycle().expect("cycle");
        assert_eq!(report.closed, 1);
        assert!(h.registry.list().is_empty());
    }

    #[test]
    fn snapshot_tracks_cycles() {
        let h = harness(Duration::from_secs(10));
        assert_eq!(h.monitor.snapshot().cycles, 0);
        h.monitor.run_cycle().expect("cycle");

        let snapshot = h.monitor.snapshot();
        assert_eq!(snapshot.cycles, 1);
        assert!(snapshot.last_run_at.is_some());
        assert_eq!(snapshot.last_report, Some(CycleReport::default()));
        assert!(!snapshot.running);
    }

    #[test]
    fn spawned_loop_runs_until_stopped() {
        let h = harness(Duration::from_millis(10));
        let handle = Arc::clone(&h.monitor).spawn().expect("spawn");
        assert!(h.monitor.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while h.monitor.snapshot().cycles == 0 {
            assert!(Instant::now() < deadline, "monitor never ran");
            thread::sleep(Duration::from_millis(5));
        }

        h.monitor.stop();
        handle.join().expect("monitor thread");
        assert!(!h.monitor.snapshot().running);
    }
}
