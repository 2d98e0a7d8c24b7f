//! The daemon lifecycle: acquire the advisory lock, poll both
//! databases, reconcile while active, and honor pause/resume/exit from
//! the control API. A replica that does not hold the lock (or is
//! paused) keeps its snapshots warm but commits nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use rand::Rng;

use crate::api::rpc::StatusSummary;
use crate::config::DaemonConfig;
use crate::db::nb::NbDb;
use crate::db::sb::SbDb;
use crate::db::{AdvisoryLock, CommitStats, Store};
use crate::northd::{self, DaemonState};

pub const LOCK_NAME: &str = "ovn_northd";

#[derive(Debug)]
struct StatusInner {
    iterations: u64,
    last_nb_ops: usize,
    last_sb_ops: usize,
    started_at: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
}

/// State shared between the lifecycle loop and the control API
#[derive(Debug)]
pub struct ControlState {
    exiting: AtomicBool,
    paused: AtomicBool,
    has_lock: AtomicBool,
    status: Mutex<StatusInner>,
}

impl ControlState {
    pub fn new(start_paused: bool) -> Self {
        ControlState {
            exiting: AtomicBool::new(false),
            paused: AtomicBool::new(start_paused),
            has_lock: AtomicBool::new(false),
            status: Mutex::new(StatusInner {
                iterations: 0,
                last_nb_ops: 0,
                last_sb_ops: 0,
                started_at: Utc::now(),
                last_run_at: None,
            }),
        }
    }

    pub fn request_exit(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn set_has_lock(&self, has_lock: bool) {
        self.has_lock.store(has_lock, Ordering::SeqCst);
    }

    pub fn has_lock(&self) -> bool {
        self.has_lock.load(Ordering::SeqCst)
    }

    fn record_run(&self, nb_ops: usize, sb_ops: usize) {
        let mut status = self.status.lock().expect("status lock");
        status.iterations += 1;
        status.last_nb_ops = nb_ops;
        status.last_sb_ops = sb_ops;
        status.last_run_at = Some(Utc::now());
    }

    pub fn summary(&self) -> StatusSummary {
        let status = self.status.lock().expect("status lock");
        StatusSummary {
            paused: self.is_paused(),
            has_lock: self.has_lock(),
            exiting: self.is_exiting(),
            iterations: status.iterations,
            last_nb_ops: status.last_nb_ops,
            last_sb_ops: status.last_sb_ops,
            started_at: status.started_at,
            last_run_at: status.last_run_at,
        }
    }
}

/// One translator replica
pub struct Daemon {
    config: DaemonConfig,
    nb: Store<NbDb>,
    sb: Store<SbDb>,
    lock: AdvisoryLock,
    client_id: u64,
    control: Arc<ControlState>,
    state: DaemonState,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        nb: Store<NbDb>,
        sb: Store<SbDb>,
        lock: AdvisoryLock,
    ) -> Self {
        let control = Arc::new(ControlState::new(config.start_paused));
        Daemon {
            config,
            nb,
            sb,
            lock,
            client_id: rand::thread_rng().gen(),
            control,
            state: DaemonState::default(),
        }
    }

    pub fn control(&self) -> Arc<ControlState> {
        Arc::clone(&self.control)
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// One pass of the main loop: try for the lock, snapshot both
    /// databases, and reconcile + commit when active. Returns the
    /// commit stats when a transaction was submitted.
    pub fn run_once(&mut self) -> Option<(CommitStats, CommitStats)> {
        let had_lock = self.control.has_lock();
        let has_lock = self.lock.try_acquire(self.client_id);
        self.control.set_has_lock(has_lock);
        if has_lock != had_lock {
            if has_lock {
                info!("acquired lock {}, this replica is active", self.lock.name());
            } else {
                info!("lost lock {}, deferring to the active replica", self.lock.name());
            }
        }

        // snapshots are taken either way so a standby stays warm
        let mut nb_snap = self.nb.snapshot();
        let mut sb_snap = self.sb.snapshot();
        if !has_lock || self.control.is_paused() {
            debug!("skipping reconciliation (lock={}, paused={})", has_lock, self.control.is_paused());
            return None;
        }

        northd::build_all(&mut nb_snap, &mut sb_snap, &mut self.state);
        let nb_stats = self.nb.commit(nb_snap);
        let sb_stats = self.sb.commit(sb_snap);
        self.control.record_run(nb_stats.total(), sb_stats.total());
        debug!("iteration committed nb [{}] sb [{}]", nb_stats, sb_stats);
        Some((nb_stats, sb_stats))
    }

    /// Main loop; returns when exit is requested or a shutdown signal
    /// arrives
    pub async fn run(mut self) {
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            if self.control.is_exiting() {
                break;
            }
            self.run_once();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        info!("shutdown signal received");
                        self.control.request_exit();
                    }
                }
            }
        }
        self.lock.release(self.client_id);
        info!("exiting cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_daemon(lock: &AdvisoryLock, nb: &Store<NbDb>, sb: &Store<SbDb>) -> Daemon {
        Daemon::new(
            DaemonConfig::default(),
            nb.clone(),
            sb.clone(),
            lock.clone(),
        )
    }

    #[test]
    fn test_only_lock_holder_commits() {
        let nb = Store::new(NbDb::default());
        let sb = Store::new(SbDb::default());
        let lock = AdvisoryLock::new(LOCK_NAME);
        let mut a = new_daemon(&lock, &nb, &sb);
        let mut b = new_daemon(&lock, &nb, &sb);
        assert!(a.run_once().is_some());
        assert!(b.run_once().is_none());
        assert!(!b.control().has_lock());
    }

    #[test]
    fn test_paused_replica_skips_commit() {
        let nb = Store::new(NbDb::default());
        let sb = Store::new(SbDb::default());
        let lock = AdvisoryLock::new(LOCK_NAME);
        let mut daemon = new_daemon(&lock, &nb, &sb);
        daemon.control().set_paused(true);
        assert!(daemon.run_once().is_none());
        assert!(daemon.control().has_lock());
        daemon.control().set_paused(false);
        assert!(daemon.run_once().is_some());
    }

    #[test]
    fn test_failover_after_release() {
        let nb = Store::new(NbDb::default());
        let sb = Store::new(SbDb::default());
        let lock = AdvisoryLock::new(LOCK_NAME);
        let mut a = new_daemon(&lock, &nb, &sb);
        let mut b = new_daemon(&lock, &nb, &sb);
        assert!(a.run_once().is_some());
        assert!(b.run_once().is_none());
        // replica A exits and releases; B takes over on its next poll
        lock.release(a.client_id());
        assert!(b.run_once().is_some());
        assert!(a.run_once().is_none());
    }
}
