use std::fmt;
use std::sync::{Arc, Mutex};

use log::info;

use super::Snapshot;

/// Totals for one committed transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl CommitStats {
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }
}

impl fmt::Display for CommitStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{} ~{} -{}",
            self.inserts, self.updates, self.deletes
        )
    }
}

/// Shared handle to one database. Each reconciliation pass takes a
/// snapshot (clone with counters cleared), mutates it freely, and
/// commits it back as one transaction.
#[derive(Debug, Clone)]
pub struct Store<D: Snapshot> {
    inner: Arc<Mutex<D>>,
}

impl<D: Snapshot> Store<D> {
    pub fn new(db: D) -> Self {
        Store {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub fn snapshot(&self) -> D {
        let mut snap = self.inner.lock().expect("store lock").clone();
        snap.clear_stats();
        snap
    }

    pub fn commit(&self, snapshot: D) -> CommitStats {
        let stats = snapshot.stats();
        let mut snapshot = snapshot;
        snapshot.clear_stats();
        *self.inner.lock().expect("store lock") = snapshot;
        stats
    }

    pub fn read<T, F: FnOnce(&D) -> T>(&self, f: F) -> T {
        f(&self.inner.lock().expect("store lock"))
    }

    /// Mutate the shared state directly, outside a reconciliation pass.
    /// Test setup and simulated external writers use this.
    pub fn apply<T, F: FnOnce(&mut D) -> T>(&self, f: F) -> T {
        let mut guard = self.inner.lock().expect("store lock");
        let out = f(&mut guard);
        guard.clear_stats();
        out
    }
}

/// Distributed advisory lock held by at most one replica. The database
/// client of the original system provides this; replicas here share the
/// handle in-process.
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    name: &'static str,
    holder: Arc<Mutex<Option<u64>>>,
}

impl AdvisoryLock {
    pub fn new(name: &'static str) -> Self {
        AdvisoryLock {
            name,
            holder: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire if free or already ours; true when we hold it afterwards
    pub fn try_acquire(&self, client: u64) -> bool {
        let mut holder = self.holder.lock().expect("lock state");
        match *holder {
            Some(id) => id == client,
            None => {
                *holder = Some(client);
                info!("lock {} acquired by client {}", self.name, client);
                true
            }
        }
    }

    pub fn release(&self, client: u64) {
        let mut holder = self.holder.lock().expect("lock state");
        if *holder == Some(client) {
            *holder = None;
            info!("lock {} released by client {}", self.name, client);
        }
    }

    pub fn held_by(&self) -> Option<u64> {
        *self.holder.lock().expect("lock state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_single_holder() {
        let lock = AdvisoryLock::new("ovn_northd");
        assert!(lock.try_acquire(1));
        assert!(!lock.try_acquire(2));
        assert!(lock.try_acquire(1));
        lock.release(2); // not the holder, no effect
        assert_eq!(lock.held_by(), Some(1));
        lock.release(1);
        assert!(lock.try_acquire(2));
    }
}
