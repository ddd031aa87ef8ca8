//! The two auxiliary workers spec.md §5 permits alongside the
//! single-threaded cooperative core: the map loader's gated rendezvous and
//! the output publisher's single-producer/single-consumer queue. Neither
//! introduces an async runtime -- both are built from `std::sync`
//! primitives, matching the core's "no suspensions inside a step" rule.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::density::ContactEstimate;
use crate::error::{ArmclError, Result};
use crate::mesh::MeshMapTree;

enum LoadState {
    Pending,
    Ready(Arc<MeshMapTree>),
    Failed(String),
}

/// The exactly-once gated rendezvous around the async map loader (spec.md
/// §5). One producer calls [`StateSpaceGate::publish`]; any number of
/// consumers call [`StateSpaceGate::wait`] and block until it has (or it
/// fails, or the deadline passes).
#[derive(Clone)]
pub struct StateSpaceGate {
    inner: Arc<(Mutex<LoadState>, Condvar)>,
}

impl StateSpaceGate {
    pub fn new() -> Self {
        StateSpaceGate {
            inner: Arc::new((Mutex::new(LoadState::Pending), Condvar::new())),
        }
    }

    /// Called exactly once by the map-loading worker on success.
    pub fn publish(&self, tree: MeshMapTree) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().expect("state-space gate mutex poisoned");
        assert!(
            matches!(*state, LoadState::Pending),
            "state space published more than once"
        );
        *state = LoadState::Ready(Arc::new(tree));
        cvar.notify_all();
    }

    /// Called by the map-loading worker if it gives up; a partially-built
    /// tree must never reach `publish` (spec.md §5).
    pub fn fail(&self, reason: impl Into<String>) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().expect("state-space gate mutex poisoned");
        if matches!(*state, LoadState::Pending) {
            *state = LoadState::Failed(reason.into());
        }
        cvar.notify_all();
    }

    /// Blocks until the loader has published or failed, or `deadline`
    /// elapses (`LoadTimeout`, spec.md §7).
    pub fn wait(&self, deadline: Duration) -> Result<Arc<MeshMapTree>> {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().expect("state-space gate mutex poisoned");
        let start = Instant::now();
        loop {
            match &*state {
                LoadState::Ready(tree) => return Ok(tree.clone()),
                LoadState::Failed(reason) => return Err(ArmclError::InvalidInput(reason.clone())),
                LoadState::Pending => {}
            }
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return Err(ArmclError::LoadTimeout(deadline));
            }
            let (guard, timeout) = cvar
                .wait_timeout(state, deadline - elapsed)
                .expect("state-space gate mutex poisoned");
            state = guard;
            if timeout.timed_out() && matches!(*state, LoadState::Pending) {
                return Err(ArmclError::LoadTimeout(deadline));
            }
        }
    }
}

impl Default for StateSpaceGate {
    fn default() -> Self {
        Self::new()
    }
}

/// One immutable snapshot handed from the driver to the output publisher
/// (spec.md §6: "optional snapshot of the full particle set").
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub step: u64,
    pub n_eff: f64,
    pub contacts: Vec<ContactEstimate>,
}

/// Builds the bounded single-producer/single-consumer publisher queue
/// (spec.md §5); capacity 1 means the driver never blocks waiting for a
/// slow consumer to drain.
pub fn publisher_channel() -> (SyncSender<Snapshot>, Receiver<Snapshot>) {
    sync_channel(1)
}

/// Publishes `snapshot` without ever blocking the driver's step (spec.md
/// §5: "no suspensions inside a step"). A full queue or a disconnected
/// consumer silently drops the snapshot.
pub fn publish_best_effort(sender: &SyncSender<Snapshot>, snapshot: Snapshot) {
    match sender.try_send(snapshot) {
        Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
    }
}
