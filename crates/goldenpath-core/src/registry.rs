use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::warn;

use crate::persist;
use crate::state::Snapshot;
use crate::types::PauseDecision;

/// Throttle between disk writes of the live snapshot.
const DISK_WRITE_INTERVAL_SECS: f64 = 3.0;

/// Context published for the diagnostic subsystem when a run starts.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub run_id: String,
    pub context: String,
    pub correlation: String,
}

struct Inner {
    snapshot: Snapshot,
    version: u64,
}

/// Process-global registry of the canonical pipeline snapshot.
///
/// The session running the pipeline writes here; observer sessions poll from
/// here. Also persisted to disk (throttled) for crash recovery. The mutexes
/// are std (non-reentrant) and must never be held across an await point.
pub struct SharedState {
    inner: Mutex<Inner>,
    pause_action: Mutex<String>,
    abort: AtomicBool,
    run_context: Mutex<RunContext>,
    disk: Mutex<Option<Instant>>,
    state_path: PathBuf,
    /// Closes the race between the registry mutex and the per-session
    /// scheduler during executor election.
    executor_gate: tokio::sync::Mutex<()>,
}

impl SharedState {
    pub fn new(state_path: PathBuf) -> Self {
        Self {
            inner: Mutex::new(Inner {
                snapshot: Snapshot::default(),
                version: 0,
            }),
            pause_action: Mutex::new(String::new()),
            abort: AtomicBool::new(false),
            run_context: Mutex::new(RunContext::default()),
            disk: Mutex::new(None),
            state_path,
            executor_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn executor_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.executor_gate
    }

    /// Replace the in-memory snapshot and bump the version.
    ///
    /// Disk writes are throttled; `force_disk` bypasses the throttle (used at
    /// pipeline start, step boundaries and finalization). Persistence errors
    /// are logged, never propagated — memory stays authoritative.
    pub fn publish(&self, snapshot: Snapshot, force_disk: bool) {
        {
            let mut inner = lock_or_recover(&self.inner);
            inner.snapshot = snapshot.clone();
            inner.version += 1;
        }
        let write = {
            let mut last = lock_or_recover(&self.disk);
            let due = match *last {
                Some(at) => at.elapsed().as_secs_f64() >= DISK_WRITE_INTERVAL_SECS,
                None => true,
            };
            if force_disk || due {
                *last = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if write {
            if let Err(e) = persist::save_live_state(&self.state_path, &snapshot) {
                warn!("failed to save live state: {e:#}");
            }
        }
    }

    /// Read the current snapshot and its version.
    pub fn read(&self) -> (Snapshot, u64) {
        let inner = lock_or_recover(&self.inner);
        (inner.snapshot.clone(), inner.version)
    }

    pub fn version(&self) -> u64 {
        lock_or_recover(&self.inner).version
    }

    /// True when a published snapshot says a pipeline is running.
    pub fn is_running(&self) -> bool {
        lock_or_recover(&self.inner).snapshot.is_running
    }

    /// Load the last persisted snapshot from disk, if any.
    pub fn load_from_disk(&self) -> Option<Snapshot> {
        persist::load_live_state(&self.state_path)
    }

    // ── Pause / abort signals ─────────────────────────────────────────────

    /// Record a cross-session pause decision (called from any session).
    pub fn set_pause_action(&self, action: &str) {
        *lock_or_recover(&self.pause_action) = action.to_string();
    }

    /// Read-and-clear the shared pause action. Returns `None` while no valid
    /// decision is pending; the slot is cleared atomically on a hit.
    pub fn take_pause_action(&self) -> Option<PauseDecision> {
        let mut slot = lock_or_recover(&self.pause_action);
        if slot.is_empty() {
            return None;
        }
        let action = std::mem::take(&mut *slot);
        PauseDecision::from_str(&action)
    }

    /// Set the sticky abort flag. Cleared only at run finalization.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    // ── Run context for diagnostics ───────────────────────────────────────

    pub fn publish_run_context(&self, run_id: &str, context: &str) {
        let mut ctx = lock_or_recover(&self.run_context);
        ctx.run_id = run_id.to_string();
        ctx.context = context.to_string();
    }

    pub fn publish_correlation(&self, correlation: &str) {
        lock_or_recover(&self.run_context).correlation = correlation.to_string();
    }

    pub fn run_context(&self) -> RunContext {
        lock_or_recover(&self.run_context).clone()
    }
}

/// A poisoned lock here means another thread panicked mid-update; the
/// snapshot itself is always replaced wholesale, so continuing is safe.
fn lock_or_recover<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> (tempfile::TempDir, SharedState) {
        let dir = tempfile::tempdir().unwrap();
        let state = SharedState::new(dir.path().join("live_state.json"));
        (dir, state)
    }

    #[test]
    fn version_strictly_increases_on_publish() {
        let (_dir, s) = shared();
        let (_, v0) = s.read();
        s.publish(Snapshot::default(), false);
        let (_, v1) = s.read();
        s.publish(Snapshot::default(), false);
        let (_, v2) = s.read();
        assert!(v1 > v0);
        assert!(v2 > v1);
    }

    #[test]
    fn pause_action_is_consume_on_read() {
        let (_dir, s) = shared();
        assert!(s.take_pause_action().is_none());
        s.set_pause_action("retry");
        assert_eq!(s.take_pause_action(), Some(PauseDecision::Retry));
        assert!(s.take_pause_action().is_none());
    }

    #[test]
    fn invalid_pause_action_is_consumed_and_discarded() {
        let (_dir, s) = shared();
        s.set_pause_action("dance");
        assert!(s.take_pause_action().is_none());
        assert!(s.take_pause_action().is_none());
    }

    #[test]
    fn abort_flag_is_sticky_until_cleared() {
        let (_dir, s) = shared();
        assert!(!s.abort_requested());
        s.request_abort();
        assert!(s.abort_requested());
        assert!(s.abort_requested());
        s.clear_abort();
        assert!(!s.abort_requested());
    }

    #[test]
    fn run_context_slot_holds_latest_values() {
        let (_dir, s) = shared();
        s.publish_run_context("r4", "run 4 started");
        s.publish_correlation("r4-merge-ab12");
        let ctx = s.run_context();
        assert_eq!(ctx.run_id, "r4");
        assert_eq!(ctx.context, "run 4 started");
        assert_eq!(ctx.correlation, "r4-merge-ab12");
    }

    #[test]
    fn forced_publish_writes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_state.json");
        let s = SharedState::new(path.clone());
        let mut snap = Snapshot::default();
        snap.is_running = true;
        s.publish(snap, true);
        let loaded = crate::persist::load_live_state(&path).expect("persisted");
        assert!(loaded.is_running);
    }

    #[test]
    fn throttled_publish_skips_rapid_disk_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_state.json");
        let s = SharedState::new(path.clone());

        // First write goes through (no previous write recorded).
        s.publish(Snapshot::default(), false);
        let first = std::fs::metadata(&path).unwrap().modified().unwrap();

        // Immediate second write is throttled.
        let mut snap = Snapshot::default();
        snap.is_running = true;
        s.publish(snap, false);
        let second = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(first, second);
        let on_disk = crate::persist::load_live_state(&path).expect("load");
        assert!(!on_disk.is_running, "throttled write must not hit disk");
    }
}
