use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Running,
    Completing,
}

/// Shared stop request, checked by the engine between users.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct GuardState {
    phase: RunPhase,
    sync_id: Option<Uuid>,
    cancel: CancelFlag,
}

impl Default for GuardState {
    fn default() -> Self {
        Self {
            phase: RunPhase::Idle,
            sync_id: None,
            cancel: CancelFlag::default(),
        }
    }
}

/// Single-flight guard for sync runs within this process.
#[derive(Debug, Clone, Default)]
pub struct SyncGuard {
    state: Arc<Mutex<GuardState>>,
}

impl SyncGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move `Idle -> Running` for `sync_id`, or report the run in flight.
    pub fn try_begin(&self, sync_id: Uuid) -> Result<SyncPermit, SyncError> {
        let mut state = self.lock();
        if state.phase != RunPhase::Idle {
            return Err(SyncError::AlreadyRunning {
                sync_id: state.sync_id.unwrap_or(sync_id),
            });
        }
        let cancel = CancelFlag::default();
        state.phase = RunPhase::Running;
        state.sync_id = Some(sync_id);
        state.cancel = cancel.clone();
        Ok(SyncPermit {
            guard: self.clone(),
            sync_id,
            cancel,
        })
    }

    pub fn phase(&self) -> RunPhase {
        self.lock().phase
    }

    pub fn current_sync_id(&self) -> Option<Uuid> {
        self.lock().sync_id
    }

    /// Flag the in-flight run for cancellation if its id matches.
    pub fn request_cancel(&self, sync_id: &str) -> bool {
        let state = self.lock();
        match state.sync_id {
            Some(current) if state.phase == RunPhase::Running && current.to_string() == sync_id => {
                state.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

/// Held for the lifetime of one run; dropping it returns the guard to idle.
#[derive(Debug)]
pub struct SyncPermit {
    guard: SyncGuard,
    sync_id: Uuid,
    cancel: CancelFlag,
}

impl SyncPermit {
    pub fn sync_id(&self) -> Uuid {
        self.sync_id
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// `Running -> Completing`; cancellation requests are ignored from here on.
    pub fn completing(&self) {
        self.guard.lock().phase = RunPhase::Completing;
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        let mut state = self.guard.lock();
        if state.sync_id == Some(self.sync_id) {
            *state = GuardState::default();
        }
    }
}
