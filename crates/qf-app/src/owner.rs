//! Which manager supervises a local calculation.
//!
//! A local run is owned by the manager that submitted it, identified by the
//! process id plus a per-manager session id. Several managers may share a
//! process (tests, embedding), so the pid alone does not say whether the
//! owner is gone.

use std::collections::HashSet;
use std::sync::{LazyLock, Mutex, PoisonError};

use chrono::Utc;
use qf_core::RunOwner;
use uuid::Uuid;

static LIVE_SESSIONS: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(Default::default);

/// Registered as live until dropped with its manager.
#[derive(Debug)]
pub(crate) struct Session {
    id: String,
    pid: u32,
}

impl Session {
    pub(crate) fn start() -> Self {
        let id = Uuid::new_v4().to_string();
        LIVE_SESSIONS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
        Self {
            id,
            pid: std::process::id(),
        }
    }

    pub(crate) fn owner(&self) -> RunOwner {
        RunOwner {
            pid: self.pid,
            session: self.id.clone(),
            since: Utc::now(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        LIVE_SESSIONS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Whether the manager recorded as `owner` may still be supervising its run.
pub(crate) fn is_alive(owner: &RunOwner) -> bool {
    if owner.pid == std::process::id() {
        return LIVE_SESSIONS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&owner.session);
    }
    process_alive(owner.pid)
}

/// Check if a process exists using kill(pid, 0).
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 is never delivered; kill only checks the pid.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: alive, but owned by another user.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a liveness check, an owner in another process is never declared gone.
#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
