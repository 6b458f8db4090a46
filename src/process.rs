//! Liveness probing and graceful-then-forceful termination of tracked
//! child processes.

use std::process::Child;
use std::time::{Duration, Instant};

use log::warn;

/// How long a terminated process gets to exit before it is force-killed.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

const REAP_POLL: Duration = Duration::from_millis(200);

/// Check whether a tracked child is still running. Exited children are
/// reaped here, so a zombie never counts as alive.
pub fn is_alive(child: &mut Child) -> bool {
    match child.try_wait() {
        Ok(None) => true,
        Ok(Some(_)) => false,
        Err(e) => {
            warn!("liveness probe of pid {} failed: {e}", child.id());
            false
        }
    }
}

/// Ask a process to exit. SIGTERM on Unix so the worker can unregister;
/// elsewhere there is no graceful tier.
#[cfg(unix)]
fn request_exit(child: &Child) {
    // Fire and forget; a dead pid just returns ESRCH.
    unsafe {
        libc::kill(child.id() as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child) {}

/// Terminate a set of processes: graceful signal to every survivor, one
/// shared grace period, then force-kill whatever is left. Consumes the
/// handles; every child is reaped before this returns.
pub fn shut_down(mut children: Vec<Child>, grace: Duration) {
    children.retain_mut(is_alive);
    if children.is_empty() {
        return;
    }

    for child in &children {
        request_exit(child);
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        children.retain_mut(is_alive);
        if children.is_empty() {
            return;
        }
        std::thread::sleep(REAP_POLL);
    }

    for mut child in children {
        warn!("pid {} ignored terminate signal, killing", child.id());
        let _ = child.kill();
        let _ = child.wait();
    }
}
