//! Health Monitor: per-tick liveness poll over the whole fleet.

use log::warn;

use crate::fleet::Fleet;

/// Slots whose backend, tunnel, or worker process is no longer alive.
/// Units currently owned by the restart controller are skipped; a unit
/// with no handles at all (a previously failed launch) counts as dead so
/// the restart is retried.
pub fn poll(fleet: &mut Fleet) -> Vec<u32> {
    let mut dead = Vec::new();
    for unit in fleet.units_mut() {
        if unit.restarting {
            continue;
        }
        if !unit.all_alive() {
            warn!("[slot {}] unit unhealthy, scheduling restart", unit.slot);
            dead.push(unit.slot);
        }
    }
    dead
}
