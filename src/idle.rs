//! Idle Coordinator: reads per-unit idle-signal files and decides whether
//! the whole fleet is done.
//!
//! The signal files are written only by the worker processes; the
//! supervisor reads and deletes them. A single idling unit never stops the
//! others — teardown requires every active unit to have flagged itself.

use std::path::Path;

use log::warn;
use serde::Deserialize;

use crate::fleet::{self, Fleet};
use crate::shutdown::ShutdownDecision;

/// What the worker asked for when it flagged idleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleScope {
    /// Stop this worker's processes only.
    Process,
    /// Stop the whole machine.
    Machine,
}

#[derive(Deserialize)]
struct IdleSignalFile {
    #[serde(default)]
    scope: String,
}

/// Per-tick view of fleet idleness, taken from one consistent fleet
/// snapshot together with the health poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleSnapshot {
    pub active_units: usize,
    pub idle_flagged: usize,
    pub machine_scope_requested: bool,
}

/// Count active units and, among those, units whose idle-signal file exists.
pub fn snapshot(fleet: &mut Fleet, work_dir: &Path) -> IdleSnapshot {
    let instance_id = fleet.instance_id.clone();
    let mut snap = IdleSnapshot {
        active_units: 0,
        idle_flagged: 0,
        machine_scope_requested: false,
    };

    for unit in fleet.units_mut() {
        if !unit.is_active() {
            continue;
        }
        snap.active_units += 1;

        let unit_id = fleet::unit_id(&instance_id, unit.slot);
        let path = fleet::idle_signal_path(work_dir, &unit_id);
        if let Some(scope) = read_idle_signal(&path) {
            snap.idle_flagged += 1;
            if scope == IdleScope::Machine {
                snap.machine_scope_requested = true;
            }
        }
    }

    snap
}

/// The fleet-idle rule: all active units must agree. A `machine` scope in
/// any signal file escalates a local teardown to instance termination even
/// when `--instance-shutdown` was not set.
pub fn decide(snap: &IdleSnapshot, instance_shutdown: bool) -> Option<ShutdownDecision> {
    if snap.active_units == 0 {
        return instance_shutdown.then_some(ShutdownDecision::TerminateInstance);
    }
    if snap.idle_flagged < snap.active_units {
        return None;
    }
    if instance_shutdown || snap.machine_scope_requested {
        Some(ShutdownDecision::TerminateInstance)
    } else {
        Some(ShutdownDecision::TerminateLocal)
    }
}

/// Read a unit's idle-signal file. Presence is the signal; a payload that
/// cannot be parsed still counts, with process scope.
pub fn read_idle_signal(path: &Path) -> Option<IdleScope> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<IdleSignalFile>(&contents) {
        Ok(signal) if signal.scope == "machine" => Some(IdleScope::Machine),
        Ok(_) => Some(IdleScope::Process),
        Err(e) => {
            warn!("malformed idle signal {}: {e}", path.display());
            Some(IdleScope::Process)
        }
    }
}

/// Delete a unit's idle-signal file (startup, relaunch, or once acted on).
pub fn clear_idle_signal(work_dir: &Path, unit_id: &str) {
    let path = fleet::idle_signal_path(work_dir, unit_id);
    if path.exists() {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("failed to clear idle signal {}: {e}", path.display());
        }
    }
}
