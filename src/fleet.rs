//! Fleet state: one `Unit` per supervised GPU slot.
//!
//! The fleet is the single shared mutable structure; the monitor loop, the
//! restart controller, and the shutdown paths all go through one coarse
//! mutex around it. Per-unit process handles are only mutated while that
//! unit's slot is being torn down or relaunched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::process;

/// Base port of the first backend; slot N serves on `BACKEND_BASE_PORT + N`.
pub const BACKEND_BASE_PORT: u16 = 8188;

/// One GPU slot's triple of cooperating processes.
pub struct Unit {
    pub slot: u32,
    pub backend: Option<Child>,
    pub tunnel: Option<Child>,
    pub worker: Option<Child>,
    /// Externally reachable URL for this unit's backend; empty when tunnel
    /// URL discovery timed out (the unit still runs, unexposed).
    pub tunnel_url: String,
    /// Set while the restart controller owns this slot; the health monitor
    /// skips units in this state.
    pub restarting: bool,
}

impl Unit {
    pub fn new(slot: u32) -> Self {
        Self {
            slot,
            backend: None,
            tunnel: None,
            worker: None,
            tunnel_url: String::new(),
            restarting: false,
        }
    }

    /// A unit is active iff its worker process is present and alive.
    pub fn is_active(&mut self) -> bool {
        self.worker.as_mut().is_some_and(process::is_alive)
    }

    /// All three processes present and alive.
    pub fn all_alive(&mut self) -> bool {
        self.backend.as_mut().is_some_and(process::is_alive)
            && self.tunnel.as_mut().is_some_and(process::is_alive)
            && self.worker.as_mut().is_some_and(process::is_alive)
    }

    /// Remove and return every process handle, leaving the unit empty.
    pub fn take_handles(&mut self) -> Vec<Child> {
        self.backend
            .take()
            .into_iter()
            .chain(self.tunnel.take())
            .chain(self.worker.take())
            .collect()
    }
}

/// All units of one supervisor instance. The slot set is fixed at startup.
pub struct Fleet {
    pub instance_id: String,
    units: BTreeMap<u32, Unit>,
    draining: bool,
}

impl Fleet {
    pub fn new(instance_id: &str, slots: &[u32]) -> Self {
        let units = slots.iter().map(|&s| (s, Unit::new(s))).collect();
        Self {
            instance_id: instance_id.to_string(),
            units,
            draining: false,
        }
    }

    /// Mark the fleet as shutting down. In-flight launches observe this and
    /// stop spawning; any process they already spawned is on its unit and
    /// gets reaped by the teardown sweep.
    pub fn begin_drain(&mut self) {
        self.draining = true;
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn slots(&self) -> Vec<u32> {
        self.units.keys().copied().collect()
    }

    pub fn unit_mut(&mut self, slot: u32) -> Option<&mut Unit> {
        self.units.get_mut(&slot)
    }

    pub fn units_mut(&mut self) -> impl Iterator<Item = &mut Unit> {
        self.units.values_mut()
    }

    /// Swap in a freshly launched unit for its slot.
    pub fn replace_unit(&mut self, unit: Unit) {
        self.units.insert(unit.slot, unit);
    }

    pub fn unit_id(&self, slot: u32) -> String {
        unit_id(&self.instance_id, slot)
    }
}

pub type SharedFleet = Arc<Mutex<Fleet>>;

/// Lock the fleet, recovering from a poisoned mutex (a panicked restart
/// task must not take the whole supervisor down).
pub fn lock(fleet: &SharedFleet) -> MutexGuard<'_, Fleet> {
    fleet.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stable unit identity derived from `(instance_id, slot)`.
pub fn unit_id(instance_id: &str, slot: u32) -> String {
    format!("{instance_id}-gpu{slot}")
}

pub fn backend_port(slot: u32) -> u16 {
    BACKEND_BASE_PORT + slot as u16
}

/// Sentinel file a worker writes to announce self-detected idleness.
pub fn idle_signal_path(work_dir: &Path, unit_id: &str) -> PathBuf {
    work_dir.join(format!("shutdown-request-{unit_id}.json"))
}

pub fn tunnel_log_path(work_dir: &Path, slot: u32) -> PathBuf {
    work_dir.join("logs").join(format!("tunnel-gpu{slot}.log"))
}

pub fn backend_log_path(work_dir: &Path, slot: u32) -> PathBuf {
    work_dir.join("logs").join(format!("backend-gpu{slot}.log"))
}

pub fn worker_log_path(work_dir: &Path, slot: u32) -> PathBuf {
    work_dir.join("logs").join(format!("worker-gpu{slot}.log"))
}
