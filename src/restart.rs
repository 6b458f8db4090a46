//! Restart Controller: tears down and relaunches a single failed unit.
//!
//! Strictly per-unit: a dead process in one slot never touches another
//! slot's processes or artifacts. A restart that fails (backend never comes
//! ready, spawn error) leaves the unit empty; the next health tick reports
//! it dead again and the restart is retried, indefinitely.

use log::{error, info};

use crate::config::Config;
use crate::fleet::{self, SharedFleet};
use crate::idle;
use crate::launcher;
use crate::process;

/// Tear down whatever remains of a unit and launch it fresh. Blocking;
/// invoked off the monitor loop so other slots keep being polled.
pub fn restart(fleet: &SharedFleet, cfg: &Config, slot: u32) {
    info!("[slot {slot}] restarting unit");

    tear_down(fleet, cfg, slot);

    // The launcher records handles on the fleet as it goes and releases
    // the restart claim itself; a failure leaves the unit empty for the
    // next health tick to retry.
    match launcher::start_unit(fleet, cfg, slot) {
        Ok(()) => info!("[slot {slot}] restart complete"),
        Err(e) => error!("[slot {slot}] restart failed: {e}"),
    }
}

/// Terminate a unit's surviving processes and delete its idle-signal and
/// tunnel-log artifacts. Only this slot's state is touched.
pub fn tear_down(fleet: &SharedFleet, cfg: &Config, slot: u32) {
    let (children, unit_id) = {
        let mut guard = fleet::lock(fleet);
        let unit_id = guard.unit_id(slot);
        let children = match guard.unit_mut(slot) {
            Some(unit) => {
                unit.restarting = true;
                unit.tunnel_url.clear();
                unit.take_handles()
            }
            None => Vec::new(),
        };
        (children, unit_id)
    };

    // Grace wait happens outside the fleet lock.
    process::shut_down(children, process::TERM_GRACE);

    idle::clear_idle_signal(&cfg.work_dir, &unit_id);
    let tunnel_log = fleet::tunnel_log_path(&cfg.work_dir, slot);
    if tunnel_log.exists() {
        let _ = std::fs::remove_file(tunnel_log);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::fleet::{Fleet, Unit};
    use std::process::{Child, Command};
    use std::sync::{Arc, Mutex};

    fn spawn_sleep() -> Child {
        Command::new("sleep").arg("30").spawn().expect("spawn sleep")
    }

    fn test_config(work_dir: &std::path::Path) -> Config {
        Config {
            instance_id: "i-0abc".to_string(),
            slots: vec![0, 1],
            instance_shutdown: false,
            idle_timeout_secs: 600,
            keep_alive: false,
            api_url: "http://127.0.0.1:1".to_string(),
            comfyui_path: work_dir.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
        }
    }

    #[test]
    fn test_tear_down_touches_only_its_own_unit() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();

        let mut fleet = Fleet::new("i-0abc", &[0, 1]);
        let mut unit0 = Unit::new(0);
        unit0.worker = Some(spawn_sleep());
        let mut unit1 = Unit::new(1);
        unit1.worker = Some(spawn_sleep());
        let other_pid = unit1.worker.as_ref().unwrap().id() as i32;
        fleet.replace_unit(unit0);
        fleet.replace_unit(unit1);

        // Artifacts for both units.
        let signal0 = fleet::idle_signal_path(dir.path(), "i-0abc-gpu0");
        let signal1 = fleet::idle_signal_path(dir.path(), "i-0abc-gpu1");
        std::fs::write(&signal0, "{}").unwrap();
        std::fs::write(&signal1, "{}").unwrap();
        let tunnel_log0 = fleet::tunnel_log_path(dir.path(), 0);
        let tunnel_log1 = fleet::tunnel_log_path(dir.path(), 1);
        std::fs::write(&tunnel_log0, "log").unwrap();
        std::fs::write(&tunnel_log1, "log").unwrap();

        let shared = Arc::new(Mutex::new(fleet));
        tear_down(&shared, &cfg, 0);

        // Slot 0 is emptied and its artifacts are gone.
        {
            let mut guard = fleet::lock(&shared);
            let unit0 = guard.unit_mut(0).unwrap();
            assert!(unit0.worker.is_none());
            assert!(unit0.restarting);
        }
        assert!(!signal0.exists());
        assert!(!tunnel_log0.exists());

        // Slot 1's process and artifacts are untouched.
        assert!(signal1.exists());
        assert!(tunnel_log1.exists());
        let probe = unsafe { libc::kill(other_pid, 0) };
        assert_eq!(probe, 0, "slot 1 worker was killed by slot 0 teardown");

        // Cleanup.
        {
            let mut guard = fleet::lock(&shared);
            for unit in guard.units_mut() {
                for mut child in unit.take_handles() {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            }
        }
    }
}
