//! Unit Launcher: brings up one unit's processes in strict order.
//!
//! backend (wait until it answers) -> tunnel (bounded URL discovery) ->
//! worker. The backend wait is intentionally unbounded: ComfyUI startup
//! time varies wildly with the models it loads, and a slow start is not a
//! failure. Tunnel URL discovery is bounded; a unit without external
//! exposure still polls for jobs.
//!
//! Every spawned process is recorded on its unit under the fleet lock
//! before the launch proceeds, so a fleet teardown that lands mid-launch
//! still reaps everything spawned so far. A launch that observes the fleet
//! draining stops spawning and kills its own fresh child.

use std::fs::{File, OpenOptions};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;

use crate::config::Config;
use crate::fleet::{self, SharedFleet, Unit};
use crate::idle;
use crate::process;
use crate::SupervisorError;

/// Interval between backend readiness probes.
pub const BACKEND_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Tunnel URL discovery: bounded, unlike the backend wait.
pub const TUNNEL_URL_ATTEMPTS: u32 = 30;
pub const TUNNEL_URL_INTERVAL: Duration = Duration::from_secs(1);

lazy_static! {
    static ref TUNNEL_URL_RE: Regex =
        Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").expect("tunnel URL regex");
}

/// Start every process of one unit, recording each handle on the fleet as
/// it spawns. Any idle signal left by a previous incarnation of this slot
/// is deleted first so it cannot trigger a stale shutdown decision. On
/// failure the slot is left empty for the health loop to retry.
pub fn start_unit(fleet: &SharedFleet, cfg: &Config, slot: u32) -> Result<(), SupervisorError> {
    let unit_id = fleet::unit_id(&cfg.instance_id, slot);
    let port = fleet::backend_port(slot);

    idle::clear_idle_signal(&cfg.work_dir, &unit_id);
    if let Some(unit) = fleet::lock(fleet).unit_mut(slot) {
        unit.restarting = true;
    }

    info!("[slot {slot}] launching unit {unit_id} (backend port {port})");

    match run_stages(fleet, cfg, slot, port, &unit_id) {
        Ok(tunnel_url) => {
            let mut guard = fleet::lock(fleet);
            if let Some(unit) = guard.unit_mut(slot) {
                unit.tunnel_url = tunnel_url;
                unit.restarting = false;
            }
            info!("[slot {slot}] unit {unit_id} up");
            Ok(())
        }
        Err(e) => {
            abort_launch(fleet, slot);
            Err(e)
        }
    }
}

fn run_stages(
    fleet: &SharedFleet,
    cfg: &Config,
    slot: u32,
    port: u16,
    unit_id: &str,
) -> Result<String, SupervisorError> {
    let backend = spawn_backend(cfg, slot, port)?;
    record_stage(fleet, slot, backend, |u| &mut u.backend)?;
    wait_for_backend(fleet, slot, port)?;

    let tunnel = spawn_tunnel(cfg, slot, port)?;
    record_stage(fleet, slot, tunnel, |u| &mut u.tunnel)?;

    let tunnel_url = discover_tunnel_url(fleet, cfg, slot)?.unwrap_or_default();
    if tunnel_url.is_empty() {
        warn!("[slot {slot}] no tunnel URL after {TUNNEL_URL_ATTEMPTS} attempts, continuing without external exposure");
    } else {
        info!("[slot {slot}] tunnel URL: {tunnel_url}");
    }

    let worker = spawn_worker(cfg, slot, port, unit_id, &tunnel_url)?;
    record_stage(fleet, slot, worker, |u| &mut u.worker)?;

    Ok(tunnel_url)
}

/// Put a freshly spawned stage process under fleet tracking. If the fleet
/// started draining since the spawn, the child is killed here instead of
/// being handed to a teardown that already ran.
fn record_stage(
    fleet: &SharedFleet,
    slot: u32,
    mut child: Child,
    stage_slot: impl FnOnce(&mut Unit) -> &mut Option<Child>,
) -> Result<(), SupervisorError> {
    let mut guard = fleet::lock(fleet);
    if !guard.is_draining() {
        if let Some(unit) = guard.unit_mut(slot) {
            *stage_slot(unit) = Some(child);
            return Ok(());
        }
    }
    drop(guard);
    let _ = child.kill();
    let _ = child.wait();
    Err(SupervisorError::Aborted(slot))
}

/// The launch loses its slot when a teardown empties it or the fleet
/// starts draining.
fn launch_cancelled(fleet: &SharedFleet, slot: u32) -> bool {
    let mut guard = fleet::lock(fleet);
    guard.is_draining() || guard.unit_mut(slot).is_none_or(|u| u.backend.is_none())
}

fn spawn_backend(cfg: &Config, slot: u32, port: u16) -> Result<Child, SupervisorError> {
    let log = open_log(cfg, fleet::backend_log_path(&cfg.work_dir, slot), "backend", slot)?;
    let err_log = log.try_clone().map_err(|source| SupervisorError::Spawn {
        stage: "backend",
        slot,
        source,
    })?;

    Command::new("python3")
        .args(["main.py", "--listen", "127.0.0.1", "--port", &port.to_string()])
        .current_dir(&cfg.comfyui_path)
        .env("CUDA_VISIBLE_DEVICES", slot.to_string())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(err_log))
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            stage: "backend",
            slot,
            source,
        })
}

/// Block until the backend answers on its local port. Unbounded by design;
/// bails only if the backend dies while we wait or the launch is cancelled
/// by a fleet teardown.
fn wait_for_backend(fleet: &SharedFleet, slot: u32, port: u16) -> Result<(), SupervisorError> {
    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(2))
        .build();
    let url = format!("http://127.0.0.1:{port}/system_stats");

    let mut attempts: u64 = 0;
    loop {
        if backend_ready(&agent, &url) {
            info!("[slot {slot}] backend ready after {attempts} probes");
            return Ok(());
        }
        {
            let mut guard = fleet::lock(fleet);
            if guard.is_draining() {
                return Err(SupervisorError::Aborted(slot));
            }
            match guard.unit_mut(slot).and_then(|u| u.backend.as_mut()) {
                None => return Err(SupervisorError::Aborted(slot)),
                Some(backend) => {
                    if !process::is_alive(backend) {
                        return Err(SupervisorError::BackendExited(slot));
                    }
                }
            }
        }
        attempts += 1;
        if attempts % 15 == 0 {
            info!("[slot {slot}] still waiting for backend on port {port} ({attempts} probes)");
        }
        std::thread::sleep(BACKEND_PROBE_INTERVAL);
    }
}

/// Any HTTP response counts as ready, including error statuses; the
/// backend answering at all means it is up.
fn backend_ready(agent: &ureq::Agent, url: &str) -> bool {
    match agent.get(url).call() {
        Ok(_) => true,
        Err(ureq::Error::Status(_, _)) => true,
        Err(_) => false,
    }
}

fn spawn_tunnel(cfg: &Config, slot: u32, port: u16) -> Result<Child, SupervisorError> {
    let log = open_log(cfg, fleet::tunnel_log_path(&cfg.work_dir, slot), "tunnel", slot)?;
    let err_log = log.try_clone().map_err(|source| SupervisorError::Spawn {
        stage: "tunnel",
        slot,
        source,
    })?;

    // cloudflared prints the assigned URL on stderr; both streams go to the
    // same per-unit log artifact.
    Command::new("cloudflared")
        .args(["tunnel", "--url", &format!("http://127.0.0.1:{port}")])
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(err_log))
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            stage: "tunnel",
            slot,
            source,
        })
}

/// Poll the tunnel log artifact for an externally routable URL.
fn discover_tunnel_url(
    fleet: &SharedFleet,
    cfg: &Config,
    slot: u32,
) -> Result<Option<String>, SupervisorError> {
    let log_path = fleet::tunnel_log_path(&cfg.work_dir, slot);
    for _ in 0..TUNNEL_URL_ATTEMPTS {
        if launch_cancelled(fleet, slot) {
            return Err(SupervisorError::Aborted(slot));
        }
        if let Ok(contents) = std::fs::read_to_string(&log_path) {
            if let Some(url) = extract_tunnel_url(&contents) {
                return Ok(Some(url));
            }
        }
        std::thread::sleep(TUNNEL_URL_INTERVAL);
    }
    Ok(None)
}

/// First externally routable tunnel URL in the log text, if any.
pub fn extract_tunnel_url(text: &str) -> Option<String> {
    TUNNEL_URL_RE.find(text).map(|m| m.as_str().to_string())
}

fn spawn_worker(
    cfg: &Config,
    slot: u32,
    port: u16,
    unit_id: &str,
    tunnel_url: &str,
) -> Result<Child, SupervisorError> {
    let log = open_log(cfg, fleet::worker_log_path(&cfg.work_dir, slot), "worker", slot)?;
    let err_log = log.try_clone().map_err(|source| SupervisorError::Spawn {
        stage: "worker",
        slot,
        source,
    })?;

    let idle_signal = fleet::idle_signal_path(&cfg.work_dir, unit_id);

    let mut command = Command::new("python3");
    command
        .args(["worker/main.py", "--api-url", &cfg.api_url])
        .args(["--worker_id", unit_id])
        .args(["--comfyui_server", &format!("http://127.0.0.1:{port}")])
        .args(["--tunnel-url", tunnel_url])
        .args(["--idle-timeout", &cfg.idle_timeout_secs.to_string()])
        .args(["--shutdown-file", &idle_signal.to_string_lossy()])
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(err_log));
    if cfg.keep_alive {
        command.arg("--keep-alive");
    }

    command.spawn().map_err(|source| SupervisorError::Spawn {
        stage: "worker",
        slot,
        source,
    })
}

/// Failed launch: empty the slot, reap whatever stages made it up, and
/// release the restart claim so the next health tick retries.
fn abort_launch(fleet: &SharedFleet, slot: u32) {
    let children = {
        let mut guard = fleet::lock(fleet);
        match guard.unit_mut(slot) {
            Some(unit) => {
                unit.tunnel_url.clear();
                unit.restarting = false;
                unit.take_handles()
            }
            None => Vec::new(),
        }
    };
    process::shut_down(children, process::TERM_GRACE);
}

fn open_log(
    cfg: &Config,
    path: std::path::PathBuf,
    stage: &'static str,
    slot: u32,
) -> Result<File, SupervisorError> {
    let _ = std::fs::create_dir_all(cfg.work_dir.join("logs"));
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| SupervisorError::Spawn { stage, slot, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOUDFLARED_LOG: &str = "\
2025-08-20T10:11:12Z INF Requesting new quick Tunnel on trycloudflare.com...\n\
2025-08-20T10:11:13Z INF +--------------------------------------------------------+\n\
2025-08-20T10:11:13Z INF |  Your quick Tunnel has been created! Visit it at:      |\n\
2025-08-20T10:11:13Z INF |  https://coral-nervous-plate-spa.trycloudflare.com     |\n\
2025-08-20T10:11:13Z INF +--------------------------------------------------------+\n";

    #[test]
    fn test_extract_tunnel_url_from_cloudflared_banner() {
        assert_eq!(
            extract_tunnel_url(CLOUDFLARED_LOG),
            Some("https://coral-nervous-plate-spa.trycloudflare.com".to_string())
        );
    }

    #[test]
    fn test_extract_tunnel_url_none_before_banner() {
        assert_eq!(
            extract_tunnel_url("2025-08-20T10:11:12Z INF Requesting new quick Tunnel...\n"),
            None
        );
    }

    #[test]
    fn test_extract_tunnel_url_ignores_non_tunnel_urls() {
        assert_eq!(
            extract_tunnel_url("see https://developers.cloudflare.com/argo-tunnel for docs"),
            None
        );
    }

    #[cfg(unix)]
    mod stage_tracking {
        use super::super::*;
        use crate::fleet::Fleet;
        use std::sync::{Arc, Mutex};

        fn fleet_with_slot_zero() -> SharedFleet {
            Arc::new(Mutex::new(Fleet::new("i-0abc", &[0])))
        }

        fn spawn_sleep() -> Child {
            Command::new("sleep").arg("30").spawn().expect("spawn sleep")
        }

        #[test]
        fn test_record_stage_puts_handle_under_fleet_tracking() {
            let fleet = fleet_with_slot_zero();
            record_stage(&fleet, 0, spawn_sleep(), |u| &mut u.backend).unwrap();

            let mut guard = fleet::lock(&fleet);
            let unit = guard.unit_mut(0).unwrap();
            assert!(unit.backend.is_some());
            for mut child in unit.take_handles() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }

        #[test]
        fn test_record_stage_kills_fresh_child_when_fleet_is_draining() {
            let fleet = fleet_with_slot_zero();
            fleet::lock(&fleet).begin_drain();

            let child = spawn_sleep();
            let pid = child.id() as i32;
            let result = record_stage(&fleet, 0, child, |u| &mut u.backend);

            assert!(matches!(result, Err(SupervisorError::Aborted(0))));
            assert_eq!(unsafe { libc::kill(pid, 0) }, -1, "fresh child survived drain");
            assert!(fleet::lock(&fleet).unit_mut(0).unwrap().backend.is_none());
        }

        #[test]
        fn test_wait_for_backend_aborts_when_slot_was_emptied() {
            // A teardown took the backend handle out from under the wait;
            // the launch must bail instead of spinning forever.
            let fleet = fleet_with_slot_zero();
            let err = wait_for_backend(&fleet, 0, 1).unwrap_err();
            assert!(matches!(err, SupervisorError::Aborted(0)));
        }

        #[test]
        fn test_launch_cancelled_once_fleet_drains() {
            let fleet = fleet_with_slot_zero();
            record_stage(&fleet, 0, spawn_sleep(), |u| &mut u.backend).unwrap();
            assert!(!launch_cancelled(&fleet, 0));

            fleet::lock(&fleet).begin_drain();
            assert!(launch_cancelled(&fleet, 0));

            let mut guard = fleet::lock(&fleet);
            for mut child in guard.unit_mut(0).unwrap().take_handles() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}
