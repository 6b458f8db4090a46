//! Supervisor entry point: validates configuration, launches one unit per
//! GPU slot, then runs the monitor loop until a shutdown decision or an
//! interrupt/terminate signal ends the fleet.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use tokio::time::MissedTickBehavior;

use fleet_supervisor::config::{self, CliArgs, Config};
use fleet_supervisor::fleet::{self, Fleet, SharedFleet};
use fleet_supervisor::shutdown::{self, ShutdownDecision};
use fleet_supervisor::{health, idle, launcher, logging, restart, watchdog};

/// Shared tick for the health monitor and the idle coordinator.
const MONITOR_TICK: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    logging::init(&args.work_dir.join("logs"))?;

    let available = config::detect_gpus()?;
    let cfg = Config::resolve(args, &available)?;

    info!(
        "fleet supervisor starting: instance={} slots={:?} instance_shutdown={} idle_timeout={}s keep_alive={} api={}",
        cfg.instance_id,
        cfg.slots,
        cfg.instance_shutdown,
        cfg.idle_timeout_secs,
        cfg.keep_alive,
        cfg.api_url,
    );

    let fleet: SharedFleet = Arc::new(Mutex::new(Fleet::new(&cfg.instance_id, &cfg.slots)));

    // The watchdog starts before the launches and races them: a backend
    // that never answers its readiness probe blocks that slot's launch
    // indefinitely, and the grace window is the only way off the machine.
    if cfg.instance_shutdown && !cfg.keep_alive {
        let _watchdog = watchdog::spawn(cfg.clone(), fleet.clone());
    }

    // Claim every slot before the launch task runs so early monitor ticks
    // do not schedule restarts for units that are still coming up.
    {
        let mut guard = fleet::lock(&fleet);
        for &slot in &cfg.slots {
            if let Some(unit) = guard.unit_mut(slot) {
                unit.restarting = true;
            }
        }
    }

    // Initial launches run detached; each slot blocks on its own backend,
    // and a failed launch leaves the slot empty for the health loop to
    // retry.
    {
        let cfg = cfg.clone();
        let fleet = fleet.clone();
        tokio::task::spawn_blocking(move || {
            for &slot in &cfg.slots {
                if let Err(e) = launcher::start_unit(&fleet, &cfg, slot) {
                    error!("[slot {slot}] initial launch failed: {e}");
                }
            }
        });
    }

    let mut tick = tokio::time::interval(MONITOR_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = tick.tick() => run_tick(&fleet, &cfg),
            () = shutdown_signal() => {
                info!("received shutdown signal");
                shutdown::execute(ShutdownDecision::TerminateLocal, &fleet, &cfg);
            }
        }
    }
}

/// One monitor tick: health poll and idle check against a single
/// consistent fleet snapshot, then per-unit restarts off the loop.
fn run_tick(fleet: &SharedFleet, cfg: &Config) {
    let (dead, idle_snap, restart_pending) = {
        let mut guard = fleet::lock(fleet);
        let dead = health::poll(&mut guard);
        // Claim the dead slots under the same lock so the next tick does
        // not schedule a second restart while this one is still launching.
        for &slot in &dead {
            if let Some(unit) = guard.unit_mut(slot) {
                unit.restarting = true;
            }
        }
        let restart_pending =
            !dead.is_empty() || guard.units_mut().any(|u| u.restarting);
        let idle_snap = idle::snapshot(&mut guard, &cfg.work_dir);
        (dead, idle_snap, restart_pending)
    };

    for slot in dead {
        let fleet = fleet.clone();
        let cfg = cfg.clone();
        tokio::task::spawn_blocking(move || restart::restart(&fleet, &cfg, slot));
    }

    // Restart wins over idleness: a unit being relaunched is not "done".
    if cfg.keep_alive || restart_pending {
        return;
    }
    if let Some(decision) = idle::decide(&idle_snap, cfg.instance_shutdown) {
        info!(
            "fleet idle ({}/{} units flagged), acting on {decision:?}",
            idle_snap.idle_flagged, idle_snap.active_units
        );
        shutdown::execute(decision, fleet, cfg);
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use log::warn;
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
