//! The two shutdown tiers.
//!
//! `TerminateLocal` stops every tracked process and exits the supervisor.
//! `TerminateInstance` does the same, then asks the cloud API to terminate
//! the instance we are running on; if that call fails the machine is
//! powered off locally as a last resort. Interrupt/terminate signals to
//! the supervisor itself take the `TerminateLocal` path.

use std::process::Command;
use std::time::Duration;

use log::{error, info, warn};

use crate::config::Config;
use crate::fleet::{self, SharedFleet};
use crate::idle;
use crate::process;
use crate::SupervisorError;

const METADATA_BASE: &str = "http://169.254.169.254/latest/meta-data";

/// Outcome of an idle or watchdog check that ends the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDecision {
    /// Stop all local processes and exit the supervisor.
    TerminateLocal,
    /// Stop all local processes, then terminate the instance itself.
    TerminateInstance,
}

/// Carry out a shutdown decision. Never returns.
pub fn execute(decision: ShutdownDecision, fleet: &SharedFleet, cfg: &Config) -> ! {
    info!("shutting down fleet: {decision:?}");

    tear_down_fleet(fleet, cfg);

    if decision == ShutdownDecision::TerminateInstance {
        match terminate_instance() {
            Ok(()) => info!("instance termination requested"),
            Err(e) => {
                // The one external failure with an explicit recovery path.
                error!("instance termination failed ({e}), powering off locally");
                power_off();
            }
        }
    }

    info!("supervisor exiting");
    std::process::exit(0);
}

/// Graceful-then-forceful termination of every tracked process across all
/// units, then removal of each unit's idle-signal and tunnel artifacts.
pub fn tear_down_fleet(fleet: &SharedFleet, cfg: &Config) {
    let (children, unit_ids, slots) = {
        let mut guard = fleet::lock(fleet);
        // In-flight launches check this flag before spawning or recording
        // another process; anything they spawned earlier is already on its
        // unit and gets taken here.
        guard.begin_drain();
        let slots = guard.slots();
        let unit_ids: Vec<String> = slots.iter().map(|&s| guard.unit_id(s)).collect();
        let mut children = Vec::new();
        for unit in guard.units_mut() {
            children.append(&mut unit.take_handles());
        }
        (children, unit_ids, slots)
    };

    info!("terminating {} tracked processes", children.len());
    process::shut_down(children, process::TERM_GRACE);

    for unit_id in &unit_ids {
        idle::clear_idle_signal(&cfg.work_dir, unit_id);
    }
    for slot in slots {
        let tunnel_log = fleet::tunnel_log_path(&cfg.work_dir, slot);
        if tunnel_log.exists() {
            let _ = std::fs::remove_file(tunnel_log);
        }
    }
}

/// Terminate the instance we are running on, identified via the local
/// metadata service.
fn terminate_instance() -> Result<(), SupervisorError> {
    let (instance_id, region) = instance_metadata()?;
    info!("terminating instance {instance_id} in {region}");

    let output = Command::new("aws")
        .args(["ec2", "terminate-instances", "--instance-ids", &instance_id])
        .args(["--region", &region])
        .output()
        .map_err(|e| SupervisorError::Terminate(e.to_string()))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(SupervisorError::Terminate(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

/// Instance id and region from the local instance metadata service.
fn instance_metadata() -> Result<(String, String), SupervisorError> {
    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(2))
        .build();

    let instance_id = metadata_value(&agent, "instance-id")?;
    let region = metadata_value(&agent, "placement/region")?;
    Ok((instance_id, region))
}

fn metadata_value(agent: &ureq::Agent, key: &str) -> Result<String, SupervisorError> {
    agent
        .get(&format!("{METADATA_BASE}/{key}"))
        .call()
        .map_err(|e| SupervisorError::Metadata(format!("{key}: {e}")))?
        .into_string()
        .map_err(|e| SupervisorError::Metadata(format!("{key}: {e}")))
}

/// Unconditional local power-off, used only when the termination API call
/// failed.
fn power_off() {
    warn!("falling back to local power-off");
    let result = Command::new("sudo").args(["shutdown", "-h", "now"]).status();
    if let Err(e) = result {
        error!("local power-off failed: {e}");
    }
}
