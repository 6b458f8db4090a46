//! Supervisor for a fleet of GPU worker units on a single host.
//!
//! Each unit couples three processes bound to one GPU slot:
//! - a ComfyUI backend serving on a local port,
//! - a cloudflared tunnel exposing that backend externally,
//! - a job-polling worker talking to the control plane.
//!
//! The supervisor launches units in order, polls their liveness on a fixed
//! tick, restarts failed units in isolation, and drives a two-tier shutdown
//! (local processes only, or the whole instance) once every active worker
//! has signaled idleness.

pub mod config;
pub mod fleet;
pub mod health;
pub mod idle;
pub mod launcher;
pub mod logging;
pub mod process;
pub mod restart;
pub mod shutdown;
pub mod watchdog;

use thiserror::Error;

/// Errors from supervisor operations. Launch and restart failures are
/// operational: they are logged and retried on the next health tick rather
/// than surfaced to an operator.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {stage} for slot {slot}: {source}")]
    Spawn {
        stage: &'static str,
        slot: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("backend for slot {0} exited before becoming ready")]
    BackendExited(u32),

    #[error("launch of slot {0} aborted by supervisor shutdown")]
    Aborted(u32),

    #[error("instance metadata lookup failed: {0}")]
    Metadata(String),

    #[error("instance termination call failed: {0}")]
    Terminate(String),
}
