//! Command-line surface and startup validation.
//!
//! Configuration errors are the only fatal errors in the supervisor: an
//! invalid slot list, an idle timeout below the floor, or GPUs that are not
//! actually present abort startup before any unit is launched.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context};
use clap::Parser;

/// Lower bound for `--idle-timeout`; a worker that flags idleness faster
/// than this would flap the whole fleet.
pub const MIN_IDLE_TIMEOUT_SECS: u64 = 60;

#[derive(Parser, Debug)]
#[command(name = "fleet-supervisor", about = "Supervises GPU worker units: backend + tunnel + job worker per GPU slot")]
pub struct CliArgs {
    /// Stable identity of this instance; unit ids are derived from it.
    pub instance_id: String,

    /// Comma-separated GPU slot indices to supervise (default: all detected).
    #[arg(long, value_delimiter = ',')]
    pub gpus: Option<Vec<u32>>,

    /// Terminate the cloud instance itself once the fleet is idle.
    #[arg(long)]
    pub instance_shutdown: bool,

    /// Seconds of inactivity after which a worker flags itself idle.
    #[arg(long, default_value_t = 600)]
    pub idle_timeout: u64,

    /// Never shut down: disables idle teardown and the registration watchdog.
    #[arg(long)]
    pub keep_alive: bool,

    /// Control-plane API base URL.
    #[arg(long, default_value = "https://inference.obobo.net")]
    pub api_url: String,

    /// ComfyUI checkout the backend processes run from.
    #[arg(long, default_value = "ComfyUI")]
    pub comfyui_path: PathBuf,

    /// Directory for idle-signal files and process log artifacts.
    #[arg(long, default_value = "worker")]
    pub work_dir: PathBuf,
}

/// Validated supervisor configuration. The slot set is fixed here and never
/// grows for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub instance_id: String,
    pub slots: Vec<u32>,
    pub instance_shutdown: bool,
    pub idle_timeout_secs: u64,
    pub keep_alive: bool,
    pub api_url: String,
    pub comfyui_path: PathBuf,
    pub work_dir: PathBuf,
}

impl Config {
    /// Validate CLI arguments against the GPUs actually present on the host.
    pub fn resolve(args: CliArgs, available_gpus: &[u32]) -> anyhow::Result<Self> {
        if available_gpus.is_empty() {
            bail!("no GPUs detected on this host");
        }

        let mut slots = match args.gpus {
            Some(requested) => {
                if requested.is_empty() {
                    bail!("--gpus was given but the slot list is empty");
                }
                for slot in &requested {
                    if !available_gpus.contains(slot) {
                        bail!(
                            "GPU slot {slot} is not available (detected: {available_gpus:?})"
                        );
                    }
                }
                requested
            }
            None => available_gpus.to_vec(),
        };
        slots.sort_unstable();
        slots.dedup();

        if args.idle_timeout < MIN_IDLE_TIMEOUT_SECS {
            bail!(
                "--idle-timeout {} is below the minimum of {MIN_IDLE_TIMEOUT_SECS} seconds",
                args.idle_timeout
            );
        }

        Ok(Self {
            instance_id: args.instance_id,
            slots,
            instance_shutdown: args.instance_shutdown,
            idle_timeout_secs: args.idle_timeout,
            keep_alive: args.keep_alive,
            api_url: args.api_url.trim_end_matches('/').to_string(),
            comfyui_path: args.comfyui_path,
            work_dir: args.work_dir,
        })
    }
}

/// Query `nvidia-smi` for the GPU indices present on this host.
pub fn detect_gpus() -> anyhow::Result<Vec<u32>> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=index", "--format=csv,noheader"])
        .output()
        .context("failed to run nvidia-smi")?;

    if !output.status.success() {
        bail!(
            "nvidia-smi exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_gpu_indices(&String::from_utf8_lossy(&output.stdout))
}

fn parse_gpu_indices(stdout: &str) -> anyhow::Result<Vec<u32>> {
    let mut indices = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let index: u32 = line
            .parse()
            .with_context(|| format!("unexpected nvidia-smi index line: {line:?}"))?;
        indices.push(index);
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(gpus: Option<Vec<u32>>, idle_timeout: u64) -> CliArgs {
        CliArgs {
            instance_id: "i-0abc".to_string(),
            gpus,
            instance_shutdown: false,
            idle_timeout,
            keep_alive: false,
            api_url: "https://api.example.com/".to_string(),
            comfyui_path: PathBuf::from("ComfyUI"),
            work_dir: PathBuf::from("worker"),
        }
    }

    #[test]
    fn test_resolve_defaults_to_all_detected_gpus() {
        let cfg = Config::resolve(args(None, 600), &[0, 1, 2]).unwrap();
        assert_eq!(cfg.slots, vec![0, 1, 2]);
    }

    #[test]
    fn test_resolve_accepts_subset_and_normalizes_order() {
        let cfg = Config::resolve(args(Some(vec![2, 0, 2]), 600), &[0, 1, 2]).unwrap();
        assert_eq!(cfg.slots, vec![0, 2]);
    }

    #[test]
    fn test_resolve_rejects_unavailable_slot() {
        let err = Config::resolve(args(Some(vec![0, 5]), 600), &[0, 1]).unwrap_err();
        assert!(err.to_string().contains("slot 5"));
    }

    #[test]
    fn test_resolve_rejects_empty_slot_list() {
        assert!(Config::resolve(args(Some(vec![]), 600), &[0]).is_err());
    }

    #[test]
    fn test_resolve_rejects_no_gpus_on_host() {
        assert!(Config::resolve(args(None, 600), &[]).is_err());
    }

    #[test]
    fn test_resolve_enforces_idle_timeout_minimum() {
        assert!(Config::resolve(args(None, 30), &[0]).is_err());
        assert!(Config::resolve(args(None, MIN_IDLE_TIMEOUT_SECS), &[0]).is_ok());
    }

    #[test]
    fn test_resolve_strips_trailing_slash_from_api_url() {
        let cfg = Config::resolve(args(None, 600), &[0]).unwrap();
        assert_eq!(cfg.api_url, "https://api.example.com");
    }

    #[test]
    fn test_parse_gpu_indices() {
        assert_eq!(parse_gpu_indices("0\n1\n2\n").unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_gpu_indices("").unwrap(), Vec::<u32>::new());
        assert!(parse_gpu_indices("garbage\n").is_err());
    }
}
