//! Registration Watchdog: a safety net against a fleet that never comes up.
//!
//! The health monitor only sees local process liveness; a fleet whose
//! workers are alive but permanently failing to register with the control
//! plane (network partition, bad credentials) would otherwise burn GPU
//! hours forever. When instance shutdown is configured, this watchdog
//! races normal operation: full registration within the grace window ends
//! it cleanly, otherwise it terminates the instance.

use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::Config;
use crate::fleet::{self, SharedFleet};
use crate::shutdown::{self, ShutdownDecision};

/// How long the fleet gets to fully register before the instance is cut.
pub const GRACE_WINDOW: Duration = Duration::from_secs(16 * 60);

/// Interval between registration sweeps.
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Every configured unit registered within the grace window.
    AllRegistered,
    /// The window elapsed with at least one unit never registering.
    GraceExpired,
}

/// Run the watchdog on its own thread. Exits quietly once the fleet is
/// fully registered; on expiry it performs the instance-termination
/// sequence itself.
pub fn spawn(cfg: Config, fleet: SharedFleet) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let unit_ids: Vec<String> =
            cfg.slots.iter().map(|&s| fleet::unit_id(&cfg.instance_id, s)).collect();
        let agent = ureq::AgentBuilder::new().timeout(PROBE_TIMEOUT).build();

        let verdict = watch(&unit_ids, GRACE_WINDOW, POLL_INTERVAL, |unit_id| {
            is_registered(&agent, &cfg.api_url, unit_id)
        });

        match verdict {
            WatchdogVerdict::AllRegistered => {
                info!("watchdog: all {} units registered", unit_ids.len());
            }
            WatchdogVerdict::GraceExpired => {
                warn!(
                    "watchdog: fleet not fully registered after {}s, terminating instance",
                    GRACE_WINDOW.as_secs()
                );
                shutdown::execute(ShutdownDecision::TerminateInstance, &fleet, &cfg);
            }
        }
    })
}

/// Poll until every unit registers or the grace window elapses. The check
/// is re-run against the external source on every sweep; nothing is cached
/// across sweeps.
pub fn watch<F>(
    unit_ids: &[String],
    grace: Duration,
    interval: Duration,
    mut check: F,
) -> WatchdogVerdict
where
    F: FnMut(&str) -> bool,
{
    let deadline = Instant::now() + grace;
    loop {
        let registered = unit_ids.iter().filter(|u| check(u.as_str())).count();
        if registered == unit_ids.len() {
            return WatchdogVerdict::AllRegistered;
        }
        info!("watchdog: {registered}/{} units registered", unit_ids.len());

        let now = Instant::now();
        if now >= deadline {
            return WatchdogVerdict::GraceExpired;
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}

/// HTTP 200 from the per-unit status resource means the control plane
/// knows this worker; any other status does not count.
pub fn is_registered(agent: &ureq::Agent, api_url: &str, unit_id: &str) -> bool {
    match agent.get(&format!("{api_url}/v1/worker/{unit_id}")).call() {
        Ok(resp) => resp.status() == 200,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ids(n: u32) -> Vec<String> {
        (0..n).map(|s| fleet::unit_id("i-0abc", s)).collect()
    }

    #[test]
    fn test_watch_exits_once_all_units_register() {
        let verdict = watch(
            &ids(3),
            Duration::from_secs(60),
            Duration::from_millis(1),
            |_| true,
        );
        assert_eq!(verdict, WatchdogVerdict::AllRegistered);
    }

    #[test]
    fn test_watch_expires_when_one_unit_never_registers() {
        let registered: HashSet<String> = ids(2).into_iter().collect();
        let verdict = watch(
            &ids(3),
            Duration::from_millis(50),
            Duration::from_millis(10),
            |unit_id| registered.contains(unit_id),
        );
        assert_eq!(verdict, WatchdogVerdict::GraceExpired);
    }

    #[test]
    fn test_watch_rechecks_every_unit_each_sweep() {
        // Units come up one sweep at a time; the watchdog must re-derive
        // the full picture each sweep rather than latch early failures.
        let mut sweep = 0;
        let verdict = watch(
            &ids(3),
            Duration::from_secs(60),
            Duration::from_millis(1),
            |unit_id| {
                if unit_id.ends_with("gpu0") {
                    sweep += 1;
                }
                sweep > 2
            },
        );
        assert_eq!(verdict, WatchdogVerdict::AllRegistered);
    }

    /// One-shot HTTP responder returning a fixed status line; gives back
    /// the base URL to probe.
    fn serve_once(response: &'static str) -> String {
        use std::io::{Read, Write};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_is_registered_accepts_only_status_200() {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(2))
            .build();

        let api = serve_once("HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n");
        assert!(!is_registered(&agent, &api, "i-0abc-gpu0"));

        let api = serve_once("HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
        assert!(is_registered(&agent, &api, "i-0abc-gpu0"));
    }

    #[test]
    fn test_is_registered_false_when_endpoint_unreachable() {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(1))
            .build();
        assert!(!is_registered(&agent, "http://127.0.0.1:1", "i-0abc-gpu0"));
    }

    #[test]
    fn test_watch_with_zero_grace_expires_immediately() {
        let verdict = watch(
            &ids(1),
            Duration::from_millis(0),
            Duration::from_millis(1),
            |_| false,
        );
        assert_eq!(verdict, WatchdogVerdict::GraceExpired);
    }
}
