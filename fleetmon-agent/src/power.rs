//! Power policy and shutdown primitives
//!
//! After the configured curfew an idle machine is shut down with a
//! grace period. A remote cancel directive suppresses the automatic
//! shutdown until the agent restarts.

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveTime};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::PowerConfig;
use crate::context::AgentContext;
use crate::metrics;
use crate::process::{run_checked, PROBE_TIMEOUT};

const SHUTDOWN_REASON: &str = "Automatic shutdown: idle past curfew.";

/// Immediate forced shutdown, for the remote command.
pub async fn shutdown_now() -> Result<String> {
    shutdown_with_grace(0, None).await
}

/// Immediate forced restart.
pub async fn restart_now() -> Result<String> {
    if cfg!(target_os = "windows") {
        run_checked("shutdown", &["/r", "/t", "0", "/f"], PROBE_TIMEOUT).await?;
        Ok("Restart initiated".to_string())
    } else if cfg!(target_os = "linux") {
        run_checked("sudo", &["reboot"], PROBE_TIMEOUT).await?;
        Ok("Restart initiated".to_string())
    } else {
        Err(anyhow!("restart not supported on this platform"))
    }
}

/// Schedule a forced shutdown `grace_secs` from now.
pub async fn shutdown_with_grace(grace_secs: u32, reason: Option<&str>) -> Result<String> {
    if cfg!(target_os = "windows") {
        let grace = grace_secs.to_string();
        let mut args = vec!["/s", "/t", grace.as_str(), "/f"];
        if let Some(reason) = reason {
            args.push("/c");
            args.push(reason);
        }

        run_checked("shutdown", &args, PROBE_TIMEOUT).await?;
        Ok(format!("Shutdown scheduled in {} seconds", grace_secs))
    } else if cfg!(target_os = "linux") {
        // systemd shutdown schedules in minutes.
        let when = if grace_secs == 0 {
            "now".to_string()
        } else {
            format!("+{}", grace_secs.div_ceil(60))
        };

        run_checked("sudo", &["shutdown", "-h", &when], PROBE_TIMEOUT).await?;
        Ok(format!("Shutdown scheduled in {} seconds", grace_secs))
    } else {
        Err(anyhow!("shutdown not supported on this platform"))
    }
}

/// Abort a shutdown already counting down its grace period.
///
/// Errors mean nothing was pending, which callers treat as success.
pub async fn abort_scheduled_shutdown() -> Result<()> {
    if cfg!(target_os = "windows") {
        run_checked("shutdown", &["/a"], PROBE_TIMEOUT).await?;
    } else if cfg!(target_os = "linux") {
        run_checked("sudo", &["shutdown", "-c"], PROBE_TIMEOUT).await?;
    }
    Ok(())
}

/// Decide whether the automatic shutdown should fire.
pub fn should_shutdown(
    now: NaiveTime,
    idle_seconds: u32,
    cancelled: bool,
    config: &PowerConfig,
) -> bool {
    if !config.auto_shutdown || cancelled {
        return false;
    }

    let curfew = match config.curfew_time() {
        Some(time) => time,
        None => return false,
    };

    now >= curfew && u64::from(idle_seconds) >= config.idle_tolerance_secs
}

/// Curfew duty: check periodically, shut down when the policy fires.
pub async fn curfew_loop(ctx: Arc<AgentContext>) {
    let interval = ctx.config.power.check_interval();

    loop {
        tokio::time::sleep(interval).await;

        let now = Local::now().time();
        let idle = metrics::idle_seconds();

        if should_shutdown(now, idle, ctx.shutdown_cancelled(), &ctx.config.power) {
            info!("Curfew passed with machine idle for {}s, shutting down", idle);

            let grace = ctx.config.power.shutdown_grace_secs;
            match shutdown_with_grace(grace, Some(SHUTDOWN_REASON)).await {
                Ok(message) => info!("{}", message),
                Err(e) => warn!("Automatic shutdown failed: {:#}", e),
            }
        }
    }
}

/// Keep the machine from sleeping while the agent runs.
#[cfg(windows)]
pub fn keep_awake() {
    use winapi::um::winbase::SetThreadExecutionState;
    use winapi::um::winnt::{ES_CONTINUOUS, ES_SYSTEM_REQUIRED};

    unsafe {
        SetThreadExecutionState(ES_CONTINUOUS | ES_SYSTEM_REQUIRED);
    }
}

#[cfg(not(windows))]
pub fn keep_awake() {}
