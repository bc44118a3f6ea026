//! Host maintenance duties
//!
//! - Weekly system restore points, throttled through a marker file
//! - Autostart registration (scheduled task, registry fallback)

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDateTime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::AgentContext;
use crate::process::{run_checked, PROBE_TIMEOUT};
use crate::reporting;

pub const MARKER_FILE: &str = "restore_point_last_run.txt";
const MARKER_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Checkpoint-Computer can take minutes on spinning disks.
const RESTORE_POINT_TIMEOUT: Duration = Duration::from_secs(300);

/// Directory for agent state files.
pub fn state_dir() -> Result<PathBuf> {
    let mut path = dirs::data_local_dir()
        .ok_or_else(|| anyhow!("Could not find local data directory"))?;

    path.push("fleetmon-agent");
    Ok(path)
}

fn marker_path() -> Result<PathBuf> {
    Ok(state_dir()?.join(MARKER_FILE))
}

/// Timestamp of the last restore point as shown in the inventory,
/// `"never"` when no marker exists.
pub fn last_restore_point_label() -> String {
    marker_path()
        .ok()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .unwrap_or_else(|| "never".to_string())
}

pub fn read_marker(path: &Path) -> Option<NaiveDateTime> {
    let content = std::fs::read_to_string(path).ok()?;
    NaiveDateTime::parse_from_str(content.trim(), MARKER_FORMAT).ok()
}

pub fn write_marker(path: &Path, when: NaiveDateTime) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, when.format(MARKER_FORMAT).to_string())
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Whether enough time has passed since the last restore point.
///
/// A missing or unreadable marker counts as elapsed.
pub fn cooldown_elapsed(
    marker: Option<NaiveDateTime>,
    now: NaiveDateTime,
    cooldown: Duration,
) -> bool {
    match marker {
        Some(last) => now.signed_duration_since(last).num_seconds() >= cooldown.as_secs() as i64,
        None => true,
    }
}

/// Periodically create a restore point once the cooldown has elapsed.
pub async fn restore_point_loop(ctx: Arc<AgentContext>) {
    let interval = ctx.config.maintenance.check_interval();
    let cooldown = ctx.config.maintenance.cooldown();

    loop {
        if let Err(e) = run_due_restore_point(&ctx, cooldown).await {
            warn!("Restore point attempt failed: {:#}", e);
        }
        tokio::time::sleep(interval).await;
    }
}

async fn run_due_restore_point(ctx: &Arc<AgentContext>, cooldown: Duration) -> Result<()> {
    if !cfg!(target_os = "windows") {
        debug!("Restore points are not supported on this platform");
        return Ok(());
    }

    let path = marker_path()?;
    if !cooldown_elapsed(read_marker(&path), Local::now().naive_local(), cooldown) {
        debug!("Restore point cooldown still active");
        return Ok(());
    }

    info!("Creating system restore point...");
    create_restore_point().await?;
    write_marker(&path, Local::now().naive_local())?;

    // Re-register so the server picks up the new restore point date.
    info!("Restore point created, refreshing registration");
    reporting::register(ctx).await;

    Ok(())
}

async fn create_restore_point() -> Result<()> {
    let script = "Checkpoint-Computer -Description 'Fleetmon weekly checkpoint' -RestorePointType 'MODIFY_SETTINGS'";

    run_checked(
        "powershell",
        &["-NoProfile", "-Command", script],
        RESTORE_POINT_TIMEOUT,
    )
    .await?;

    Ok(())
}

/// Register the agent to start at logon, idempotently.
///
/// A scheduled task is preferred since it can run elevated; when task
/// creation is denied the per-user Run key is used instead.
pub async fn ensure_autostart() {
    if !cfg!(target_os = "windows") {
        return;
    }

    let exe = match std::env::current_exe() {
        Ok(path) => path.to_string_lossy().to_string(),
        Err(e) => {
            warn!("Cannot resolve own executable path: {}", e);
            return;
        }
    };

    let task_args = [
        "/create",
        "/tn",
        "FleetmonAgent",
        "/tr",
        exe.as_str(),
        "/sc",
        "onlogon",
        "/rl",
        "highest",
        "/f",
    ];

    match run_checked("schtasks", &task_args, PROBE_TIMEOUT).await {
        Ok(_) => {
            info!("Autostart registered as scheduled task");
            return;
        }
        Err(e) => debug!("schtasks unavailable, using Run key: {:#}", e),
    }

    let script = format!(
        r"$key = 'HKCU:\Software\Microsoft\Windows\CurrentVersion\Run'
$name = 'FleetmonAgent'
$path = '{exe}'
$current = (Get-ItemProperty -Path $key -Name $name -ErrorAction SilentlyContinue).$name
if ($current -ne $path) {{ Set-ItemProperty -Path $key -Name $name -Value $path }}"
    );

    if let Err(e) = run_checked("powershell", &["-NoProfile", "-Command", &script], PROBE_TIMEOUT).await
    {
        warn!("Could not register autostart: {:#}", e);
    }
}
