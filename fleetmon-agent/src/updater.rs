//! Self-update cycle
//!
//! Polls the update endpoint for a published version string and, when it
//! differs from the running build, downloads the new binary, swaps it in
//! place and relaunches the agent.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::AgentContext;

const VERSION_FILE: &str = "version.txt";

/// A server that accepts the connection but never answers must not
/// park the update duty.
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Anything smaller than this is a truncated download or an error page,
/// not an agent binary.
const MIN_BINARY_BYTES: usize = 1024 * 1024;

/// Update duty: poll for a published version on a fixed cadence.
///
/// Sleeps before the first check so a bad published binary cannot wedge
/// the fleet in an update loop at boot.
pub async fn update_loop(ctx: Arc<AgentContext>) {
    if !ctx.config.update.enabled {
        info!("Self-update disabled by configuration");
        return;
    }

    loop {
        tokio::time::sleep(ctx.config.update.check_interval()).await;

        if let Err(e) = check_for_update(&ctx).await {
            warn!("Update check failed: {:#}", e);
        }
    }
}

async fn check_for_update(ctx: &AgentContext) -> Result<()> {
    let client = update_client(ctx)?;

    let remote = client
        .get(ctx.update_endpoint(VERSION_FILE))
        .timeout(VERSION_TIMEOUT)
        .send()
        .await
        .context("Failed to fetch version file")?
        .error_for_status()
        .context("Version file request rejected")?
        .text()
        .await
        .context("Failed to read version file")?;

    let local = env!("CARGO_PKG_VERSION");
    if !versions_differ(local, &remote) {
        debug!("Already on version {}", local);
        return Ok(());
    }

    info!(
        "Version {} published, running {}; updating",
        remote.trim(),
        local
    );
    perform_update(ctx, &client).await
}

/// Dedicated client for update traffic. No client-wide timeout; the
/// binary download may outlive the reporting client's budget, and the
/// version request sets its own per-request bound.
fn update_client(ctx: &AgentContext) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(ctx.config.server.accept_invalid_certs)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build update HTTP client")
}

/// A published version triggers an update only when it is non-empty and
/// differs from the running build.
pub fn versions_differ(local: &str, remote: &str) -> bool {
    let remote = remote.trim();
    !remote.is_empty() && remote != local.trim()
}

async fn perform_update(ctx: &AgentContext, client: &reqwest::Client) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate running executable")?;
    let file_name = exe
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("fleetmon-agent");

    let bytes = client
        .get(ctx.update_endpoint(file_name))
        .send()
        .await
        .context("Failed to download new binary")?
        .error_for_status()
        .context("Binary download rejected")?
        .bytes()
        .await
        .context("Failed to read new binary")?;

    install_bytes(&exe, &bytes)?;

    info!("Update installed, relaunching");
    relaunch(&exe)?;
    std::process::exit(0);
}

/// Validate a downloaded build and install it over `exe`.
fn install_bytes(exe: &Path, bytes: &[u8]) -> Result<()> {
    if bytes.len() < MIN_BINARY_BYTES {
        bail!(
            "Downloaded binary is {} bytes, refusing to install",
            bytes.len()
        );
    }

    swap_with_rollback(exe, |target| write_binary(target, bytes))
}

/// Replace `exe` via `install`, restoring the previous binary when the
/// install step fails.
///
/// Windows will not let a running executable be overwritten, but it can
/// be renamed, so the running binary is set aside first and survives as
/// a `.old` sidecar until the next update.
fn swap_with_rollback(exe: &Path, install: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    let old = sidecar_path(exe);

    // Sidecar from the previous update may still be around.
    let _ = std::fs::remove_file(&old);

    std::fs::rename(exe, &old).context("Failed to set aside running executable")?;

    if let Err(e) = install(exe) {
        let _ = std::fs::remove_file(exe);
        if let Err(undo) = std::fs::rename(&old, exe) {
            warn!("Rollback failed, agent binary is missing: {:#}", undo);
        }
        return Err(e);
    }

    Ok(())
}

/// `agent.exe` becomes `agent.exe.old`, keeping the real extension intact.
fn sidecar_path(exe: &Path) -> PathBuf {
    let mut name = OsString::from(exe.as_os_str());
    name.push(".old");
    PathBuf::from(name)
}

fn write_binary(target: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(target, bytes).context("Failed to write new binary")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))
            .context("Failed to mark new binary executable")?;
    }

    Ok(())
}

fn relaunch(exe: &Path) -> Result<()> {
    if cfg!(target_os = "windows") {
        // `start` detaches the child from the exiting parent.
        std::process::Command::new("cmd")
            .args(["/C", "start", ""])
            .arg(exe)
            .spawn()
            .context("Failed to relaunch agent")?;
    } else {
        std::process::Command::new(exe)
            .spawn()
            .context("Failed to relaunch agent")?;
    }
    Ok(())
}
