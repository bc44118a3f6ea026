//! Remote command execution
//!
//! Directives arrive piggybacked on telemetry replies. Each one runs in
//! its own task so a slow script never stalls reporting, and every
//! outcome is sent back to the server.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::AgentContext;
use crate::power;
use crate::process::{run_checked, run_with_timeout, ProcessOutput};
use crate::reporting;

/// A remote command plus its opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub command: String,
    pub payload: String,
}

/// Commands the server may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Shutdown,
    Restart,
    CleanTemp,
    CancelShutdown,
    SetWallpaper,
    CustomScript,
}

/// Directive outside the closed command set. Ignorable, never fatal.
#[derive(Debug, thiserror::Error)]
#[error("unknown command: {0}")]
pub struct UnknownCommand(String);

impl FromStr for CommandKind {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, UnknownCommand> {
        match s {
            "shutdown" => Ok(Self::Shutdown),
            "restart" => Ok(Self::Restart),
            "clean_temp" => Ok(Self::CleanTemp),
            "cancel_shutdown" => Ok(Self::CancelShutdown),
            "set_wallpaper" => Ok(Self::SetWallpaper),
            "custom_script" => Ok(Self::CustomScript),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

/// Outcome reported to `/machines/{uuid}/command-result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub output: String,
    pub error: String,
}

impl CommandResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: error.into(),
        }
    }

    /// Substitute a placeholder when a command produced nothing at all.
    fn normalized(mut self) -> Self {
        if self.output.trim().is_empty() && self.error.trim().is_empty() {
            self.output = "executed, no output".to_string();
        }
        self
    }
}

/// Run a directive in the background and report its outcome.
///
/// Unknown commands are logged and ignored.
pub fn dispatch(ctx: Arc<AgentContext>, directive: Directive) {
    tokio::spawn(async move {
        let kind = match directive.command.parse::<CommandKind>() {
            Ok(kind) => kind,
            Err(_) => {
                warn!("Ignoring unknown remote command: {:?}", directive.command);
                return;
            }
        };

        info!("Executing remote command: {:?}", kind);
        let result = execute(&ctx, kind, &directive.payload).await.normalized();
        reporting::send_command_result(&ctx, &result).await;
    });
}

/// Execute one command to completion.
pub async fn execute(ctx: &Arc<AgentContext>, kind: CommandKind, payload: &str) -> CommandResult {
    match kind {
        CommandKind::Shutdown => to_result(power::shutdown_now().await),
        CommandKind::Restart => to_result(power::restart_now().await),
        CommandKind::CleanTemp => to_result(clean_temp(ctx.temp_root())),
        CommandKind::CancelShutdown => {
            ctx.request_shutdown_cancel();
            // Abort a grace period already ticking; nothing pending is fine.
            if let Err(e) = power::abort_scheduled_shutdown().await {
                debug!("No scheduled shutdown to abort: {:#}", e);
            }
            CommandResult::success("Automatic shutdown cancelled")
        }
        CommandKind::SetWallpaper => to_result(set_wallpaper(ctx, payload).await),
        CommandKind::CustomScript => run_script(ctx, payload).await,
    }
}

fn to_result(outcome: Result<String>) -> CommandResult {
    match outcome {
        Ok(output) => CommandResult::success(output),
        Err(e) => CommandResult::failure(format!("{:#}", e)),
    }
}

/// Delete everything under the temp root.
///
/// Entries that resist deletion (typically files held open) are skipped,
/// never propagated as a failure.
pub fn clean_temp(root: &Path) -> Result<String> {
    let entries = std::fs::read_dir(root)
        .with_context(|| format!("Cannot read {}", root.display()))?;

    let mut removed = 0usize;
    let mut skipped = 0usize;

    for entry in entries.flatten() {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let gone = if is_dir {
            std::fs::remove_dir_all(&path).is_ok()
        } else {
            std::fs::remove_file(&path).is_ok()
        };

        if gone {
            removed += 1;
        } else {
            skipped += 1;
        }
    }

    if skipped > 0 {
        Ok(format!("Removed {} entries, {} skipped", removed, skipped))
    } else {
        Ok(format!("Removed {} entries", removed))
    }
}

async fn run_script(ctx: &Arc<AgentContext>, script: &str) -> CommandResult {
    match script_output(script, ctx.config.execution.script_timeout()).await {
        Ok(result) => match result.exit_code {
            Some(0) => CommandResult::success(result.output),
            code => CommandResult {
                output: result.output,
                error: format!("exit status {}", code.unwrap_or(-1)),
            },
        },
        Err(e) => CommandResult::failure(format!("{:#}", e)),
    }
}

/// Write the script to a scratch file and run the platform interpreter
/// on it. The file is removed however execution ends.
async fn script_output(script: &str, timeout: Duration) -> Result<ProcessOutput> {
    use std::io::Write as _;

    let suffix = if cfg!(target_os = "windows") { ".ps1" } else { ".sh" };
    let mut file = tempfile::Builder::new()
        .prefix("fleetmon-script-")
        .suffix(suffix)
        .tempfile()
        .context("Failed to create scratch file")?;

    file.write_all(script.trim().as_bytes())
        .context("Failed to write script")?;
    file.flush()?;

    // Close our handle so the interpreter can open the file on Windows.
    let path = file.into_temp_path();
    let path_str = path.to_string_lossy().to_string();

    if cfg!(target_os = "windows") {
        run_with_timeout(
            "powershell",
            &["-ExecutionPolicy", "Bypass", "-File", path_str.as_str()],
            timeout,
        )
        .await
    } else {
        run_with_timeout("sh", &[path_str.as_str()], timeout).await
    }
}

async fn set_wallpaper(ctx: &Arc<AgentContext>, url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(anyhow!("no image URL in payload"));
    }

    let response = ctx
        .http()
        .get(url)
        .send()
        .await
        .context("Image download failed")?
        .error_for_status()
        .context("Image download rejected")?;
    let bytes = response.bytes().await.context("Image download interrupted")?;

    let image_path = ctx.temp_root().join("fleetmon_wallpaper.jpg");
    if image_path.exists() {
        let _ = std::fs::remove_file(&image_path);
    }
    tokio::fs::write(&image_path, &bytes)
        .await
        .with_context(|| format!("Cannot write {}", image_path.display()))?;

    apply_wallpaper(&image_path).await?;
    Ok(format!("Wallpaper applied from {}", url))
}

async fn apply_wallpaper(image: &Path) -> Result<()> {
    if cfg!(target_os = "windows") {
        let script = format!(
            r#"$code = @'
using System;
using System.Runtime.InteropServices;
public class Wallpaper {{
    [DllImport("user32.dll", CharSet = CharSet.Auto)]
    public static extern int SystemParametersInfo(int uAction, int uParam, string lpvParam, int fuWinIni);
}}
'@
Add-Type -TypeDefinition $code
[Wallpaper]::SystemParametersInfo(0x0014, 0, '{}', 0x03)"#,
            image.display()
        );

        run_checked(
            "powershell",
            &["-NoProfile", "-Command", &script],
            Duration::from_secs(30),
        )
        .await?;
        Ok(())
    } else if cfg!(target_os = "linux") {
        let uri = format!("file://{}", image.display());
        run_checked(
            "gsettings",
            &["set", "org.gnome.desktop.background", "picture-uri", &uri],
            Duration::from_secs(10),
        )
        .await?;
        Ok(())
    } else {
        Err(anyhow!("wallpaper control not supported on this platform"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    #[test]
    fn test_command_kind_parsing() {
        assert_eq!("shutdown".parse::<CommandKind>().unwrap(), CommandKind::Shutdown);
        assert_eq!("restart".parse::<CommandKind>().unwrap(), CommandKind::Restart);
        assert_eq!("clean_temp".parse::<CommandKind>().unwrap(), CommandKind::CleanTemp);
        assert_eq!(
            "cancel_shutdown".parse::<CommandKind>().unwrap(),
            CommandKind::CancelShutdown
        );
        assert_eq!(
            "set_wallpaper".parse::<CommandKind>().unwrap(),
            CommandKind::SetWallpaper
        );
        assert_eq!(
            "custom_script".parse::<CommandKind>().unwrap(),
            CommandKind::CustomScript
        );

        assert!("format_disk".parse::<CommandKind>().is_err());
        assert!("SHUTDOWN".parse::<CommandKind>().is_err());
    }

    #[test]
    fn test_empty_outcome_gets_placeholder() {
        let result = CommandResult::success("").normalized();
        assert_eq!(result.output, "executed, no output");
        assert_eq!(result.error, "");

        let result = CommandResult::success("done").normalized();
        assert_eq!(result.output, "done");

        let result = CommandResult::failure("boom").normalized();
        assert_eq!(result.output, "");
        assert_eq!(result.error, "boom");
    }

    #[test]
    fn test_clean_temp_removes_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.tmp"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("b.tmp"), b"y").unwrap();

        let summary = clean_temp(dir.path()).unwrap();
        assert_eq!(summary, "Removed 2 entries");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_clean_temp_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(clean_temp(dir.path()).unwrap(), "Removed 0 entries");
    }

    #[test]
    fn test_clean_temp_on_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        assert!(clean_temp(&gone).is_err());
    }

    #[tokio::test]
    async fn test_cancel_shutdown_sets_flag() {
        let ctx = crate::context::AgentContext::new(AgentConfig::default()).unwrap();
        assert!(!ctx.shutdown_cancelled());

        let result = execute(&ctx, CommandKind::CancelShutdown, "").await;
        assert!(ctx.shutdown_cancelled());
        assert_eq!(result.output, "Automatic shutdown cancelled");
        assert_eq!(result.error, "");

        // Idempotent on repeat.
        let result = execute(&ctx, CommandKind::CancelShutdown, "").await;
        assert!(ctx.shutdown_cancelled());
        assert!(result.error.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_custom_script_captures_output() {
        let ctx = crate::context::AgentContext::new(AgentConfig::default()).unwrap();

        let result = execute(&ctx, CommandKind::CustomScript, "echo scripted").await;
        assert!(result.output.contains("scripted"));
        assert!(result.error.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_custom_script_reports_exit_status() {
        let ctx = crate::context::AgentContext::new(AgentConfig::default()).unwrap();

        let result = execute(&ctx, CommandKind::CustomScript, "echo partial; exit 7").await;
        assert!(result.output.contains("partial"));
        assert_eq!(result.error, "exit status 7");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_custom_script_timeout() {
        let mut config = AgentConfig::default();
        config.execution.script_timeout_secs = 1;
        let ctx = crate::context::AgentContext::new(config).unwrap();

        let result = execute(&ctx, CommandKind::CustomScript, "sleep 30").await;
        assert!(result.output.is_empty());
        assert!(result.error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_wallpaper_rejects_empty_payload() {
        let ctx = crate::context::AgentContext::new(AgentConfig::default()).unwrap();

        let result = execute(&ctx, CommandKind::SetWallpaper, "  ").await;
        assert!(result.error.contains("no image URL"));
    }
}
