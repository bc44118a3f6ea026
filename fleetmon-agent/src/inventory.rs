//! Static machine inventory sent on registration
//!
//! Collects hardware identity, firmware details and the installed
//! software list. Every probe degrades to a sentinel value ("N/A",
//! 0, empty list) so a broken tool never blocks registration.

use chrono::TimeZone;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::debug;

use crate::context::AgentContext;
use crate::discovery::{self, NetworkInterface};
use crate::maintenance;
use crate::metrics;
use crate::process::run_probe;

/// Sentinel for string fields no probe could fill.
pub const UNKNOWN: &str = "N/A";

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Software {
    pub name: String,
    pub version: String,
}

/// Full hardware and software identity of this host, as the server
/// expects it on `/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    pub uuid: String,
    pub hostname: String,
    pub ip_address: String,
    pub default_gateway: String,
    pub subnet_mask: String,
    pub os_name: String,
    pub cpu_model: String,
    pub cpu_speed_mhz: f64,
    pub cpu_cores_physical: i64,
    pub cpu_cores_logical: i64,
    pub ram_total_gb: f64,
    pub disk_total_gb: f64,
    pub mac_address: String,
    pub machine_model: String,
    pub serial_number: String,
    pub machine_type: String,
    pub mb_manufacturer: String,
    pub mb_model: String,
    pub mb_version: String,
    pub gpu_model: String,
    pub gpu_vram_mb: i64,
    pub last_boot_time: String,
    pub last_restore_point: String,
    pub mem_slots_total: i64,
    pub mem_slots_used: i64,
    pub network_interfaces: Vec<NetworkInterface>,
    pub installed_software: Vec<Software>,
}

impl MachineInfo {
    /// Collect a fresh inventory snapshot. Never fails.
    pub async fn collect(ctx: &AgentContext) -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let (cpu_model, cpu_speed_mhz) = match sys.cpus().first() {
            Some(cpu) => (cpu.brand().trim().to_string(), cpu.frequency() as f64),
            None => (UNKNOWN.to_string(), 0.0),
        };

        let (gpu_model, gpu_vram_mb) = gpu_info().await;
        let (mem_slots_total, mem_slots_used) = memory_slots().await;
        let (default_gateway, subnet_mask) = network_details().await;

        MachineInfo {
            uuid: ctx.machine_id.clone(),
            hostname: host_label(&ctx.config.agent.hostname),
            ip_address: discovery::local_ip(),
            default_gateway,
            subnet_mask,
            os_name: os_name(),
            cpu_model,
            cpu_speed_mhz,
            cpu_cores_physical: sys.physical_core_count().unwrap_or(0) as i64,
            cpu_cores_logical: sys.cpus().len() as i64,
            ram_total_gb: sys.total_memory() as f64 / GIB,
            disk_total_gb: metrics::primary_disk().map(|d| d.total_gb).unwrap_or(0.0),
            mac_address: discovery::primary_mac(),
            machine_model: wmic_value(&["csproduct", "get", "name"]).await,
            serial_number: wmic_value(&["bios", "get", "serialnumber"]).await,
            machine_type: machine_type().await,
            mb_manufacturer: wmic_value(&["baseboard", "get", "manufacturer"]).await,
            mb_model: wmic_value(&["baseboard", "get", "product"]).await,
            mb_version: wmic_value(&["baseboard", "get", "version"]).await,
            gpu_model,
            gpu_vram_mb,
            last_boot_time: last_boot_time(),
            last_restore_point: maintenance::last_restore_point_label(),
            mem_slots_total,
            mem_slots_used,
            network_interfaces: discovery::interfaces(),
            installed_software: installed_software().await,
        }
    }
}

/// Configured hostname when the operator pinned one, detected otherwise.
fn host_label(configured: &str) -> String {
    let configured = configured.trim();
    if configured.is_empty() {
        System::host_name().unwrap_or_else(|| "unknown-host".to_string())
    } else {
        configured.to_string()
    }
}

fn os_name() -> String {
    match (System::name(), System::os_version()) {
        (Some(name), Some(version)) => format!("{} {}", name, version),
        (Some(name), None) => name,
        _ => std::env::consts::OS.to_string(),
    }
}

fn last_boot_time() -> String {
    chrono::Local
        .timestamp_opt(System::boot_time() as i64, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Run a `wmic` query and return the first value line, `"N/A"` otherwise.
async fn wmic_value(args: &[&str]) -> String {
    if !cfg!(target_os = "windows") {
        return UNKNOWN.to_string();
    }

    match run_probe("wmic", args).await {
        Ok(output) => second_line(&output).unwrap_or_else(|| UNKNOWN.to_string()),
        Err(e) => {
            debug!("wmic {:?} failed: {:#}", args, e);
            UNKNOWN.to_string()
        }
    }
}

/// wmic prints a header line followed by values.
fn second_line(output: &str) -> Option<String> {
    let mut lines = output.trim().lines();
    lines.next()?;
    let value = lines.next()?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

async fn machine_type() -> String {
    if !cfg!(target_os = "windows") {
        return "Undefined".to_string();
    }

    let chassis = wmic_value(&["systemenclosure", "get", "chassistypes"]).await;
    chassis_label(&chassis)
}

/// Map an SMBIOS chassis type to a coarse machine category.
fn chassis_label(raw: &str) -> String {
    // wmic reports the value as "{10}"; keep only the digits.
    let code: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    match code.as_str() {
        "8" | "9" | "10" | "14" => "Notebook/Laptop".to_string(),
        "1" | "2" | "3" | "4" | "5" | "6" | "7" => "Desktop".to_string(),
        _ => "Desktop/Generic".to_string(),
    }
}

async fn gpu_info() -> (String, i64) {
    if !cfg!(target_os = "windows") {
        return (UNKNOWN.to_string(), 0);
    }

    let model = wmic_value(&["path", "Win32_VideoController", "get", "Name"]).await;
    let vram_mb = wmic_value(&["path", "Win32_VideoController", "get", "AdapterRAM"])
        .await
        .parse::<i64>()
        // AdapterRAM is a 32-bit counter and wraps negative past 2 GiB.
        .map(|bytes| (bytes / (1024 * 1024)).abs())
        .unwrap_or(0);

    (model, vram_mb)
}

async fn memory_slots() -> (i64, i64) {
    if !cfg!(target_os = "windows") {
        return (0, 0);
    }

    let total = wmic_value(&["memphysical", "get", "MemoryDevices"])
        .await
        .parse::<i64>()
        .unwrap_or(0);

    let used = match run_probe("wmic", &["memorychip", "get", "banklabel"]).await {
        Ok(output) => output
            .trim()
            .lines()
            .skip(1)
            .filter(|line| !line.trim().is_empty())
            .count() as i64,
        Err(_) => 0,
    };

    (total, used)
}

async fn network_details() -> (String, String) {
    if !cfg!(target_os = "windows") {
        return (UNKNOWN.to_string(), UNKNOWN.to_string());
    }

    let query = [
        "nicconfig",
        "where",
        "IPEnabled=true and DefaultIPGateway is not null",
        "get",
        "DefaultIPGateway,IPSubnet",
    ];

    match run_probe("wmic", &query).await {
        Ok(output) => parse_nicconfig(&output)
            .unwrap_or_else(|| (UNKNOWN.to_string(), UNKNOWN.to_string())),
        Err(e) => {
            debug!("nicconfig probe failed: {:#}", e);
            (UNKNOWN.to_string(), UNKNOWN.to_string())
        }
    }
}

fn parse_nicconfig(output: &str) -> Option<(String, String)> {
    let line = output.trim().lines().nth(1)?;
    let mut fields = line.split_whitespace();

    let clean = |s: &str| {
        s.trim_matches(|c| matches!(c, '{' | '}' | '"' | ','))
            .to_string()
    };

    let gateway = clean(fields.next()?);
    let mask = clean(fields.next()?);
    if gateway.is_empty() || mask.is_empty() {
        return None;
    }

    Some((gateway, mask))
}

const UNINSTALL_QUERY: &str = r"Get-ItemProperty HKLM:\Software\Microsoft\Windows\CurrentVersion\Uninstall\*, HKLM:\Software\Wow6432Node\Microsoft\Windows\CurrentVersion\Uninstall\* | Where-Object { $_.DisplayName -ne $null } | ForEach-Object { $_.DisplayName + '|||' + $_.DisplayVersion }";

async fn installed_software() -> Vec<Software> {
    if cfg!(target_os = "windows") {
        match run_probe("powershell", &["-NoProfile", "-Command", UNINSTALL_QUERY]).await {
            Ok(output) => parse_software_list(&output),
            Err(e) => {
                debug!("software inventory failed: {:#}", e);
                Vec::new()
            }
        }
    } else if cfg!(target_os = "linux") {
        linux_installed_software().await
    } else {
        Vec::new()
    }
}

/// Parse `Name|||Version` lines from the uninstall registry query.
fn parse_software_list(output: &str) -> Vec<Software> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().split("|||");
            let name = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            Some(Software {
                name: name.to_string(),
                version: parts.next().unwrap_or("").trim().to_string(),
            })
        })
        .collect()
}

async fn linux_installed_software() -> Vec<Software> {
    // dpkg first (Debian/Ubuntu), rpm as fallback.
    if let Ok(output) = run_probe("dpkg-query", &["-W", "-f", "${Package}\t${Version}\n"]).await {
        let list = parse_tabbed_software(&output);
        if !list.is_empty() {
            return list;
        }
    }

    match run_probe("rpm", &["-qa", "--queryformat", "%{NAME}\t%{VERSION}\n"]).await {
        Ok(output) => parse_tabbed_software(&output),
        Err(_) => Vec::new(),
    }
}

fn parse_tabbed_software(output: &str) -> Vec<Software> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(2, '\t');
            let name = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            Some(Software {
                name: name.to_string(),
                version: parts.next().unwrap_or("").trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    #[test]
    fn test_second_line_skips_wmic_header() {
        assert_eq!(
            second_line("SerialNumber  \r\nABC123XY  \r\n"),
            Some("ABC123XY".to_string())
        );
        assert_eq!(second_line("SerialNumber\r\n\r\n"), None);
        assert_eq!(second_line(""), None);
    }

    #[test]
    fn test_chassis_label_mapping() {
        assert_eq!(chassis_label("{10}"), "Notebook/Laptop");
        assert_eq!(chassis_label("9"), "Notebook/Laptop");
        assert_eq!(chassis_label("3"), "Desktop");
        assert_eq!(chassis_label("{30}"), "Desktop/Generic");
        assert_eq!(chassis_label("junk"), "Desktop/Generic");
    }

    #[test]
    fn test_nicconfig_parsing() {
        let output = "DefaultIPGateway          IPSubnet\r\n{\"192.168.0.1\"}           {\"255.255.255.0\", \"64\"}\r\n";
        assert_eq!(
            parse_nicconfig(output),
            Some(("192.168.0.1".to_string(), "255.255.255.0".to_string()))
        );
        assert_eq!(parse_nicconfig("DefaultIPGateway IPSubnet\r\n"), None);
    }

    #[test]
    fn test_software_list_parsing() {
        let output = "7-Zip 23.01|||23.01\r\nMozilla Firefox|||\r\n\r\n";
        let list = parse_software_list(output);

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "7-Zip 23.01");
        assert_eq!(list[0].version, "23.01");
        assert_eq!(list[1].name, "Mozilla Firefox");
        assert_eq!(list[1].version, "");
    }

    #[test]
    fn test_tabbed_software_parsing() {
        let output = "bash\t5.2.15\ncoreutils\t9.1\n";
        let list = parse_tabbed_software(output);

        assert_eq!(list.len(), 2);
        assert_eq!(list[1].name, "coreutils");
        assert_eq!(list[1].version, "9.1");
    }

    #[test]
    fn test_host_label_prefers_the_configured_name() {
        assert_eq!(host_label(" lab-pc-07 "), "lab-pc-07");
    }

    #[test]
    fn test_host_label_falls_back_to_detection() {
        assert!(!host_label("").is_empty());
        assert!(!host_label("   ").is_empty());
    }

    #[tokio::test]
    async fn test_collect_reports_the_configured_hostname() {
        let mut config = AgentConfig::default();
        config.agent.hostname = "lab-pc-override".to_string();
        let ctx = crate::context::AgentContext::new(config).unwrap();

        let info = MachineInfo::collect(&ctx).await;
        assert_eq!(info.hostname, "lab-pc-override");
    }

    #[tokio::test]
    async fn test_collected_inventory_has_no_nulls() {
        let ctx = crate::context::AgentContext::new(AgentConfig::default()).unwrap();
        let info = MachineInfo::collect(&ctx).await;

        assert!(!info.uuid.is_empty());
        assert!(!info.hostname.is_empty());

        // Sentinels, never nulls, on the wire.
        let value = serde_json::to_value(&info).unwrap();
        for (key, field) in value.as_object().unwrap() {
            assert!(!field.is_null(), "field {} serialized as null", key);
        }
    }
}
