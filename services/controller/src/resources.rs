//! Best-effort local system facts for registration and status reports.

use fleet_proto::{ResourceMetrics, SystemInfo};

#[derive(Debug, Clone, Default, PartialEq)]
struct MemInfo {
    total_kb: u64,
    available_kb: u64,
}

pub fn system_info() -> SystemInfo {
    SystemInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        cpu_cores: cpu_count(),
        memory_mb: read_meminfo().map(|m| m.total_kb / 1024).unwrap_or(0),
        uptime_secs: read_uptime().unwrap_or(0),
    }
}

/// Utilization percentages. Host counts are filled in by the caller.
pub fn sample_metrics() -> ResourceMetrics {
    let memory_percent = read_meminfo()
        .filter(|m| m.total_kb > 0)
        .map(|m| {
            let used = m.total_kb.saturating_sub(m.available_kb);
            used as f64 * 100.0 / m.total_kb as f64
        })
        .unwrap_or(0.0);

    // One-minute load average relative to core count.
    let cpu_percent = read_loadavg()
        .map(|load| (load * 100.0 / cpu_count() as f64).min(100.0))
        .unwrap_or(0.0);

    ResourceMetrics {
        cpu_percent,
        memory_percent,
        disk_percent: 0.0,
        connected_hosts: 0,
        total_hosts: 0,
    }
}

fn cpu_count() -> u32 {
    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

fn read_meminfo() -> Option<MemInfo> {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .map(|content| parse_meminfo(&content))
}

fn read_loadavg() -> Option<f64> {
    std::fs::read_to_string("/proc/loadavg")
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn read_uptime() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/uptime").ok()?;
    let secs: f64 = content.split_whitespace().next()?.parse().ok()?;
    Some(secs as u64)
}

fn parse_meminfo(content: &str) -> MemInfo {
    let mut total = 0;
    let mut available = 0;
    let mut free = 0;
    let mut buffers = 0;
    let mut cached = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value: u64 = value.parse().unwrap_or(0);
        match key {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = value,
            "MemFree:" => free = value,
            "Buffers:" => buffers = value,
            "Cached:" => cached = value,
            _ => {}
        }
    }

    // Older kernels do not report MemAvailable.
    if available == 0 {
        available = free + buffers + cached;
    }

    MemInfo {
        total_kb: total,
        available_kb: available,
    }
}
