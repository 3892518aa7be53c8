//! Host statistics plugin
//!
//! Samples memory, load average, CPU usage, filesystem usage and network
//! counters straight from procfs and `statvfs`. Each section is
//! independent: a file that cannot be read or parsed is skipped with a
//! warning and the remaining sections still produce metrics.

use std::collections::HashSet;
use std::ffi::CString;
use std::fs;

use anyhow::Result;
use shared::utils::current_timestamp;
use shared::WrappedMetric;
use tracing::warn;

use super::StatsCollector;

pub struct HostStatsCollector {
    /// `(total, idle)` jiffies from the previous CPU sample. CPU usage is
    /// a delta, so the very first request produces no CPU metric.
    previous_cpu: Option<(u64, u64)>,
}

impl HostStatsCollector {
    pub fn new() -> Self {
        Self { previous_cpu: None }
    }

    fn collect_memory(&self, timestamp: f64, stats: &mut Vec<WrappedMetric>) {
        let meminfo = match fs::read_to_string("/proc/meminfo") {
            Ok(content) => content,
            Err(error) => {
                warn!("[host] Could not read /proc/meminfo: {}", error);
                return;
            }
        };
        let field = |name: &str| -> Option<f64> {
            meminfo
                .lines()
                .find(|line| line.starts_with(name))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<f64>().ok())
                .map(|kb| kb * 1024.0)
        };
        let (Some(total), Some(available)) = (field("MemTotal:"), field("MemAvailable:")) else {
            warn!("[host] Unexpected /proc/meminfo format.");
            return;
        };
        stats.push(gauge(
            "Chouette.host.memory.used",
            total - available,
            timestamp,
            vec![],
        ));
        stats.push(gauge(
            "Chouette.host.memory.available",
            available,
            timestamp,
            vec![],
        ));
    }

    fn collect_load_average(&self, timestamp: f64, stats: &mut Vec<WrappedMetric>) {
        let loadavg = match fs::read_to_string("/proc/loadavg") {
            Ok(content) => content,
            Err(error) => {
                warn!("[host] Could not read /proc/loadavg: {}", error);
                return;
            }
        };
        let Some(la_1m) = loadavg
            .split_whitespace()
            .next()
            .and_then(|value| value.parse::<f64>().ok())
        else {
            warn!("[host] Unexpected /proc/loadavg format.");
            return;
        };
        stats.push(gauge(
            "Chouette.host.la",
            la_1m,
            timestamp,
            vec!["period:1m".to_string()],
        ));
    }

    fn collect_cpu_percentage(&mut self, timestamp: f64, stats: &mut Vec<WrappedMetric>) {
        let stat = match fs::read_to_string("/proc/stat") {
            Ok(content) => content,
            Err(error) => {
                warn!("[host] Could not read /proc/stat: {}", error);
                return;
            }
        };
        let Some(sample) = parse_cpu_line(&stat) else {
            warn!("[host] Unexpected /proc/stat format.");
            return;
        };
        let previous = self.previous_cpu.replace(sample);
        let Some((previous_total, previous_idle)) = previous else {
            return;
        };
        let (total, idle) = sample;
        let total_delta = total.saturating_sub(previous_total);
        if total_delta == 0 {
            return;
        }
        let busy_delta = total_delta.saturating_sub(idle.saturating_sub(previous_idle));
        let percentage = busy_delta as f64 / total_delta as f64 * 100.0;
        stats.push(gauge(
            "Chouette.host.cpu.percentage",
            percentage,
            timestamp,
            vec![],
        ));
    }

    fn collect_filesystem(&self, timestamp: f64, stats: &mut Vec<WrappedMetric>) {
        let mounts = match fs::read_to_string("/proc/mounts") {
            Ok(content) => content,
            Err(error) => {
                warn!("[host] Could not read /proc/mounts: {}", error);
                return;
            }
        };
        // Containers may expose one device under several mountpoints;
        // each device is reported once.
        let mut seen: HashSet<String> = HashSet::new();
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(device), Some(mountpoint)) = (fields.next(), fields.next()) else {
                continue;
            };
            if !device.starts_with("/dev/") || !seen.insert(device.to_string()) {
                continue;
            }
            let Some((used, free)) = filesystem_usage(mountpoint) else {
                continue;
            };
            let tags = vec![format!("device:{}", device)];
            stats.push(gauge("Chouette.host.fs.used", used, timestamp, tags.clone()));
            stats.push(gauge("Chouette.host.fs.free", free, timestamp, tags));
        }
    }

    fn collect_network(&self, timestamp: f64, stats: &mut Vec<WrappedMetric>) {
        let net_dev = match fs::read_to_string("/proc/net/dev") {
            Ok(content) => content,
            Err(error) => {
                warn!("[host] Could not read /proc/net/dev: {}", error);
                return;
            }
        };
        let mut bytes_recv = 0.0;
        let mut bytes_sent = 0.0;
        // First two lines are headers; loopback traffic is not interesting.
        for line in net_dev.lines().skip(2) {
            let Some((interface, counters)) = line.split_once(':') else {
                continue;
            };
            if interface.trim() == "lo" {
                continue;
            }
            let fields: Vec<&str> = counters.split_whitespace().collect();
            if let (Some(recv), Some(sent)) = (
                fields.first().and_then(|value| value.parse::<f64>().ok()),
                fields.get(8).and_then(|value| value.parse::<f64>().ok()),
            ) {
                bytes_recv += recv;
                bytes_sent += sent;
            }
        }
        stats.push(gauge(
            "Chouette.host.network.bytes.sent",
            bytes_sent,
            timestamp,
            vec![],
        ));
        stats.push(gauge(
            "Chouette.host.network.bytes.recv",
            bytes_recv,
            timestamp,
            vec![],
        ));
    }
}

impl StatsCollector for HostStatsCollector {
    fn name(&self) -> &'static str {
        "host"
    }

    fn collect_stats(&mut self) -> Result<Vec<WrappedMetric>> {
        let timestamp = current_timestamp();
        let mut stats = Vec::new();
        self.collect_memory(timestamp, &mut stats);
        self.collect_load_average(timestamp, &mut stats);
        self.collect_cpu_percentage(timestamp, &mut stats);
        self.collect_filesystem(timestamp, &mut stats);
        self.collect_network(timestamp, &mut stats);
        Ok(stats)
    }
}

/// Returns `(used, free)` bytes for the filesystem mounted at `path`,
/// or None if the mountpoint cannot be queried.
fn filesystem_usage(path: &str) -> Option<(f64, f64)> {
    let path = CString::new(path).ok()?;
    let mut usage: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(path.as_ptr(), &mut usage) };
    if result != 0 {
        return None;
    }
    let fragment_size = usage.f_frsize as f64;
    let used = usage.f_blocks.saturating_sub(usage.f_bfree) as f64 * fragment_size;
    // Free space as seen by unprivileged users.
    let free = usage.f_bavail as f64 * fragment_size;
    Some((used, free))
}

/// Returns `(total, idle)` jiffies from the aggregate cpu line.
fn parse_cpu_line(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let counters: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .filter_map(|value| value.parse().ok())
        .collect();
    if counters.len() < 5 {
        return None;
    }
    let total = counters.iter().sum();
    // idle + iowait both count as not-busy
    let idle = counters[3] + counters[4];
    Some((total, idle))
}

fn gauge(metric: &str, value: f64, timestamp: f64, tags: Vec<String>) -> WrappedMetric {
    WrappedMetric::new(metric, "gauge", Some(timestamp), value, tags, None)
}
