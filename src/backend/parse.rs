//! Parsers for the text the remote shell hands back: `/proc/stat`, `/proc/meminfo`,
//! `df -P -T -k`, `/proc/diskstats`, `/proc/net/dev`, `/etc/os-release`, `/proc/uptime`.
//!
//! Every parser is total. Lines are whitespace-collapsed and checked against the
//! expected column count; a mismatching row is skipped and logged, never fatal.

use std::collections::HashMap;

use crate::models::{
    CpuUsage, DiskIo, FileSystemInfo, InterfaceUsage, MemoryInfo, MountUsage, NetworkInfo,
    ProcessInfo, SystemInfo,
};

/// Separates samples and sections inside one combined remote invocation.
pub const SENTINEL: &str = "__FLEETWATCH_SAMPLE__";

/// Delay between the two samples of a differenced reading.
pub const SAMPLE_WINDOW_SECS: f64 = 1.0;

/// `cpu` + user nice system idle iowait irq softirq steal guest guest_nice.
const PROC_STAT_COLUMNS: usize = 11;
/// loadavg: 1m 5m 15m running/total last_pid.
const LOADAVG_COLUMNS: usize = 5;
/// `Key: value kB`.
const MEMINFO_COLUMNS: usize = 3;
/// Filesystem Type 1024-blocks Used Available Capacity Mounted-on.
const DF_COLUMNS: usize = 7;
/// diskstats grew fields over kernel versions (4.18 added 4, 5.5 added 2).
const DISKSTATS_COLUMNS: [usize; 3] = [14, 18, 20];
/// iface + 8 receive + 8 transmit counters.
const NET_DEV_COLUMNS: usize = 17;
const SECTOR_BYTES: u64 = 512;

const PSEUDO_FILESYSTEMS: &[&str] = &[
    "tmpfs", "devtmpfs", "squashfs", "overlay", "proc", "sysfs", "devfs", "efivarfs",
];

/// Split combined output on sentinel lines.
pub fn split_sections(text: &str) -> Vec<String> {
    let mut sections = vec![String::new()];
    for line in text.lines() {
        if line.trim() == SENTINEL {
            sections.push(String::new());
        } else if let Some(current) = sections.last_mut() {
            current.push_str(line);
            current.push('\n');
        }
    }
    sections
}

fn columns(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// Raw jiffy counters of one `cpu*` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuTimes {
    pub name: String,
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    /// guest/guest_nice are already counted in user/nice and are left out.
    fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq + self.steal
    }
}

pub fn parse_proc_stat(text: &str) -> Vec<CpuTimes> {
    let mut out = Vec::new();
    for line in text.lines().filter(|l| l.starts_with("cpu")) {
        let cols = columns(line);
        if cols.len() != PROC_STAT_COLUMNS {
            tracing::debug!(line, expected = PROC_STAT_COLUMNS, got = cols.len(), "skipping /proc/stat row");
            continue;
        }
        let nums: Option<Vec<u64>> = cols[1..].iter().map(|c| c.parse().ok()).collect();
        let Some(n) = nums else {
            tracing::debug!(line, "skipping non-numeric /proc/stat row");
            continue;
        };
        out.push(CpuTimes {
            name: cols[0].to_string(),
            user: n[0],
            nice: n[1],
            system: n[2],
            idle: n[3],
            iowait: n[4],
            irq: n[5],
            softirq: n[6],
            steal: n[7],
        });
    }
    out
}

/// Percentages over the window between two samples of the same row.
/// Counters that went backwards (per-core iowait can) contribute zero, and
/// the window is the sum of the clamped deltas so the parts never exceed 100.
pub fn cpu_usage_between(prev: &CpuTimes, cur: &CpuTimes) -> CpuUsage {
    let delta = CpuTimes {
        name: cur.name.clone(),
        user: cur.user.saturating_sub(prev.user),
        nice: cur.nice.saturating_sub(prev.nice),
        system: cur.system.saturating_sub(prev.system),
        idle: cur.idle.saturating_sub(prev.idle),
        iowait: cur.iowait.saturating_sub(prev.iowait),
        irq: cur.irq.saturating_sub(prev.irq),
        softirq: cur.softirq.saturating_sub(prev.softirq),
        steal: cur.steal.saturating_sub(prev.steal),
    };
    let total = delta.total();
    if total == 0 {
        return CpuUsage {
            name: delta.name,
            ..CpuUsage::default()
        };
    }
    let pct = |d: u64| d as f64 / total as f64 * 100.0;
    CpuUsage {
        user: pct(delta.user),
        nice: pct(delta.nice),
        system: pct(delta.system),
        iowait: pct(delta.iowait),
        irq: pct(delta.irq),
        softirq: pct(delta.softirq),
        steal: pct(delta.steal),
        idle: pct(delta.idle),
        name: delta.name,
    }
}

/// Output of `cat /proc/stat; SENTINEL; sleep 1; cat /proc/stat; SENTINEL; cat /proc/loadavg`.
pub fn parse_process_info(text: &str) -> ProcessInfo {
    let sections = split_sections(text);
    if sections.len() < 2 {
        tracing::warn!(sections = sections.len(), "process info: missing second /proc/stat sample");
        return ProcessInfo::default();
    }
    let before = parse_proc_stat(&sections[0]);
    let after = parse_proc_stat(&sections[1]);

    let mut info = ProcessInfo::default();
    for cur in &after {
        let Some(prev) = before.iter().find(|p| p.name == cur.name) else {
            continue;
        };
        let usage = cpu_usage_between(prev, cur);
        if cur.name == "cpu" {
            info.summary = usage;
        } else {
            info.cores.push(usage);
        }
    }

    if let Some(loadavg) = sections.get(2) {
        apply_loadavg(&mut info, loadavg);
    }
    info
}

fn apply_loadavg(info: &mut ProcessInfo, text: &str) {
    let Some(line) = text.lines().find(|l| !l.trim().is_empty()) else {
        return;
    };
    let cols = columns(line);
    if cols.len() != LOADAVG_COLUMNS {
        tracing::debug!(line, "skipping /proc/loadavg row");
        return;
    }
    info.load_1 = cols[0].parse().unwrap_or(0.0);
    info.load_5 = cols[1].parse().unwrap_or(0.0);
    info.load_15 = cols[2].parse().unwrap_or(0.0);
    if let Some((running, total)) = cols[3].split_once('/') {
        info.running_processes = running.parse().unwrap_or(0);
        info.total_processes = total.parse().unwrap_or(0);
    }
}

pub fn parse_meminfo(text: &str) -> MemoryInfo {
    let mut values: HashMap<&str, u64> = HashMap::new();
    for line in text.lines() {
        let cols = columns(line);
        if cols.len() != MEMINFO_COLUMNS {
            // Unit-less rows (HugePages_*) have two columns and are not needed.
            continue;
        }
        let key = cols[0].trim_end_matches(':');
        match cols[1].parse::<u64>() {
            Ok(v) => {
                values.insert(key, v);
            }
            Err(_) => tracing::debug!(line, "skipping non-numeric /proc/meminfo row"),
        }
    }
    let get = |k: &str| values.get(k).copied().unwrap_or(0);
    let free_kb = get("MemFree");
    let buffers_kb = get("Buffers");
    let cached_kb = get("Cached");
    let available_kb = values
        .get("MemAvailable")
        .copied()
        .unwrap_or(free_kb + buffers_kb + cached_kb);
    MemoryInfo {
        total_kb: get("MemTotal"),
        free_kb,
        available_kb,
        buffers_kb,
        cached_kb,
        swap_total_kb: get("SwapTotal"),
        swap_free_kb: get("SwapFree"),
    }
}

pub fn parse_df(text: &str) -> Vec<MountUsage> {
    let mut out = Vec::new();
    for line in text.lines() {
        if line.starts_with("Filesystem") || line.trim().is_empty() {
            continue;
        }
        let cols = columns(line);
        if cols.len() != DF_COLUMNS {
            tracing::debug!(line, expected = DF_COLUMNS, got = cols.len(), "skipping df row");
            continue;
        }
        if PSEUDO_FILESYSTEMS.contains(&cols[1]) {
            continue;
        }
        let (Ok(total_kb), Ok(used_kb), Ok(available_kb)) = (
            cols[2].parse::<u64>(),
            cols[3].parse::<u64>(),
            cols[4].parse::<u64>(),
        ) else {
            tracing::debug!(line, "skipping non-numeric df row");
            continue;
        };
        out.push(MountUsage {
            device: cols[0].to_string(),
            fs_type: cols[1].to_string(),
            mount_point: cols[6].to_string(),
            total_kb,
            used_kb,
            available_kb,
        });
    }
    out
}

/// Device name -> (sectors read, sectors written).
pub fn parse_diskstats(text: &str) -> HashMap<String, (u64, u64)> {
    let mut out = HashMap::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let cols = columns(line);
        if !DISKSTATS_COLUMNS.contains(&cols.len()) {
            tracing::debug!(line, got = cols.len(), "skipping /proc/diskstats row");
            continue;
        }
        let name = cols[2];
        if name.starts_with("loop") || name.starts_with("ram") {
            continue;
        }
        let (Ok(read), Ok(written)) = (cols[5].parse::<u64>(), cols[9].parse::<u64>()) else {
            continue;
        };
        out.insert(name.to_string(), (read, written));
    }
    out
}

/// Output of `df; SENTINEL; diskstats; SENTINEL; sleep 1; diskstats`.
pub fn parse_file_system_info(text: &str) -> FileSystemInfo {
    let sections = split_sections(text);
    let mounts = sections.first().map(|s| parse_df(s)).unwrap_or_default();
    let mut devices = Vec::new();
    if let (Some(a), Some(b)) = (sections.get(1), sections.get(2)) {
        let before = parse_diskstats(a);
        let after = parse_diskstats(b);
        for (name, (read, written)) in &after {
            if let Some((pr, pw)) = before.get(name) {
                devices.push(DiskIo {
                    name: name.clone(),
                    read_bytes_per_sec: (read.saturating_sub(*pr) * SECTOR_BYTES) as f64
                        / SAMPLE_WINDOW_SECS,
                    write_bytes_per_sec: (written.saturating_sub(*pw) * SECTOR_BYTES) as f64
                        / SAMPLE_WINDOW_SECS,
                });
            }
        }
        devices.sort_by(|a, b| a.name.cmp(&b.name));
    }
    FileSystemInfo { mounts, devices }
}

/// Interface name -> (rx bytes, tx bytes), in file order.
pub fn parse_net_dev(text: &str) -> Vec<(String, u64, u64)> {
    let mut out = Vec::new();
    for line in text.lines() {
        if line.contains('|') || line.trim().is_empty() {
            continue;
        }
        let flattened = line.replacen(':', " ", 1);
        let cols = columns(&flattened);
        if cols.len() != NET_DEV_COLUMNS {
            tracing::debug!(line, expected = NET_DEV_COLUMNS, got = cols.len(), "skipping /proc/net/dev row");
            continue;
        }
        let (Ok(rx), Ok(tx)) = (cols[1].parse::<u64>(), cols[9].parse::<u64>()) else {
            continue;
        };
        out.push((cols[0].to_string(), rx, tx));
    }
    out
}

/// Output of `cat /proc/net/dev; SENTINEL; sleep 1; cat /proc/net/dev`.
pub fn parse_network_info(text: &str) -> NetworkInfo {
    let sections = split_sections(text);
    let before = sections.first().map(|s| parse_net_dev(s)).unwrap_or_default();
    let after = match sections.get(1) {
        Some(s) => parse_net_dev(s),
        None => before.clone(),
    };
    let interfaces = after
        .into_iter()
        .map(|(name, rx, tx)| {
            let (rx_rate, tx_rate) = before
                .iter()
                .find(|(n, _, _)| *n == name)
                .map(|(_, prx, ptx)| {
                    (
                        rx.saturating_sub(*prx) as f64 / SAMPLE_WINDOW_SECS,
                        tx.saturating_sub(*ptx) as f64 / SAMPLE_WINDOW_SECS,
                    )
                })
                .unwrap_or((0.0, 0.0));
            InterfaceUsage {
                name,
                rx_bytes: rx,
                tx_bytes: tx,
                rx_bytes_per_sec: rx_rate,
                tx_bytes_per_sec: tx_rate,
            }
        })
        .collect();
    NetworkInfo { interfaces }
}

/// PRETTY_NAME, falling back to NAME.
pub fn parse_os_release(text: &str) -> Option<String> {
    let value = |prefix: &str| {
        text.lines()
            .find_map(|l| l.strip_prefix(prefix))
            .map(|v| v.trim().trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
    };
    value("PRETTY_NAME=").or_else(|| value("NAME="))
}

/// Output of `hostname; SENTINEL; uname -r; SENTINEL; cat /etc/os-release; SENTINEL; cat /proc/uptime`.
pub fn parse_system_info(text: &str) -> SystemInfo {
    let sections = split_sections(text);
    let first_line = |i: usize| {
        sections
            .get(i)
            .and_then(|s| s.lines().map(str::trim).find(|l| !l.is_empty()))
            .unwrap_or_default()
            .to_string()
    };
    let uptime_secs = sections
        .get(3)
        .and_then(|s| s.split_whitespace().next())
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v.max(0.0) as u64)
        .unwrap_or(0);
    SystemInfo {
        hostname: first_line(0),
        kernel_release: first_line(1),
        os_name: sections
            .get(2)
            .and_then(|s| parse_os_release(s))
            .unwrap_or_default(),
        uptime_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_samples(first: &str, second: &str) -> String {
        format!("{}\n{}\n{}\n{}\n0.52 0.58 0.59 2/389 12345\n", first, SENTINEL, second, SENTINEL)
    }

    #[test]
    fn cpu_percentages_from_fixed_deltas() {
        let first = "cpu  1000 0 500 8000 100 0 0 0 0 0\n\
                     cpu0 500 0 250 4000 50 0 0 0 0 0\n\
                     cpu1 500 0 250 4000 50 0 0 0 0 0\n\
                     intr 12345";
        // +100 user, +50 system, +800 idle, +50 iowait over 1000 jiffies; split evenly per core.
        let second = "cpu  1100 0 550 8800 150 0 0 0 0 0\n\
                      cpu0 550 0 275 4400 75 0 0 0 0 0\n\
                      cpu1 550 0 275 4400 75 0 0 0 0 0";
        let info = parse_process_info(&two_samples(first, second));

        assert_eq!(info.summary.name, "cpu");
        assert!((info.summary.user - 10.0).abs() < 1e-9);
        assert!((info.summary.system - 5.0).abs() < 1e-9);
        assert!((info.summary.idle - 80.0).abs() < 1e-9);
        assert!((info.summary.iowait - 5.0).abs() < 1e-9);
        assert_eq!(info.cores.len(), 2);
        for core in info.cores.iter().chain(std::iter::once(&info.summary)) {
            let parts = [
                core.user, core.nice, core.system, core.iowait, core.irq, core.softirq, core.steal,
                core.idle,
            ];
            assert!(parts.iter().all(|p| p.is_finite() && *p >= 0.0));
            assert!(parts.iter().sum::<f64>() <= 100.0 + 1e-9);
        }
        assert_eq!(info.load_1, 0.52);
        assert_eq!(info.running_processes, 2);
        assert_eq!(info.total_processes, 389);
    }

    #[test]
    fn cpu_counters_going_backwards_stay_non_negative() {
        let first = "cpu  2000 0 500 8000 100 0 0 0 0 0";
        let second = "cpu  1000 0 600 8100 100 0 0 0 0 0";
        let info = parse_process_info(&two_samples(first, second));
        assert!(info.summary.user >= 0.0);
        assert!(info.summary.busy_percent() <= 100.0);
    }

    #[test]
    fn cpu_iowait_decrease_keeps_core_total_within_100() {
        let first = "cpu0 1000 0 500 8000 400 0 0 0 0 0";
        let second = "cpu0 1000 0 800 8500 100 0 0 0 0 0";
        let info = parse_process_info(&two_samples(first, second));
        let core = &info.cores[0];
        let sum = core.user + core.nice + core.system + core.iowait + core.irq + core.softirq
            + core.steal
            + core.idle;
        assert!(sum <= 100.0 + 1e-9, "sum {} > 100", sum);
        assert_eq!(core.iowait, 0.0);
        // 300 system + 500 idle jiffies
        assert!((core.system - 37.5).abs() < 1e-9);
        assert!((core.idle - 62.5).abs() < 1e-9);
    }

    #[test]
    fn cpu_rows_with_wrong_column_count_are_skipped() {
        let rows = parse_proc_stat("cpu 1 2 3\ncpu0 1 2 3 4 5 6 7 8 9 10\n");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "cpu0");
    }

    #[test]
    fn missing_second_sample_is_zero_value() {
        assert_eq!(parse_process_info("garbage"), ProcessInfo::default());
    }

    #[test]
    fn meminfo_parsed_in_kib() {
        let text = "MemTotal:       16314852 kB\n\
                    MemFree:         1034232 kB\n\
                    MemAvailable:    9876543 kB\n\
                    Buffers:          345678 kB\n\
                    Cached:          7654321 kB\n\
                    SwapTotal:       2097148 kB\n\
                    SwapFree:        2097148 kB\n\
                    HugePages_Total:       0\n";
        let m = parse_meminfo(text);
        assert_eq!(m.total_kb, 16314852);
        assert_eq!(m.available_kb, 9876543);
        assert_eq!(m.swap_free_kb, 2097148);
        assert!(m.usage_percent() > 0.0 && m.usage_percent() < 100.0);
    }

    #[test]
    fn meminfo_without_available_falls_back() {
        let m = parse_meminfo("MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 50 kB\nCached: 250 kB\n");
        assert_eq!(m.available_kb, 400);
    }

    #[test]
    fn df_skips_header_pseudo_fs_and_bad_rows() {
        let text = "Filesystem     Type  1024-blocks     Used Available Capacity Mounted on\n\
                    /dev/sda1      ext4     41152736 12345678  26710312      32% /\n\
                    tmpfs          tmpfs      814512     1200    813312       1% /run\n\
                    /dev/sdb1      xfs     104857600  5242880  99614720       5% /mnt/my data\n";
        let mounts = parse_df(text);
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].mount_point, "/");
        assert_eq!(mounts[0].fs_type, "ext4");
        assert_eq!(mounts[0].used_kb, 12345678);
    }

    #[test]
    fn diskstats_rates_from_two_samples() {
        let a = "   8       0 sda 100 0 2000 0 50 0 4000 0 0 0 0 0 0 0 0 0 0 0\n   7       0 loop0 1 0 1 0 0 0 0 0 0 0 0 0 0 0";
        let b = "   8       0 sda 110 0 2010 0 60 0 4020 0 0 0 0 0 0 0 0 0 0 0\n   7       0 loop0 1 0 1 0 0 0 0 0 0 0 0 0 0 0";
        let text = format!("Filesystem Type 1024-blocks Used Available Capacity Mounted on\n{}\n{}\n{}\n{}\n", SENTINEL, a, SENTINEL, b);
        let fs = parse_file_system_info(&text);
        assert_eq!(fs.devices.len(), 1);
        assert_eq!(fs.devices[0].name, "sda");
        assert_eq!(fs.devices[0].read_bytes_per_sec, 10.0 * 512.0);
        assert_eq!(fs.devices[0].write_bytes_per_sec, 20.0 * 512.0);
    }

    #[test]
    fn net_dev_rates() {
        let header = "Inter-|   Receive                                                |  Transmit\n \
                      face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n";
        let a = format!("{}  eth0: 1000 10 0 0 0 0 0 0 2000 20 0 0 0 0 0 0\n", header);
        let b = format!("{}  eth0: 1500 15 0 0 0 0 0 0 2600 26 0 0 0 0 0 0\n  bad: 1 2 3\n", header);
        let net = parse_network_info(&format!("{}{}\n{}", a, SENTINEL, b));
        assert_eq!(net.interfaces.len(), 1);
        let eth0 = net.interface("eth0").unwrap();
        assert_eq!(eth0.rx_bytes, 1500);
        assert_eq!(eth0.rx_bytes_per_sec, 500.0);
        assert_eq!(eth0.tx_bytes_per_sec, 600.0);
    }

    #[test]
    fn system_info_sections() {
        let text = format!(
            "web-01\n{s}\n6.1.0-18-amd64\n{s}\nNAME=\"Debian GNU/Linux\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\n{s}\n12345.67 23456.78\n",
            s = SENTINEL
        );
        let sys = parse_system_info(&text);
        assert_eq!(sys.hostname, "web-01");
        assert_eq!(sys.kernel_release, "6.1.0-18-amd64");
        assert_eq!(sys.os_name, "Debian GNU/Linux 12 (bookworm)");
        assert_eq!(sys.uptime_secs, 12345);
    }

    #[test]
    fn os_release_falls_back_to_name() {
        assert_eq!(parse_os_release("NAME=Alpine\n").as_deref(), Some("Alpine"));
        assert_eq!(parse_os_release("PRETTY_NAME=\"\"\n"), None);
    }
}
