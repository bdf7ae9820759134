// Server snapshot models: CPU, memory, file systems, network, system identity

use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

/// CPU time shares over one sampling window, in percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct CpuUsage {
    /// `cpu` for the aggregate row, `cpu0`, `cpu1`, ... for cores.
    pub name: String,
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    pub iowait: f64,
    pub irq: f64,
    pub softirq: f64,
    pub steal: f64,
    pub idle: f64,
}

impl CpuUsage {
    /// Busy share (everything except idle and iowait).
    pub fn busy_percent(&self) -> f64 {
        (self.user + self.nice + self.system + self.irq + self.softirq + self.steal).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub summary: CpuUsage,
    pub cores: Vec<CpuUsage>,
    pub load_1: f64,
    pub load_5: f64,
    pub load_15: f64,
    pub running_processes: u32,
    pub total_processes: u32,
}

impl ProcessInfo {
    pub fn is_zero(&self) -> bool {
        self.cores.is_empty() && self.summary == CpuUsage::default() && self.total_processes == 0
    }
}

/// Memory counters in KiB, as reported by /proc/meminfo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub total_kb: u64,
    pub free_kb: u64,
    pub available_kb: u64,
    pub buffers_kb: u64,
    pub cached_kb: u64,
    pub swap_total_kb: u64,
    pub swap_free_kb: u64,
}

impl MemoryInfo {
    pub fn used_kb(&self) -> u64 {
        self.total_kb.saturating_sub(self.available_kb)
    }

    pub fn usage_percent(&self) -> f64 {
        if self.total_kb > 0 {
            (self.used_kb() as f64 / self.total_kb as f64) * 100.0
        } else {
            0.0
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total_kb == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct MountUsage {
    pub device: String,
    pub fs_type: String,
    pub mount_point: String,
    pub total_kb: u64,
    pub used_kb: u64,
    pub available_kb: u64,
}

impl MountUsage {
    pub fn usage_percent(&self) -> f64 {
        if self.total_kb > 0 {
            (self.used_kb as f64 / self.total_kb as f64) * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct DiskIo {
    pub name: String,
    pub read_bytes_per_sec: f64,
    pub write_bytes_per_sec: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemInfo {
    pub mounts: Vec<MountUsage>,
    pub devices: Vec<DiskIo>,
}

impl FileSystemInfo {
    pub fn mount(&self, mount_point: &str) -> Option<&MountUsage> {
        self.mounts.iter().find(|m| m.mount_point == mount_point)
    }

    pub fn is_zero(&self) -> bool {
        self.mounts.is_empty() && self.devices.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceUsage {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub interfaces: Vec<InterfaceUsage>,
}

impl NetworkInfo {
    pub fn interface(&self, name: &str) -> Option<&InterfaceUsage> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn is_zero(&self) -> bool {
        self.interfaces.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub hostname: String,
    pub os_name: String,
    pub kernel_release: String,
    pub uptime_secs: u64,
}

impl SystemInfo {
    pub fn is_zero(&self) -> bool {
        self.hostname.is_empty() && self.os_name.is_empty() && self.uptime_secs == 0
    }
}

/// One point-in-time metrics bundle for a target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    pub process: ProcessInfo,
    pub memory: MemoryInfo,
    pub file_system: FileSystemInfo,
    pub system: SystemInfo,
    pub network: NetworkInfo,
}

impl ServerSnapshot {
    /// Number of categories still at their zero value.
    pub fn zero_categories(&self) -> usize {
        [
            self.process.is_zero(),
            self.memory.is_zero(),
            self.file_system.is_zero(),
            self.system.is_zero(),
            self.network.is_zero(),
        ]
        .into_iter()
        .filter(|z| *z)
        .count()
    }
}
