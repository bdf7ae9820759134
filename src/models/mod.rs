// Domain models

mod credential;
mod script;
mod snapshot;
mod target;

pub use credential::CredentialRecord;
pub use script::{
    ExecutionResult, ExecutorKind, ScriptSpec, ScriptSpecGroup, TargetKind, exit_code,
};
pub use snapshot::{
    CpuUsage, DiskIo, FileSystemInfo, InterfaceUsage, MemoryInfo, MountUsage, NetworkInfo,
    ProcessInfo, ServerSnapshot, SystemInfo,
};
pub use target::{AccountKind, DuplicatePolicy, TargetRecord, tag};
