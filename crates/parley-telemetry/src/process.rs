use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Resource usage of the server process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessUsage {
    /// CPU usage since the previous sample, in percent of one core.
    pub cpu_percent: f32,
    /// Resident memory in KiB.
    pub memory_kib: u64,
}

/// Samples CPU and memory of the current process.
///
/// CPU usage is a delta between refreshes, so the first sample reports 0.
pub struct ProcessSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessSampler {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| tracing::warn!(error = e, "cannot resolve current pid"))
            .ok();
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }

    pub fn sample(&self) -> ProcessUsage {
        let Some(pid) = self.pid else {
            return ProcessUsage::default();
        };
        let mut system = self.system.lock();
        let _ = system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map_or_else(ProcessUsage::default, |p| ProcessUsage {
                cpu_percent: p.cpu_usage(),
                memory_kib: p.memory() / 1024,
            })
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}
