use std::time::Duration;

use serde::{Deserialize, Serialize};

use tether_core::tools::{category, ToolCategory};

use crate::approval::ApprovalGate;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Read, list, search, info and create_directory requests.
    pub read_timeout_secs: u64,
    /// write_file, edit_file, delete_file and unknown tools.
    pub write_timeout_secs: u64,
    pub shell_timeout_secs: u64,
    pub approval_timeout_secs: u64,
    pub shell_requires_approval: bool,
    /// How long a paused job stays resumable.
    pub resume_retention_secs: u64,
    pub expiry_tick_ms: u64,
    /// Interval of the paused-job expiry sweep.
    pub maintenance_interval_secs: u64,
    pub event_queue: usize,
    pub outbound_queue: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 30,
            write_timeout_secs: 60,
            shell_timeout_secs: 300,
            approval_timeout_secs: 300,
            shell_requires_approval: true,
            resume_retention_secs: 24 * 60 * 60,
            expiry_tick_ms: 500,
            maintenance_interval_secs: 60,
            event_queue: 256,
            outbound_queue: 1024,
        }
    }
}

impl ControllerConfig {
    pub fn timeout_for(&self, tool: &str) -> Duration {
        let secs = match category(tool) {
            ToolCategory::ReadOnly | ToolCategory::Directory => self.read_timeout_secs,
            ToolCategory::Mutating | ToolCategory::Unknown => self.write_timeout_secs,
            ToolCategory::Shell => self.shell_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn resume_retention(&self) -> Duration {
        Duration::from_secs(self.resume_retention_secs)
    }

    pub fn expiry_tick(&self) -> Duration {
        Duration::from_millis(self.expiry_tick_ms.max(10))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    pub fn gate(&self) -> ApprovalGate {
        ApprovalGate {
            shell_requires_approval: self.shell_requires_approval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_by_category() {
        let c = ControllerConfig::default();
        assert_eq!(c.timeout_for("read_file"), Duration::from_secs(30));
        assert_eq!(c.timeout_for("create_directory"), Duration::from_secs(30));
        assert_eq!(c.timeout_for("write_file"), Duration::from_secs(60));
        assert_eq!(c.timeout_for("shell"), Duration::from_secs(300));
        assert_eq!(c.approval_timeout(), Duration::from_secs(300));
        assert_eq!(c.resume_retention(), Duration::from_secs(86_400));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c: ControllerConfig =
            serde_json::from_str(r#"{"shell_timeout_secs": 900, "shell_requires_approval": false}"#).unwrap();
        assert_eq!(c.shell_timeout_secs, 900);
        assert!(!c.gate().shell_requires_approval);
        assert_eq!(c.read_timeout_secs, 30);
    }
}
