use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool families, used for approval policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// list_files, read_file, search_files, get_file_info.
    ReadOnly,
    /// write_file, edit_file, delete_file.
    Mutating,
    /// create_directory.
    Directory,
    Shell,
    Unknown,
}

pub const READ_ONLY_TOOLS: &[&str] = &["list_files", "read_file", "search_files", "get_file_info"];
pub const MUTATING_TOOLS: &[&str] = &["write_file", "edit_file", "delete_file"];

pub fn category(tool: &str) -> ToolCategory {
    if READ_ONLY_TOOLS.contains(&tool) {
        ToolCategory::ReadOnly
    } else if MUTATING_TOOLS.contains(&tool) {
        ToolCategory::Mutating
    } else if tool == "create_directory" {
        ToolCategory::Directory
    } else if tool == "shell" {
        ToolCategory::Shell
    } else {
        ToolCategory::Unknown
    }
}

/// A tool invocation as planned by the reasoning side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }

    pub fn category(&self) -> ToolCategory {
        category(&self.tool)
    }

    pub fn describe(&self) -> String {
        describe(&self.tool, &self.args)
    }
}

/// One-line human description shown in approval prompts.
pub fn describe(tool: &str, args: &Value) -> String {
    let arg = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or("?");
    match tool {
        "write_file" => format!("Write file: {}", arg("file_path")),
        "edit_file" => format!("Edit file: {}", arg("file_path")),
        "delete_file" => format!("Delete file: {}", arg("file_path")),
        "create_directory" => format!("Create directory: {}", arg("dir_path")),
        "shell" => format!("Run command: {}", arg("command")),
        other => format!("Execute {other}"),
    }
}

/// Runs tools on the executor side of the wire.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool: &str, args: Value) -> Result<Value, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("path escapes working directory: {0}")]
    PathEscapesRoot(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}
