//! Tool catalog against the local filesystem.
//!
//! Every path argument is resolved against the executor's root directory and
//! must stay inside it, both after `..` components are folded away and after
//! symlinks along the existing part of the path are followed.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use tether_core::tools::{ToolError, ToolExecutor};

const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_SHELL_TIMEOUT_MS: u64 = 600_000;
const MAX_OUTPUT_BYTES: usize = 200_000;
const MAX_LIST_ENTRIES: usize = 2_000;
const DEFAULT_MAX_MATCHES: usize = 200;
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target"];

pub struct LocalToolExecutor {
    root: PathBuf,
    shell_timeout: Duration,
}

impl LocalToolExecutor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::fs::canonicalize(&root).unwrap_or_else(|_| normalize(&root));
        Self {
            root,
            shell_timeout: DEFAULT_SHELL_TIMEOUT,
        }
    }

    pub fn with_shell_timeout(mut self, timeout: Duration) -> Self {
        self.shell_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `raw` under the root, rejecting anything that lands outside it.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let path = Path::new(raw);
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let resolved = normalize(&joined);
        if !resolved.starts_with(&self.root) {
            return Err(ToolError::PathEscapesRoot(raw.to_string()));
        }
        match real_path(&resolved) {
            Some(real) if real.starts_with(&self.root) => Ok(resolved),
            _ => Err(ToolError::PathEscapesRoot(raw.to_string())),
        }
    }

    fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string_lossy().into_owned())
    }

    async fn list_files(&self, args: &Value) -> Result<Value, ToolError> {
        let dir = self.resolve(args["path"].as_str().unwrap_or("."))?;
        let recursive = args["recursive"].as_bool().unwrap_or(false);
        if !dir.is_dir() {
            return Err(ToolError::ExecutionFailed(format!(
                "not a directory: {}",
                self.display(&dir)
            )));
        }

        let root = self.root.clone();
        let walk_dir = dir.clone();
        let (entries, truncated) =
            tokio::task::spawn_blocking(move || walk(&walk_dir, &root, recursive))
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("list task failed: {e}")))?;

        Ok(json!({
            "path": self.display(&dir),
            "entries": entries,
            "truncated": truncated,
        }))
    }

    async fn read_file(&self, args: &Value) -> Result<Value, ToolError> {
        let raw = required(args, "file_path")?;
        let path = self.resolve(raw)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to read {raw}: {e}")))?;

        let offset = args["offset"].as_u64().unwrap_or(1).max(1) as usize;
        let limit = args["limit"].as_u64().map(|l| l as usize);
        let total_lines = content.lines().count();
        let selected: Vec<&str> = content
            .lines()
            .skip(offset - 1)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        let truncated = offset - 1 + selected.len() < total_lines;

        Ok(json!({
            "file_path": raw,
            "content": selected.join("\n"),
            "start_line": offset,
            "total_lines": total_lines,
            "truncated": truncated,
        }))
    }

    async fn search_files(&self, args: &Value) -> Result<Value, ToolError> {
        let base = self.resolve(args["path"].as_str().unwrap_or("."))?;
        let glob_filter = args["glob"].as_str().map(String::from);
        let max_results = args["max_results"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_MATCHES);

        let Some(pattern) = args["pattern"].as_str() else {
            // Name search only.
            let Some(glob_pattern) = glob_filter else {
                return Err(ToolError::InvalidArguments(
                    "pattern or glob is required".into(),
                ));
            };
            let full = base.join(&glob_pattern).to_string_lossy().into_owned();
            let entries = glob::glob(&full)
                .map_err(|e| ToolError::InvalidArguments(format!("invalid glob: {e}")))?;
            let mut files: Vec<String> = entries
                .flatten()
                .filter(|p| p.starts_with(&self.root))
                .map(|p| self.display(&p))
                .collect();
            files.sort();
            let truncated = files.len() > max_results;
            files.truncate(max_results);
            return Ok(json!({ "files": files, "truncated": truncated }));
        };

        let regex = regex::Regex::new(pattern)
            .map_err(|e| ToolError::InvalidArguments(format!("invalid regex: {e}")))?;
        let name_filter = match glob_filter.as_deref() {
            Some(g) => Some(
                glob::Pattern::new(g)
                    .map_err(|e| ToolError::InvalidArguments(format!("invalid glob: {e}")))?,
            ),
            None => None,
        };

        let root = self.root.clone();
        let (matches, truncated) = tokio::task::spawn_blocking(move || {
            search(&base, &root, &regex, name_filter.as_ref(), max_results)
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("search task failed: {e}")))?;

        Ok(json!({ "matches": matches, "truncated": truncated }))
    }

    async fn get_file_info(&self, args: &Value) -> Result<Value, ToolError> {
        let raw = required(args, "file_path")?;
        let path = self.resolve(raw)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(json!({ "file_path": raw, "exists": false }));
            }
            Err(e) => {
                return Err(ToolError::ExecutionFailed(format!("failed to stat {raw}: {e}")));
            }
        };
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        Ok(json!({
            "file_path": raw,
            "exists": true,
            "type": if meta.is_dir() { "directory" } else { "file" },
            "size": meta.len(),
            "modified": modified,
            "readonly": meta.permissions().readonly(),
        }))
    }

    async fn write_file(&self, args: &Value) -> Result<Value, ToolError> {
        let raw = required(args, "file_path")?;
        let content = required(args, "content")?;
        let path = self.resolve(raw)?;
        let created = !tokio::fs::try_exists(&path).await.unwrap_or(false);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("failed to create parent of {raw}: {e}")))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to write {raw}: {e}")))?;

        Ok(json!({
            "file_path": raw,
            "bytes_written": content.len(),
            "created": created,
        }))
    }

    async fn edit_file(&self, args: &Value) -> Result<Value, ToolError> {
        let raw = required(args, "file_path")?;
        let old_string = required(args, "old_string")?;
        let new_string = required(args, "new_string")?;
        let replace_all = args["replace_all"].as_bool().unwrap_or(false);
        if old_string == new_string {
            return Err(ToolError::InvalidArguments(
                "old_string and new_string must be different".into(),
            ));
        }

        let path = self.resolve(raw)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to read {raw}: {e}")))?;

        let count = content.matches(old_string).count();
        if count == 0 {
            return Err(ToolError::ExecutionFailed("old_string not found in file".into()));
        }
        if count > 1 && !replace_all {
            return Err(ToolError::ExecutionFailed(format!(
                "old_string is not unique in the file ({count} occurrences)"
            )));
        }
        let updated = if replace_all {
            content.replace(old_string, new_string)
        } else {
            content.replacen(old_string, new_string, 1)
        };

        tokio::fs::write(&path, updated)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to write {raw}: {e}")))?;

        Ok(json!({ "file_path": raw, "replacements": count }))
    }

    async fn delete_file(&self, args: &Value) -> Result<Value, ToolError> {
        let raw = required(args, "file_path")?;
        let path = self.resolve(raw)?;
        if path.is_dir() {
            return Err(ToolError::InvalidArguments(format!("{raw} is a directory")));
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to delete {raw}: {e}")))?;
        Ok(json!({ "file_path": raw, "deleted": true }))
    }

    async fn create_directory(&self, args: &Value) -> Result<Value, ToolError> {
        let raw = required(args, "dir_path")?;
        let path = self.resolve(raw)?;
        let existed = path.is_dir();
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to create {raw}: {e}")))?;
        Ok(json!({ "dir_path": raw, "created": !existed }))
    }

    async fn shell(&self, args: &Value) -> Result<Value, ToolError> {
        let command = required(args, "command")?;
        let timeout = args["timeout_ms"]
            .as_u64()
            .map(|ms| Duration::from_millis(ms.min(MAX_SHELL_TIMEOUT_MS)))
            .unwrap_or(self.shell_timeout);

        let output = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.root)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ToolError::Timeout(timeout))?
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn command: {e}")))?;

        Ok(json!({
            "exit_code": output.status.code(),
            "stdout": clip(&String::from_utf8_lossy(&output.stdout)),
            "stderr": clip(&String::from_utf8_lossy(&output.stderr)),
        }))
    }
}

#[async_trait]
impl ToolExecutor for LocalToolExecutor {
    async fn execute(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        debug!(tool, "executing tool");
        match tool {
            "list_files" => self.list_files(&args).await,
            "read_file" => self.read_file(&args).await,
            "search_files" => self.search_files(&args).await,
            "get_file_info" => self.get_file_info(&args).await,
            "write_file" => self.write_file(&args).await,
            "edit_file" => self.edit_file(&args).await,
            "delete_file" => self.delete_file(&args).await,
            "create_directory" => self.create_directory(&args).await,
            "shell" => self.shell(&args).await,
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

fn required<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args[key]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments(format!("{key} is required")))
}

/// Lexical normalization: folds `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// `path` with its deepest existing ancestor canonicalized and the
/// not-yet-created remainder appended.
fn real_path(path: &Path) -> Option<PathBuf> {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        match std::fs::canonicalize(existing) {
            Ok(mut real) => {
                for part in rest.iter().rev() {
                    real.push(part);
                }
                return Some(real);
            }
            // A dangling symlink cannot be checked.
            Err(_) if std::fs::symlink_metadata(existing).is_ok() => return None,
            Err(_) => {
                rest.push(existing.file_name()?);
                existing = existing.parent()?;
            }
        }
    }
}

fn clip(text: &str) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text.to_string();
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated: {} bytes total]", &text[..end], text.len())
}

fn relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn walk(dir: &Path, root: &Path, recursive: bool) -> (Vec<Value>, bool) {
    let mut entries = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(read) = std::fs::read_dir(&current) else {
            continue;
        };
        let mut children: Vec<_> = read.flatten().collect();
        children.sort_by_key(|e| e.file_name());
        for entry in children {
            if entries.len() >= MAX_LIST_ENTRIES {
                return (entries, true);
            }
            let path = entry.path();
            let is_dir = path.is_dir();
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(json!({
                "path": relative(&path, root),
                "type": if is_dir { "directory" } else { "file" },
                "size": size,
            }));
            let skipped = SKIPPED_DIRS.iter().any(|s| entry.file_name() == *s);
            if recursive && is_dir && !skipped {
                stack.push(path);
            }
        }
    }
    (entries, false)
}

fn search(
    base: &Path,
    root: &Path,
    regex: &regex::Regex,
    name_filter: Option<&glob::Pattern>,
    max_results: usize,
) -> (Vec<Value>, bool) {
    let mut matches = Vec::new();
    let mut stack = vec![base.to_path_buf()];
    while let Some(current) = stack.pop() {
        if current.is_file() {
            let name_ok = name_filter.map_or(true, |p| {
                current
                    .file_name()
                    .map(|n| p.matches(&n.to_string_lossy()))
                    .unwrap_or(false)
            });
            if !name_ok {
                continue;
            }
            // Binary or unreadable files are skipped.
            let Ok(content) = std::fs::read_to_string(&current) else {
                continue;
            };
            for (i, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    if matches.len() >= max_results {
                        return (matches, true);
                    }
                    matches.push(json!({
                        "file": relative(&current, root),
                        "line": i + 1,
                        "text": line.trim_end(),
                    }));
                }
            }
            continue;
        }
        let Ok(read) = std::fs::read_dir(&current) else {
            continue;
        };
        let mut children: Vec<_> = read
            .flatten()
            .filter(|e| !SKIPPED_DIRS.iter().any(|s| e.file_name() == *s))
            .map(|e| e.path())
            .collect();
        // Reverse so the stack pops in name order.
        children.sort();
        children.reverse();
        stack.extend(children);
    }
    (matches, false)
}
