use std::io::{BufRead, Write};

use async_trait::async_trait;
use serde_json::Value;

/// Asks the local user whether a destructive operation may run.
#[async_trait]
pub trait ApprovalPrompt: Send + Sync {
    async fn confirm(&self, tool: &str, args: &Value, description: &str) -> std::io::Result<bool>;
}

pub struct AutoApprove;

#[async_trait]
impl ApprovalPrompt for AutoApprove {
    async fn confirm(&self, _tool: &str, _args: &Value, _description: &str) -> std::io::Result<bool> {
        Ok(true)
    }
}

pub struct DenyAll;

#[async_trait]
impl ApprovalPrompt for DenyAll {
    async fn confirm(&self, _tool: &str, _args: &Value, _description: &str) -> std::io::Result<bool> {
        Ok(false)
    }
}

/// Interactive `[y/N]` prompt on the terminal.
pub struct StdinPrompt;

#[async_trait]
impl ApprovalPrompt for StdinPrompt {
    async fn confirm(&self, _tool: &str, _args: &Value, description: &str) -> std::io::Result<bool> {
        let description = description.to_string();
        tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            write!(stderr, "Approve? {description} [y/N] ")?;
            stderr.flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(is_yes(&line))
        })
        .await
        .map_err(std::io::Error::other)?
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fixed_answers() {
        let args = json!({"file_path": "a"});
        assert!(AutoApprove.confirm("write_file", &args, "Write file: a").await.unwrap());
        assert!(!DenyAll.confirm("write_file", &args, "Write file: a").await.unwrap());
    }

    #[test]
    fn yes_parsing() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("nope"));
    }
}
