use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use tether_core::protocol::{ClientMessage, ServerMessage};
use tether_core::tools::ToolExecutor;

use crate::prompt::ApprovalPrompt;

/// Local end of the tool channel.
///
/// Turns `tool_request` into `tool_result`/`tool_error` and `approval_request`
/// into `approval`, always echoing the server's `request_id`. An approval
/// request never runs the tool itself; the server sends a fresh
/// `tool_request` once consent is recorded.
pub struct ExecutorAdapter {
    tools: Arc<dyn ToolExecutor>,
    prompt: Arc<dyn ApprovalPrompt>,
    // One prompt on the terminal at a time.
    prompt_lock: Mutex<()>,
}

impl ExecutorAdapter {
    pub fn new(tools: Arc<dyn ToolExecutor>, prompt: Arc<dyn ApprovalPrompt>) -> Self {
        Self {
            tools,
            prompt,
            prompt_lock: Mutex::new(()),
        }
    }

    /// The reply owed for `message`, if any.
    pub async fn handle(&self, message: &ServerMessage) -> Option<ClientMessage> {
        match message {
            ServerMessage::ToolRequest {
                request_id,
                tool,
                args,
            } => {
                let reply = match self.tools.execute(tool, args.clone()).await {
                    Ok(result) => ClientMessage::ToolResult {
                        request_id: request_id.clone(),
                        result,
                    },
                    Err(e) => {
                        warn!(request_id = %request_id, tool, error = %e, "tool failed");
                        ClientMessage::ToolError {
                            request_id: request_id.clone(),
                            error: e.to_string(),
                        }
                    }
                };
                Some(reply)
            }
            ServerMessage::ApprovalRequest {
                request_id,
                tool,
                args,
                description,
            } => {
                let _guard = self.prompt_lock.lock().await;
                let approved = match self.prompt.confirm(tool, args, description).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!(request_id = %request_id, error = %e, "approval prompt failed, denying");
                        false
                    }
                };
                info!(request_id = %request_id, tool, approved, "approval decided");
                Some(ClientMessage::Approval {
                    request_id: request_id.clone(),
                    approved,
                })
            }
            _ => None,
        }
    }
}
