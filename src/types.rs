use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Persisted OAuth token bundle. Mirrors the on-disk `token.json` layout:
/// `expiry_utc` is unix seconds so freshness checks stay timezone-free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredCredential {
    pub(crate) access_token: String,
    #[serde(default)]
    pub(crate) refresh_token: Option<String>,
    pub(crate) expiry_utc: i64,
    #[serde(default)]
    pub(crate) scopes: Vec<String>,
}

/// Google client-secret file. Desktop clients nest under "installed",
/// older console exports under "web"; accept either.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ClientSecretFile {
    #[serde(default)]
    pub(crate) installed: Option<ClientSecret>,
    #[serde(default)]
    pub(crate) web: Option<ClientSecret>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ClientSecret {
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
    #[serde(default)]
    pub(crate) auth_uri: Option<String>,
    #[serde(default)]
    pub(crate) token_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AgentMessage {
    pub(crate) role: String,
    #[serde(default)]
    pub(crate) content: Option<String>,
    #[serde(default)]
    pub(crate) tool_calls: Vec<AgentToolCall>,
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) is_error: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AgentToolCall {
    pub(crate) id: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AgentHookRequest {
    pub(crate) messages: Vec<AgentMessage>,
    pub(crate) tools: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AgentHookResponse {
    pub(crate) message: AgentMessage,
}

#[derive(Debug, Serialize)]
pub(crate) struct AgentToolResult {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) output: String,
    pub(crate) details: serde_json::Value,
    pub(crate) is_error: bool,
}

#[derive(Debug)]
pub(crate) struct ToolExecution {
    pub(crate) output: String,
    pub(crate) details: serde_json::Value,
    pub(crate) is_error: bool,
}

/// Full transcript of one briefing run, emitted with `--json`.
#[derive(Debug, Serialize)]
pub(crate) struct AgentRunOutput {
    pub(crate) context: String,
    pub(crate) messages: Vec<AgentMessage>,
    pub(crate) tool_results: Vec<AgentToolResult>,
    pub(crate) final_text: Option<String>,
    pub(crate) steps_used: usize,
    pub(crate) stop_reason: String,
}

/// Hard limits on the reasoning loop. Every iteration checks all three
/// before calling the model, so a run can never outlive its budget.
pub(crate) struct LoopBudget {
    pub(crate) max_steps: usize,
    pub(crate) deadline: Option<Instant>,
    pub(crate) cancel: Arc<AtomicBool>,
}

impl LoopBudget {
    pub(crate) fn new(max_steps: usize) -> Self {
        LoopBudget {
            max_steps,
            deadline: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub(crate) fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
