use std::thread;
use std::time::Duration;

use serde_json;

use crate::{
    env_f64, env_optional, env_required, env_u64, env_usize, jitter_ratio, parse_retry_after,
    AgentHookRequest, AgentHookResponse, AgentMessage, AgentToolCall,
};

pub(crate) fn collect_system_blocks(messages: &[AgentMessage]) -> Vec<String> {
    let mut blocks = Vec::new();
    for msg in messages {
        if msg.role == "system" {
            if let Some(content) = &msg.content {
                if !content.trim().is_empty() {
                    blocks.push(content.trim().to_string());
                }
            }
        }
    }
    blocks
}

/// Maps the crate's message model onto Anthropic content blocks. Tool-role
/// messages become user-role `tool_result` blocks, which is how the Messages
/// API threads observations back to the model.
pub(crate) fn to_anthropic_messages(messages: &[AgentMessage]) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    for msg in messages {
        match msg.role.as_str() {
            "system" => continue,
            "user" => {
                let content = msg.content.clone().unwrap_or_default();
                out.push(serde_json::json!({
                    "role": "user",
                    "content": [{"type": "text", "text": content}]
                }));
            }
            "assistant" => {
                let mut blocks = Vec::new();
                if let Some(content) = &msg.content {
                    if !content.is_empty() {
                        blocks.push(serde_json::json!({"type": "text", "text": content}));
                    }
                }
                for call in &msg.tool_calls {
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": call.id.clone(),
                        "name": call.name.clone(),
                        "input": call.args.clone()
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(serde_json::json!({"type": "text", "text": ""}));
                }
                out.push(serde_json::json!({"role": "assistant", "content": blocks}));
            }
            "tool" => {
                let Some(tool_id) = msg.tool_call_id.clone() else {
                    continue;
                };
                let mut block = serde_json::Map::new();
                block.insert("type".to_string(), serde_json::json!("tool_result"));
                block.insert("tool_use_id".to_string(), serde_json::json!(tool_id));
                block.insert(
                    "content".to_string(),
                    serde_json::json!(msg.content.clone().unwrap_or_default()),
                );
                if msg.is_error.unwrap_or(false) {
                    block.insert("is_error".to_string(), serde_json::json!(true));
                }
                out.push(serde_json::json!({
                    "role": "user",
                    "content": [serde_json::Value::Object(block)]
                }));
            }
            _ => {}
        }
    }
    out
}

pub(crate) fn to_anthropic_tools(tools: &[serde_json::Value]) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    for tool in tools {
        let Some(obj) = tool.as_object() else {
            continue;
        };
        let Some(name) = obj.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        let mut entry = serde_json::Map::new();
        entry.insert("name".to_string(), serde_json::json!(name));
        if let Some(desc) = obj.get("description").and_then(|v| v.as_str()) {
            entry.insert("description".to_string(), serde_json::json!(desc));
        }
        if let Some(schema) = obj.get("inputSchema").or_else(|| obj.get("input_schema")) {
            entry.insert("input_schema".to_string(), schema.clone());
        }
        out.push(serde_json::Value::Object(entry));
    }
    out
}

pub(crate) fn parse_claude_response(
    payload: &serde_json::Value,
) -> Result<AgentHookResponse, Box<dyn std::error::Error>> {
    let content = payload
        .get("content")
        .and_then(|v| v.as_array())
        .ok_or("Claude response missing content")?;
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in content {
        let btype = block.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match btype {
            "text" => {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        text_parts.push(text.to_string());
                    }
                }
            }
            "tool_use" => {
                let id = block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let args = block
                    .get("input")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({}));
                tool_calls.push(AgentToolCall { id, name, args });
            }
            _ => {}
        }
    }

    let content_text = if text_parts.is_empty() {
        None
    } else {
        Some(text_parts.join("\n"))
    };

    Ok(AgentHookResponse {
        message: AgentMessage {
            role: "assistant".to_string(),
            content: content_text,
            tool_calls,
            name: None,
            tool_call_id: None,
            is_error: None,
        },
    })
}

pub(crate) fn call_claude(
    request: &AgentHookRequest,
) -> Result<AgentHookResponse, Box<dyn std::error::Error>> {
    let api_key = env_required("ANTHROPIC_API_KEY")?;
    let model = env_required("ANTHROPIC_MODEL")?;
    let base_url = env_optional("ANTHROPIC_BASE_URL")
        .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".to_string());
    let max_tokens = env_u64("ANTHROPIC_MAX_TOKENS", 4096)?;
    let timeout = env_u64("ANTHROPIC_TIMEOUT", 120)?;
    let max_retries = env_usize("ANTHROPIC_MAX_RETRIES", 2)?;
    let retry_base = env_f64("ANTHROPIC_RETRY_BASE", 0.5)?;
    let retry_max = env_f64("ANTHROPIC_RETRY_MAX", 4.0)?;
    let version = env_optional("ANTHROPIC_VERSION").unwrap_or_else(|| "2023-06-01".to_string());

    let mut payload = serde_json::json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": to_anthropic_messages(&request.messages),
    });
    let system_blocks = collect_system_blocks(&request.messages);
    if !system_blocks.is_empty() {
        payload["system"] = serde_json::json!(system_blocks.join("\n\n"));
    }
    let tools = to_anthropic_tools(&request.tools);
    if !tools.is_empty() {
        payload["tools"] = serde_json::json!(tools);
    }

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(timeout))
        .timeout_read(Duration::from_secs(timeout))
        .timeout_write(Duration::from_secs(timeout))
        .build();

    let retryable = |status: u16| matches!(status, 429 | 500 | 502 | 503 | 504 | 529);
    let mut body = None;
    let mut last_error = String::new();

    for attempt in 0..=max_retries {
        let response = agent
            .post(&base_url)
            .set("content-type", "application/json")
            .set("x-api-key", &api_key)
            .set("anthropic-version", &version)
            .send_json(payload.clone());
        match response {
            Ok(resp) => {
                body = Some(resp.into_string()?);
                break;
            }
            Err(ureq::Error::Status(code, resp)) => {
                let retry_after = parse_retry_after(&resp);
                let text = resp.into_string().unwrap_or_default();
                last_error = format!("{code} {text}");
                if attempt < max_retries && retryable(code) {
                    let mut delay = (retry_base * 2.0_f64.powi(attempt as i32)).min(retry_max);
                    if let Some(retry_after) = retry_after {
                        delay = delay.max(retry_after);
                    }
                    delay *= 1.0 + jitter_ratio() * 0.2;
                    eprintln!("[claude] {code}, retrying in {delay:.1}s");
                    thread::sleep(Duration::from_secs_f64(delay));
                    continue;
                }
                break;
            }
            Err(ureq::Error::Transport(err)) => {
                last_error = err.to_string();
                if attempt < max_retries {
                    let mut delay = (retry_base * 2.0_f64.powi(attempt as i32)).min(retry_max);
                    delay *= 1.0 + jitter_ratio() * 0.2;
                    eprintln!("[claude] transport error, retrying in {delay:.1}s");
                    thread::sleep(Duration::from_secs_f64(delay));
                    continue;
                }
                break;
            }
        }
    }

    let body = body.ok_or_else(|| format!("Claude API failed after retries: {last_error}"))?;
    let payload: serde_json::Value = serde_json::from_str(&body)?;
    parse_claude_response(&payload)
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(block: &serde_json::Value) -> &str {
        block.get("text").and_then(|t| t.as_str()).unwrap()
    }

    #[test]
    fn test_to_anthropic_messages_roles() {
        let messages = vec![
            AgentMessage {
                role: "system".to_string(),
                content: Some("be brief".to_string()),
                tool_calls: Vec::new(),
                name: None,
                tool_call_id: None,
                is_error: None,
            },
            AgentMessage {
                role: "user".to_string(),
                content: Some("CONTEXT DATA: ...".to_string()),
                tool_calls: Vec::new(),
                name: None,
                tool_call_id: None,
                is_error: None,
            },
            AgentMessage {
                role: "assistant".to_string(),
                content: Some("Searching now.".to_string()),
                tool_calls: vec![AgentToolCall {
                    id: "tu_1".to_string(),
                    name: "web_search".to_string(),
                    args: serde_json::json!({"query": "gift ideas"}),
                }],
                name: None,
                tool_call_id: None,
                is_error: None,
            },
            AgentMessage {
                role: "tool".to_string(),
                content: Some("Flowers: A classic choice".to_string()),
                tool_calls: Vec::new(),
                name: Some("web_search".to_string()),
                tool_call_id: Some("tu_1".to_string()),
                is_error: None,
            },
        ];
        let wire = to_anthropic_messages(&messages);
        // System messages go into the top-level system field, not the array.
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(text_of(&wire[0]["content"][0]), "CONTEXT DATA: ...");

        let blocks = wire[1]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1]["type"], "tool_use");
        assert_eq!(blocks[1]["id"], "tu_1");
        assert_eq!(blocks[1]["input"]["query"], "gift ideas");

        assert_eq!(wire[2]["role"], "user");
        let result_block = &wire[2]["content"][0];
        assert_eq!(result_block["type"], "tool_result");
        assert_eq!(result_block["tool_use_id"], "tu_1");
        assert_eq!(result_block["content"], "Flowers: A classic choice");
        assert!(result_block.get("is_error").is_none());
    }

    #[test]
    fn test_tool_result_carries_error_flag() {
        let messages = vec![AgentMessage {
            role: "tool".to_string(),
            content: Some("tool server error -32602: Unknown tool: x".to_string()),
            tool_calls: Vec::new(),
            name: Some("x".to_string()),
            tool_call_id: Some("tu_9".to_string()),
            is_error: Some(true),
        }];
        let wire = to_anthropic_messages(&messages);
        assert_eq!(wire[0]["content"][0]["is_error"], true);
    }

    #[test]
    fn test_tool_message_without_id_is_dropped() {
        let messages = vec![AgentMessage {
            role: "tool".to_string(),
            content: Some("orphan".to_string()),
            tool_calls: Vec::new(),
            name: None,
            tool_call_id: None,
            is_error: None,
        }];
        assert!(to_anthropic_messages(&messages).is_empty());
    }

    #[test]
    fn test_to_anthropic_tools_renames_schema_key() {
        let tools = vec![serde_json::json!({
            "name": "web_search",
            "description": "search the web",
            "inputSchema": {"type": "object", "properties": {"query": {"type": "string"}}}
        })];
        let wire = to_anthropic_tools(&tools);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["name"], "web_search");
        assert!(wire[0].get("inputSchema").is_none());
        assert_eq!(wire[0]["input_schema"]["type"], "object");
    }

    #[test]
    fn test_parse_claude_response_text_and_tool_use() {
        let payload = serde_json::json!({
            "content": [
                {"type": "text", "text": "Looking for gift ideas."},
                {"type": "tool_use", "id": "tu_2", "name": "web_search",
                 "input": {"query": "birthday gift ideas for mom"}}
            ]
        });
        let resp = parse_claude_response(&payload).unwrap();
        assert_eq!(resp.message.role, "assistant");
        assert_eq!(resp.message.content.as_deref(), Some("Looking for gift ideas."));
        assert_eq!(resp.message.tool_calls.len(), 1);
        assert_eq!(resp.message.tool_calls[0].name, "web_search");

        let missing = serde_json::json!({"type": "error"});
        assert!(parse_claude_response(&missing).is_err());
    }

    #[test]
    fn test_collect_system_blocks_skips_blank() {
        let messages = vec![
            AgentMessage {
                role: "system".to_string(),
                content: Some("  ".to_string()),
                tool_calls: Vec::new(),
                name: None,
                tool_call_id: None,
                is_error: None,
            },
            AgentMessage {
                role: "system".to_string(),
                content: Some("stay professional".to_string()),
                tool_calls: Vec::new(),
                name: None,
                tool_call_id: None,
                is_error: None,
            },
        ];
        assert_eq!(collect_system_blocks(&messages), vec!["stay professional"]);
    }
}
