use std::collections::HashSet;

use serde_json;

/// Names of the tools the reasoning loop may call directly. Context gathering
/// happens once up front, so the read-only providers stay out of this set.
pub(crate) const AGENT_TOOL_NAMES: [&str; 2] = ["web_search", "create_draft"];

pub(crate) fn tool_definitions_json() -> Vec<serde_json::Value> {
    vec![
        serde_json::json!({
            "name": "get_weather",
            "description": "Fetches a real-time weather summary for a specified city.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "city": { "type": "string", "description": "City name, e.g. 'San Francisco'" }
                },
                "required": []
            }
        }),
        serde_json::json!({
            "name": "get_unread_emails",
            "description": "Summarizes recent unread Gmail messages from the inbox.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "description": "Maximum messages to summarize" }
                },
                "required": []
            }
        }),
        serde_json::json!({
            "name": "get_calendar_events",
            "description": "Lists upcoming appointments and birthdays from the primary calendar.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "description": "Maximum events to list" }
                },
                "required": []
            }
        }),
        serde_json::json!({
            "name": "web_search",
            "description": "Performs a web search for research, gift ideas, or information synthesis.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string" }
                },
                "required": ["query"]
            }
        }),
        serde_json::json!({
            "name": "create_draft",
            "description": "Creates a new Gmail draft addressed to the account owner for review.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "subject": { "type": "string" },
                    "body": { "type": "string" }
                },
                "required": ["subject", "body"]
            }
        }),
        serde_json::json!({
            "name": "get_morning_status",
            "description": "Gathers weather, unread mail, and calendar context in one parallel call.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "city": { "type": "string", "description": "City for the weather section" }
                },
                "required": []
            }
        }),
    ]
}

/// Subset of the catalog exposed to the model during a briefing run.
pub(crate) fn agent_tool_definitions() -> Vec<serde_json::Value> {
    let bound: HashSet<&str> = AGENT_TOOL_NAMES.into_iter().collect();
    tool_definitions_json()
        .into_iter()
        .filter(|tool| {
            tool.get("name")
                .and_then(|n| n.as_str())
                .map(|n| bound.contains(n))
                .unwrap_or(false)
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────────────
