use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json;

use crate::{
    agent_tool_definitions, call_claude, AgentHookRequest, AgentMessage, AgentRunOutput,
    AgentToolCall, AgentToolResult, BriefSettings, LoopBudget, ToolExecution, ToolServerHandle,
};

const MAX_CONSECUTIVE_MODEL_FAILURES: usize = 3;

pub(crate) fn build_brief_prompt(context: &str) -> String {
    format!(
        "CONTEXT DATA:\n{context}\n\n\
         INSTRUCTIONS:\n\
         1. Summarize the unread emails and upcoming calendar events into a concise briefing.\n\
         2. If a birthday or significant anniversary is noted, use 'web_search' to find gift ideas.\n\
         3. If gift ideas are found, use 'create_draft' to prepare a message for me to review.\n\
         4. Deliver the final briefing in a professional tone."
    )
}

pub(crate) fn user_message(text: String) -> AgentMessage {
    AgentMessage {
        role: "user".to_string(),
        content: Some(text),
        tool_calls: Vec::new(),
        name: None,
        tool_call_id: None,
        is_error: None,
    }
}

fn tool_message(call: &AgentToolCall, output: String, is_error: bool) -> AgentMessage {
    AgentMessage {
        role: "tool".to_string(),
        content: Some(output),
        tool_calls: Vec::new(),
        name: Some(call.name.clone()),
        tool_call_id: Some(call.id.clone()),
        is_error: is_error.then_some(true),
    }
}

/// Drives the model-call / tool-call cycle until the model stops requesting
/// tools or the budget runs out. The model and the tool router are injected
/// as closures, so tests can script both without a network.
///
/// Stop reasons: "completed", "max_steps", "deadline", "cancelled",
/// "model_failure". On any early stop the last assistant text, if any, is
/// kept as the best available output.
pub(crate) fn run_reasoning_loop(
    initial_messages: Vec<AgentMessage>,
    tools: Vec<serde_json::Value>,
    budget: &LoopBudget,
    model: &mut dyn FnMut(&AgentHookRequest) -> Result<AgentMessage, String>,
    router: &mut dyn FnMut(&str, serde_json::Value) -> Result<ToolExecution, String>,
) -> AgentRunOutput {
    let mut messages = initial_messages;
    let mut tool_results: Vec<AgentToolResult> = Vec::new();
    let mut final_text: Option<String> = None;
    let mut last_assistant_text: Option<String> = None;
    let mut consecutive_failures = 0;
    let mut step = 0;
    let stop_reason;

    loop {
        if budget.cancelled() {
            stop_reason = "cancelled";
            break;
        }
        if budget.expired() {
            eprintln!("[brief] run deadline reached after {step} step(s)");
            stop_reason = "deadline";
            break;
        }
        if step >= budget.max_steps {
            eprintln!("[brief] step budget of {} exhausted", budget.max_steps);
            stop_reason = "max_steps";
            break;
        }
        step += 1;

        let request = AgentHookRequest {
            messages: messages.clone(),
            tools: tools.clone(),
        };
        let message = match model(&request) {
            Ok(msg) => {
                consecutive_failures = 0;
                msg
            }
            Err(err) => {
                consecutive_failures += 1;
                eprintln!(
                    "[brief] model call failed ({consecutive_failures}/{MAX_CONSECUTIVE_MODEL_FAILURES}): {err}"
                );
                if consecutive_failures >= MAX_CONSECUTIVE_MODEL_FAILURES {
                    stop_reason = "model_failure";
                    break;
                }
                continue;
            }
        };

        if let Some(text) = &message.content {
            if !text.trim().is_empty() {
                last_assistant_text = Some(text.clone());
            }
        }
        let tool_calls = message.tool_calls.clone();
        messages.push(message);

        if tool_calls.is_empty() {
            final_text = last_assistant_text.clone();
            stop_reason = "completed";
            break;
        }

        for call in &tool_calls {
            eprintln!("[brief] tool call: {} {}", call.name, call.args);
            let (output, is_error) = match router(&call.name, call.args.clone()) {
                Ok(exec) => (exec.output, exec.is_error),
                Err(err) => (err, true),
            };
            tool_results.push(AgentToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                output: output.clone(),
                details: serde_json::json!({}),
                is_error,
            });
            messages.push(tool_message(call, output, is_error));
        }
    }

    if final_text.is_none() && stop_reason != "completed" {
        final_text = last_assistant_text;
    }

    AgentRunOutput {
        context: String::new(),
        messages,
        tool_results,
        final_text,
        steps_used: step,
        stop_reason: stop_reason.to_string(),
    }
}

/// Default server command: re-exec this binary in serve mode with the same
/// credential paths.
fn default_server_cmd(settings: &BriefSettings) -> Result<String, String> {
    let exe = std::env::current_exe().map_err(|e| format!("cannot locate own binary: {e}"))?;
    let parts = vec![
        exe.to_string_lossy().into_owned(),
        "serve".to_string(),
        "--token".to_string(),
        settings.token_path.to_string_lossy().into_owned(),
        "--client-secret".to_string(),
        settings.client_secret_path.to_string_lossy().into_owned(),
    ];
    Ok(shlex::try_join(parts.iter().map(String::as_str))
        .map_err(|e| format!("cannot build server command: {e}"))?)
}

pub(crate) fn run_brief(settings: BriefSettings) -> Result<(), Box<dyn std::error::Error>> {
    let server_cmd = match settings.server_cmd.clone() {
        Some(cmd) => cmd,
        None => default_server_cmd(&settings)?,
    };
    eprintln!("[brief] spawning tool server: {server_cmd}");
    let mut server = ToolServerHandle::spawn(&server_cmd, settings.tool_timeout_secs)?;
    if !server.has_tool("get_morning_status") {
        server.shutdown();
        return Err("tool server does not expose get_morning_status".into());
    }

    eprintln!("[brief] gathering morning context for {}", settings.city);
    let status = server
        .call_tool(
            "get_morning_status",
            serde_json::json!({ "city": settings.city }),
        )
        .map_err(|e| format!("morning status failed: {e}"))?;
    let context = status.output;

    let budget = LoopBudget {
        max_steps: settings.max_steps,
        deadline: settings
            .deadline_secs
            .filter(|secs| *secs > 0)
            .map(|secs| Instant::now() + Duration::from_secs(secs)),
        cancel: Arc::new(AtomicBool::new(false)),
    };
    let prompt = build_brief_prompt(&context);
    let tools = agent_tool_definitions();

    let mut model = |request: &AgentHookRequest| {
        call_claude(request)
            .map(|resp| resp.message)
            .map_err(|e| e.to_string())
    };
    let mut router =
        |name: &str, args: serde_json::Value| server.call_tool(name, args);

    let mut output = run_reasoning_loop(
        vec![user_message(prompt)],
        tools,
        &budget,
        &mut model,
        &mut router,
    );
    output.context = context;
    drop(router);
    server.shutdown();

    if output.stop_reason == "model_failure" {
        return Err(format!(
            "model failed {MAX_CONSECUTIVE_MODEL_FAILURES} times in a row; no briefing produced"
        )
        .into());
    }
    if output.stop_reason != "completed" {
        eprintln!(
            "[brief] run ended early ({}); printing best available text",
            output.stop_reason
        );
    }

    let text = output
        .final_text
        .clone()
        .unwrap_or_else(|| "(no briefing text produced)".to_string());
    println!("\n{} FINAL BRIEFING {}\n", "=".repeat(20), "=".repeat(20));
    println!("{}", text.trim());
    println!("\n{}", "=".repeat(56));

    if settings.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────
