use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{execute_tool, tool_definitions_json, CredentialStore, ToolExecution};

pub(crate) const MAX_RPC_BYTES: usize = 10 * 1024 * 1024;

// ── Wire framing ─────────────────────────────────────────────────────────

/// Reads one JSON-RPC message. Framed messages carry a Content-Length header;
/// a bare JSON line (newline-delimited clients) is accepted as a fallback.
/// Returns None on a clean end of stream.
pub(crate) fn read_rpc_message(
    reader: &mut BufReader<impl Read>,
) -> io::Result<Option<serde_json::Value>> {
    let mut first_line = String::new();
    if reader.read_line(&mut first_line)? == 0 {
        return Ok(None);
    }
    if first_line.trim().is_empty() {
        return Ok(None);
    }

    if first_line.to_ascii_lowercase().starts_with("content-length:") {
        let mut content_length = first_line
            .split(':')
            .nth(1)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);

        // Read remaining headers
        loop {
            let mut line = String::new();
            reader.read_line(&mut line)?;
            if line == "\r\n" || line == "\n" || line.is_empty() {
                break;
            }
            if line.to_ascii_lowercase().starts_with("content-length:") {
                content_length = line
                    .split(':')
                    .nth(1)
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(content_length);
            }
        }

        if content_length == 0 {
            return Ok(None);
        }
        if content_length > MAX_RPC_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message too large ({content_length} bytes)"),
            ));
        }
        let mut buffer = vec![0u8; content_length];
        reader.read_exact(&mut buffer)?;
        let value = serde_json::from_slice(&buffer).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("invalid json: {e}"))
        })?;
        Ok(Some(value))
    } else {
        let value = serde_json::from_str(first_line.trim()).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("invalid json: {e}"))
        })?;
        Ok(Some(value))
    }
}

pub(crate) fn write_rpc_message(
    writer: &mut impl Write,
    value: &serde_json::Value,
) -> io::Result<()> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e}")))?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()
}

// ── Server loop ──────────────────────────────────────────────────────────

pub(crate) struct ServerOutcome {
    pub(crate) reply: Option<serde_json::Value>,
    pub(crate) quit: bool,
}

/// Routes one request. Tool traffic is rejected with -32002 until the client
/// has completed the initialize handshake; a tool name outside the catalog is
/// a protocol error (-32602), never a tool payload.
pub(crate) fn dispatch_request(
    msg: &serde_json::Value,
    initialized: &mut bool,
    tools: &[serde_json::Value],
    store: &Arc<CredentialStore>,
) -> ServerOutcome {
    let id = msg.get("id").cloned();
    let has_id = id.as_ref().is_some_and(|v| !v.is_null());
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let params = msg
        .get("params")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    let response = match method {
        "initialize" => {
            *initialized = true;
            let protocol = params
                .get("protocolVersion")
                .and_then(|v| v.as_str())
                .unwrap_or("0.1");
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": protocol,
                    "capabilities": {
                        "tools": {
                            "list": true,
                            "call": true
                        }
                    },
                    "serverInfo": {
                        "name": "daybrief",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }
            })
        }
        "tools/list" | "tools/call" if !*initialized => serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32002, "message": "server not initialized" }
        }),
        "tools/list" => serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "tools": tools }
        }),
        "tools/call" => {
            let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            match execute_tool(name, arguments, store) {
                Ok(result) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [
                            { "type": "text", "text": result.output }
                        ],
                        "details": result.details,
                        "isError": result.is_error
                    }
                }),
                Err(err) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32602, "message": err.to_string() }
                }),
            }
        }
        "shutdown" => {
            return ServerOutcome {
                reply: Some(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": null
                })),
                quit: true,
            };
        }
        _ => {
            if !has_id {
                return ServerOutcome { reply: None, quit: false };
            }
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "method not found" }
            })
        }
    };

    let reply = if has_id || method == "initialize" || method == "tools/list" || method == "tools/call"
    {
        Some(response)
    } else {
        None
    };
    ServerOutcome { reply, quit: false }
}

pub(crate) fn run_tool_server(
    token_path: PathBuf,
    client_secret_path: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut reader = BufReader::new(io::stdin());
    let mut writer = io::stdout();
    let tools = tool_definitions_json();
    let store = Arc::new(CredentialStore::new(token_path, client_secret_path));
    let mut initialized = false;
    eprintln!("[serve] tool server ready on stdio ({} tools)", tools.len());

    loop {
        let Some(msg) = read_rpc_message(&mut reader)? else {
            break;
        };
        let outcome = dispatch_request(&msg, &mut initialized, &tools, &store);
        if let Some(reply) = outcome.reply {
            write_rpc_message(&mut writer, &reply)?;
        }
        if outcome.quit {
            break;
        }
    }

    Ok(())
}

// ── Client handle ────────────────────────────────────────────────────────

/// One spawned tool-server process. A dedicated reader thread feeds parsed
/// messages through a channel, so every read can carry a timeout without
/// tearing down the pipe.
pub(crate) struct ToolServerHandle {
    stdin: std::process::ChildStdin,
    incoming: mpsc::Receiver<Result<serde_json::Value, String>>,
    child: std::process::Child,
    next_id: i64,
    timeout_secs: u64,
    alive: bool,
    /// Tools discovered from the server at spawn time
    pub(crate) tools: Vec<serde_json::Value>,
}

impl ToolServerHandle {
    /// Spawn the server, run the initialize handshake, and discover tools.
    pub(crate) fn spawn(command: &str, timeout_secs: u64) -> Result<Self, String> {
        let cmd_parts =
            shlex::split(command).ok_or_else(|| "tool server: malformed command".to_string())?;
        if cmd_parts.is_empty() {
            return Err("tool server: empty command".to_string());
        }

        let mut cmd = super::build_external_command(&cmd_parts[0], &cmd_parts[1..]);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| format!("tool server spawn: {e}"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "tool server: no stdin".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "tool server: no stdout".to_string())?;

        // Drain stderr in background to prevent pipe buffer deadlock and
        // surface server diagnostics.
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines().flatten() {
                    eprintln!("[tool-server:stderr] {line}");
                }
            });
        }

        let (tx, incoming) = mpsc::channel();
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                match read_rpc_message(&mut reader) {
                    Ok(Some(msg)) => {
                        if tx.send(Ok(msg)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(Err(
                            "tool server closed the stream (process likely exited)".to_string(),
                        ));
                        break;
                    }
                    Err(err) => {
                        let _ = tx.send(Err(format!("tool server read: {err}")));
                        break;
                    }
                }
            }
        });

        let mut handle = ToolServerHandle {
            stdin,
            incoming,
            child,
            next_id: 1,
            timeout_secs,
            alive: true,
            tools: Vec::new(),
        };

        // Initialize handshake
        handle.send_msg(&serde_json::json!({
            "jsonrpc": "2.0", "id": handle.next_id, "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "daybrief", "version": env!("CARGO_PKG_VERSION") }
            }
        }))?;
        handle.next_id += 1;

        let init_resp = handle.read_msg()?;
        if let Some(err) = init_resp.get("error") {
            let msg = err.get("message").and_then(|m| m.as_str()).unwrap_or("unknown");
            handle.shutdown();
            return Err(format!("tool server initialize failed: {msg}"));
        }

        handle.send_msg(&serde_json::json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        }))?;

        // Discover tools
        handle.send_msg(&serde_json::json!({
            "jsonrpc": "2.0", "id": handle.next_id, "method": "tools/list"
        }))?;
        handle.next_id += 1;

        let list_resp = handle.read_msg()?;
        if let Some(err) = list_resp.get("error") {
            let msg = err.get("message").and_then(|m| m.as_str()).unwrap_or("unknown");
            eprintln!("[mcp] tools/list failed: {msg}");
        } else if let Some(tools_arr) = list_resp
            .get("result")
            .and_then(|r| r.get("tools"))
            .and_then(|t| t.as_array())
        {
            handle.tools = tools_arr.clone();
            eprintln!("[mcp] discovered {} tools", handle.tools.len());
        }

        Ok(handle)
    }

    pub(crate) fn has_tool(&self, name: &str) -> bool {
        self.tools
            .iter()
            .any(|tool| tool.get("name").and_then(|n| n.as_str()) == Some(name))
    }

    pub(crate) fn call_tool(
        &mut self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<ToolExecution, String> {
        let call_id = self.next_id;
        self.send_msg(&serde_json::json!({
            "jsonrpc": "2.0", "id": call_id, "method": "tools/call",
            "params": { "name": name, "arguments": args }
        }))?;
        self.next_id += 1;

        // Read the matching response, skipping any asynchronous notifications
        let resp = loop {
            let msg = self.read_msg()?;
            if msg.get("id").is_none() {
                let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("unknown");
                eprintln!("[mcp] skipping notification: {method}");
                continue;
            }
            if let Some(resp_id) = msg.get("id").and_then(|v| v.as_i64()) {
                if resp_id != call_id {
                    return Err(format!(
                        "tool server response id mismatch (expected {call_id}, got {resp_id})"
                    ));
                }
            }
            break msg;
        };

        extract_tool_result(&resp)
    }

    pub(crate) fn shutdown(&mut self) {
        if !self.alive {
            return;
        }
        self.alive = false;
        let _ = self.send_msg(&serde_json::json!({
            "jsonrpc": "2.0", "id": self.next_id, "method": "shutdown"
        }));
        // Brief pause for graceful exit, then kill the process group
        thread::sleep(Duration::from_millis(500));
        super::kill_process_tree(&mut self.child);
    }

    fn send_msg(&mut self, msg: &serde_json::Value) -> Result<(), String> {
        let body = serde_json::to_string(msg).map_err(|e| e.to_string())?;
        write!(self.stdin, "Content-Length: {}\r\n\r\n{}", body.len(), body)
            .map_err(|e| format!("tool server write: {e}"))?;
        self.stdin
            .flush()
            .map_err(|e| format!("tool server flush: {e}"))
    }

    fn read_msg(&mut self) -> Result<serde_json::Value, String> {
        match self.incoming.recv_timeout(Duration::from_secs(self.timeout_secs)) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(format!(
                "tool server did not respond within {}s",
                self.timeout_secs
            )),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err("tool server stream ended".to_string())
            }
        }
    }
}

impl Drop for ToolServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pulls the text payload out of a tools/call response envelope.
pub(crate) fn extract_tool_result(resp: &serde_json::Value) -> Result<ToolExecution, String> {
    if let Some(err) = resp.get("error") {
        let msg = err.get("message").and_then(|m| m.as_str()).unwrap_or("unknown");
        let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
        return Err(format!("tool server error {code}: {msg}"));
    }
    let result = resp
        .get("result")
        .cloned()
        .ok_or_else(|| "tool server response missing 'result'".to_string())?;
    let content_text = match result.get("content").and_then(|c| c.as_array()) {
        Some(arr) => {
            let text_parts: Vec<&str> = arr
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect();
            if text_parts.is_empty() {
                serde_json::to_string_pretty(&result).unwrap_or_default()
            } else {
                text_parts.join("\n")
            }
        }
        None => serde_json::to_string_pretty(&result).unwrap_or_default(),
    };
    let is_error = result.get("isError").and_then(|v| v.as_bool()).unwrap_or(false);

    Ok(ToolExecution {
        output: content_text,
        details: result,
        is_error,
    })
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_store() -> Arc<CredentialStore> {
        let dir = std::env::temp_dir().join("daybrief_test_absent");
        Arc::new(CredentialStore::new(
            dir.join("token.json"),
            dir.join("credentials.json"),
        ))
    }

    fn dispatch(
        msg: serde_json::Value,
        initialized: &mut bool,
        store: &Arc<CredentialStore>,
    ) -> ServerOutcome {
        let tools = tool_definitions_json();
        dispatch_request(&msg, initialized, &tools, store)
    }

    #[test]
    fn test_framing_roundtrip() {
        let msg = serde_json::json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"});
        let mut buf = Vec::new();
        write_rpc_message(&mut buf, &msg).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("Content-Length: "));
        assert!(text.contains("\r\n\r\n"));

        let mut reader = BufReader::new(Cursor::new(buf));
        let back = read_rpc_message(&mut reader).unwrap().unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_framing_two_messages_back_to_back() {
        let first = serde_json::json!({"id": 1});
        let second = serde_json::json!({"id": 2});
        let mut buf = Vec::new();
        write_rpc_message(&mut buf, &first).unwrap();
        write_rpc_message(&mut buf, &second).unwrap();

        let mut reader = BufReader::new(Cursor::new(buf));
        assert_eq!(read_rpc_message(&mut reader).unwrap().unwrap(), first);
        assert_eq!(read_rpc_message(&mut reader).unwrap().unwrap(), second);
        assert!(read_rpc_message(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_framing_bare_json_line_fallback() {
        let data = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\"}\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(data));
        let msg = read_rpc_message(&mut reader).unwrap().unwrap();
        assert_eq!(msg.get("method").and_then(|m| m.as_str()), Some("initialize"));
    }

    #[test]
    fn test_framing_rejects_oversized_message() {
        let data = format!("Content-Length: {}\r\n\r\n", MAX_RPC_BYTES + 1).into_bytes();
        let mut reader = BufReader::new(Cursor::new(data));
        assert!(read_rpc_message(&mut reader).is_err());
    }

    #[test]
    fn test_initialize_echoes_protocol_and_names_server() {
        let store = test_store();
        let mut initialized = false;
        let outcome = dispatch(
            serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": { "protocolVersion": "2024-11-05" }
            }),
            &mut initialized,
            &store,
        );
        assert!(initialized);
        let reply = outcome.reply.unwrap();
        let result = reply.get("result").unwrap();
        assert_eq!(
            result.get("protocolVersion").and_then(|v| v.as_str()),
            Some("2024-11-05")
        );
        assert_eq!(
            result
                .get("serverInfo")
                .and_then(|s| s.get("name"))
                .and_then(|n| n.as_str()),
            Some("daybrief")
        );
    }

    #[test]
    fn test_tool_traffic_rejected_before_handshake() {
        let store = test_store();
        let mut initialized = false;
        let outcome = dispatch(
            serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": { "name": "get_weather", "arguments": {} }
            }),
            &mut initialized,
            &store,
        );
        let reply = outcome.reply.unwrap();
        let error = reply.get("error").unwrap();
        assert_eq!(error.get("code").and_then(|c| c.as_i64()), Some(-32002));
        assert!(!initialized);
    }

    #[test]
    fn test_tools_list_after_handshake() {
        let store = test_store();
        let mut initialized = true;
        let outcome = dispatch(
            serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            &mut initialized,
            &store,
        );
        let reply = outcome.reply.unwrap();
        let tools = reply
            .get("result")
            .and_then(|r| r.get("tools"))
            .and_then(|t| t.as_array())
            .unwrap();
        assert_eq!(tools.len(), 6);
    }

    #[test]
    fn test_tools_call_wraps_text_content() {
        let store = test_store();
        let mut initialized = true;
        let outcome = dispatch(
            serde_json::json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": { "name": "get_weather", "arguments": { "city": "Oslo" } }
            }),
            &mut initialized,
            &store,
        );
        let reply = outcome.reply.unwrap();
        let result = reply.get("result").unwrap();
        let text = result
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|item| item.get("text"))
            .and_then(|t| t.as_str())
            .unwrap();
        assert_eq!(text, "The weather in Oslo is currently 65°F and Partly Cloudy.");
        assert_eq!(result.get("isError").and_then(|v| v.as_bool()), Some(false));
    }

    #[test]
    fn test_unknown_tool_is_protocol_error() {
        let store = test_store();
        let mut initialized = true;
        let outcome = dispatch(
            serde_json::json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": { "name": "no_such_tool", "arguments": {} }
            }),
            &mut initialized,
            &store,
        );
        let reply = outcome.reply.unwrap();
        let error = reply.get("error").unwrap();
        assert_eq!(error.get("code").and_then(|c| c.as_i64()), Some(-32602));
        assert_eq!(
            error.get("message").and_then(|m| m.as_str()),
            Some("Unknown tool: no_such_tool")
        );
    }

    #[test]
    fn test_unknown_method_and_notifications() {
        let store = test_store();
        let mut initialized = true;
        let outcome = dispatch(
            serde_json::json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"}),
            &mut initialized,
            &store,
        );
        let reply = outcome.reply.unwrap();
        assert_eq!(
            reply.get("error").and_then(|e| e.get("code")).and_then(|c| c.as_i64()),
            Some(-32601)
        );

        // Notifications (no id) for unknown methods are dropped silently.
        let outcome = dispatch(
            serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            &mut initialized,
            &store,
        );
        assert!(outcome.reply.is_none());
        assert!(!outcome.quit);
    }

    #[test]
    fn test_shutdown_replies_then_quits() {
        let store = test_store();
        let mut initialized = true;
        let outcome = dispatch(
            serde_json::json!({"jsonrpc": "2.0", "id": 9, "method": "shutdown"}),
            &mut initialized,
            &store,
        );
        assert!(outcome.quit);
        let reply = outcome.reply.unwrap();
        assert!(reply.get("result").unwrap().is_null());
    }

    #[test]
    fn test_extract_tool_result_variants() {
        let err_resp = serde_json::json!({
            "jsonrpc": "2.0", "id": 1,
            "error": { "code": -32602, "message": "Unknown tool: x" }
        });
        let err = extract_tool_result(&err_resp).unwrap_err();
        assert!(err.contains("-32602"));
        assert!(err.contains("Unknown tool: x"));

        let ok_resp = serde_json::json!({
            "jsonrpc": "2.0", "id": 2,
            "result": {
                "content": [
                    { "type": "text", "text": "line one" },
                    { "type": "text", "text": "line two" }
                ],
                "isError": true
            }
        });
        let exec = extract_tool_result(&ok_resp).unwrap();
        assert_eq!(exec.output, "line one\nline two");
        assert!(exec.is_error);
    }
}
