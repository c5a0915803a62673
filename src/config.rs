use std::path::PathBuf;

use super::env_optional;

pub(crate) const DEFAULT_TOKEN_FILE: &str = "token.json";
pub(crate) const DEFAULT_CLIENT_SECRET_FILE: &str = "credentials.json";

pub(crate) const DEFAULT_CITY: &str = "San Francisco";
pub(crate) const DEFAULT_MAX_STEPS: usize = 8;
pub(crate) const DEFAULT_DEADLINE_SECS: u64 = 300;
pub(crate) const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

/// Token path: CLI flag, then DAYBRIEF_TOKEN, then ./token.json.
pub(crate) fn resolve_token_path(cli: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli {
        return path;
    }
    if let Some(value) = env_optional("DAYBRIEF_TOKEN") {
        return PathBuf::from(value);
    }
    PathBuf::from(DEFAULT_TOKEN_FILE)
}

/// Client-secret path: CLI flag, then DAYBRIEF_CLIENT_SECRET, then ./credentials.json.
pub(crate) fn resolve_client_secret_path(cli: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli {
        return path;
    }
    if let Some(value) = env_optional("DAYBRIEF_CLIENT_SECRET") {
        return PathBuf::from(value);
    }
    PathBuf::from(DEFAULT_CLIENT_SECRET_FILE)
}

/// Everything one briefing run needs, resolved before the tool server spawns.
#[derive(Debug, Clone)]
pub(crate) struct BriefSettings {
    pub(crate) city: String,
    /// Command line used to spawn the tool server. None means re-exec this
    /// binary in serve mode.
    pub(crate) server_cmd: Option<String>,
    pub(crate) max_steps: usize,
    pub(crate) deadline_secs: Option<u64>,
    pub(crate) tool_timeout_secs: u64,
    pub(crate) json: bool,
    pub(crate) token_path: PathBuf,
    pub(crate) client_secret_path: PathBuf,
}

// ── Tests ────────────────────────────────────────────────────────────────
