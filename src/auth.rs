use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tiny_http::{Response, Server};
use url::form_urlencoded;

use super::{now_ts, ClientSecret, ClientSecretFile, StoredCredential};

pub(crate) const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub(crate) const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub(crate) const GOOGLE_SCOPES: [&str; 3] = [
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.compose",
    "https://www.googleapis.com/auth/calendar.readonly",
];

/// Tokens within this many seconds of expiry count as expired, so a request
/// started now cannot present a token that dies mid-flight.
pub(crate) const EXPIRY_SKEW_SECS: i64 = 60;

const TOKEN_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;
const DEFAULT_AUTH_WAIT_SECS: u64 = 300;
const OAUTH_STATE: &str = "daybrief";

#[derive(Debug)]
pub(crate) enum CredError {
    /// Unrecoverable: the client-secret file is absent or unusable. Nothing
    /// can be retried until the operator fixes the setup.
    MissingConfiguration(String),
    Io(String),
    Refresh(String),
    Authorize(String),
}

impl fmt::Display for CredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredError::MissingConfiguration(msg) => write!(f, "configuration error: {msg}"),
            CredError::Io(msg) => write!(f, "credential store error: {msg}"),
            CredError::Refresh(msg) => write!(f, "token refresh failed: {msg}"),
            CredError::Authorize(msg) => write!(f, "authorization failed: {msg}"),
        }
    }
}

impl std::error::Error for CredError {}

/// Lazily materialized Google credential. `get()` hands out the cached token
/// while it is fresh and otherwise walks refresh, then interactive
/// authorization, persisting after every successful transition.
///
/// The mutex serializes the whole transition, so concurrent callers produce
/// exactly one refresh; the rest block briefly and reuse its result.
pub(crate) struct CredentialStore {
    token_path: PathBuf,
    client_secret_path: PathBuf,
    pub(crate) auth_port: u16,
    pub(crate) auth_wait_secs: u64,
    cached: Mutex<Option<StoredCredential>>,
}

impl CredentialStore {
    pub(crate) fn new(token_path: PathBuf, client_secret_path: PathBuf) -> Self {
        CredentialStore {
            token_path,
            client_secret_path,
            auth_port: 0,
            auth_wait_secs: DEFAULT_AUTH_WAIT_SECS,
            cached: Mutex::new(None),
        }
    }

    /// Returns a fresh access token, walking the refresh/authorize ladder as
    /// needed. A token already fresh in memory costs no I/O at all.
    pub(crate) fn get(&self) -> Result<StoredCredential, CredError> {
        let mut slot = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = load_credential(&self.token_path)?;
        }
        let now = now_ts();
        if let Some(cred) = slot.as_ref() {
            if credential_is_fresh(cred, now) {
                return Ok(cred.clone());
            }
        }
        if let Some(expired) = slot.clone() {
            if expired.refresh_token.is_some() {
                match self.refresh(&expired) {
                    Ok(renewed) => {
                        persist_credential(&self.token_path, &renewed)?;
                        *slot = Some(renewed.clone());
                        return Ok(renewed);
                    }
                    Err(CredError::MissingConfiguration(msg)) => {
                        return Err(CredError::MissingConfiguration(msg));
                    }
                    Err(err) => {
                        eprintln!("[oauth] refresh failed, starting a new authorization: {err}");
                    }
                }
            }
        }
        let fresh = self.authorize()?;
        persist_credential(&self.token_path, &fresh)?;
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    /// Forces the interactive consent flow and saves the result. Used by
    /// `connect`, where the operator wants a new grant even if a token exists.
    pub(crate) fn authorize_and_persist(&self) -> Result<StoredCredential, CredError> {
        let fresh = self.authorize()?;
        persist_credential(&self.token_path, &fresh)?;
        let mut slot = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    fn refresh(&self, expired: &StoredCredential) -> Result<StoredCredential, CredError> {
        let secret = load_client_secret(&self.client_secret_path)?;
        let refresh_token = expired.refresh_token.as_deref().unwrap_or_default();
        let token_url = secret
            .token_uri
            .clone()
            .unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string());
        eprintln!("[oauth] refreshing expired access token");
        let payload = form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &secret.client_id)
            .append_pair("client_secret", &secret.client_secret)
            .append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", refresh_token)
            .finish();
        let body = post_token_form(&token_url, &payload).map_err(CredError::Refresh)?;
        credential_from_token_response(&body, expired.refresh_token.as_deref(), now_ts())
            .map_err(CredError::Refresh)
    }

    fn authorize(&self) -> Result<StoredCredential, CredError> {
        let secret = load_client_secret(&self.client_secret_path)?;
        let server = Server::http(("127.0.0.1", self.auth_port))
            .map_err(|e| CredError::Authorize(format!("callback listener: {e}")))?;
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .ok_or_else(|| CredError::Authorize("callback listener has no tcp port".to_string()))?;
        let redirect_uri = format!("http://127.0.0.1:{port}/oauth/callback");
        let scope = GOOGLE_SCOPES.join(" ");
        let auth_base = secret.auth_uri.as_deref().unwrap_or(GOOGLE_AUTH_URL);
        let auth_url = build_auth_url(auth_base, &secret.client_id, &redirect_uri, &scope, OAUTH_STATE);
        eprintln!("[oauth] open this URL to authorize:\n{auth_url}");

        let deadline = Instant::now() + Duration::from_secs(self.auth_wait_secs);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CredError::Authorize(format!(
                    "authorization timed out after {}s",
                    self.auth_wait_secs
                )));
            }
            let request = match server.recv_timeout(remaining) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(err) => return Err(CredError::Authorize(format!("callback listener: {err}"))),
            };
            let url = request.url().to_string();
            if !url.starts_with("/oauth/callback") {
                let _ = request.respond(Response::from_string("ok"));
                continue;
            }
            let query = url.splitn(2, '?').nth(1).unwrap_or("");
            let params: HashMap<String, String> =
                form_urlencoded::parse(query.as_bytes()).into_owned().collect();
            if params.get("state").map(String::as_str) != Some(OAUTH_STATE) {
                let _ = request.respond(Response::from_string("state mismatch"));
                continue;
            }
            let Some(code) = params.get("code") else {
                let _ = request.respond(Response::from_string("missing code"));
                continue;
            };
            let token_url = secret
                .token_uri
                .clone()
                .unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string());
            let payload = form_urlencoded::Serializer::new(String::new())
                .append_pair("client_id", &secret.client_id)
                .append_pair("client_secret", &secret.client_secret)
                .append_pair("grant_type", "authorization_code")
                .append_pair("code", code)
                .append_pair("redirect_uri", &redirect_uri)
                .finish();
            let body = post_token_form(&token_url, &payload).map_err(CredError::Authorize)?;
            let cred = credential_from_token_response(&body, None, now_ts())
                .map_err(CredError::Authorize)?;
            let _ = request.respond(Response::from_string("Authorized. You can close this tab."));
            eprintln!("[oauth] authorization complete");
            return Ok(cred);
        }
    }
}

pub(crate) fn credential_is_fresh(cred: &StoredCredential, now: i64) -> bool {
    cred.expiry_utc - EXPIRY_SKEW_SECS > now
}

/// Builds a StoredCredential from a token-endpoint response. Google omits
/// `refresh_token` on refresh grants; the previous one carries forward so a
/// refresh never downgrades the stored bundle.
pub(crate) fn credential_from_token_response(
    body: &serde_json::Value,
    previous_refresh: Option<&str>,
    now: i64,
) -> Result<StoredCredential, String> {
    let access_token = body
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "token response missing access_token".to_string())?
        .to_string();
    let expires_in = body
        .get("expires_in")
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    let refresh_token = body
        .get("refresh_token")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| previous_refresh.map(|s| s.to_string()));
    let scopes = body
        .get("scope")
        .and_then(|v| v.as_str())
        .map(|s| s.split_whitespace().map(|p| p.to_string()).collect())
        .unwrap_or_default();
    Ok(StoredCredential {
        access_token,
        refresh_token,
        expiry_utc: now + expires_in,
        scopes,
    })
}

pub(crate) fn build_auth_url(
    base: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    state: &str,
) -> String {
    format!(
        "{base}?response_type=code&client_id={}&redirect_uri={}&scope={}&access_type=offline&prompt=consent&state={}",
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(scope),
        urlencoding::encode(state)
    )
}

fn post_token_form(token_url: &str, payload: &str) -> Result<serde_json::Value, String> {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_millis(TOKEN_TIMEOUT_MS))
        .timeout_read(Duration::from_millis(TOKEN_TIMEOUT_MS))
        .timeout_write(Duration::from_millis(TOKEN_TIMEOUT_MS))
        .build();
    let resp = agent
        .post(token_url)
        .set("content-type", "application/x-www-form-urlencoded")
        .send_string(payload);
    match resp {
        Ok(resp) => resp
            .into_json::<serde_json::Value>()
            .map_err(|e| format!("token response malformed: {e}")),
        Err(ureq::Error::Status(code, resp)) => {
            let text = resp.into_string().unwrap_or_default();
            Err(format!("token error {code}: {text}"))
        }
        Err(err) => Err(format!("token request failed: {err}")),
    }
}

pub(crate) fn load_credential(path: &Path) -> Result<Option<StoredCredential>, CredError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(CredError::Io(format!("read {}: {err}", path.display()))),
    };
    match serde_json::from_str::<StoredCredential>(&data) {
        Ok(cred) => Ok(Some(cred)),
        Err(err) => {
            // Unreadable token files trigger a fresh authorization instead of
            // wedging every command.
            eprintln!("[oauth] ignoring unreadable token file {}: {err}", path.display());
            Ok(None)
        }
    }
}

/// Write-then-rename so a crash mid-write can never leave a torn token file.
pub(crate) fn persist_credential(path: &Path, cred: &StoredCredential) -> Result<(), CredError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| CredError::Io(format!("create {}: {e}", parent.display())))?;
        }
    }
    let json = serde_json::to_string_pretty(cred).map_err(|e| CredError::Io(e.to_string()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json)
        .map_err(|e| CredError::Io(format!("write {}: {e}", tmp_path.display())))?;
    fs::rename(&tmp_path, path)
        .map_err(|e| CredError::Io(format!("rename {}: {e}", path.display())))?;
    Ok(())
}

fn load_client_secret(path: &Path) -> Result<ClientSecret, CredError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(CredError::MissingConfiguration(format!(
                "Missing {}. Please provide Google Cloud credentials.",
                path.display()
            )));
        }
        Err(err) => return Err(CredError::Io(format!("read {}: {err}", path.display()))),
    };
    let parsed: ClientSecretFile = serde_json::from_str(&data).map_err(|err| {
        CredError::MissingConfiguration(format!(
            "Unreadable client secret {}: {err}",
            path.display()
        ))
    })?;
    parsed.installed.or(parsed.web).ok_or_else(|| {
        CredError::MissingConfiguration(format!(
            "Client secret {} has neither \"installed\" nor \"web\" section",
            path.display()
        ))
    })
}

pub(crate) fn run_connect(
    token_path: PathBuf,
    client_secret_path: PathBuf,
    port: u16,
    timeout_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = CredentialStore::new(token_path.clone(), client_secret_path);
    store.auth_port = port;
    store.auth_wait_secs = timeout_secs;
    let cred = store.authorize_and_persist()?;
    println!(
        "Authorized. Token saved to {} (expires in {}s).",
        token_path.display(),
        (cred.expiry_utc - now_ts()).max(0)
    );
    Ok(())
}

pub(crate) fn credential_status(token_path: &Path) -> Result<String, CredError> {
    match load_credential(token_path)? {
        None => Ok(format!("no credential at {}", token_path.display())),
        Some(cred) => {
            let now = now_ts();
            let state = if credential_is_fresh(&cred, now) {
                "valid"
            } else if cred.refresh_token.is_some() {
                "expired (refreshable)"
            } else {
                "expired (needs authorization)"
            };
            let delta = cred.expiry_utc - now;
            let when = if delta >= 0 {
                format!("in {delta}s")
            } else {
                format!("{}s ago", -delta)
            };
            let mut lines = vec![
                format!("token file: {}", token_path.display()),
                format!("state: {state}"),
                format!("expiry: {} ({when})", cred.expiry_utc),
            ];
            if !cred.scopes.is_empty() {
                lines.push(format!("scopes: {}", cred.scopes.join(" ")));
            }
            Ok(lines.join("\n"))
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
