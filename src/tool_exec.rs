use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use rayon::ThreadPoolBuilder;

use super::{
    utc_now_rfc3339, CredentialStore, ToolCalendarArgs, ToolDraftArgs, ToolExecution,
    ToolMorningStatusArgs, ToolSearchArgs, ToolUnreadMailArgs, ToolWeatherArgs, DEFAULT_CITY,
};

pub(crate) const DEFAULT_MAIL_LIMIT: usize = 3;
pub(crate) const DEFAULT_CALENDAR_LIMIT: usize = 5;
pub(crate) const SEARCH_RESULT_LIMIT: usize = 2;

const PROVIDER_TIMEOUT_MS: u64 = 15_000;
const STATUS_DEADLINE_MS: u64 = 60_000;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const CALENDAR_EVENTS_URL: &str =
    "https://www.googleapis.com/calendar/v3/calendars/primary/events";
const SEARCH_API_URL: &str = "https://api.duckduckgo.com/";

/// Dispatch-level failures. These surface as protocol errors to the caller;
/// provider faults never land here, they come back as tagged text payloads.
#[derive(Debug)]
pub(crate) enum ToolDispatchError {
    UnknownTool(String),
    InvalidArgs(String),
}

impl fmt::Display for ToolDispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolDispatchError::UnknownTool(name) => write!(f, "Unknown tool: {name}"),
            ToolDispatchError::InvalidArgs(msg) => write!(f, "args: {msg}"),
        }
    }
}

impl std::error::Error for ToolDispatchError {}

pub(crate) fn execute_tool(
    name: &str,
    args: serde_json::Value,
    store: &Arc<CredentialStore>,
) -> Result<ToolExecution, ToolDispatchError> {
    match name {
        "get_weather" => {
            let parsed: ToolWeatherArgs = parse_args(args)?;
            let city = parsed.city.unwrap_or_else(|| DEFAULT_CITY.to_string());
            Ok(ToolExecution {
                output: weather_summary(&city),
                details: serde_json::json!({ "city": city }),
                is_error: false,
            })
        }
        "get_unread_emails" => {
            let parsed: ToolUnreadMailArgs = parse_args(args)?;
            let limit = parsed.limit.unwrap_or(DEFAULT_MAIL_LIMIT);
            Ok(ToolExecution {
                output: unread_mail_summary(store, limit),
                details: serde_json::json!({ "limit": limit }),
                is_error: false,
            })
        }
        "get_calendar_events" => {
            let parsed: ToolCalendarArgs = parse_args(args)?;
            let limit = parsed.limit.unwrap_or(DEFAULT_CALENDAR_LIMIT);
            Ok(ToolExecution {
                output: calendar_summary(store, limit),
                details: serde_json::json!({ "limit": limit }),
                is_error: false,
            })
        }
        "web_search" => {
            let parsed: ToolSearchArgs = parse_args(args)?;
            Ok(ToolExecution {
                output: web_search_summary(&parsed.query),
                details: serde_json::json!({ "query": parsed.query }),
                is_error: false,
            })
        }
        "create_draft" => {
            let parsed: ToolDraftArgs = parse_args(args)?;
            Ok(ToolExecution {
                output: create_draft_text(store, &parsed.subject, &parsed.body),
                details: serde_json::json!({ "subject": parsed.subject }),
                is_error: false,
            })
        }
        "get_morning_status" => {
            let parsed: ToolMorningStatusArgs = parse_args(args)?;
            let city = parsed.city.unwrap_or_else(|| DEFAULT_CITY.to_string());
            Ok(ToolExecution {
                output: morning_status(store, &city),
                details: serde_json::json!({ "city": city }),
                is_error: false,
            })
        }
        other => Err(ToolDispatchError::UnknownTool(other.to_string())),
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(
    args: serde_json::Value,
) -> Result<T, ToolDispatchError> {
    // Callers may omit "arguments" entirely; treat that as an empty object.
    let args = if args.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| ToolDispatchError::InvalidArgs(e.to_string()))
}

// ── Weather ──────────────────────────────────────────────────────────────

pub(crate) fn weather_summary(city: &str) -> String {
    format!("The weather in {city} is currently 65°F and Partly Cloudy.")
}

// ── Gmail: unread summary ────────────────────────────────────────────────

pub(crate) fn unread_mail_summary(store: &CredentialStore, limit: usize) -> String {
    match fetch_unread_mail(store, limit) {
        Ok(items) => summarize_unread(items, limit),
        Err(err) => format!("Gmail Error: {err}"),
    }
}

pub(crate) fn summarize_unread(items: Vec<(String, String)>, limit: usize) -> String {
    let lines: Vec<String> = items
        .into_iter()
        .take(limit)
        .map(|(subject, snippet)| format!("Subject: {subject} | Snippet: {snippet}"))
        .collect();
    if lines.is_empty() {
        "No unread emails.".to_string()
    } else {
        lines.join("\n")
    }
}

fn fetch_unread_mail(
    store: &CredentialStore,
    limit: usize,
) -> Result<Vec<(String, String)>, String> {
    let token = store.get().map_err(|e| e.to_string())?.access_token;
    let agent = provider_agent();
    let mut url = format!("{GMAIL_API_BASE}/messages?maxResults={limit}");
    url.push_str("&q=");
    url.push_str(&urlencoding::encode("is:unread label:INBOX"));
    let listing = get_json(&agent, &url, Some(&token), "gmail")?;
    let ids: Vec<String> = listing
        .get("messages")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|m| m.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let mut items = Vec::new();
    for id in ids.into_iter().take(limit) {
        let detail_url =
            format!("{GMAIL_API_BASE}/messages/{id}?format=metadata&metadataHeaders=Subject");
        let message = get_json(&agent, &detail_url, Some(&token), "gmail")?;
        items.push(message_summary_parts(&message));
    }
    Ok(items)
}

pub(crate) fn message_summary_parts(message: &serde_json::Value) -> (String, String) {
    let subject = message
        .get("payload")
        .and_then(|p| p.get("headers"))
        .and_then(|h| h.as_array())
        .and_then(|headers| {
            headers.iter().find_map(|header| {
                let name = header.get("name").and_then(|v| v.as_str())?;
                if name.eq_ignore_ascii_case("subject") {
                    header
                        .get("value")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                } else {
                    None
                }
            })
        })
        .unwrap_or_else(|| "No Subject".to_string());
    let snippet = message
        .get("snippet")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    (subject, snippet)
}

// ── Calendar: upcoming events ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CalendarEvent {
    pub(crate) summary: String,
    pub(crate) start: String,
}

enum StartKind {
    Timed(i64),
    AllDay(NaiveDate),
    Unknown,
}

pub(crate) fn calendar_summary(store: &CredentialStore, limit: usize) -> String {
    match fetch_calendar_events(store, limit) {
        Ok(events) => summarize_calendar(filter_upcoming(events, Utc::now(), limit)),
        Err(err) => format!("Calendar Error: {err}"),
    }
}

pub(crate) fn summarize_calendar(events: Vec<CalendarEvent>) -> String {
    if events.is_empty() {
        return "No upcoming events found.".to_string();
    }
    events
        .iter()
        .map(|event| format!("- {} ({})", event.summary, event.start))
        .collect::<Vec<_>>()
        .join("\n")
}

fn fetch_calendar_events(
    store: &CredentialStore,
    limit: usize,
) -> Result<Vec<CalendarEvent>, String> {
    let token = store.get().map_err(|e| e.to_string())?.access_token;
    let agent = provider_agent();
    let time_min = utc_now_rfc3339();
    let url = format!(
        "{CALENDAR_EVENTS_URL}?timeMin={}&maxResults={limit}&singleEvents=true&orderBy=startTime",
        urlencoding::encode(&time_min)
    );
    let payload = get_json(&agent, &url, Some(&token), "calendar")?;
    let events = payload
        .get("items")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().map(event_from_item).collect())
        .unwrap_or_default();
    Ok(events)
}

pub(crate) fn event_from_item(item: &serde_json::Value) -> CalendarEvent {
    let summary = item
        .get("summary")
        .and_then(|v| v.as_str())
        .unwrap_or("(no title)")
        .to_string();
    let start = item
        .get("start")
        .and_then(|s| s.get("dateTime").or_else(|| s.get("date")))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    CalendarEvent { summary, start }
}

/// The API's `timeMin` matches on event END time, so an in-progress meeting
/// still comes back. Keep events that have not started yet; all-day events
/// count for their entire date.
pub(crate) fn filter_upcoming(
    events: Vec<CalendarEvent>,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<CalendarEvent> {
    let mut keep: Vec<(i64, CalendarEvent)> = events
        .into_iter()
        .filter_map(|event| match event_start(&event.start) {
            StartKind::Timed(ts) if ts > now.timestamp() => Some((ts, event)),
            StartKind::AllDay(date) if date >= now.date_naive() => {
                let ts = date
                    .and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc().timestamp())
                    .unwrap_or(i64::MAX);
                Some((ts, event))
            }
            StartKind::Unknown => Some((i64::MAX, event)),
            _ => None,
        })
        .collect();
    keep.sort_by_key(|(ts, _)| *ts);
    keep.into_iter().take(limit).map(|(_, event)| event).collect()
}

fn event_start(start: &str) -> StartKind {
    if let Ok(dt) = DateTime::parse_from_rfc3339(start) {
        return StartKind::Timed(dt.timestamp());
    }
    if let Ok(date) = NaiveDate::parse_from_str(start, "%Y-%m-%d") {
        return StartKind::AllDay(date);
    }
    StartKind::Unknown
}

// ── Web search ───────────────────────────────────────────────────────────

pub(crate) fn web_search_summary(query: &str) -> String {
    match fetch_search_payload(query) {
        Ok(payload) => summarize_search(collect_search_results(&payload, SEARCH_RESULT_LIMIT)),
        Err(err) => format!("Search Error: {err}"),
    }
}

pub(crate) fn summarize_search(results: Vec<(String, String)>) -> String {
    if results.is_empty() {
        return "No search results found.".to_string();
    }
    results
        .iter()
        .map(|(title, body)| format!("{title}: {body}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn fetch_search_payload(query: &str) -> Result<serde_json::Value, String> {
    let agent = provider_agent();
    let url = format!(
        "{SEARCH_API_URL}?q={}&format=json&no_html=1&skip_disambig=1",
        urlencoding::encode(query)
    );
    get_json(&agent, &url, None, "search")
}

/// Instant-answer payloads nest results two ways: a top-level abstract and a
/// RelatedTopics list whose entries are either leaf topics or named groups.
pub(crate) fn collect_search_results(
    payload: &serde_json::Value,
    limit: usize,
) -> Vec<(String, String)> {
    let mut results = Vec::new();
    let abstract_text = payload
        .get("AbstractText")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if !abstract_text.is_empty() {
        let heading = payload
            .get("Heading")
            .and_then(|v| v.as_str())
            .unwrap_or("Summary");
        results.push((heading.to_string(), abstract_text.to_string()));
    }
    if let Some(topics) = payload.get("RelatedTopics").and_then(|v| v.as_array()) {
        for topic in topics {
            if results.len() >= limit {
                break;
            }
            push_topic(topic, &mut results, limit);
        }
    }
    results.truncate(limit);
    results
}

fn push_topic(topic: &serde_json::Value, results: &mut Vec<(String, String)>, limit: usize) {
    if results.len() >= limit {
        return;
    }
    if let Some(group) = topic.get("Topics").and_then(|v| v.as_array()) {
        for inner in group {
            if results.len() >= limit {
                return;
            }
            push_topic(inner, results, limit);
        }
        return;
    }
    let Some(text) = topic.get("Text").and_then(|v| v.as_str()) else {
        return;
    };
    if text.is_empty() {
        return;
    }
    match text.split_once(" - ") {
        Some((title, body)) => results.push((title.trim().to_string(), body.trim().to_string())),
        None => {
            let url = topic.get("FirstURL").and_then(|v| v.as_str()).unwrap_or("");
            results.push((text.to_string(), url.to_string()));
        }
    }
}

// ── Gmail: draft creation ────────────────────────────────────────────────

pub(crate) fn create_draft_text(store: &CredentialStore, subject: &str, body: &str) -> String {
    draft_outcome_text(subject, submit_draft(store, subject, body))
}

pub(crate) fn draft_outcome_text(subject: &str, outcome: Result<(), String>) -> String {
    match outcome {
        Ok(()) => format!("SUCCESS: Draft created with subject: '{subject}'"),
        Err(err) => format!("Drafting Error: {err}"),
    }
}

fn submit_draft(store: &CredentialStore, subject: &str, body: &str) -> Result<(), String> {
    let token = store.get().map_err(|e| e.to_string())?.access_token;
    let agent = provider_agent();
    let payload = serde_json::json!({ "message": { "raw": encode_raw_message(subject, body) } });
    let resp = agent
        .post(&format!("{GMAIL_API_BASE}/drafts"))
        .set("authorization", &format!("Bearer {token}"))
        .set("content-type", "application/json")
        .send_string(&payload.to_string());
    match resp {
        Ok(_) => Ok(()),
        Err(ureq::Error::Status(code, resp)) => {
            let text = resp.into_string().unwrap_or_default();
            Err(format!("gmail error {code}: {text}"))
        }
        Err(err) => Err(format!("gmail request failed: {err}")),
    }
}

/// RFC 2822 message in the url-safe base64 the Gmail API expects.
pub(crate) fn encode_raw_message(subject: &str, body: &str) -> String {
    let raw = format!("To: me\r\nSubject: {subject}\r\n\r\n{body}\r\n");
    base64::engine::general_purpose::STANDARD
        .encode(raw.as_bytes())
        .replace('+', "-")
        .replace('/', "_")
        .trim_end_matches('=')
        .to_string()
}

// ── Morning status: parallel fan-out ─────────────────────────────────────

type StatusTask = (Box<dyn FnOnce() -> String + Send + 'static>, String);

pub(crate) fn morning_status(store: &Arc<CredentialStore>, city: &str) -> String {
    let weather_city = city.to_string();
    let mail_store = Arc::clone(store);
    let calendar_store = Arc::clone(store);
    let tasks: Vec<StatusTask> = vec![
        (
            Box::new(move || weather_summary(&weather_city)),
            "Weather Error: timed out".to_string(),
        ),
        (
            Box::new(move || unread_mail_summary(&mail_store, DEFAULT_MAIL_LIMIT)),
            "Gmail Error: timed out".to_string(),
        ),
        (
            Box::new(move || calendar_summary(&calendar_store, DEFAULT_CALENDAR_LIMIT)),
            "Calendar Error: timed out".to_string(),
        ),
    ];
    let mut sections = gather_sections(tasks, STATUS_DEADLINE_MS).into_iter();
    let weather = sections.next().unwrap_or_default();
    let mail = sections.next().unwrap_or_default();
    let calendar = sections.next().unwrap_or_default();
    assemble_status(&weather, &mail, &calendar)
}

pub(crate) fn assemble_status(weather: &str, mail: &str, calendar: &str) -> String {
    format!("WEATHER: {weather}\n\nGMAIL:\n{mail}\n\nCALENDAR:\n{calendar}")
}

/// Runs every task on its own pool thread and collects results in task order.
/// A task that outlives the deadline keeps running detached; its slot gets the
/// fallback text so one stuck provider cannot wedge the whole gather.
pub(crate) fn gather_sections(tasks: Vec<StatusTask>, deadline_ms: u64) -> Vec<String> {
    let count = tasks.len();
    let pool = match ThreadPoolBuilder::new().num_threads(count.max(1)).build() {
        Ok(pool) => pool,
        Err(err) => {
            eprintln!("[status] thread pool unavailable ({err}); gathering sequentially");
            return tasks.into_iter().map(|(task, _)| task()).collect();
        }
    };
    let (tx, rx) = mpsc::channel();
    let mut fallbacks = Vec::with_capacity(count);
    for (idx, (task, fallback)) in tasks.into_iter().enumerate() {
        fallbacks.push(fallback);
        let tx = tx.clone();
        pool.spawn(move || {
            let _ = tx.send((idx, task()));
        });
    }
    drop(tx);

    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    let mut sections: Vec<Option<String>> = (0..count).map(|_| None).collect();
    let mut received = 0;
    while received < count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            eprintln!(
                "[status] gather deadline hit with {} section(s) pending",
                count - received
            );
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok((idx, text)) => {
                if sections[idx].is_none() {
                    sections[idx] = Some(text);
                    received += 1;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                eprintln!(
                    "[status] gather deadline hit with {} section(s) pending",
                    count - received
                );
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    sections
        .into_iter()
        .zip(fallbacks)
        .map(|(section, fallback)| section.unwrap_or(fallback))
        .collect()
}

fn provider_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_millis(PROVIDER_TIMEOUT_MS))
        .timeout_read(Duration::from_millis(PROVIDER_TIMEOUT_MS))
        .timeout_write(Duration::from_millis(PROVIDER_TIMEOUT_MS))
        .build()
}

fn get_json(
    agent: &ureq::Agent,
    url: &str,
    token: Option<&str>,
    what: &str,
) -> Result<serde_json::Value, String> {
    let mut request = agent.get(url);
    if let Some(token) = token {
        request = request.set("authorization", &format!("Bearer {token}"));
    }
    match request.call() {
        Ok(resp) => resp
            .into_json::<serde_json::Value>()
            .map_err(|e| format!("{what} response malformed: {e}")),
        Err(ureq::Error::Status(code, resp)) => {
            let text = resp.into_string().unwrap_or_default();
            Err(format!("{what} error {code}: {text}"))
        }
        Err(err) => Err(format!("{what} request failed: {err}")),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn idle_store() -> Arc<CredentialStore> {
        // Paths that never exist; tests using this store must not hit them
        // unless they expect a configuration failure in the payload.
        let dir = std::env::temp_dir().join("daybrief_test_absent");
        Arc::new(CredentialStore::new(
            dir.join("token.json"),
            dir.join("credentials.json"),
        ))
    }

    #[test]
    fn test_weather_summary_format() {
        assert_eq!(
            weather_summary("San Francisco"),
            "The weather in San Francisco is currently 65°F and Partly Cloudy."
        );
    }

    #[test]
    fn test_summarize_unread_limit_and_sentinel() {
        assert_eq!(summarize_unread(vec![], 3), "No unread emails.");

        let items: Vec<(String, String)> = (1..=5)
            .map(|n| (format!("Mail {n}"), format!("snippet {n}")))
            .collect();
        let text = summarize_unread(items, 3);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Subject: Mail 1 | Snippet: snippet 1");
        assert_eq!(lines[2], "Subject: Mail 3 | Snippet: snippet 3");
    }

    #[test]
    fn test_message_summary_parts_defaults() {
        let message = serde_json::json!({
            "snippet": "quick note",
            "payload": { "headers": [
                { "name": "From", "value": "a@example.com" },
                { "name": "Subject", "value": "Lunch?" }
            ]}
        });
        assert_eq!(
            message_summary_parts(&message),
            ("Lunch?".to_string(), "quick note".to_string())
        );

        let bare = serde_json::json!({"payload": {"headers": []}});
        assert_eq!(
            message_summary_parts(&bare),
            ("No Subject".to_string(), String::new())
        );
    }

    #[test]
    fn test_event_from_item_prefers_datetime() {
        let timed = serde_json::json!({
            "summary": "Standup",
            "start": { "dateTime": "2030-01-02T09:00:00Z", "date": "2030-01-02" }
        });
        let event = event_from_item(&timed);
        assert_eq!(event.start, "2030-01-02T09:00:00Z");

        let all_day = serde_json::json!({
            "summary": "Mom's Birthday",
            "start": { "date": "2030-01-02" }
        });
        assert_eq!(event_from_item(&all_day).start, "2030-01-02");

        let untitled = serde_json::json!({"start": {"date": "2030-01-02"}});
        assert_eq!(event_from_item(&untitled).summary, "(no title)");
    }

    #[test]
    fn test_filter_upcoming_drops_past_and_sorts() {
        let now = Utc.with_ymd_and_hms(2030, 1, 2, 12, 0, 0).unwrap();
        let events = vec![
            CalendarEvent {
                summary: "Yesterday".to_string(),
                start: "2030-01-01T09:00:00Z".to_string(),
            },
            CalendarEvent {
                summary: "In progress".to_string(),
                start: "2030-01-02T11:00:00Z".to_string(),
            },
            CalendarEvent {
                summary: "Later".to_string(),
                start: "2030-01-03T09:00:00Z".to_string(),
            },
            CalendarEvent {
                summary: "Birthday today".to_string(),
                start: "2030-01-02".to_string(),
            },
            CalendarEvent {
                summary: "Sooner".to_string(),
                start: "2030-01-02T15:00:00Z".to_string(),
            },
        ];
        let kept = filter_upcoming(events, now, 5);
        let names: Vec<&str> = kept.iter().map(|e| e.summary.as_str()).collect();
        assert_eq!(names, vec!["Birthday today", "Sooner", "Later"]);
    }

    #[test]
    fn test_filter_upcoming_respects_limit() {
        let now = Utc.with_ymd_and_hms(2030, 1, 2, 12, 0, 0).unwrap();
        let events: Vec<CalendarEvent> = (1..=6)
            .map(|n| CalendarEvent {
                summary: format!("Event {n}"),
                start: format!("2030-02-0{n}T09:00:00Z"),
            })
            .collect();
        assert_eq!(filter_upcoming(events, now, 4).len(), 4);
    }

    #[test]
    fn test_summarize_calendar_lines_and_sentinel() {
        assert_eq!(summarize_calendar(vec![]), "No upcoming events found.");
        let text = summarize_calendar(vec![CalendarEvent {
            summary: "Dentist".to_string(),
            start: "2030-01-03T09:00:00Z".to_string(),
        }]);
        assert_eq!(text, "- Dentist (2030-01-03T09:00:00Z)");
    }

    #[test]
    fn test_collect_search_results_abstract_and_topics() {
        let payload = serde_json::json!({
            "Heading": "Gift ideas",
            "AbstractText": "Popular gift ideas for mothers.",
            "RelatedTopics": [
                { "Text": "Flowers - A classic choice", "FirstURL": "https://x/flowers" },
                { "Text": "Jewelry - Always appreciated", "FirstURL": "https://x/jewelry" }
            ]
        });
        let results = collect_search_results(&payload, SEARCH_RESULT_LIMIT);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "Gift ideas");
        assert_eq!(
            results[1],
            ("Flowers".to_string(), "A classic choice".to_string())
        );
    }

    #[test]
    fn test_collect_search_results_grouped_topics() {
        let payload = serde_json::json!({
            "AbstractText": "",
            "RelatedTopics": [
                { "Name": "Categories", "Topics": [
                    { "Text": "Spa day - Relaxing option", "FirstURL": "https://x/spa" },
                    { "Text": "Books - For readers", "FirstURL": "https://x/books" },
                    { "Text": "Extra - Should be cut", "FirstURL": "https://x/extra" }
                ]}
            ]
        });
        let results = collect_search_results(&payload, 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "Spa day");
        assert_eq!(results[1].0, "Books");
    }

    #[test]
    fn test_summarize_search_sentinel_and_lines() {
        assert_eq!(summarize_search(vec![]), "No search results found.");
        let text = summarize_search(vec![(
            "Flowers".to_string(),
            "A classic choice".to_string(),
        )]);
        assert_eq!(text, "Flowers: A classic choice");
    }

    #[test]
    fn test_draft_outcome_text() {
        assert_eq!(
            draft_outcome_text("Gift Idea", Ok(())),
            "SUCCESS: Draft created with subject: 'Gift Idea'"
        );
        assert_eq!(
            draft_outcome_text("Gift Idea", Err("gmail error 403: denied".to_string())),
            "Drafting Error: gmail error 403: denied"
        );
    }

    #[test]
    fn test_encode_raw_message_urlsafe() {
        let encoded = encode_raw_message("Hello?", "Line one\nLine two");
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('='));
        let padded = match encoded.len() % 4 {
            0 => encoded.clone(),
            rem => format!("{encoded}{}", "=".repeat(4 - rem)),
        };
        let decoded = base64::engine::general_purpose::URL_SAFE
            .decode(padded.as_bytes())
            .unwrap();
        let text = String::from_utf8(decoded).unwrap();
        assert!(text.starts_with("To: me\r\nSubject: Hello?\r\n\r\n"));
        assert!(text.contains("Line one\nLine two"));
    }

    #[test]
    fn test_assemble_status_section_layout() {
        let text = assemble_status("sunny", "No unread emails.", "No upcoming events found.");
        assert_eq!(
            text,
            "WEATHER: sunny\n\nGMAIL:\nNo unread emails.\n\nCALENDAR:\nNo upcoming events found."
        );
    }

    #[test]
    fn test_gather_sections_preserves_order() {
        let tasks: Vec<StatusTask> = vec![
            (Box::new(|| "first".to_string()), "f1".to_string()),
            (Box::new(|| "second".to_string()), "f2".to_string()),
            (Box::new(|| "third".to_string()), "f3".to_string()),
        ];
        assert_eq!(
            gather_sections(tasks, 5_000),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn test_gather_sections_runs_concurrently() {
        let tasks: Vec<StatusTask> = (0..3)
            .map(|n| {
                let task: Box<dyn FnOnce() -> String + Send> = Box::new(move || {
                    std::thread::sleep(Duration::from_millis(150));
                    format!("slept {n}")
                });
                (task, format!("fallback {n}"))
            })
            .collect();
        let started = Instant::now();
        let sections = gather_sections(tasks, 5_000);
        let elapsed = started.elapsed();
        assert_eq!(sections.len(), 3);
        assert!(elapsed >= Duration::from_millis(150));
        // Far below the 450ms a serial run would need.
        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
    }

    #[test]
    fn test_gather_sections_deadline_substitutes_fallback() {
        let tasks: Vec<StatusTask> = vec![
            (Box::new(|| "fast".to_string()), "f1".to_string()),
            (
                Box::new(|| {
                    std::thread::sleep(Duration::from_millis(2_000));
                    "slow".to_string()
                }),
                "Gmail Error: timed out".to_string(),
            ),
        ];
        let started = Instant::now();
        let sections = gather_sections(tasks, 250);
        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(sections[0], "fast");
        assert_eq!(sections[1], "Gmail Error: timed out");
    }

    #[test]
    fn test_gather_sections_carries_error_text_inline() {
        let tasks: Vec<StatusTask> = vec![
            (Box::new(|| "sunny".to_string()), "f1".to_string()),
            (
                Box::new(|| "Gmail Error: gmail error 401: expired".to_string()),
                "f2".to_string(),
            ),
            (
                Box::new(|| "No upcoming events found.".to_string()),
                "f3".to_string(),
            ),
        ];
        let sections = gather_sections(tasks, 5_000);
        let text = assemble_status(&sections[0], &sections[1], &sections[2]);
        assert!(text.contains("WEATHER: sunny"));
        assert!(text.contains("GMAIL:\nGmail Error: gmail error 401: expired"));
        assert!(text.contains("CALENDAR:\nNo upcoming events found."));
    }

    #[test]
    fn test_execute_tool_unknown_and_bad_args() {
        let store = idle_store();
        let err = execute_tool("no_such_tool", serde_json::json!({}), &store).unwrap_err();
        assert!(matches!(err, ToolDispatchError::UnknownTool(_)));
        assert_eq!(err.to_string(), "Unknown tool: no_such_tool");

        let err = execute_tool(
            "create_draft",
            serde_json::json!({"subject": "only"}),
            &store,
        )
        .unwrap_err();
        assert!(matches!(err, ToolDispatchError::InvalidArgs(_)));
    }

    #[test]
    fn test_execute_tool_weather_needs_no_credentials() {
        let store = idle_store();
        let exec = execute_tool("get_weather", serde_json::json!({"city": "Oslo"}), &store)
            .unwrap();
        assert_eq!(
            exec.output,
            "The weather in Oslo is currently 65°F and Partly Cloudy."
        );
        assert!(!exec.is_error);

        // Null arguments behave like an empty object.
        let exec = execute_tool("get_weather", serde_json::Value::Null, &store).unwrap();
        assert_eq!(
            exec.output,
            format!("The weather in {DEFAULT_CITY} is currently 65°F and Partly Cloudy.")
        );
    }

    #[test]
    fn test_provider_error_text_stays_in_payload() {
        // Mail and calendar lean on the credential store; with no config on
        // disk the configuration failure must come back as tagged text.
        let store = idle_store();
        let exec = execute_tool("get_unread_emails", serde_json::json!({}), &store).unwrap();
        assert!(exec.output.starts_with("Gmail Error: "), "{}", exec.output);
        assert!(!exec.is_error);

        let exec = execute_tool("get_calendar_events", serde_json::json!({}), &store).unwrap();
        assert!(exec.output.starts_with("Calendar Error: "), "{}", exec.output);
    }
}
