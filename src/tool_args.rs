#[allow(unused_imports)]
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct ToolWeatherArgs {
    #[serde(default)]
    pub(crate) city: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolUnreadMailArgs {
    #[serde(default)]
    pub(crate) limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolCalendarArgs {
    #[serde(default)]
    pub(crate) limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolSearchArgs {
    pub(crate) query: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolDraftArgs {
    pub(crate) subject: String,
    pub(crate) body: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolMorningStatusArgs {
    #[serde(default)]
    pub(crate) city: Option<String>,
}

// ── Tests ────────────────────────────────────────────────────────────────
