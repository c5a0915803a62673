#[allow(unused_imports)]
use std::path::PathBuf;
use clap::{Parser, Subcommand};

use crate::{DEFAULT_CITY, DEFAULT_DEADLINE_SECS, DEFAULT_MAX_STEPS, DEFAULT_TOOL_TIMEOUT_SECS};

#[derive(Parser)]
#[command(name = "daybrief")]
#[command(about = "Morning-briefing tool server and orchestrator", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the stdio tool server (weather, mail, calendar, search, drafts).
    Serve {
        /// Token file path (default: ./token.json or DAYBRIEF_TOKEN)
        #[arg(long)]
        token: Option<PathBuf>,
        /// Client-secret file path (default: ./credentials.json or DAYBRIEF_CLIENT_SECRET)
        #[arg(long)]
        client_secret: Option<PathBuf>,
    },

    /// Run the orchestrated morning briefing end to end.
    Brief {
        /// City for the weather section.
        #[arg(long, default_value = DEFAULT_CITY)]
        city: String,
        /// Command line for the tool server. Default: re-exec this binary in serve mode.
        #[arg(long)]
        server_cmd: Option<String>,
        /// Maximum reasoning-loop iterations before the run is cut off.
        #[arg(long, default_value_t = DEFAULT_MAX_STEPS)]
        max_steps: usize,
        /// Overall wall-clock deadline for the run, in seconds. 0 disables it.
        #[arg(long, default_value_t = DEFAULT_DEADLINE_SECS)]
        deadline_secs: u64,
        /// Per-tool-call response timeout, in seconds.
        #[arg(long, default_value_t = DEFAULT_TOOL_TIMEOUT_SECS)]
        tool_timeout_secs: u64,
        /// Also emit the full run transcript as JSON.
        #[arg(long)]
        json: bool,
        #[arg(long)]
        token: Option<PathBuf>,
        #[arg(long)]
        client_secret: Option<PathBuf>,
    },

    /// Invoke a single tool in-process and print its text result.
    Call {
        /// Tool name, e.g. get_weather or get_morning_status.
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
        #[arg(long)]
        token: Option<PathBuf>,
        #[arg(long)]
        client_secret: Option<PathBuf>,
    },

    /// Run the interactive Google authorization flow and save the token.
    Connect {
        /// Loopback callback port. 0 picks a free port.
        #[arg(long, default_value_t = 0)]
        port: u16,
        /// How long to wait for the browser callback, in seconds.
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
        #[arg(long)]
        token: Option<PathBuf>,
        #[arg(long)]
        client_secret: Option<PathBuf>,
    },

    /// Show the stored credential's state without touching the network.
    Creds {
        #[arg(long)]
        token: Option<PathBuf>,
    },
}

// ── Tests ────────────────────────────────────────────────────────────────
