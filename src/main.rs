// Module declarations
mod cli;
mod types;
mod tool_args;
mod util;
mod config;
mod auth;
mod tool_defs;
mod tool_exec;
mod mcp;
mod claude;
mod agent;

// Re-export all module items at crate root so cross-module references work.
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use types::*;
#[allow(unused_imports)]
pub(crate) use tool_args::*;
#[allow(unused_imports)]
pub(crate) use util::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use auth::*;
#[allow(unused_imports)]
pub(crate) use tool_defs::*;
#[allow(unused_imports)]
pub(crate) use tool_exec::*;
#[allow(unused_imports)]
pub(crate) use mcp::*;
#[allow(unused_imports)]
pub(crate) use claude::*;
#[allow(unused_imports)]
pub(crate) use agent::*;

use std::sync::Arc;

use clap::Parser;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            token,
            client_secret,
        } => run_tool_server(
            resolve_token_path(token),
            resolve_client_secret_path(client_secret),
        ),

        Command::Brief {
            city,
            server_cmd,
            max_steps,
            deadline_secs,
            tool_timeout_secs,
            json,
            token,
            client_secret,
        } => run_brief(BriefSettings {
            city,
            server_cmd,
            max_steps,
            deadline_secs: (deadline_secs > 0).then_some(deadline_secs),
            tool_timeout_secs,
            json,
            token_path: resolve_token_path(token),
            client_secret_path: resolve_client_secret_path(client_secret),
        }),

        Command::Call {
            tool,
            args,
            token,
            client_secret,
        } => {
            let arguments: serde_json::Value = serde_json::from_str(&args)
                .map_err(|e| format!("--args must be a JSON object: {e}"))?;
            let store = Arc::new(CredentialStore::new(
                resolve_token_path(token),
                resolve_client_secret_path(client_secret),
            ));
            let exec = execute_tool(&tool, arguments, &store)?;
            println!("{}", exec.output);
            Ok(())
        }

        Command::Connect {
            port,
            timeout_secs,
            token,
            client_secret,
        } => run_connect(
            resolve_token_path(token),
            resolve_client_secret_path(client_secret),
            port,
            timeout_secs,
        ),

        Command::Creds { token } => {
            println!("{}", credential_status(&resolve_token_path(token))?);
            Ok(())
        }
    }
}
