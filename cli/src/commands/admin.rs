use clap::Subcommand;
use serde_json::json;

use crate::util::{api_request, require_operator_token, to_pretty};

#[derive(Subcommand)]
pub enum AdminCommands {
    /// Chat counts by state and orphaned tool messages
    Stats,
    /// Recovery outcomes and success rate
    Recovery {
        /// Look-back window in hours
        #[arg(long, default_value_t = 24)]
        since_hours: i64,
    },
    /// Validate and heal every open chat now
    Sweep,
    /// Delete checkpoints past the retention period
    Purge,
    /// Generate a new operator token and the hash the API expects
    Token,
}

pub async fn run(api_url: &str, token: Option<&str>, command: AdminCommands) -> i32 {
    let (method, path, query) = match command {
        AdminCommands::Token => {
            let (token, sha256) = chatguard_core::auth::generate_operator_token();
            println!(
                "{}",
                to_pretty(&json!({
                    "operator_token": token,
                    "CHATGUARD_OPERATOR_TOKEN_SHA256": sha256,
                    "note": "Give the token to operators; configure only the hash on the API."
                }))
            );
            return 0;
        }
        AdminCommands::Stats => (reqwest::Method::GET, "/v1/admin/stats/chats", Vec::new()),
        AdminCommands::Recovery { since_hours } => (
            reqwest::Method::GET,
            "/v1/admin/stats/recovery",
            vec![("since_hours".to_string(), since_hours.to_string())],
        ),
        AdminCommands::Sweep => (reqwest::Method::POST, "/v1/admin/sweep", Vec::new()),
        AdminCommands::Purge => (
            reqwest::Method::POST,
            "/v1/admin/checkpoints/purge",
            Vec::new(),
        ),
    };
    let token = require_operator_token(token);
    api_request(api_url, method, path, Some(token), None, &query, &[], false).await
}
