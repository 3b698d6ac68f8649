use clap::Subcommand;

use crate::util::{api_request, require_operator_token};

#[derive(Subcommand)]
pub enum ProviderCommands {
    /// Show the provider circuit breaker status
    Status,
    /// Probe the provider now (does not change the circuit state)
    Check,
}

pub async fn run(api_url: &str, token: Option<&str>, command: ProviderCommands) -> i32 {
    let token = require_operator_token(token);
    let (method, path) = match command {
        ProviderCommands::Status => (reqwest::Method::GET, "/v1/provider/health"),
        ProviderCommands::Check => (reqwest::Method::POST, "/v1/provider/health/check"),
    };
    api_request(api_url, method, path, Some(token), None, &[], &[], false).await
}
