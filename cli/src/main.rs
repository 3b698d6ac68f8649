use clap::{Parser, Subcommand};
use uuid::Uuid;

mod commands;
mod util;

#[derive(Parser)]
#[command(name = "chatguard", version, about = "Chatguard CLI: drive chats and operate conversation integrity")]
struct Cli {
    /// API base URL
    #[arg(long, env = "CHATGUARD_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// User to act as on chat routes (normally set by the gateway)
    #[arg(long, env = "CHATGUARD_USER_ID")]
    user_id: Option<Uuid>,

    /// Organization to act as on chat routes
    #[arg(long, env = "CHATGUARD_ORGANIZATION_ID")]
    organization_id: Option<Uuid>,

    /// Operator bearer token for operator routes
    #[arg(long, env = "CHATGUARD_OPERATOR_TOKEN", hide_env_values = true)]
    operator_token: Option<String>,

    /// Include HTTP status and headers (e.g. retry-after) in the output
    #[arg(long, short = 'i', global = true)]
    include: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check API health
    Health,
    /// Chat operations
    Chat {
        #[command(subcommand)]
        command: commands::chat::ChatCommands,
    },
    /// Moderation events and reports
    Moderation {
        #[command(subcommand)]
        command: commands::moderation::ModerationCommands,
    },
    /// LLM provider circuit status (operator)
    Provider {
        #[command(subcommand)]
        command: commands::provider::ProviderCommands,
    },
    /// Integrity stats and maintenance (operator)
    Admin {
        #[command(subcommand)]
        command: commands::admin::AdminCommands,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let api_url = cli.api_url.as_str();
    let token = cli.operator_token.as_deref();
    let (user_id, organization_id) = (cli.user_id, cli.organization_id);
    let caller = || util::require_caller(user_id, organization_id);

    let code = match cli.command {
        Commands::Health => commands::health::run(api_url, cli.include).await,
        Commands::Chat { command } => {
            commands::chat::run(api_url, caller, token, cli.include, command).await
        }
        Commands::Moderation { command } => {
            commands::moderation::run(api_url, caller, token, command).await
        }
        Commands::Provider { command } => commands::provider::run(api_url, token, command).await,
        Commands::Admin { command } => commands::admin::run(api_url, token, command).await,
    };

    std::process::exit(code);
}
