use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chatguard_core::breaker::{BreakerState, CircuitBreaker};
use chatguard_core::config::GuardConfig;
use chatguard_core::provider::LlmProvider;
use chatguard_core::resilience::ResilientProvider;
use chatguard_core::sweep::IntegritySweep;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod auth;
mod error;
mod extract;
mod middleware;
mod provider;
mod routes;
mod state;
mod store;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Chatguard API",
        version = "0.1.0",
        description = "Keeps LLM chat histories structurally valid: integrity checks, in-place repair, forking, guarded provider calls and moderation-driven archiving."
    ),
    paths(
        routes::health::health_check,
        routes::provider::provider_health,
        routes::provider::provider_health_check,
        routes::chats::create_chat,
        routes::chats::get_chat,
        routes::chats::post_turn,
        routes::chats::post_tool_response,
        routes::chats::check_integrity,
        routes::chats::repair_chat,
        routes::moderation::record_moderation_event,
        routes::admin::chat_stats,
        routes::admin::recovery_stats,
        routes::admin::moderation_summary,
        routes::admin::repeat_offenders,
        routes::admin::run_sweep,
        routes::admin::purge_checkpoints,
    ),
    components(schemas(
        HealthResponse,
        routes::chats::CreateChatRequest,
        routes::chats::TurnRequest,
        routes::chats::ToolResponseRequest,
        routes::moderation::ModerationEventResponse,
        routes::admin::PurgeResponse,
        chatguard_core::error::ApiError,
        chatguard_core::chat::ChatView,
        chatguard_core::chat::MessageView,
        chatguard_core::chat::ToolCallView,
        chatguard_core::chat::Message,
        chatguard_core::chat::ToolCall,
        chatguard_core::chat::MessageRole,
        chatguard_core::chat::ConversationState,
        chatguard_core::breaker::BreakerState,
        chatguard_core::breaker::HealthStatus,
        chatguard_core::resilience::ProbeStatus,
        chatguard_core::resilience::HealthCheckReport,
        chatguard_core::provider::ProviderErrorKind,
        chatguard_core::healer::HealStatus,
        chatguard_core::healer::HealReport,
        chatguard_core::repair::RepairAction,
        chatguard_core::validator::ViolationKind,
        chatguard_core::turn::ModerationVerdict,
        chatguard_core::turn::TurnReply,
        chatguard_core::moderation::ModerationAction,
        chatguard_core::moderation::ModerationEvent,
        chatguard_core::moderation::ModerationLogEntry,
        chatguard_core::moderation::AutoArchiveDecision,
        chatguard_core::stats::ChatIntegrityStats,
        chatguard_core::stats::RecoveryStats,
        chatguard_core::stats::ViolationSummaryRow,
        chatguard_core::stats::OffenderRow,
        chatguard_core::sweep::SweepReport,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Circuit state of the LLM provider. Informational only.
    pub provider_circuit: BreakerState,
}

fn required_env(name: &str) -> Result<String, String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| format!("{name} must be set"))
}

fn spawn_periodic_sweep(sweep: Arc<IntegritySweep>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; let the service settle before sweeping.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = sweep.run().await {
                tracing::error!(error = %err, kind = err.kind(), "scheduled integrity sweep failed");
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "chatguard_api=debug,chatguard_core=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = GuardConfig::from_env()?;

    // Database connection
    let database_url = required_env("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await?;

    // Run migrations
    sqlx::migrate!("../migrations").run(&pool).await?;

    // LLM provider behind breaker, timeout and retry
    let upstream = provider::OpenAiCompatibleProvider::new(
        &required_env("CHATGUARD_PROVIDER_BASE_URL")?,
        &std::env::var("CHATGUARD_PROVIDER_API_KEY").unwrap_or_default(),
        &required_env("CHATGUARD_PROVIDER_MODEL")?,
        config.provider_call_timeout(),
    )?;
    let breaker = Arc::new(CircuitBreaker::new(
        upstream.name().to_string(),
        config.breaker_settings(),
    ));
    let resilient = Arc::new(ResilientProvider::new(
        Arc::new(upstream),
        breaker,
        config.provider_call_timeout(),
        config.provider_max_retries,
    ));

    let operator_token_sha256 = std::env::var("CHATGUARD_OPERATOR_TOKEN_SHA256")
        .ok()
        .map(|hash| hash.trim().to_ascii_lowercase())
        .filter(|hash| !hash.is_empty());
    if operator_token_sha256.is_none() {
        tracing::warn!("CHATGUARD_OPERATOR_TOKEN_SHA256 not set; operator routes are disabled");
    }

    let app_state = state::AppState::new(
        pool.clone(),
        store::postgres(pool),
        resilient,
        config,
        operator_token_sha256,
    );

    if let Some(secs) = std::env::var("CHATGUARD_SWEEP_INTERVAL_S")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
    {
        tracing::info!(interval_s = secs, "scheduled integrity sweep enabled");
        spawn_periodic_sweep(app_state.sweep.clone(), Duration::from_secs(secs));
    }

    // CORS
    let cors_layer = middleware::cors::build_cors_layer();

    // Router with per-group rate limiting
    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::chats::router().layer(middleware::rate_limit::chat_write_layer()?))
        .merge(routes::moderation::router().layer(middleware::rate_limit::moderation_layer()?))
        .merge(
            routes::chats::operator_router().layer(middleware::rate_limit::operator_layer()?),
        )
        .merge(routes::provider::router().layer(middleware::rate_limit::operator_layer()?))
        .merge(routes::admin::router().layer(middleware::rate_limit::operator_layer()?))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Chatguard API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
