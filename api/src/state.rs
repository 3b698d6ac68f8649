use std::sync::Arc;

use chatguard_core::config::GuardConfig;
use chatguard_core::healer::ConversationHealer;
use chatguard_core::moderation::ModerationLedger;
use chatguard_core::resilience::ResilientProvider;
use chatguard_core::store::Stores;
use chatguard_core::sweep::IntegritySweep;
use chatguard_core::turn::TurnProcessor;
use sqlx::PgPool;

/// Commits retried after losing a version race before the turn gives up.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: GuardConfig,
    pub stores: Stores,
    pub healer: Arc<ConversationHealer>,
    pub turns: Arc<TurnProcessor>,
    pub ledger: Arc<ModerationLedger>,
    pub provider: Arc<ResilientProvider>,
    pub sweep: Arc<IntegritySweep>,
    /// Hex SHA-256 of the operator bearer token. Operator routes answer 403
    /// when unset.
    pub operator_token_sha256: Option<String>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        stores: Stores,
        provider: Arc<ResilientProvider>,
        config: GuardConfig,
        operator_token_sha256: Option<String>,
    ) -> Self {
        let healer = Arc::new(ConversationHealer::new(stores.clone(), config.clone()));
        let ledger = Arc::new(ModerationLedger::new(
            stores.chats.clone(),
            stores.moderation.clone(),
            config.auto_archive_violation_threshold,
            config.auto_archive_window(),
        ));
        let turns = Arc::new(TurnProcessor::new(
            healer.clone(),
            provider.clone(),
            ledger.clone(),
            MAX_COMMIT_ATTEMPTS,
        ));
        let sweep = Arc::new(IntegritySweep::new(healer.clone(), config.sweep_batch_size));
        Self {
            db,
            config,
            stores,
            healer,
            turns,
            ledger,
            provider,
            sweep,
            operator_token_sha256,
        }
    }
}
