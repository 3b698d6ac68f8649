//! Background pass over every open chat.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::healer::{ConversationHealer, HealStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct SweepReport {
    pub scanned: u64,
    pub stable: u64,
    pub healed: u64,
    pub forked: u64,
    /// Chats another repair was already working on
    pub skipped: u64,
    pub failed: u64,
    pub expired_contexts: u64,
}

pub struct IntegritySweep {
    healer: Arc<ConversationHealer>,
    batch_size: u32,
}

impl IntegritySweep {
    pub fn new(healer: Arc<ConversationHealer>, batch_size: u32) -> Self {
        Self {
            healer,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(&self) -> Result<SweepReport, crate::error::ChatGuardError> {
        let stores = self.healer.stores();
        let mut report = SweepReport {
            expired_contexts: stores.recovery.expire_stale(Utc::now()).await?,
            ..SweepReport::default()
        };

        let mut after = None;
        loop {
            let page = stores.chats.list_open(after, self.batch_size).await?;
            let Some(last) = page.last().copied() else {
                break;
            };
            for chat_id in page {
                report.scanned += 1;
                match self.healer.validate_and_heal_state(chat_id).await {
                    Ok(heal) => match heal.status {
                        HealStatus::Stable => report.stable += 1,
                        HealStatus::Healed => report.healed += 1,
                        HealStatus::Forked => report.forked += 1,
                        HealStatus::Skipped => report.skipped += 1,
                        HealStatus::Archived | HealStatus::Moved => {}
                    },
                    Err(err) => {
                        report.failed += 1;
                        tracing::error!(chat_id = %chat_id, error = %err, kind = err.kind(), "sweep repair failed");
                    }
                }
            }
            after = Some(last);
        }

        tracing::info!(
            scanned = report.scanned,
            healed = report.healed,
            forked = report.forked,
            skipped = report.skipped,
            failed = report.failed,
            "integrity sweep finished"
        );
        Ok(report)
    }
}
