use chatguard_core::moderation::ModerationAction;
use clap::Subcommand;
use serde_json::json;
use uuid::Uuid;

use crate::util::{Caller, api_request, exit_error, require_operator_token};

#[derive(Subcommand)]
pub enum ModerationCommands {
    /// Record a moderation outcome for a message in one of your chats
    Record {
        #[arg(long)]
        chat_id: Uuid,
        #[arg(long)]
        message_id: Option<Uuid>,
        /// Violation category (e.g. "harassment", "spam")
        #[arg(long)]
        violation_type: String,
        /// logged, warned, blocked or archived
        #[arg(long)]
        action: String,
        /// When the violation was detected (RFC3339). Defaults to now.
        #[arg(long)]
        detected_at: Option<String>,
    },
    /// Violations by type and action for an organization (operator)
    Summary {
        #[arg(long)]
        organization_id: Uuid,
        /// Window start (RFC3339). Defaults to 30 days before --until.
        #[arg(long)]
        since: Option<String>,
        /// Window end (RFC3339). Defaults to now.
        #[arg(long)]
        until: Option<String>,
    },
    /// Users with repeated blocked messages (operator)
    Offenders {
        #[arg(long)]
        organization_id: Option<Uuid>,
        #[arg(long, default_value_t = 30)]
        since_days: i64,
        #[arg(long, default_value_t = 3)]
        min_blocked: i64,
    },
}

fn parse_timestamp(flag: &str, raw: &str) -> String {
    match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts.with_timezone(&chrono::Utc).to_rfc3339(),
        Err(e) => exit_error(
            &format!("Invalid --{flag} timestamp '{raw}': {e}"),
            Some("Use RFC3339, e.g. 2026-03-01T12:00:00Z."),
        ),
    }
}

pub async fn run(
    api_url: &str,
    caller: impl FnOnce() -> Caller,
    token: Option<&str>,
    command: ModerationCommands,
) -> i32 {
    match command {
        ModerationCommands::Record {
            chat_id,
            message_id,
            violation_type,
            action,
            detected_at,
        } => {
            let Some(action) = ModerationAction::parse(action.trim()) else {
                exit_error(
                    &format!("Unknown moderation action '{action}'"),
                    Some("Use one of: logged, warned, blocked, archived."),
                );
            };
            let caller = caller();
            let mut body = json!({
                "chat_id": chat_id,
                "user_id": caller.user_id,
                "organization_id": caller.organization_id,
                "violation_type": violation_type,
                "action_taken": action.as_str(),
            });
            if let Some(message_id) = message_id {
                body["message_id"] = json!(message_id);
            }
            if let Some(raw) = detected_at.as_deref() {
                body["detected_at"] = json!(parse_timestamp("detected-at", raw));
            }
            api_request(
                api_url,
                reqwest::Method::POST,
                "/v1/moderation/events",
                None,
                Some(body),
                &[],
                &caller.headers(),
                false,
            )
            .await
        }
        ModerationCommands::Summary {
            organization_id,
            since,
            until,
        } => {
            let token = require_operator_token(token);
            let mut query = vec![("organization_id".to_string(), organization_id.to_string())];
            if let Some(raw) = since.as_deref() {
                query.push(("since".to_string(), parse_timestamp("since", raw)));
            }
            if let Some(raw) = until.as_deref() {
                query.push(("until".to_string(), parse_timestamp("until", raw)));
            }
            api_request(
                api_url,
                reqwest::Method::GET,
                "/v1/admin/moderation/summary",
                Some(token),
                None,
                &query,
                &[],
                false,
            )
            .await
        }
        ModerationCommands::Offenders {
            organization_id,
            since_days,
            min_blocked,
        } => {
            let token = require_operator_token(token);
            let mut query = vec![
                ("since_days".to_string(), since_days.to_string()),
                ("min_blocked".to_string(), min_blocked.to_string()),
            ];
            if let Some(org) = organization_id {
                query.push(("organization_id".to_string(), org.to_string()));
            }
            api_request(
                api_url,
                reqwest::Method::GET,
                "/v1/admin/moderation/offenders",
                Some(token),
                None,
                &query,
                &[],
                false,
            )
            .await
        }
    }
}
