//! Tunables for integrity checking, recovery, the breaker and moderation.

use std::time::Duration;

use chrono::Duration as ChronoDuration;

use crate::breaker::BreakerSettings;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got '{value}'")]
    Invalid { name: String, value: String },
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    /// Consecutive counted provider failures that open the circuit
    pub circuit_breaker_threshold: u32,
    /// Seconds the circuit stays open before a probe is admitted
    pub circuit_breaker_timeout_s: u64,
    /// Failures further apart than this do not extend the streak
    pub circuit_breaker_window_s: u64,
    pub provider_call_timeout_s: u64,
    /// Extra attempts for timeout / network / rate-limited failures
    pub provider_max_retries: u32,
    pub checkpoint_retention_days: u64,
    pub checkpoint_every_turns: u32,
    pub max_recovery_attempts: u32,
    pub recovery_context_ttl_s: u64,
    pub auto_archive_violation_threshold: u32,
    pub auto_archive_window_days: u64,
    pub sweep_batch_size: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_s: 60,
            circuit_breaker_window_s: 300,
            provider_call_timeout_s: 30,
            provider_max_retries: 1,
            checkpoint_retention_days: 7,
            checkpoint_every_turns: 10,
            max_recovery_attempts: 3,
            recovery_context_ttl_s: 120,
            auto_archive_violation_threshold: 5,
            auto_archive_window_days: 7,
            sweep_batch_size: 100,
        }
    }
}

fn read<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            value: raw,
        }),
    }
}

impl GuardConfig {
    /// Load from `CHATGUARD_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            circuit_breaker_threshold: read(
                &lookup,
                "CHATGUARD_CIRCUIT_BREAKER_THRESHOLD",
                d.circuit_breaker_threshold,
            )?,
            circuit_breaker_timeout_s: read(
                &lookup,
                "CHATGUARD_CIRCUIT_BREAKER_TIMEOUT_S",
                d.circuit_breaker_timeout_s,
            )?,
            circuit_breaker_window_s: read(
                &lookup,
                "CHATGUARD_CIRCUIT_BREAKER_WINDOW_S",
                d.circuit_breaker_window_s,
            )?,
            provider_call_timeout_s: read(
                &lookup,
                "CHATGUARD_PROVIDER_CALL_TIMEOUT_S",
                d.provider_call_timeout_s,
            )?,
            provider_max_retries: read(
                &lookup,
                "CHATGUARD_PROVIDER_MAX_RETRIES",
                d.provider_max_retries,
            )?,
            checkpoint_retention_days: read(
                &lookup,
                "CHATGUARD_CHECKPOINT_RETENTION_DAYS",
                d.checkpoint_retention_days,
            )?,
            checkpoint_every_turns: read(
                &lookup,
                "CHATGUARD_CHECKPOINT_EVERY_TURNS",
                d.checkpoint_every_turns,
            )?,
            max_recovery_attempts: read(
                &lookup,
                "CHATGUARD_MAX_RECOVERY_ATTEMPTS",
                d.max_recovery_attempts,
            )?,
            recovery_context_ttl_s: read(
                &lookup,
                "CHATGUARD_RECOVERY_CONTEXT_TTL_S",
                d.recovery_context_ttl_s,
            )?,
            auto_archive_violation_threshold: read(
                &lookup,
                "CHATGUARD_AUTO_ARCHIVE_VIOLATION_THRESHOLD",
                d.auto_archive_violation_threshold,
            )?,
            auto_archive_window_days: read(
                &lookup,
                "CHATGUARD_AUTO_ARCHIVE_WINDOW_DAYS",
                d.auto_archive_window_days,
            )?,
            sweep_batch_size: read(&lookup, "CHATGUARD_SWEEP_BATCH_SIZE", d.sweep_batch_size)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("circuit_breaker_threshold", self.circuit_breaker_threshold as u64),
            ("circuit_breaker_timeout_s", self.circuit_breaker_timeout_s),
            ("circuit_breaker_window_s", self.circuit_breaker_window_s),
            ("provider_call_timeout_s", self.provider_call_timeout_s),
            ("max_recovery_attempts", self.max_recovery_attempts as u64),
            ("recovery_context_ttl_s", self.recovery_context_ttl_s),
            (
                "auto_archive_violation_threshold",
                self.auto_archive_violation_threshold as u64,
            ),
            ("auto_archive_window_days", self.auto_archive_window_days),
            ("sweep_batch_size", self.sweep_batch_size as u64),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        Ok(())
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            threshold: self.circuit_breaker_threshold,
            cooldown: ChronoDuration::seconds(self.circuit_breaker_timeout_s as i64),
            window: ChronoDuration::seconds(self.circuit_breaker_window_s as i64),
        }
    }

    pub fn provider_call_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_call_timeout_s)
    }

    pub fn checkpoint_retention(&self) -> ChronoDuration {
        ChronoDuration::days(self.checkpoint_retention_days as i64)
    }

    pub fn recovery_context_ttl(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.recovery_context_ttl_s as i64)
    }

    pub fn auto_archive_window(&self) -> ChronoDuration {
        ChronoDuration::days(self.auto_archive_window_days as i64)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = GuardConfig::from_lookup(lookup(&[])).expect("defaults are valid");
        assert_eq!(config, GuardConfig::default());
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert_eq!(config.circuit_breaker_timeout_s, 60);
        assert_eq!(config.checkpoint_retention_days, 7);
        assert_eq!(config.max_recovery_attempts, 3);
        assert_eq!(config.auto_archive_violation_threshold, 5);
        assert_eq!(config.auto_archive_window_days, 7);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = GuardConfig::from_lookup(lookup(&[
            ("CHATGUARD_CIRCUIT_BREAKER_THRESHOLD", "2"),
            ("CHATGUARD_PROVIDER_MAX_RETRIES", "0"),
            ("CHATGUARD_SWEEP_BATCH_SIZE", " 25 "),
        ]))
        .expect("valid overrides");
        assert_eq!(config.circuit_breaker_threshold, 2);
        assert_eq!(config.provider_max_retries, 0);
        assert_eq!(config.sweep_batch_size, 25);
        assert_eq!(config.breaker_settings().threshold, 2);
    }

    #[test]
    fn rejects_garbage_and_zero() {
        let err = GuardConfig::from_lookup(lookup(&[("CHATGUARD_MAX_RECOVERY_ATTEMPTS", "many")]))
            .expect_err("non-numeric");
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = GuardConfig::from_lookup(lookup(&[("CHATGUARD_CIRCUIT_BREAKER_THRESHOLD", "0")]))
            .expect_err("zero threshold");
        assert_eq!(
            err,
            ConfigError::Zero {
                name: "circuit_breaker_threshold"
            }
        );
    }
}
