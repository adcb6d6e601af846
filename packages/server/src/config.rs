use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// External status vocabulary served to polling clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusVocabulary {
    /// Raw ledger statuses (`queued`, `running`, ...).
    Internal,
    /// Back-compat names (`pending`, `processing`, `completed`, ...).
    #[default]
    Legacy,
}

impl StatusVocabulary {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "internal" => Ok(StatusVocabulary::Internal),
            "legacy" => Ok(StatusVocabulary::Legacy),
            other => anyhow::bail!("invalid STATUS_VOCABULARY_MODE: {other}"),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub nats_url: String,
    pub port: u16,
    pub auth_jwt_secret: String,
    pub app_env: String,

    // Outbox dispatcher
    pub outbox_dispatch_interval_ms: u64,
    pub outbox_claim_batch_size: i64,

    // Worker retry/backoff
    pub job_default_max_attempts: i32,
    pub worker_max_retries: i32,
    pub worker_min_backoff_ms: u64,
    pub worker_max_backoff_ms: u64,

    // Status API
    pub status_vocabulary_mode: StatusVocabulary,

    // Embeddings
    pub vector_size: usize,
    pub embedding_model: String,
    pub embedding_model_ver: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            nats_url: env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            auth_jwt_secret: env::var("AUTH_JWT_SECRET")
                .context("AUTH_JWT_SECRET must be set")?,
            app_env: env::var("APP_ENV").unwrap_or_else(|_| "local".to_string()),
            outbox_dispatch_interval_ms: parse_var("OUTBOX_DISPATCH_INTERVAL_MS", 500)?,
            outbox_claim_batch_size: parse_var("OUTBOX_CLAIM_BATCH_SIZE", 100)?,
            job_default_max_attempts: parse_var("JOB_DEFAULT_MAX_ATTEMPTS", 3)?,
            worker_max_retries: parse_var("WORKER_MAX_RETRIES", 3)?,
            worker_min_backoff_ms: parse_var("WORKER_MIN_BACKOFF_MS", 1_000)?,
            worker_max_backoff_ms: parse_var("WORKER_MAX_BACKOFF_MS", 60_000)?,
            status_vocabulary_mode: StatusVocabulary::parse(
                &env::var("STATUS_VOCABULARY_MODE").unwrap_or_else(|_| "legacy".to_string()),
            )?,
            vector_size: parse_var("VECTOR_SIZE", 384)?,
            embedding_model: env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "hash".to_string()),
            embedding_model_ver: env::var("EMBEDDING_MODEL_VER")
                .unwrap_or_else(|_| "v1".to_string()),
        })
    }

    /// Configuration for tests: no environment access, fast retry timings.
    pub fn for_tests() -> Self {
        Self {
            database_url: "postgres://localhost/conveyor_test".to_string(),
            nats_url: "nats://localhost:4222".to_string(),
            port: 0,
            auth_jwt_secret: "test-secret".to_string(),
            app_env: "test".to_string(),
            outbox_dispatch_interval_ms: 10,
            outbox_claim_batch_size: 100,
            job_default_max_attempts: 3,
            worker_max_retries: 3,
            worker_min_backoff_ms: 1,
            worker_max_backoff_ms: 5,
            status_vocabulary_mode: StatusVocabulary::Legacy,
            vector_size: 384,
            embedding_model: "hash".to_string(),
            embedding_model_ver: "v1".to_string(),
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be a valid number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_parses_known_modes() {
        assert_eq!(
            StatusVocabulary::parse("internal").unwrap(),
            StatusVocabulary::Internal
        );
        assert_eq!(
            StatusVocabulary::parse("legacy").unwrap(),
            StatusVocabulary::Legacy
        );
    }

    #[test]
    fn vocabulary_rejects_unknown_mode() {
        assert!(StatusVocabulary::parse("external").is_err());
    }

    #[test]
    fn test_config_has_fast_backoff() {
        let config = Config::for_tests();
        assert!(config.worker_max_backoff_ms < 100);
        assert_eq!(config.job_default_max_attempts, 3);
    }
}
