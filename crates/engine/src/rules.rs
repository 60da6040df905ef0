//! Filter rule backing store.
//!
//! Rules are read from PostgreSQL only on a cache miss; the classifier keeps
//! the working copy in the shared store.

use async_trait::async_trait;
use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::FilterRule;

/// Source of truth for a service's suppression rules.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn load_rules(&self, service_name: &str) -> Result<Vec<FilterRule>, AppError>;
}

/// Reads rules from the `alarm_filter_words` table.
pub struct PgRuleSource {
    pool: PgPool,
}

impl PgRuleSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleSource for PgRuleSource {
    async fn load_rules(&self, service_name: &str) -> Result<Vec<FilterRule>, AppError> {
        let rules: Vec<FilterRule> = sqlx::query_as(
            "SELECT msg, cooldown_times FROM alarm_filter_words WHERE platform = $1 ORDER BY id",
        )
        .bind(service_name)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(
            service = service_name,
            rules = rules.len(),
            "Loaded alarm filter rules from database"
        );

        Ok(rules)
    }
}

/// Fixed in-memory rule set, for wiring without a database.
pub struct StaticRuleSource {
    rules: Vec<FilterRule>,
}

impl StaticRuleSource {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl RuleSource for StaticRuleSource {
    async fn load_rules(&self, _service_name: &str) -> Result<Vec<FilterRule>, AppError> {
        Ok(self.rules.clone())
    }
}
