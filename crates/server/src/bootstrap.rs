use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use leadline_agent::llm::{LlmError, OpenAiCompatClient};
use leadline_agent::planner::QueryPlanner;
use leadline_agent::runtime::AgentLimits;
use leadline_agent::{LlmPlanner, QueryAgent, RulePlanner};
use leadline_core::audit::TracingAuditSink;
use leadline_core::compose::ComposePolicy;
use leadline_core::config::{AppConfig, ConfigError, LoadOptions};
use leadline_db::repositories::SqlMessageRepository;
use leadline_db::{connect_with_settings, migrations, DbPool, LeadLedger, ReadOnlyExecutor};
use leadline_webhook::processor::MessageProcessor;
use leadline_webhook::push::{DeliveryClient, DeliveryError, HttpDeliveryClient, NoopDeliveryClient};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub processor: Arc<MessageProcessor<Box<dyn QueryPlanner>>>,
    pub delivery: Arc<dyn DeliveryClient>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("llm client init failed: {0}")]
    Llm(#[source] LlmError),
    #[error("delivery client init failed: {0}")]
    Delivery(#[source] DeliveryError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let planner: Box<dyn QueryPlanner> = match &config.llm.api_key {
        Some(api_key) => {
            let client = OpenAiCompatClient::new(
                config.llm.base_url.clone(),
                config.llm.model.clone(),
                api_key.clone(),
                Duration::from_secs(config.llm.timeout_secs),
            )
            .map_err(BootstrapError::Llm)?;
            Box::new(LlmPlanner::new(client))
        }
        // No model configured: the deterministic rule planner keeps the
        // common query shapes answerable.
        None => Box::new(RulePlanner::new()),
    };

    let agent = QueryAgent::new(
        planner,
        ReadOnlyExecutor::new(db_pool.clone()),
        AgentLimits::from_config(&config.agent),
    );

    let processor = Arc::new(MessageProcessor::new(
        Arc::new(SqlMessageRepository::new(db_pool.clone())),
        Arc::new(LeadLedger::new(db_pool.clone())),
        agent,
        ComposePolicy { max_chars: config.agent.reply_max_chars, ..ComposePolicy::default() },
        Arc::new(TracingAuditSink),
    ));

    let delivery: Arc<dyn DeliveryClient> = match &config.webhook.robot_id {
        Some(robot_id) => Arc::new(
            HttpDeliveryClient::new(
                config.webhook.push_base_url.clone(),
                robot_id.clone(),
                Duration::from_secs(config.webhook.push_timeout_secs),
            )
            .map_err(BootstrapError::Delivery)?,
        ),
        None => Arc::new(NoopDeliveryClient),
    };

    Ok(Application { config, db_pool, processor, delivery })
}

#[cfg(test)]
mod tests {
    use leadline_core::config::{ConfigOverrides, LoadOptions};

    use super::bootstrap;

    #[tokio::test]
    async fn bootstrap_connects_migrates_and_assembles_the_pipeline() {
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:?cache=shared".to_owned()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap succeeds with in-memory database");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('raw_message', 'lead', 'process_log', 'feedback')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("baseline tables present");
        assert_eq!(table_count, 4);

        app.db_pool.close().await;
    }
}
