use std::time::Duration;

use leadline_agent::llm::OpenAiCompatClient;
use leadline_agent::planner::QueryPlanner;
use leadline_agent::runtime::AgentLimits;
use leadline_agent::{LlmPlanner, QueryAgent, RulePlanner};
use leadline_core::config::{AppConfig, LoadOptions};
use leadline_db::{connect_with_settings, migrations, ReadOnlyExecutor};

use crate::commands::CommandResult;

/// One-shot agent invocation against the configured database. Mirrors the
/// webhook query path without the webhook.
pub fn run(question: &str, show_trace: bool) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "ask",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "ask",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let outcome = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let planner: Box<dyn QueryPlanner> = match &config.llm.api_key {
            Some(api_key) => {
                let client = OpenAiCompatClient::new(
                    config.llm.base_url.clone(),
                    config.llm.model.clone(),
                    api_key.clone(),
                    Duration::from_secs(config.llm.timeout_secs),
                )
                .map_err(|error| ("llm_init", error.to_string(), 6u8))?;
                Box::new(LlmPlanner::new(client))
            }
            None => Box::new(RulePlanner::new()),
        };

        let agent = QueryAgent::new(
            planner,
            ReadOnlyExecutor::new(pool.clone()),
            AgentLimits::from_config(&config.agent),
        );
        let outcome = agent.answer(question).await;
        pool.close().await;
        Ok::<_, (&'static str, String, u8)>(outcome)
    });

    match outcome {
        Ok(outcome) => {
            let message = if show_trace {
                let trace = serde_json::to_string_pretty(&outcome.trace)
                    .unwrap_or_else(|_| "<trace unavailable>".to_owned());
                format!("{}\n{trace}", outcome.summary)
            } else {
                outcome.summary
            };
            CommandResult::success("ask", message)
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("ask", error_class, message, exit_code)
        }
    }
}
