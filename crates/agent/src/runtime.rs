use std::time::Duration;

use tokio::time::Instant;

use leadline_core::config::AgentConfig;
use leadline_db::readonly::{ReadOnlyError, ReadOnlyExecutor};

use crate::guard::check_read_only;
use crate::planner::QueryPlanner;
use crate::trace::{AgentAction, Observation, QueryTrace, TraceStep};

/// Rows carried into an observation for follow-up prompts and the trace.
const PREVIEW_ROWS: usize = 10;

pub const FALLBACK_SUMMARY: &str = "抱歉，这个问题我暂时没能得出答案，请换个问法再试。";
pub const EMPTY_QUESTION_REPLY: &str = "请补充想查询的内容。";

#[derive(Clone, Copy, Debug)]
pub struct AgentLimits {
    pub max_rounds: usize,
    pub overall_timeout: Duration,
    pub call_timeout: Duration,
    pub row_cap: usize,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_rounds: 6,
            overall_timeout: Duration::from_secs(20),
            call_timeout: Duration::from_secs(10),
            row_cap: 50,
        }
    }
}

impl AgentLimits {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_rounds: config.max_rounds,
            overall_timeout: Duration::from_secs(config.overall_timeout_secs),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            row_cap: config.row_cap,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AnswerOutcome {
    pub summary: String,
    pub trace: QueryTrace,
}

/// The bounded think → act → observe loop. Terminates within
/// `limits.max_rounds` planner decisions or `limits.overall_timeout`,
/// whichever comes first; `answer` itself never fails.
pub struct QueryAgent<P> {
    planner: P,
    executor: ReadOnlyExecutor,
    limits: AgentLimits,
}

impl<P> QueryAgent<P>
where
    P: QueryPlanner,
{
    pub fn new(planner: P, executor: ReadOnlyExecutor, limits: AgentLimits) -> Self {
        Self { planner, executor, limits }
    }

    pub async fn answer(&self, question: &str) -> AnswerOutcome {
        let question = question.trim();
        let mut trace = QueryTrace::new(question);

        if question.is_empty() {
            trace.summary = EMPTY_QUESTION_REPLY.to_owned();
            return AnswerOutcome { summary: trace.summary.clone(), trace };
        }

        let deadline = Instant::now() + self.limits.overall_timeout;

        for round in 0..self.limits.max_rounds {
            let Some(budget) = remaining(deadline) else {
                return self.timed_out(trace, round);
            };

            let planned = tokio::time::timeout(
                budget.min(self.limits.call_timeout),
                self.planner.plan(question, &trace.steps),
            )
            .await;

            let action = match planned {
                // Deadline hit mid-call: the in-flight action is abandoned
                // and no further iteration starts.
                Err(_) => return self.timed_out(trace, round),
                Ok(Err(error)) => {
                    tracing::warn!(
                        event_name = "agent.plan.failed",
                        round,
                        error = %error,
                        "planner failed; returning fallback summary"
                    );
                    trace.summary = FALLBACK_SUMMARY.to_owned();
                    return AnswerOutcome { summary: trace.summary.clone(), trace };
                }
                Ok(Ok(action)) => action,
            };

            match action {
                AgentAction::FinalAnswer { ref text } => {
                    trace.summary = text.clone();
                    trace.steps.push(TraceStep { action, observation: None });
                    return AnswerOutcome { summary: trace.summary.clone(), trace };
                }
                AgentAction::Clarify { ref prompt } => {
                    trace.summary = prompt.clone();
                    trace.steps.push(TraceStep { action, observation: None });
                    return AnswerOutcome { summary: trace.summary.clone(), trace };
                }
                AgentAction::RunQuery { sql } => {
                    if let Err(violation) = check_read_only(&sql) {
                        tracing::info!(
                            event_name = "agent.query.rejected",
                            round,
                            reason = %violation,
                            "candidate statement rejected by read-only policy"
                        );
                        trace.steps.push(TraceStep {
                            action: AgentAction::RunQuery { sql },
                            observation: Some(Observation::Rejected {
                                reason: format!("not permitted: {violation}"),
                            }),
                        });
                        continue;
                    }

                    let Some(budget) = remaining(deadline) else {
                        return self.timed_out(trace, round);
                    };
                    let run = self
                        .executor
                        .run(&sql, self.limits.row_cap, budget.min(self.limits.call_timeout))
                        .await;

                    match run {
                        Ok(rows) => {
                            trace.final_sql = Some(sql.clone());
                            let preview =
                                rows.rows.iter().take(PREVIEW_ROWS).cloned().collect();
                            trace.steps.push(TraceStep {
                                action: AgentAction::RunQuery { sql },
                                observation: Some(Observation::Rows {
                                    columns: rows.columns,
                                    preview,
                                    total: rows.rows.len(),
                                    truncated: rows.truncated,
                                }),
                            });
                        }
                        Err(ReadOnlyError::Timeout) => return self.timed_out(trace, round),
                        Err(ReadOnlyError::Execution(detail)) => {
                            trace.steps.push(TraceStep {
                                action: AgentAction::RunQuery { sql },
                                observation: Some(Observation::Failed {
                                    kind: format!("query failed: {detail}"),
                                }),
                            });
                        }
                    }
                }
            }
        }

        tracing::info!(
            event_name = "agent.ceiling_reached",
            rounds = self.limits.max_rounds,
            "agent hit the iteration ceiling without a final answer"
        );
        trace.summary = FALLBACK_SUMMARY.to_owned();
        AnswerOutcome { summary: trace.summary.clone(), trace }
    }

    fn timed_out(&self, mut trace: QueryTrace, round: usize) -> AnswerOutcome {
        tracing::info!(
            event_name = "agent.timed_out",
            round,
            "agent deadline elapsed; aborting loop"
        );
        trace.summary = FALLBACK_SUMMARY.to_owned();
        AnswerOutcome { summary: trace.summary.clone(), trace }
    }
}

fn remaining(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use leadline_core::domain::lead::{Lead, LeadCode, LeadStatus};
    use leadline_db::readonly::ReadOnlyExecutor;
    use leadline_db::repositories::{LeadRepository, SqlLeadRepository};
    use leadline_db::{connect_with_settings, migrations};

    use crate::planner::{PlanError, QueryPlanner, RulePlanner};
    use crate::trace::{AgentAction, Observation, TraceStep};

    use super::{AgentLimits, QueryAgent, EMPTY_QUESTION_REPLY, FALLBACK_SUMMARY};

    async fn seeded_pool(leads: usize) -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let repo = SqlLeadRepository::new(pool.clone());
        let now = Utc::now();
        for i in 0..leads {
            repo.save(Lead {
                code: LeadCode(format!("L20260807{i:04}")),
                display_name: format!("家长{i}"),
                phone: None,
                status: LeadStatus::NewContact,
                deal_amount: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("seed");
        }
        pool
    }

    fn tight_limits() -> AgentLimits {
        AgentLimits {
            max_rounds: 6,
            overall_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(2),
            row_cap: 50,
        }
    }

    /// Planner that replays a fixed script of actions.
    struct ScriptedPlanner {
        script: std::sync::Mutex<Vec<AgentAction>>,
    }

    impl ScriptedPlanner {
        fn new(actions: Vec<AgentAction>) -> Self {
            Self { script: std::sync::Mutex::new(actions) }
        }
    }

    #[async_trait]
    impl QueryPlanner for ScriptedPlanner {
        async fn plan(
            &self,
            _question: &str,
            _steps: &[TraceStep],
        ) -> Result<AgentAction, PlanError> {
            let mut script = self.script.lock().expect("script lock");
            if script.is_empty() {
                return Ok(AgentAction::RunQuery {
                    sql: "SELECT COUNT(*) FROM lead".to_owned(),
                });
            }
            Ok(script.remove(0))
        }
    }

    /// Planner that never returns within any reasonable budget.
    struct StallingPlanner;

    #[async_trait]
    impl QueryPlanner for StallingPlanner {
        async fn plan(
            &self,
            _question: &str,
            _steps: &[TraceStep],
        ) -> Result<AgentAction, PlanError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("sleep outlives every test deadline")
        }
    }

    #[tokio::test]
    async fn weekly_count_question_round_trips_through_rule_planner() {
        let pool = seeded_pool(3).await;
        let agent =
            QueryAgent::new(RulePlanner::new(), ReadOnlyExecutor::new(pool), tight_limits());

        let outcome = agent.answer("上周新增了多少家长？").await;

        assert_eq!(outcome.summary, "查询结果：3");
        let sql = outcome.trace.final_sql.as_deref().expect("executed sql");
        assert!(sql.starts_with("SELECT COUNT(*)"));
        assert!(outcome
            .trace
            .executed_sql()
            .iter()
            .all(|sql| sql.trim_start().to_ascii_uppercase().starts_with("SELECT")));
    }

    #[tokio::test]
    async fn mutating_proposal_is_rejected_and_nothing_is_deleted() {
        let pool = seeded_pool(2).await;
        let planner = ScriptedPlanner::new(vec![
            AgentAction::RunQuery { sql: "DELETE FROM lead".to_owned() },
            AgentAction::FinalAnswer { text: "好的。".to_owned() },
        ]);
        let agent = QueryAgent::new(planner, ReadOnlyExecutor::new(pool.clone()), tight_limits());

        let outcome = agent.answer("删除所有家长").await;

        assert_eq!(outcome.trace.rejected_count(), 1);
        assert!(outcome.trace.executed_sql().is_empty());
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM lead")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn ceiling_bounds_a_planner_that_never_finishes() {
        let pool = seeded_pool(1).await;
        let planner = ScriptedPlanner::new(Vec::new());
        let agent = QueryAgent::new(planner, ReadOnlyExecutor::new(pool), tight_limits());

        let outcome = agent.answer("一直查下去").await;

        assert_eq!(outcome.summary, FALLBACK_SUMMARY);
        assert_eq!(outcome.trace.steps.len(), 6);
    }

    #[tokio::test]
    async fn wall_clock_timeout_aborts_the_loop() {
        let pool = seeded_pool(1).await;
        let limits = AgentLimits {
            max_rounds: 6,
            overall_timeout: Duration::from_millis(100),
            call_timeout: Duration::from_secs(60),
            row_cap: 50,
        };
        let agent = QueryAgent::new(StallingPlanner, ReadOnlyExecutor::new(pool), limits);

        let started = std::time::Instant::now();
        let outcome = agent.answer("有多少家长？").await;

        assert_eq!(outcome.summary, FALLBACK_SUMMARY);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(outcome.trace.steps.is_empty());
    }

    #[tokio::test]
    async fn malformed_sql_feeds_back_as_failed_observation() {
        let pool = seeded_pool(1).await;
        let planner = ScriptedPlanner::new(vec![
            AgentAction::RunQuery { sql: "SELECT no_such_column FROM lead".to_owned() },
            AgentAction::FinalAnswer { text: "换个问法吧。".to_owned() },
        ]);
        let agent = QueryAgent::new(planner, ReadOnlyExecutor::new(pool), tight_limits());

        let outcome = agent.answer("查一下").await;

        assert!(matches!(
            outcome.trace.steps[0].observation,
            Some(Observation::Failed { ref kind }) if kind.starts_with("query failed:")
        ));
        assert_eq!(outcome.summary, "换个问法吧。");
    }

    #[tokio::test]
    async fn empty_question_fails_gracefully() {
        let pool = seeded_pool(0).await;
        let agent =
            QueryAgent::new(RulePlanner::new(), ReadOnlyExecutor::new(pool), tight_limits());

        let outcome = agent.answer("   ").await;

        assert_eq!(outcome.summary, EMPTY_QUESTION_REPLY);
        assert!(outcome.trace.steps.is_empty());
    }

    #[tokio::test]
    async fn clarification_is_terminal() {
        let pool = seeded_pool(0).await;
        let agent =
            QueryAgent::new(RulePlanner::new(), ReadOnlyExecutor::new(pool), tight_limits());

        let outcome = agent.answer("早上好").await;

        assert_eq!(outcome.trace.steps.len(), 1);
        assert!(matches!(
            outcome.trace.steps[0].action,
            AgentAction::Clarify { .. }
        ));
    }
}
