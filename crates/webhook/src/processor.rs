//! One inbound delivery, end to end: durable ingest (dedup) → routing →
//! ledger apply or query agent → composed reply → acknowledgement.
//!
//! `handle` never returns an error: every internal fault is converted into
//! a best-effort acknowledgement plus an audit event, so the relay always
//! gets its answer and retry storms cannot start.

use std::sync::Arc;

use leadline_agent::planner::QueryPlanner;
use leadline_agent::QueryAgent;
use leadline_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use leadline_core::classify::{classify, Classification, LedgerSnapshot};
use leadline_core::compose::{compose, ComposePolicy};
use leadline_core::domain::lead::{LeadStatus, TemplateCategory};
use leadline_core::errors::ApplicationError;
use leadline_db::ledger::AppliedEntry;
use leadline_db::repositories::MessageRepository;
use leadline_db::LeadLedger;

use crate::events::{mentions_bot, strip_leading_mention, Ack, WebhookEnvelope, WebhookEvent};

pub struct MessageProcessor<P> {
    store: Arc<dyn MessageRepository>,
    ledger: Arc<LeadLedger>,
    agent: QueryAgent<P>,
    compose_policy: ComposePolicy,
    audit: Arc<dyn AuditSink>,
}

impl<P> MessageProcessor<P>
where
    P: QueryPlanner,
{
    pub fn new(
        store: Arc<dyn MessageRepository>,
        ledger: Arc<LeadLedger>,
        agent: QueryAgent<P>,
        compose_policy: ComposePolicy,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { store, ledger, agent, compose_policy, audit }
    }

    pub async fn handle(&self, envelope: &WebhookEnvelope) -> Ack {
        let correlation_id = envelope.envelope_id.as_str();
        let WebhookEvent::Delivery { message, at_bot } = &envelope.event else {
            return Ack::no_op();
        };

        if message.body.trim().is_empty() {
            return Ack { success: true, handled: false, content: Some("消息内容为空".to_owned()) };
        }

        // Storage first: classification results are keyed off a stored
        // message, so a storage fault stops the pipeline here.
        let receipt = match self.store.ingest(message).await {
            Ok(receipt) => receipt,
            Err(error) => {
                tracing::warn!(
                    event_name = "ingress.store.failed",
                    correlation_id,
                    error = %error,
                    "message ingest failed; acknowledging with no effect"
                );
                self.audit.emit(AuditEvent::new(
                    None,
                    None,
                    correlation_id,
                    "ingress.store.failed",
                    AuditCategory::Ingress,
                    AuditOutcome::Failed,
                ));
                return Ack::retryable();
            }
        };

        let stored = &receipt.stored;
        if !receipt.is_new {
            // Duplicate delivery: the first pass already produced whatever
            // effects there were. At-most-once, so do not re-process.
            self.audit.emit(AuditEvent::new(
                Some(stored.dedup_key.0.clone()),
                None,
                correlation_id,
                "ingress.duplicate_delivery",
                AuditCategory::Ingress,
                AuditOutcome::Success,
            ));
            return Ack::no_op();
        }

        // A bot mention always routes to the query agent, template tag or
        // not: people quote templates when asking about them.
        if *at_bot || mentions_bot(&stored.body) {
            let question = strip_leading_mention(&stored.body);
            let outcome = self.agent.answer(question).await;
            self.audit.emit(
                AuditEvent::new(
                    Some(stored.dedup_key.0.clone()),
                    None,
                    correlation_id,
                    "agent.answered",
                    AuditCategory::Agent,
                    AuditOutcome::Success,
                )
                .with_metadata("steps", outcome.trace.steps.len().to_string()),
            );
            return Ack::replied(compose(&outcome.summary, &self.compose_policy));
        }

        let snapshot = match self.ledger.snapshot_for(&stored.body).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(
                    event_name = "classify.snapshot_failed",
                    correlation_id,
                    error = %error,
                    "ledger snapshot unavailable; classifying against an empty snapshot"
                );
                LedgerSnapshot::empty()
            }
        };

        match classify(&stored.body, &snapshot) {
            Classification::Template(matched) => {
                let category = matched.category;
                match self.ledger.apply(&matched, stored).await {
                    Ok(applied) => {
                        self.audit.emit(
                            AuditEvent::new(
                                Some(stored.dedup_key.0.clone()),
                                Some(applied.lead.code.0.clone()),
                                correlation_id,
                                "ledger.applied",
                                AuditCategory::Ledger,
                                AuditOutcome::Success,
                            )
                            .with_metadata("category", category.as_str()),
                        );
                        Ack::replied(compose(&applied_reply(&applied), &self.compose_policy))
                    }
                    Err(error) => {
                        tracing::warn!(
                            event_name = "ledger.apply_failed",
                            correlation_id,
                            category = category.as_str(),
                            error = %error,
                            "ledger apply failed; degrading to a polite reply"
                        );
                        self.audit.emit(
                            AuditEvent::new(
                                Some(stored.dedup_key.0.clone()),
                                None,
                                correlation_id,
                                "ledger.apply_failed",
                                AuditCategory::Ledger,
                                AuditOutcome::Failed,
                            )
                            .with_metadata("category", category.as_str()),
                        );
                        let polite = apply_failure_reply(&error, correlation_id);
                        Ack::replied(compose(&polite, &self.compose_policy))
                    }
                }
            }
            // Not a template and nobody asked the bot anything: the
            // explicit no-op terminal outcome. Nothing written beyond the
            // raw message, nothing replied.
            Classification::Unclassified => {
                self.audit.emit(AuditEvent::new(
                    Some(stored.dedup_key.0.clone()),
                    None,
                    correlation_id,
                    "classify.unclassified",
                    AuditCategory::Classification,
                    AuditOutcome::Success,
                ));
                Ack::no_op()
            }
        }
    }
}

fn category_label(category: TemplateCategory) -> &'static str {
    match category {
        TemplateCategory::NewContact => "新家长",
        TemplateCategory::PhoneCompletion => "补全联系方式",
        TemplateCategory::PartnerHandoff => "合伙人接手",
        TemplateCategory::SalesHandoff => "转销售",
        TemplateCategory::SalesFollowup => "跟进",
        TemplateCategory::Feedback => "反馈",
        TemplateCategory::DealClosed => "成交",
        TemplateCategory::Churned => "流失",
    }
}

fn status_label(status: LeadStatus) -> &'static str {
    match status {
        LeadStatus::NewContact => "待接手",
        LeadStatus::PartnerActive => "合伙人跟进中",
        LeadStatus::SalesActive => "销售跟进中",
        LeadStatus::Closed => "已成交",
        LeadStatus::Churned => "已流失",
        LeadStatus::Unset => "未设置",
    }
}

fn applied_reply(applied: &AppliedEntry) -> String {
    let mut reply = format!(
        "✅ {}已登记\n编号:{}\n状态:{}",
        category_label(applied.entry.category),
        applied.lead.code,
        status_label(applied.lead.status),
    );
    if applied.entry.category == TemplateCategory::DealClosed {
        if let Some(amount) = applied.lead.deal_amount {
            reply.push_str(&format!("\n金额:{amount}"));
        }
    }
    reply
}

fn apply_failure_reply(error: &ApplicationError, correlation_id: &str) -> String {
    match error {
        ApplicationError::Domain(domain) => match domain {
            leadline_core::errors::DomainError::UnknownLead(code) => {
                format!("❌ 未找到编号 {code}，请确认后重发")
            }
            leadline_core::errors::DomainError::MissingField { .. } => {
                "❌ 模板缺少家长编号，请补充后重发".to_owned()
            }
            leadline_core::errors::DomainError::InvariantViolation(_) => {
                "❌ 消息暂时无法登记，请稍后重试".to_owned()
            }
        },
        other => other.clone().into_interface(correlation_id).user_message().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use leadline_agent::planner::RulePlanner;
    use leadline_agent::runtime::AgentLimits;
    use leadline_agent::QueryAgent;
    use leadline_core::audit::InMemoryAuditSink;
    use leadline_core::compose::ComposePolicy;
    use leadline_core::domain::message::NewInboundMessage;
    use leadline_db::readonly::ReadOnlyExecutor;
    use leadline_db::repositories::{
        InMemoryMessageRepository, MessageRepository, RepositoryError, SqlMessageRepository,
    };
    use leadline_db::{connect_with_settings, migrations, LeadLedger};

    use crate::events::{DeliveryPayload, WebhookEnvelope};

    use super::MessageProcessor;

    async fn pool() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn processor_with_store(
        pool: sqlx::SqlitePool,
        store: Arc<dyn MessageRepository>,
    ) -> (MessageProcessor<RulePlanner>, InMemoryAuditSink) {
        let sink = InMemoryAuditSink::default();
        let processor = MessageProcessor::new(
            store,
            Arc::new(LeadLedger::new(pool.clone())),
            QueryAgent::new(
                RulePlanner::new(),
                ReadOnlyExecutor::new(pool),
                AgentLimits::default(),
            ),
            ComposePolicy::default(),
            Arc::new(sink.clone()),
        );
        (processor, sink)
    }

    async fn sql_processor(
        pool: sqlx::SqlitePool,
    ) -> (MessageProcessor<RulePlanner>, InMemoryAuditSink) {
        let store = Arc::new(SqlMessageRepository::new(pool.clone()));
        processor_with_store(pool, store)
    }

    fn envelope(id: &str, message_id: &str, text: &str, at_me: bool) -> WebhookEnvelope {
        WebhookEnvelope::delivery(
            id,
            DeliveryPayload {
                message_id: Some(message_id.to_owned()),
                group_id: Some("G-1".to_owned()),
                group_name: Some("招生一群".to_owned()),
                sender: Some("SM_小赵".to_owned()),
                text: Some(text.to_owned()),
                at_me: Some(serde_json::Value::Bool(at_me)),
                timestamp: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn new_contact_template_creates_lead_and_replies() {
        let pool = pool().await;
        let (processor, _sink) = sql_processor(pool.clone()).await;

        let ack = processor
            .handle(&envelope("env-1", "m-1", "新家长，孩子叫小明，电话13800000000", false))
            .await;

        assert!(ack.success && ack.handled);
        let content = ack.content.expect("reply");
        assert!(content.contains("新家长已登记"));
        assert!(content.contains("待接手"));

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM lead WHERE phone = '13800000000' AND status = 'new_contact'",
        )
        .fetch_one(&pool)
        .await
        .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_acknowledged_without_reprocessing() {
        let pool = pool().await;
        let (processor, _sink) = sql_processor(pool.clone()).await;
        let first = envelope("env-1", "m-42", "新家长，孩子叫小雨", false);
        let second = envelope("env-2", "m-42", "新家长，孩子叫小雨", false);

        let ack1 = processor.handle(&first).await;
        let ack2 = processor.handle(&second).await;

        assert!(ack1.handled);
        assert!(!ack2.handled);
        assert_eq!(ack2.content, None);

        let (messages,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM raw_message WHERE dedup_key = 'm-42'")
                .fetch_one(&pool)
                .await
                .expect("messages");
        assert_eq!(messages, 1);
        let (logs,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM process_log WHERE message_key = 'm-42'")
                .fetch_one(&pool)
                .await
                .expect("logs");
        assert_eq!(logs, 1);
    }

    #[tokio::test]
    async fn mention_routes_to_the_query_agent() {
        let pool = pool().await;
        let (processor, _sink) = sql_processor(pool.clone()).await;
        processor
            .handle(&envelope("env-1", "m-1", "新家长，孩子叫小明，电话13800000000", false))
            .await;

        let ack = processor
            .handle(&envelope("env-2", "m-2", "@机器人 上周新增了多少家长？", true))
            .await;

        assert!(ack.handled);
        assert_eq!(ack.content.as_deref(), Some("查询结果：1"));
    }

    #[tokio::test]
    async fn chatter_gets_the_no_op_acknowledgement() {
        let pool = pool().await;
        let (processor, sink) = sql_processor(pool).await;

        let ack = processor.handle(&envelope("env-1", "m-1", "大家早上好", false)).await;

        assert!(ack.success);
        assert!(!ack.handled);
        assert_eq!(ack.content, None);
        assert!(sink
            .events()
            .iter()
            .any(|event| event.event_type == "classify.unclassified"));
    }

    #[tokio::test]
    async fn unknown_lead_code_degrades_to_a_polite_reply() {
        let pool = pool().await;
        let (processor, _sink) = sql_processor(pool).await;

        let ack = processor
            .handle(&envelope("env-1", "m-1", "【成交】家长编号：L999999999999 金额：1", false))
            .await;

        assert!(ack.success && ack.handled);
        let content = ack.content.expect("reply");
        assert!(content.contains("未找到编号"));
        assert!(!content.contains("sqlx"));
    }

    struct FailingStore;

    #[async_trait::async_trait]
    impl MessageRepository for FailingStore {
        async fn ingest(
            &self,
            _message: &NewInboundMessage,
        ) -> Result<leadline_db::repositories::IngestReceipt, RepositoryError> {
            Err(RepositoryError::Decode("storage offline".to_owned()))
        }

        async fn find_by_key(
            &self,
            _key: &leadline_core::domain::message::MessageKey,
        ) -> Result<Option<leadline_core::domain::message::InboundMessage>, RepositoryError>
        {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn storage_fault_returns_retryable_ack_with_no_effect() {
        let pool = pool().await;
        let (processor, sink) = processor_with_store(pool, Arc::new(FailingStore));

        let ack = processor.handle(&envelope("env-1", "m-1", "新家长，孩子叫小明", false)).await;

        assert!(!ack.success);
        assert_eq!(ack.content, None);
        assert!(sink.events().iter().any(|event| event.event_type == "ingress.store.failed"));
    }

    #[tokio::test]
    async fn in_memory_store_supports_the_same_dedup_contract() {
        let pool = pool().await;
        let (processor, _sink) =
            processor_with_store(pool, Arc::new(InMemoryMessageRepository::default()));

        let ack1 = processor.handle(&envelope("env-1", "m-42", "@机器人 多少家长？", true)).await;
        let ack2 = processor.handle(&envelope("env-2", "m-42", "@机器人 多少家长？", true)).await;

        assert!(ack1.handled);
        assert!(!ack2.handled);
    }

    #[tokio::test]
    async fn empty_body_is_acknowledged_with_a_note() {
        let pool = pool().await;
        let (processor, _sink) = sql_processor(pool).await;

        let ack = processor.handle(&envelope("env-1", "m-1", "   ", false)).await;

        assert!(ack.success);
        assert_eq!(ack.content.as_deref(), Some("消息内容为空"));
    }
}
