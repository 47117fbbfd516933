use async_trait::async_trait;
use thiserror::Error;

use crate::llm::{strip_code_fences, LlmClient};
use crate::summarize::summarize;
use crate::trace::{AgentAction, Observation, TraceStep};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("planner failed: {0}")]
    Failed(String),
}

/// Proposes the next action given the question and what has been observed
/// so far. Implementations must not execute anything themselves.
#[async_trait]
pub trait QueryPlanner: Send + Sync {
    async fn plan(&self, question: &str, steps: &[TraceStep]) -> Result<AgentAction, PlanError>;
}

#[async_trait]
impl QueryPlanner for Box<dyn QueryPlanner> {
    async fn plan(&self, question: &str, steps: &[TraceStep]) -> Result<AgentAction, PlanError> {
        (**self).plan(question, steps).await
    }
}

/// Schema context handed to the model. Kept to the tables the agent may
/// read; mirrors the migration baseline.
const SCHEMA_OVERVIEW: &str = "\
数据库为 SQLite，可读表结构如下：

1. lead（家长线索表）
   - code: 线索编号（文本，L 开头）
   - display_name: 称呼
   - phone: 电话（可空）
   - status: 状态，取值 new_contact/partner_active/sales_active/closed/churned/unset
   - deal_amount: 成交金额（文本数字，可空）
   - created_at, updated_at: RFC 3339 时间文本

2. process_log（流转日志表，只追加）
   - id, lead_code, category, message_key, applied_at
   - category 取值 new_contact/phone_completion/partner_handoff/sales_handoff/sales_followup/feedback/deal_closed/churned

3. feedback（跟进反馈表）
   - id, lead_code, message_key, body, recorded_at

4. raw_message（原始消息表）
   - dedup_key, group_id, group_name, sender, body, received_at";

const SYSTEM_PROMPT: &str = "\
你是家长线索管理群里的数据助理。根据用户问题生成 SQLite 查询并总结结果。

规则：
1. 只允许 SELECT 查询，禁止任何修改语句。
2. 时间过滤使用 date(created_at) 与 date('now') 比较；“过去一周/上周”用 date(created_at) >= date('now', '-7 day')。
3. 需要明细时返回列表并 LIMIT 50，按 created_at DESC 排序。
4. 回复格式严格三选一：
   SQL: <一条查询语句>
   ANSWER: <给群聊的中文总结>
   CLARIFY: <需要用户补充的信息>
5. 已经拿到查询结果后，用 ANSWER 总结；不要重复查询。";

/// Planner backed by an opaque text-generation capability.
pub struct LlmPlanner<C> {
    client: C,
}

impl<C> LlmPlanner<C>
where
    C: LlmClient,
{
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C> QueryPlanner for LlmPlanner<C>
where
    C: LlmClient,
{
    async fn plan(&self, question: &str, steps: &[TraceStep]) -> Result<AgentAction, PlanError> {
        let user = format!(
            "{SCHEMA_OVERVIEW}\n\n用户问题：{question}\n\n此前的步骤与观察：\n{}",
            render_steps(steps)
        );
        let reply = self
            .client
            .complete(SYSTEM_PROMPT, &user)
            .await
            .map_err(|e| PlanError::Failed(e.to_string()))?;
        Ok(parse_action(&reply))
    }
}

pub(crate) fn render_steps(steps: &[TraceStep]) -> String {
    if steps.is_empty() {
        return "（无）".to_owned();
    }
    let mut out = String::new();
    for (i, step) in steps.iter().enumerate() {
        let action = match &step.action {
            AgentAction::RunQuery { sql } => format!("执行查询 {sql}"),
            AgentAction::FinalAnswer { text } => format!("给出回答 {text}"),
            AgentAction::Clarify { prompt } => format!("请求澄清 {prompt}"),
        };
        out.push_str(&format!("[{}] {action}\n", i + 1));
        match &step.observation {
            Some(Observation::Rows { preview, total, truncated, .. }) => {
                out.push_str(&format!("    结果 {total} 行{}", if *truncated { "（已截断）" } else { "" }));
                for row in preview.iter().take(5) {
                    let line = row
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    out.push_str(&format!("\n    {line}"));
                }
                out.push('\n');
            }
            Some(Observation::Rejected { reason }) => {
                out.push_str(&format!("    被拒绝：{reason}\n"));
            }
            Some(Observation::Failed { kind }) => {
                out.push_str(&format!("    执行失败：{kind}\n"));
            }
            None => {}
        }
    }
    out
}

/// Parse the model's reply into an action. Tolerates markdown fences and
/// bare SELECT statements.
pub fn parse_action(reply: &str) -> AgentAction {
    let cleaned = strip_code_fences(reply);

    if let Some(rest) = cleaned.strip_prefix("SQL:") {
        return AgentAction::RunQuery { sql: strip_code_fences(rest).to_owned() };
    }
    if let Some(rest) = cleaned.strip_prefix("ANSWER:") {
        return AgentAction::FinalAnswer { text: rest.trim().to_owned() };
    }
    if let Some(rest) = cleaned.strip_prefix("CLARIFY:") {
        return AgentAction::Clarify { prompt: rest.trim().to_owned() };
    }

    let first_word =
        cleaned.split_whitespace().next().map(str::to_ascii_uppercase).unwrap_or_default();
    if first_word == "SELECT" || first_word == "WITH" {
        return AgentAction::RunQuery { sql: cleaned.to_owned() };
    }

    // Anything else reads as prose; treat it as the final answer.
    AgentAction::FinalAnswer { text: cleaned.to_owned() }
}

/// Deterministic fallback covering the query shapes the group actually
/// asks for. Used when no model is configured, and directly testable.
#[derive(Clone, Copy, Debug, Default)]
pub struct RulePlanner;

impl RulePlanner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QueryPlanner for RulePlanner {
    async fn plan(&self, question: &str, steps: &[TraceStep]) -> Result<AgentAction, PlanError> {
        // Second round: summarize what the executor observed.
        if let Some(step) = steps.last() {
            return Ok(match &step.observation {
                Some(Observation::Rows { columns, preview, total, truncated }) => {
                    AgentAction::FinalAnswer {
                        text: summarize(columns, preview, *total, *truncated),
                    }
                }
                Some(Observation::Rejected { .. }) | Some(Observation::Failed { .. }) => {
                    AgentAction::FinalAnswer {
                        text: "查询执行遇到问题，请稍后重试或换个问法。".to_owned(),
                    }
                }
                None => AgentAction::Clarify {
                    prompt: "请补充想查询的内容，例如：上周新增了多少家长？".to_owned(),
                },
            });
        }

        Ok(match rule_sql(question) {
            Some(sql) => AgentAction::RunQuery { sql },
            None => AgentAction::Clarify {
                prompt: "我没有理解这个问题，可以换个说法吗？例如：今天新增了多少家长？"
                    .to_owned(),
            },
        })
    }
}

fn wants_list(question: &str) -> bool {
    ["名单", "列表", "明细", "名称", "名字", "哪些"].iter().any(|kw| question.contains(kw))
}

fn rule_sql(question: &str) -> Option<String> {
    let q = question;
    let today = q.contains("今天") || q.contains("今日");
    let past_week = ["上周", "过去一周", "近一周", "最近一周", "本周", "这周"]
        .iter()
        .any(|kw| q.contains(kw));

    if today && q.contains("新增") && !wants_list(q) {
        return Some(
            "SELECT COUNT(*) AS total FROM lead WHERE date(created_at) = date('now')".to_owned(),
        );
    }
    if past_week && (q.contains("新增") || q.contains("多少")) && !wants_list(q) {
        return Some(
            "SELECT COUNT(*) AS total FROM lead WHERE date(created_at) >= date('now', '-7 day')"
                .to_owned(),
        );
    }
    if q.contains("本月") && q.contains("成交") && q.contains("金额") {
        return Some(
            "SELECT COALESCE(SUM(deal_amount), 0) AS total_amount FROM lead \
             WHERE status = 'closed' \
             AND strftime('%Y-%m', updated_at) = strftime('%Y-%m', 'now')"
                .to_owned(),
        );
    }
    if q.contains("状态") && (q.contains("统计") || q.contains("分布")) {
        return Some(
            "SELECT status, COUNT(*) AS count FROM lead GROUP BY status".to_owned(),
        );
    }
    if let Some(code) = leadline_core::classify::extract_lead_code(q) {
        return Some(format!(
            "SELECT code, display_name, phone, status, deal_amount, created_at, updated_at \
             FROM lead WHERE code = '{code}'"
        ));
    }
    if wants_list(q) {
        let window = if today {
            " WHERE date(created_at) = date('now')"
        } else if past_week {
            " WHERE date(created_at) >= date('now', '-7 day')"
        } else {
            ""
        };
        return Some(format!(
            "SELECT code, display_name, status FROM lead{window} \
             ORDER BY created_at DESC LIMIT 50"
        ));
    }
    if (q.contains("总") || q.contains("多少")) && (q.contains("家长") || q.contains("线索")) {
        return Some("SELECT COUNT(*) AS total FROM lead".to_owned());
    }
    None
}

#[cfg(test)]
mod tests {
    use crate::trace::{AgentAction, Observation, TraceStep};

    use super::{parse_action, rule_sql, QueryPlanner, RulePlanner};

    #[test]
    fn parse_action_handles_the_three_prefixes() {
        assert_eq!(
            parse_action("SQL: SELECT COUNT(*) FROM lead"),
            AgentAction::RunQuery { sql: "SELECT COUNT(*) FROM lead".to_owned() }
        );
        assert_eq!(
            parse_action("ANSWER: 本周新增 3 位家长。"),
            AgentAction::FinalAnswer { text: "本周新增 3 位家长。".to_owned() }
        );
        assert_eq!(
            parse_action("CLARIFY: 想查哪个时间段？"),
            AgentAction::Clarify { prompt: "想查哪个时间段？".to_owned() }
        );
    }

    #[test]
    fn parse_action_accepts_bare_and_fenced_select() {
        assert_eq!(
            parse_action("```sql\nSELECT code FROM lead\n```"),
            AgentAction::RunQuery { sql: "SELECT code FROM lead".to_owned() }
        );
        assert_eq!(
            parse_action("select 1"),
            AgentAction::RunQuery { sql: "select 1".to_owned() }
        );
    }

    #[test]
    fn weekly_count_question_produces_windowed_count() {
        let sql = rule_sql("上周新增了多少家长？").expect("sql");
        assert!(sql.starts_with("SELECT COUNT(*)"));
        assert!(sql.contains("date('now', '-7 day')"));
    }

    #[test]
    fn status_breakdown_groups_by_status() {
        let sql = rule_sql("看一下状态分布").expect("sql");
        assert!(sql.contains("GROUP BY status"));
    }

    #[test]
    fn list_questions_return_detail_not_aggregate() {
        let sql = rule_sql("这周新增家长的名单").expect("sql");
        assert!(sql.contains("SELECT code"));
        assert!(sql.contains("LIMIT 50"));
        assert!(!sql.contains("COUNT"));
    }

    #[test]
    fn lead_code_lookup_is_supported() {
        let sql = rule_sql("帮我查询 L202608071234 的情况").expect("sql");
        assert!(sql.contains("WHERE code = 'L202608071234'"));
    }

    #[test]
    fn unknown_question_yields_none() {
        assert_eq!(rule_sql("早上好"), None);
    }

    #[tokio::test]
    async fn rule_planner_answers_from_observation() {
        let planner = RulePlanner::new();
        let steps = vec![TraceStep {
            action: AgentAction::RunQuery { sql: "SELECT COUNT(*) AS total FROM lead".to_owned() },
            observation: Some(Observation::Rows {
                columns: vec!["total".to_owned()],
                preview: vec![[("total".to_owned(), "5".to_owned())].into_iter().collect()],
                total: 1,
                truncated: false,
            }),
        }];

        let action = planner.plan("有多少家长？", &steps).await.expect("plan");
        assert_eq!(action, AgentAction::FinalAnswer { text: "查询结果：5".to_owned() });
    }

    #[tokio::test]
    async fn rule_planner_gives_up_politely_after_failure() {
        let planner = RulePlanner::new();
        let steps = vec![TraceStep {
            action: AgentAction::RunQuery { sql: "SELECT x FROM lead".to_owned() },
            observation: Some(Observation::Failed { kind: "no such column".to_owned() }),
        }];

        let action = planner.plan("有多少家长？", &steps).await.expect("plan");
        assert!(matches!(action, AgentAction::FinalAnswer { .. }));
    }
}
