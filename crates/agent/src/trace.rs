use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One decision from the planner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentAction {
    RunQuery { sql: String },
    FinalAnswer { text: String },
    Clarify { prompt: String },
}

/// What executing (or refusing to execute) an action produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Observation {
    Rows {
        columns: Vec<String>,
        /// Bounded preview for the trace and follow-up prompts.
        preview: Vec<BTreeMap<String, String>>,
        /// Rows returned (already capped by the executor).
        total: usize,
        /// The underlying result exceeded the cap.
        truncated: bool,
    },
    Rejected { reason: String },
    Failed { kind: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    pub action: AgentAction,
    pub observation: Option<Observation>,
}

/// Ordered record of one agent invocation. Ephemeral: it lives for the
/// duration of the request and is never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTrace {
    pub question: String,
    pub steps: Vec<TraceStep>,
    pub final_sql: Option<String>,
    pub summary: String,
}

impl QueryTrace {
    pub fn new(question: impl Into<String>) -> Self {
        Self { question: question.into(), steps: Vec::new(), final_sql: None, summary: String::new() }
    }

    /// SQL statements that actually reached the executor.
    pub fn executed_sql(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|step| match (&step.action, &step.observation) {
                (AgentAction::RunQuery { sql }, Some(Observation::Rows { .. }))
                | (AgentAction::RunQuery { sql }, Some(Observation::Failed { .. })) => {
                    Some(sql.as_str())
                }
                _ => None,
            })
            .collect()
    }

    pub fn rejected_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step.observation, Some(Observation::Rejected { .. })))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::{AgentAction, Observation, QueryTrace, TraceStep};

    #[test]
    fn executed_sql_excludes_rejected_statements() {
        let mut trace = QueryTrace::new("有多少家长？");
        trace.steps.push(TraceStep {
            action: AgentAction::RunQuery { sql: "DELETE FROM lead".to_owned() },
            observation: Some(Observation::Rejected { reason: "not permitted".to_owned() }),
        });
        trace.steps.push(TraceStep {
            action: AgentAction::RunQuery { sql: "SELECT COUNT(*) FROM lead".to_owned() },
            observation: Some(Observation::Rows {
                columns: vec!["COUNT(*)".to_owned()],
                preview: Vec::new(),
                total: 1,
                truncated: false,
            }),
        });

        assert_eq!(trace.executed_sql(), vec!["SELECT COUNT(*) FROM lead"]);
        assert_eq!(trace.rejected_count(), 1);
    }
}
