//! Template classification: an ordered rule table evaluated
//! first-match-wins over the message text plus a ledger snapshot.
//!
//! Two match modes per rule: a bracketed tag (`【新家长】`) matches anywhere
//! in the text; a bare keyword matches only at the start of the trimmed
//! text, and only when the text does not read as a question, so that
//! queries like 上周成交金额是多少 stay unclassified and reach the query
//! agent. For a fixed (text, snapshot) pair the result is always the same:
//! no randomness, no clock reads.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::lead::{LeadStatus, TemplateCategory};

/// Point-in-time view of lead statuses used by state-gated rules.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    statuses: HashMap<String, LeadStatus>,
}

impl LedgerSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_status(code: impl Into<String>, status: LeadStatus) -> Self {
        let mut snapshot = Self::default();
        snapshot.insert(code, status);
        snapshot
    }

    pub fn insert(&mut self, code: impl Into<String>, status: LeadStatus) {
        self.statuses.insert(code.into(), status);
    }

    pub fn status_of(&self, code: &str) -> Option<LeadStatus> {
        self.statuses.get(code).copied()
    }
}

/// Fields pulled out of a matched template body. Everything is optional at
/// this layer; the ledger validates per-category requirements.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub lead_code: Option<String>,
    pub display_name: Option<String>,
    pub phone: Option<String>,
    pub deal_amount: Option<Decimal>,
    pub reason: Option<String>,
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMatch {
    pub category: TemplateCategory,
    pub fields: ExtractedFields,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Template(TemplateMatch),
    Unclassified,
}

struct Rule {
    category: TemplateCategory,
    tags: &'static [&'static str],
    leading: &'static [&'static str],
    /// Gate on the snapshot: the referenced lead must be in an
    /// active-contact status for this rule to apply.
    requires_active_contact: bool,
}

/// Priority order. More specific tags come before substrings of themselves
/// (合伙人接手 before 接手 is handled inside one rule's tag list).
const RULES: &[Rule] = &[
    Rule {
        category: TemplateCategory::NewContact,
        tags: &["【新家长】"],
        leading: &["新家长"],
        requires_active_contact: false,
    },
    Rule {
        category: TemplateCategory::PhoneCompletion,
        tags: &["【补全微信号】", "【补全电话】"],
        leading: &["补全微信号", "补全电话"],
        requires_active_contact: false,
    },
    Rule {
        category: TemplateCategory::PartnerHandoff,
        tags: &["【合伙人接手】", "【接手】"],
        leading: &["合伙人接手"],
        requires_active_contact: false,
    },
    Rule {
        category: TemplateCategory::SalesHandoff,
        tags: &["【转销售】", "【销售接手】"],
        leading: &["转销售", "销售接手"],
        requires_active_contact: false,
    },
    Rule {
        category: TemplateCategory::DealClosed,
        tags: &["【成交】"],
        leading: &["成交"],
        requires_active_contact: false,
    },
    Rule {
        category: TemplateCategory::Churned,
        tags: &["【流失】", "【放弃】"],
        leading: &["流失", "放弃"],
        requires_active_contact: false,
    },
    Rule {
        category: TemplateCategory::SalesFollowup,
        tags: &["【跟进】"],
        leading: &["跟进"],
        requires_active_contact: true,
    },
    Rule {
        category: TemplateCategory::Feedback,
        tags: &["【反馈】"],
        leading: &["反馈"],
        requires_active_contact: true,
    },
];

pub fn classify(text: &str, snapshot: &LedgerSnapshot) -> Classification {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Classification::Unclassified;
    }

    let question = looks_like_question(trimmed);
    let lead_code = extract_lead_code(trimmed);

    for rule in RULES {
        let tag_hit = rule.tags.iter().any(|tag| trimmed.contains(tag));
        // A bare keyword needs corroboration: never inside a question, and
        // for code-bearing categories only when a lead code is present.
        let leading_hit = !question
            && rule.leading.iter().any(|kw| trimmed.starts_with(kw))
            && (rule.category == TemplateCategory::NewContact || lead_code.is_some());

        if !tag_hit && !leading_hit {
            continue;
        }

        if rule.requires_active_contact {
            let active = lead_code
                .as_deref()
                .and_then(|code| snapshot.status_of(code))
                .is_some_and(|status| status.is_active_contact());
            if !active {
                continue;
            }
        }

        return Classification::Template(TemplateMatch {
            category: rule.category,
            fields: extract_fields(trimmed, lead_code.clone()),
        });
    }

    Classification::Unclassified
}

fn extract_fields(text: &str, lead_code: Option<String>) -> ExtractedFields {
    ExtractedFields {
        lead_code,
        display_name: extract_display_name(text),
        phone: extract_phone(text),
        deal_amount: extract_amount(text),
        reason: extract_after_labels(text, &["原因"]),
        note: extract_after_labels(text, &["内容", "备注", "需求"]),
    }
}

/// First `L`-prefixed run of 6+ digits, e.g. `L202608071234`.
pub fn extract_lead_code(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == 'L' {
            let digits: String =
                chars[i + 1..].iter().take_while(|c| c.is_ascii_digit()).collect();
            if digits.len() >= 6 {
                return Some(format!("L{digits}"));
            }
        }
        i += 1;
    }
    None
}

/// Mainland mobile number: an 11-digit run starting with 1, bounded by
/// non-digits.
fn extract_phone(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let run = &chars[start..i];
            if run.len() == 11 && run[0] == '1' {
                return Some(run.iter().collect());
            }
        } else {
            i += 1;
        }
    }
    None
}

fn extract_display_name(text: &str) -> Option<String> {
    for label in ["孩子叫", "家长叫", "学生叫"] {
        if let Some(pos) = text.find(label) {
            let rest = &text[pos + label.len()..];
            let name: String = rest
                .chars()
                .take_while(|c| !is_name_boundary(*c))
                .take(10)
                .collect();
            if !name.is_empty() {
                return Some(name);
            }
        }
    }
    None
}

fn is_name_boundary(c: char) -> bool {
    c.is_whitespace()
        || matches!(c, '，' | '。' | ',' | '.' | '！' | '!' | '？' | '?' | '、' | '：' | ':')
}

fn extract_amount(text: &str) -> Option<Decimal> {
    let pos = text.find("金额")?;
    let rest = &text[pos + "金额".len()..];
    let digits: String = rest
        .chars()
        .skip_while(|c| matches!(c, ':' | '：' | ' ' | '\t' | '¥' | '￥'))
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn extract_after_labels(text: &str, labels: &[&str]) -> Option<String> {
    for label in labels {
        if let Some(pos) = text.find(label) {
            let rest = &text[pos + label.len()..];
            let rest = rest.strip_prefix([':', '：']).unwrap_or(rest);
            let value = rest.lines().next().unwrap_or("").trim();
            if !value.is_empty() {
                return Some(value.to_owned());
            }
        }
    }
    None
}

fn looks_like_question(text: &str) -> bool {
    const MARKERS: &[&str] = &[
        "？", "?", "多少", "几个", "几条", "哪些", "是什么", "怎么", "吗", "统计", "查询", "列表",
        "名单",
    ];
    MARKERS.iter().any(|marker| text.contains(marker))
}
