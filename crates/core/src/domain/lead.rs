use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::message::MessageKey;

/// Closed set of recognized business intents. A message classifies to
/// exactly one of these or to none.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    NewContact,
    PhoneCompletion,
    PartnerHandoff,
    SalesHandoff,
    SalesFollowup,
    Feedback,
    DealClosed,
    Churned,
}

impl TemplateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewContact => "new_contact",
            Self::PhoneCompletion => "phone_completion",
            Self::PartnerHandoff => "partner_handoff",
            Self::SalesHandoff => "sales_handoff",
            Self::SalesFollowup => "sales_followup",
            Self::Feedback => "feedback",
            Self::DealClosed => "deal_closed",
            Self::Churned => "churned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new_contact" => Some(Self::NewContact),
            "phone_completion" => Some(Self::PhoneCompletion),
            "partner_handoff" => Some(Self::PartnerHandoff),
            "sales_handoff" => Some(Self::SalesHandoff),
            "sales_followup" => Some(Self::SalesFollowup),
            "feedback" => Some(Self::Feedback),
            "deal_closed" => Some(Self::DealClosed),
            "churned" => Some(Self::Churned),
            _ => None,
        }
    }

    /// What the category does to the lead's current status. Followup and
    /// feedback leave the status alone; everything else overwrites it
    /// (last-write-wins on the row, history preserved in the process log).
    pub fn status_effect(&self) -> StatusEffect {
        match self {
            Self::NewContact => StatusEffect::Set(LeadStatus::NewContact),
            Self::PhoneCompletion | Self::PartnerHandoff => {
                StatusEffect::Set(LeadStatus::PartnerActive)
            }
            Self::SalesHandoff => StatusEffect::Set(LeadStatus::SalesActive),
            Self::SalesFollowup | Self::Feedback => StatusEffect::NoChange,
            Self::DealClosed => StatusEffect::Set(LeadStatus::Closed),
            Self::Churned => StatusEffect::Set(LeadStatus::Churned),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusEffect {
    Set(LeadStatus),
    NoChange,
}

/// Lifecycle status of a lead. `Unset` is the neutral marker for "no
/// status": it serializes to the literal `unset`, never an empty string,
/// so the column stays a strict enumeration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    NewContact,
    PartnerActive,
    SalesActive,
    Closed,
    Churned,
    #[default]
    Unset,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewContact => "new_contact",
            Self::PartnerActive => "partner_active",
            Self::SalesActive => "sales_active",
            Self::Closed => "closed",
            Self::Churned => "churned",
            Self::Unset => "unset",
        }
    }

    /// Lenient parse for values read back from storage: anything blank or
    /// unknown collapses to `Unset` rather than failing the whole row.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "new_contact" => Self::NewContact,
            "partner_active" => Self::PartnerActive,
            "sales_active" => Self::SalesActive,
            "closed" => Self::Closed,
            "churned" => Self::Churned,
            _ => Self::Unset,
        }
    }

    /// A lead someone is actively working: feedback and followup templates
    /// only apply in these states.
    pub fn is_active_contact(&self) -> bool {
        matches!(self, Self::PartnerActive | Self::SalesActive)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadCode(pub String);

impl LeadCode {
    /// `L` + date + 4 random digits, e.g. `L202608071234`. Collisions are
    /// possible and handled at insert time by regenerating.
    pub fn generate(today: DateTime<Utc>) -> Self {
        let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
        Self(format!("L{}{suffix:04}", today.format("%Y%m%d")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LeadCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub code: LeadCode,
    pub display_name: String,
    pub phone: Option<String>,
    pub status: LeadStatus,
    pub deal_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable audit-trail entry per successful classification apply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLogEntry {
    pub id: String,
    pub lead_code: LeadCode,
    pub category: TemplateCategory,
    pub message_key: MessageKey,
    pub applied_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: String,
    pub lead_code: LeadCode,
    pub message_key: MessageKey,
    pub body: String,
    pub recorded_at: DateTime<Utc>,
}
