use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("unknown lead code `{0}`")]
    UnknownLead(String),
    #[error("template `{category}` is missing required field `{field}`")]
    MissingField { category: &'static str, field: &'static str },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// Storage was unavailable while ingesting. Retryable: the upstream
    /// relay redelivers and the dedup key makes the retry idempotent.
    #[error("ingestion failure: {0}")]
    Ingestion(String),
    /// A per-lead write lost the race twice (initial attempt plus one
    /// retry with reloaded state).
    #[error("ledger write conflict on lead `{0}`")]
    LedgerConflict(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    /// Reply text safe for the outbound channel. Internal detail never
    /// crosses this boundary.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "消息无法处理，请检查格式后重试。",
            Self::ServiceUnavailable { .. } => "服务暂时不可用，请稍后重试。",
            Self::Internal { .. } => "系统开小差了，请稍后再试。",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(_) => Self::BadRequest {
                message: "domain validation failed".to_owned(),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Ingestion(message)
            | ApplicationError::Persistence(message)
            | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::LedgerConflict(lead) => Self::ServiceUnavailable {
                message: format!("write conflict on lead {lead}"),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ApplicationError, DomainError, InterfaceError};

    #[test]
    fn domain_error_maps_to_bad_request_with_correlation_id() {
        let interface = ApplicationError::from(DomainError::UnknownLead("L20260101".to_owned()))
            .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest { ref correlation_id, .. } if correlation_id == "req-1"
        ));
    }

    #[test]
    fn ingestion_fault_maps_to_service_unavailable() {
        let interface =
            ApplicationError::Ingestion("database locked".to_owned()).into_interface("req-2");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(interface.user_message(), "服务暂时不可用，请稍后重试。");
    }

    #[test]
    fn ledger_conflict_keeps_internal_detail_off_the_channel() {
        let interface =
            ApplicationError::LedgerConflict("L202601011234".to_owned()).into_interface("req-3");

        assert!(!interface.user_message().contains("L202601011234"));
    }

    #[test]
    fn configuration_error_maps_to_internal() {
        let interface =
            ApplicationError::Configuration("missing api key".to_owned()).into_interface("req-4");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
    }
}
