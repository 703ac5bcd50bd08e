//! Authority status codes (`cStat`) and their domain outcomes.
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Remote operation a status code was returned for. The same code can mean
/// different things depending on the call (e.g. `135` only exists for events).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Authorization,
    ReceiptQuery,
    ProtocolQuery,
    Event,
    VoidRange,
    ServiceStatus,
}

impl Operation {
    pub const ALL: &'static [Operation] = &[
        Operation::Authorization,
        Operation::ReceiptQuery,
        Operation::ProtocolQuery,
        Operation::Event,
        Operation::VoidRange,
        Operation::ServiceStatus,
    ];
}

/// Closed set of domain outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Authorized,
    Processing,
    Denied,
    Cancelled,
    Success,
    Error,
}

/// `cStat` and `xMotivo` as returned by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthorityStatus {
    pub code: u16,
    pub message: String,
}

impl AuthorityStatus {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for AuthorityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.code, self.message)
    }
}

/// Where a failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Certificate,
    Build,
    Signing,
    Transport,
    Authority,
    /// Still processing when the poll budget ran out.
    Unresolved,
    State,
    Store,
}

/// One entry of a structured error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: FailureKind,
    pub code: Option<u16>,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn authority(status: &AuthorityStatus) -> Self {
        Self {
            kind: FailureKind::Authority,
            code: Some(status.code),
            message: status.message.clone(),
        }
    }
}

/// Result of running a status through the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedStatus {
    outcome: Outcome,
    status: AuthorityStatus,
    known: bool,
}

impl MappedStatus {
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn status(&self) -> &AuthorityStatus {
        &self.status
    }

    pub fn code(&self) -> u16 {
        self.status.code
    }

    pub fn message(&self) -> &str {
        &self.status.message
    }

    /// `false` when the code fell through to the unknown-code fallback.
    pub fn is_known(&self) -> bool {
        self.known
    }

    /// Authority message as a structured error, for outcomes that are failures.
    pub fn error_detail(&self) -> Option<ErrorDetail> {
        match self.outcome {
            Outcome::Denied | Outcome::Error => Some(ErrorDetail::authority(&self.status)),
            _ => None,
        }
    }
}

struct Rule {
    operation: Operation,
    from: u16,
    to: u16,
    outcome: Outcome,
}

const fn rule(operation: Operation, from: u16, to: u16, outcome: Outcome) -> Rule {
    Rule {
        operation,
        from,
        to,
        outcome,
    }
}

use Operation::{Authorization, Event, ProtocolQuery, ReceiptQuery, ServiceStatus, VoidRange};

// First match wins, so specific codes precede the catch-all rejection ranges.
const RULES: &[Rule] = &[
    // 100 authorized, 150 authorized out of time.
    rule(Authorization, 100, 100, Outcome::Authorized),
    rule(Authorization, 150, 150, Outcome::Authorized),
    // 103 batch received, 105 batch in processing.
    rule(Authorization, 103, 103, Outcome::Processing),
    rule(Authorization, 105, 105, Outcome::Processing),
    // 110 use denied, 205 document already denied, 301..=303 irregular parties.
    rule(Authorization, 110, 110, Outcome::Denied),
    rule(Authorization, 205, 205, Outcome::Denied),
    rule(Authorization, 301, 303, Outcome::Denied),
    rule(Authorization, 201, 999, Outcome::Denied),
    rule(ReceiptQuery, 100, 100, Outcome::Authorized),
    rule(ReceiptQuery, 150, 150, Outcome::Authorized),
    rule(ReceiptQuery, 105, 105, Outcome::Processing),
    rule(ReceiptQuery, 110, 110, Outcome::Denied),
    rule(ReceiptQuery, 301, 303, Outcome::Denied),
    rule(ReceiptQuery, 201, 999, Outcome::Denied),
    rule(ProtocolQuery, 100, 100, Outcome::Authorized),
    rule(ProtocolQuery, 150, 150, Outcome::Authorized),
    rule(ProtocolQuery, 101, 101, Outcome::Cancelled),
    rule(ProtocolQuery, 151, 151, Outcome::Cancelled),
    rule(ProtocolQuery, 155, 155, Outcome::Cancelled),
    rule(ProtocolQuery, 105, 105, Outcome::Processing),
    rule(ProtocolQuery, 110, 110, Outcome::Denied),
    rule(ProtocolQuery, 301, 303, Outcome::Denied),
    // 217 document not found in the authority's base.
    rule(ProtocolQuery, 217, 217, Outcome::Error),
    // 135 event registered, 136 registered without link, 155 cancelled out of time.
    rule(Event, 135, 136, Outcome::Success),
    rule(Event, 155, 155, Outcome::Success),
    rule(Event, 201, 999, Outcome::Error),
    // 102 number range disabled.
    rule(VoidRange, 102, 102, Outcome::Success),
    rule(VoidRange, 201, 999, Outcome::Error),
    // 107 in operation, 108 paralysed briefly, 109 paralysed.
    rule(ServiceStatus, 107, 107, Outcome::Success),
    rule(ServiceStatus, 108, 109, Outcome::Error),
];

/// Map an authority status for `operation` into a domain outcome.
///
/// Never fails; codes absent from the table map to [`Outcome::Error`] and keep
/// the raw code and message.
///
/// # Examples
/// ```rust
/// use nfe_core::status::{map_status, AuthorityStatus, Operation, Outcome};
///
/// let mapped = map_status(Operation::Authorization, &AuthorityStatus::new(100, "Autorizado o uso da NF-e"));
/// assert_eq!(mapped.outcome(), Outcome::Authorized);
/// ```
pub fn map_status(operation: Operation, status: &AuthorityStatus) -> MappedStatus {
    let found = RULES.iter().find(|rule| {
        rule.operation == operation && (rule.from..=rule.to).contains(&status.code)
    });
    match found {
        Some(rule) => MappedStatus {
            outcome: rule.outcome,
            status: status.clone(),
            known: true,
        },
        None => {
            warn!(
                ?operation,
                code = status.code,
                message = %status.message,
                "unmapped authority status"
            );
            MappedStatus {
                outcome: Outcome::Error,
                status: status.clone(),
                known: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(operation: Operation, code: u16) -> Outcome {
        map_status(operation, &AuthorityStatus::new(code, "motivo")).outcome()
    }

    #[test]
    fn authorization_codes() {
        assert_eq!(outcome(Authorization, 100), Outcome::Authorized);
        assert_eq!(outcome(Authorization, 150), Outcome::Authorized);
        assert_eq!(outcome(Authorization, 103), Outcome::Processing);
        assert_eq!(outcome(Authorization, 105), Outcome::Processing);
        assert_eq!(outcome(Authorization, 110), Outcome::Denied);
        assert_eq!(outcome(Authorization, 302), Outcome::Denied);
        assert_eq!(outcome(Authorization, 539), Outcome::Denied);
        assert_eq!(outcome(Authorization, 108), Outcome::Error);
    }

    #[test]
    fn event_codes() {
        assert_eq!(outcome(Event, 135), Outcome::Success);
        assert_eq!(outcome(Event, 136), Outcome::Success);
        assert_eq!(outcome(Event, 155), Outcome::Success);
        assert_eq!(outcome(Event, 573), Outcome::Error);
        assert_eq!(outcome(Event, 100), Outcome::Error);
    }

    #[test]
    fn query_distinguishes_cancelled_and_missing() {
        assert_eq!(outcome(ProtocolQuery, 101), Outcome::Cancelled);
        assert_eq!(outcome(ProtocolQuery, 100), Outcome::Authorized);
        let missing = map_status(ProtocolQuery, &AuthorityStatus::new(217, "NF-e nao consta"));
        assert_eq!(missing.outcome(), Outcome::Error);
        assert!(missing.is_known());
    }

    #[test]
    fn void_and_service_status_codes() {
        assert_eq!(outcome(VoidRange, 102), Outcome::Success);
        assert_eq!(outcome(VoidRange, 241), Outcome::Error);
        assert_eq!(outcome(ServiceStatus, 107), Outcome::Success);
        assert_eq!(outcome(ServiceStatus, 109), Outcome::Error);
    }

    #[test]
    fn every_code_maps_for_every_operation() {
        for operation in Operation::ALL {
            for code in 0..=999u16 {
                let status = AuthorityStatus::new(code, format!("motivo {code}"));
                let mapped = map_status(*operation, &status);
                assert_eq!(mapped.code(), code);
                assert_eq!(mapped.message(), status.message);
                if !mapped.is_known() {
                    assert_eq!(mapped.outcome(), Outcome::Error);
                }
            }
        }
    }

    #[test]
    fn unknown_code_keeps_raw_status() {
        let mapped = map_status(Authorization, &AuthorityStatus::new(42, "Codigo inesperado"));
        assert!(!mapped.is_known());
        assert_eq!(mapped.outcome(), Outcome::Error);
        let detail = mapped.error_detail().unwrap();
        assert_eq!(detail.kind, FailureKind::Authority);
        assert_eq!(detail.code, Some(42));
        assert_eq!(detail.message, "Codigo inesperado");
    }

    #[test]
    fn denied_message_is_verbatim() {
        let mapped = map_status(
            Authorization,
            &AuthorityStatus::new(539, "Rejeicao: Duplicidade de NF-e com diferenca na Chave de Acesso"),
        );
        assert_eq!(
            mapped.error_detail().unwrap().message,
            "Rejeicao: Duplicidade de NF-e com diferenca na Chave de Acesso"
        );
        assert!(map_status(Authorization, &AuthorityStatus::new(100, "ok"))
            .error_detail()
            .is_none());
    }
}
