//! Persisted lifecycle records and the results handed back to callers.
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::EngineError;
use crate::{
    access_key::AccessKey,
    config::{Environment, Region},
    document::{DocumentKind, events::EventKind},
    ports::TenantId,
    status::{AuthorityStatus, ErrorDetail, Outcome},
};

/// Lifecycle of one reserved number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentState {
    Draft,
    Built,
    Signed,
    Submitted,
    Processing,
    Authorized,
    Denied,
    Error,
    Cancelled,
}

impl DocumentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentState::Draft => "DRAFT",
            DocumentState::Built => "BUILT",
            DocumentState::Signed => "SIGNED",
            DocumentState::Submitted => "SUBMITTED",
            DocumentState::Processing => "PROCESSING",
            DocumentState::Authorized => "AUTHORIZED",
            DocumentState::Denied => "DENIED",
            DocumentState::Error => "ERROR",
            DocumentState::Cancelled => "CANCELLED",
        }
    }

    /// No further submission happens for the number in these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentState::Denied | DocumentState::Error | DocumentState::Cancelled
        )
    }

    /// Transitions the engine performs itself.
    ///
    /// ```rust
    /// use nfe_core::engine::DocumentState;
    ///
    /// assert!(DocumentState::Authorized.can_transition_to(DocumentState::Cancelled));
    /// assert!(!DocumentState::Denied.can_transition_to(DocumentState::Cancelled));
    /// ```
    pub fn can_transition_to(&self, next: DocumentState) -> bool {
        use DocumentState::*;
        matches!(
            (self, next),
            (Draft, Built)
                | (Built, Signed)
                | (Signed, Submitted)
                | (Submitted, Processing | Authorized | Denied | Error)
                | (Processing, Authorized | Denied | Error)
                | (Authorized, Cancelled)
                | (Draft | Built | Signed, Error)
        )
    }

    /// Transitions accepted when a status query reports what the record missed.
    pub fn can_reconcile_to(&self, next: DocumentState) -> bool {
        use DocumentState::*;
        matches!(
            (self, next),
            (Submitted | Processing | Error, Authorized | Denied | Cancelled) | (Authorized, Cancelled)
        )
    }

    pub(crate) fn from_outcome(outcome: Outcome) -> Option<DocumentState> {
        match outcome {
            Outcome::Authorized => Some(DocumentState::Authorized),
            Outcome::Denied => Some(DocumentState::Denied),
            Outcome::Cancelled => Some(DocumentState::Cancelled),
            Outcome::Processing => Some(DocumentState::Processing),
            Outcome::Success | Outcome::Error => None,
        }
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about one reserved number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub tenant: TenantId,
    pub cnpj: String,
    pub series: u16,
    pub number: u32,
    pub kind: DocumentKind,
    pub environment: Environment,
    pub region: Region,
    /// Absent only when assembly failed after the number was reserved.
    pub access_key: Option<AccessKey>,
    pub state: DocumentState,
    pub receipt: Option<String>,
    pub protocol: Option<String>,
    pub authorized_at: Option<DateTime<FixedOffset>>,
    pub authority_status: Option<AuthorityStatus>,
    pub errors: Vec<ErrorDetail>,
    pub signed_xml: Option<String>,
    /// `nfeProc` with the authority stamp, once authorized.
    pub distribution_xml: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// Record of a freshly reserved number.
    #[allow(clippy::too_many_arguments)]
    pub fn reserved(
        tenant: TenantId,
        cnpj: impl Into<String>,
        series: u16,
        number: u32,
        kind: DocumentKind,
        environment: Environment,
        region: Region,
    ) -> Self {
        Self {
            tenant,
            cnpj: cnpj.into(),
            series,
            number,
            kind,
            environment,
            region,
            access_key: None,
            state: DocumentState::Draft,
            receipt: None,
            protocol: None,
            authorized_at: None,
            authority_status: None,
            errors: Vec::new(),
            signed_xml: None,
            distribution_xml: None,
            updated_at: Utc::now(),
        }
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidTransition`] for an illegal move.
    pub fn advance(&mut self, next: DocumentState) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Close the record as ERROR with `detail`, whatever step it reached.
    pub(crate) fn fail(&mut self, detail: ErrorDetail) {
        self.state = DocumentState::Error;
        self.errors.push(detail);
        self.updated_at = Utc::now();
    }

    pub fn result(&self) -> AuthorizationResult {
        let status = match self.state {
            DocumentState::Authorized => AuthorizationStatus::Authorized,
            DocumentState::Denied => AuthorizationStatus::Denied,
            DocumentState::Submitted | DocumentState::Processing => AuthorizationStatus::Processing,
            _ => AuthorizationStatus::Error,
        };
        AuthorizationResult {
            status,
            access_key: self.access_key.clone(),
            series: self.series,
            number: self.number,
            protocol: self.protocol.clone(),
            authorized_at: self.authorized_at,
            receipt: self.receipt.clone(),
            authority_status: self.authority_status.clone(),
            errors: self.errors.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Authorized,
    Denied,
    Processing,
    Error,
}

/// Outcome of a submission. Always tied to the reserved number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationResult {
    pub status: AuthorizationStatus,
    pub access_key: Option<AccessKey>,
    pub series: u16,
    pub number: u32,
    pub protocol: Option<String>,
    pub authorized_at: Option<DateTime<FixedOffset>>,
    pub receipt: Option<String>,
    pub authority_status: Option<AuthorityStatus>,
    pub errors: Vec<ErrorDetail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Success,
    Error,
}

/// One cancellation or correction submitted to the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub tenant: TenantId,
    pub access_key: AccessKey,
    pub kind: EventKind,
    pub sequence: u8,
    pub status: EventStatus,
    pub text: String,
    pub protocol: Option<String>,
    pub registered_at: Option<DateTime<FixedOffset>>,
    pub authority_status: AuthorityStatus,
    pub signed_xml: String,
    pub recorded_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn result(&self) -> EventResult {
        EventResult {
            status: self.status,
            sequence: Some(self.sequence),
            protocol: self.protocol.clone(),
            registered_at: self.registered_at,
            authority_status: Some(self.authority_status.clone()),
            errors: failure_details(self.status, &self.authority_status),
        }
    }
}

/// One number range disabled (or refused) by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoidRecord {
    pub tenant: TenantId,
    pub cnpj: String,
    pub series: u16,
    pub first: u32,
    pub last: u32,
    pub justification: String,
    pub status: EventStatus,
    pub protocol: Option<String>,
    pub registered_at: Option<DateTime<FixedOffset>>,
    pub authority_status: AuthorityStatus,
    pub signed_xml: String,
    pub recorded_at: DateTime<Utc>,
}

impl VoidRecord {
    pub fn result(&self) -> EventResult {
        EventResult {
            status: self.status,
            sequence: None,
            protocol: self.protocol.clone(),
            registered_at: self.registered_at,
            authority_status: Some(self.authority_status.clone()),
            errors: failure_details(self.status, &self.authority_status),
        }
    }
}

/// Outcome of an event or void submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResult {
    pub status: EventStatus,
    /// `nSeqEvento`; absent for void ranges.
    pub sequence: Option<u8>,
    pub protocol: Option<String>,
    pub registered_at: Option<DateTime<FixedOffset>>,
    pub authority_status: Option<AuthorityStatus>,
    pub errors: Vec<ErrorDetail>,
}

/// Authority view of a document, and what it changed locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub access_key: AccessKey,
    pub outcome: Outcome,
    pub authority_status: AuthorityStatus,
    pub protocol: Option<String>,
    /// State of the persisted record after the query, if one exists.
    pub state: Option<DocumentState>,
    /// `true` when the record was updated to match the authority.
    pub reconciled: bool,
}

fn failure_details(status: EventStatus, authority: &AuthorityStatus) -> Vec<ErrorDetail> {
    match status {
        EventStatus::Success => Vec::new(),
        EventStatus::Error => vec![ErrorDetail::authority(authority)],
    }
}
