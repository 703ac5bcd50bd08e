//! Collaborators the engine depends on: fiscal profiles, series numbering and
//! record persistence.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::{
    access_key::AccessKey,
    document::{DocumentKind, FiscalProfile},
    engine::{DocumentRecord, EventRecord, VoidRecord},
};

/// Identifies the issuing organization a request acts for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no fiscal profile for tenant {0}")]
    ProfileNotFound(TenantId),
    #[error("no active {kind:?} series {series} for CNPJ {cnpj}")]
    NoActiveSeries {
        cnpj: String,
        series: u16,
        kind: DocumentKind,
    },
    #[error("series {series} for CNPJ {cnpj} has no numbers left")]
    SeriesExhausted { cnpj: String, series: u16 },
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Read-only source of issuer profiles.
#[async_trait]
pub trait FiscalProfileStore: Send + Sync {
    /// Profile of the issuer acting as `tenant`.
    async fn fiscal_profile(&self, tenant: &TenantId) -> Result<FiscalProfile, StoreError>;
}

/// Series numbering. The only serialization point of the engine.
#[async_trait]
pub trait SeriesCounter: Send + Sync {
    /// Atomically read and increment the next number of the active series.
    ///
    /// A returned number is consumed for good: implementations must never hand
    /// it out again, whatever happens to the document afterwards.
    async fn reserve_next(&self, cnpj: &str, series: u16, kind: DocumentKind) -> Result<u32, StoreError>;
}

/// Persistence of documents, events and void ranges.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace the record of `(tenant, cnpj, series, kind, number)`.
    ///
    /// Numbering is per kind, so an entry and an exit sharing a series and a
    /// number are two distinct records.
    async fn save_document(&self, record: &DocumentRecord) -> Result<(), StoreError>;

    async fn find_document(&self, tenant: &TenantId, key: &AccessKey) -> Result<Option<DocumentRecord>, StoreError>;

    async fn save_event(&self, record: &EventRecord) -> Result<(), StoreError>;

    /// Events registered for `key`, oldest first.
    async fn events_for(&self, tenant: &TenantId, key: &AccessKey) -> Result<Vec<EventRecord>, StoreError>;

    async fn save_void(&self, record: &VoidRecord) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_describe_themselves() {
        let err = StoreError::NoActiveSeries {
            cnpj: "12345678000195".into(),
            series: 1,
            kind: DocumentKind::Exit,
        };
        assert_eq!(err.to_string(), "no active Exit series 1 for CNPJ 12345678000195");
        assert_eq!(
            StoreError::ProfileNotFound(TenantId::new("acme")).to_string(),
            "no fiscal profile for tenant acme"
        );
    }
}
