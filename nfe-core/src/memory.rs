//! In-memory collaborators for tests, demos and the CLI.
//!
//! Locks are only held inside synchronous sections, never across an await.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::{
    access_key::AccessKey,
    document::{DocumentKind, FiscalProfile},
    engine::{DocumentRecord, EventRecord, VoidRecord},
    ports::{FiscalProfileStore, RecordStore, SeriesCounter, StoreError, TenantId},
};

const MAX_NUMBER: u32 = 999_999_999;

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    cnpj: String,
    series: u16,
    kind: DocumentKind,
}

#[derive(Debug, Clone, Copy)]
struct SeriesState {
    next: u32,
    active: bool,
}

/// Series counter backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemorySeriesCounter {
    series: Mutex<HashMap<SeriesKey, SeriesState>>,
}

impl InMemorySeriesCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `series` starting at `next`. Reopening an existing series keeps
    /// its counter unless `next` is ahead of it.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] if the lock is poisoned.
    pub fn open_series(&self, cnpj: &str, series: u16, kind: DocumentKind, next: u32) -> Result<(), StoreError> {
        let mut map = self.series.lock().map_err(poisoned)?;
        let state = map
            .entry(SeriesKey {
                cnpj: cnpj.to_string(),
                series,
                kind,
            })
            .or_insert(SeriesState { next, active: true });
        state.next = state.next.max(next);
        state.active = true;
        Ok(())
    }

    /// # Errors
    /// Returns [`StoreError::NoActiveSeries`] for an unknown series.
    pub fn deactivate(&self, cnpj: &str, series: u16, kind: DocumentKind) -> Result<(), StoreError> {
        let mut map = self.series.lock().map_err(poisoned)?;
        let key = SeriesKey {
            cnpj: cnpj.to_string(),
            series,
            kind,
        };
        match map.get_mut(&key) {
            Some(state) => {
                state.active = false;
                Ok(())
            }
            None => Err(StoreError::NoActiveSeries {
                cnpj: key.cnpj,
                series,
                kind,
            }),
        }
    }

    /// Number the next reservation would return, without consuming it.
    pub fn peek_next(&self, cnpj: &str, series: u16, kind: DocumentKind) -> Option<u32> {
        let map = self.series.lock().ok()?;
        map.get(&SeriesKey {
            cnpj: cnpj.to_string(),
            series,
            kind,
        })
        .map(|state| state.next)
    }
}

#[async_trait]
impl SeriesCounter for InMemorySeriesCounter {
    async fn reserve_next(&self, cnpj: &str, series: u16, kind: DocumentKind) -> Result<u32, StoreError> {
        let mut map = self.series.lock().map_err(poisoned)?;
        let state = map
            .get_mut(&SeriesKey {
                cnpj: cnpj.to_string(),
                series,
                kind,
            })
            .filter(|state| state.active)
            .ok_or_else(|| StoreError::NoActiveSeries {
                cnpj: cnpj.to_string(),
                series,
                kind,
            })?;
        let number = state.next;
        if number > MAX_NUMBER {
            return Err(StoreError::SeriesExhausted {
                cnpj: cnpj.to_string(),
                series,
            });
        }
        state.next = number + 1;
        Ok(number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DocumentKey {
    tenant: TenantId,
    cnpj: String,
    series: u16,
    kind: DocumentKind,
    number: u32,
}

/// Record store keeping everything in maps.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    documents: RwLock<HashMap<DocumentKey, DocumentRecord>>,
    events: RwLock<Vec<EventRecord>>,
    voids: RwLock<Vec<VoidRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every document record, ordered by series and number.
    pub fn documents(&self) -> Vec<DocumentRecord> {
        let mut documents: Vec<DocumentRecord> = self
            .documents
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        documents.sort_by_key(|record| (record.series, record.number));
        documents
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.events.read().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn voids(&self) -> Vec<VoidRecord> {
        self.voids.read().map(|voids| voids.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn save_document(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let key = DocumentKey {
            tenant: record.tenant.clone(),
            cnpj: record.cnpj.clone(),
            series: record.series,
            kind: record.kind,
            number: record.number,
        };
        self.documents
            .write()
            .map_err(poisoned)?
            .insert(key, record.clone());
        Ok(())
    }

    async fn find_document(&self, tenant: &TenantId, key: &AccessKey) -> Result<Option<DocumentRecord>, StoreError> {
        let documents = self.documents.read().map_err(poisoned)?;
        Ok(documents
            .values()
            .find(|record| &record.tenant == tenant && record.access_key.as_ref() == Some(key))
            .cloned())
    }

    async fn save_event(&self, record: &EventRecord) -> Result<(), StoreError> {
        self.events.write().map_err(poisoned)?.push(record.clone());
        Ok(())
    }

    async fn events_for(&self, tenant: &TenantId, key: &AccessKey) -> Result<Vec<EventRecord>, StoreError> {
        let events = self.events.read().map_err(poisoned)?;
        Ok(events
            .iter()
            .filter(|event| &event.tenant == tenant && &event.access_key == key)
            .cloned()
            .collect())
    }

    async fn save_void(&self, record: &VoidRecord) -> Result<(), StoreError> {
        self.voids.write().map_err(poisoned)?.push(record.clone());
        Ok(())
    }
}

/// Fixed set of profiles.
#[derive(Debug, Default, Clone)]
pub struct StaticProfileStore {
    profiles: HashMap<TenantId, FiscalProfile>,
}

impl StaticProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, tenant: TenantId, profile: FiscalProfile) -> Self {
        self.insert(tenant, profile);
        self
    }

    pub fn insert(&mut self, tenant: TenantId, profile: FiscalProfile) {
        self.profiles.insert(tenant, profile);
    }
}

#[async_trait]
impl FiscalProfileStore for StaticProfileStore {
    async fn fiscal_profile(&self, tenant: &TenantId) -> Result<FiscalProfile, StoreError> {
        self.profiles
            .get(tenant)
            .cloned()
            .ok_or_else(|| StoreError::ProfileNotFound(tenant.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Environment, Region};
    use std::sync::Arc;

    const CNPJ: &str = "12345678000195";

    #[tokio::test]
    async fn reservations_are_sequential_and_never_reused() {
        let counter = InMemorySeriesCounter::new();
        counter.open_series(CNPJ, 1, DocumentKind::Exit, 10).unwrap();

        assert_eq!(counter.reserve_next(CNPJ, 1, DocumentKind::Exit).await.unwrap(), 10);
        assert_eq!(counter.reserve_next(CNPJ, 1, DocumentKind::Exit).await.unwrap(), 11);
        // Reopening with a lower start keeps the counter.
        counter.open_series(CNPJ, 1, DocumentKind::Exit, 1).unwrap();
        assert_eq!(counter.peek_next(CNPJ, 1, DocumentKind::Exit), Some(12));
    }

    #[tokio::test]
    async fn inactive_or_unknown_series_refuses() {
        let counter = InMemorySeriesCounter::new();
        assert!(matches!(
            counter.reserve_next(CNPJ, 1, DocumentKind::Exit).await,
            Err(StoreError::NoActiveSeries { .. })
        ));
        counter.open_series(CNPJ, 1, DocumentKind::Exit, 1).unwrap();
        counter.deactivate(CNPJ, 1, DocumentKind::Exit).unwrap();
        assert!(counter.reserve_next(CNPJ, 1, DocumentKind::Exit).await.is_err());
        // Kinds are independent series.
        assert!(counter.reserve_next(CNPJ, 1, DocumentKind::Entry).await.is_err());
    }

    #[tokio::test]
    async fn exhausted_series_stops() {
        let counter = InMemorySeriesCounter::new();
        counter.open_series(CNPJ, 2, DocumentKind::Exit, MAX_NUMBER).unwrap();
        assert_eq!(counter.reserve_next(CNPJ, 2, DocumentKind::Exit).await.unwrap(), MAX_NUMBER);
        assert!(matches!(
            counter.reserve_next(CNPJ, 2, DocumentKind::Exit).await,
            Err(StoreError::SeriesExhausted { series: 2, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_are_distinct() {
        let counter = Arc::new(InMemorySeriesCounter::new());
        counter.open_series(CNPJ, 1, DocumentKind::Exit, 1).unwrap();

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move { counter.reserve_next(CNPJ, 1, DocumentKind::Exit).await })
            })
            .collect();
        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap().unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=50).collect::<Vec<u32>>());
        assert_eq!(counter.peek_next(CNPJ, 1, DocumentKind::Exit), Some(51));
    }

    #[tokio::test]
    async fn record_store_upserts_by_number() {
        let store = InMemoryRecordStore::new();
        let tenant = TenantId::new("acme");
        let mut record = DocumentRecord::reserved(
            tenant.clone(),
            CNPJ,
            1,
            7,
            DocumentKind::Exit,
            Environment::Homologation,
            Region::SP,
        );
        store.save_document(&record).await.unwrap();
        let key = AccessKey::parse("35240512345678000195550010000001231123456786").unwrap();
        record.access_key = Some(key.clone());
        store.save_document(&record).await.unwrap();

        assert_eq!(store.documents().len(), 1);
        let found = store.find_document(&tenant, &key).await.unwrap().unwrap();
        assert_eq!(found.number, 7);
        assert!(store.find_document(&TenantId::new("other"), &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entry_and_exit_with_the_same_number_are_kept_apart() {
        let store = InMemoryRecordStore::new();
        let tenant = TenantId::new("acme");
        for kind in [DocumentKind::Exit, DocumentKind::Entry] {
            let record = DocumentRecord::reserved(
                tenant.clone(),
                CNPJ,
                1,
                1,
                kind,
                Environment::Homologation,
                Region::SP,
            );
            store.save_document(&record).await.unwrap();
        }

        let documents = store.documents();
        assert_eq!(documents.len(), 2);
        assert!(documents.iter().any(|record| record.kind == DocumentKind::Entry));
        assert!(documents.iter().any(|record| record.kind == DocumentKind::Exit));
    }

    #[tokio::test]
    async fn unknown_tenant_has_no_profile() {
        let store = StaticProfileStore::new();
        assert_eq!(
            store.fiscal_profile(&TenantId::new("ghost")).await.unwrap_err(),
            StoreError::ProfileNotFound(TenantId::new("ghost"))
        );
    }
}
