//! Protocol state machine: submission, polling, events, void ranges and
//! status reconciliation.
//!
//! Every submission is two-phase. The draft is validated and the certificate
//! checked first; only then is a number reserved from the series counter.
//! From that point on the number is gone for good, and whatever happens the
//! engine persists a record for it before answering. Failures before the
//! reservation are returned as errors; failures after it come back as an
//! [`AuthorizationResult`] with status `Error`.
mod records;

pub use records::{
    AuthorizationResult, AuthorizationStatus, DocumentRecord, DocumentState, EventRecord,
    EventResult, EventStatus, QueryResult, VoidRecord,
};

use chrono::{DateTime, Datelike, FixedOffset, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    access_key::AccessKey,
    api::{AuthorityReply, AuthorityTransport, TransportConnector, TransportError},
    certificate::{CertificateError, CertificateManager, KeyMaterial},
    config::{Config, Environment, Region},
    document::{
        BuildError, DocumentBuilder, FiscalProfile, InvoiceDraft, ValidationError, brasilia_now,
        events::{EventDocument, EventKind, MAX_CORRECTIONS, VoidRange},
        sign::{SignedDocument, SigningError, DocumentSigner},
        validate_correction, validate_draft, validate_justification, validate_numbering,
    },
    ports::{FiscalProfileStore, RecordStore, SeriesCounter, StoreError, TenantId},
    status::{ErrorDetail, FailureKind, MappedStatus, Operation, Outcome, map_status},
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no document with access key {0}")]
    UnknownDocument(AccessKey),
    #[error("cannot move document from {from} to {to}")]
    InvalidTransition {
        from: DocumentState,
        to: DocumentState,
    },
    #[error("document {key} is {state}; only authorized documents accept corrections")]
    NotAuthorized { key: AccessKey, state: DocumentState },
    #[error("document {0} has no authorization protocol")]
    MissingProtocol(AccessKey),
    #[error("document {0} already carries the maximum of 20 corrections")]
    CorrectionLimit(AccessKey),
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::Validation(_) | EngineError::Build(BuildError::Validation(_)) => {
                FailureKind::Validation
            }
            EngineError::Build(_) => FailureKind::Build,
            EngineError::Certificate(_) => FailureKind::Certificate,
            EngineError::Signing(_) => FailureKind::Signing,
            EngineError::Transport(_) => FailureKind::Transport,
            EngineError::Store(_) => FailureKind::Store,
            EngineError::UnknownDocument(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::NotAuthorized { .. }
            | EngineError::MissingProtocol(_)
            | EngineError::CorrectionLimit(_) => FailureKind::State,
        }
    }

    /// The error as an entry of a result's error list.
    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail::new(self.kind(), self.to_string())
    }
}

/// Per-call knobs of [`FiscalEngine::submit_invoice`].
#[derive(Debug, Clone, Copy)]
pub struct SubmitOptions {
    /// Emission time; Brasília now when absent.
    pub issued_at: Option<DateTime<FixedOffset>>,
    /// Ask for synchronous processing (`indSinc` 1).
    pub synchronous: bool,
    /// Fixed `cNF` instead of a random one.
    pub random_code: Option<u32>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            issued_at: None,
            synchronous: true,
            random_code: None,
        }
    }
}

/// Drives documents through their lifecycle against the authority.
///
/// Collaborators are injected as trait objects; the engine keeps no state of
/// its own besides configuration, so one instance can serve concurrent
/// requests for many tenants.
pub struct FiscalEngine {
    config: Config,
    profiles: Arc<dyn FiscalProfileStore>,
    series: Arc<dyn SeriesCounter>,
    records: Arc<dyn RecordStore>,
    connector: Arc<dyn TransportConnector>,
}

// Public API
impl FiscalEngine {
    pub fn new(
        config: Config,
        profiles: Arc<dyn FiscalProfileStore>,
        series: Arc<dyn SeriesCounter>,
        records: Arc<dyn RecordStore>,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        Self {
            config,
            profiles,
            series,
            records,
            connector,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate, reserve a number, build, sign and submit `draft`.
    ///
    /// # Errors
    /// Only failures before the reservation are errors: validation, profile
    /// lookup, certificate loading and the reservation itself. Anything later
    /// is recorded and returned as a result with status `Error`; a failure to
    /// persist that record is the one exception.
    pub async fn submit_invoice(
        &self,
        tenant: &TenantId,
        draft: &InvoiceDraft,
        options: SubmitOptions,
    ) -> Result<AuthorizationResult, EngineError> {
        let profile = self.profiles.fiscal_profile(tenant).await?;
        let issued_at = options.issued_at.unwrap_or_else(brasilia_now);
        validate_draft(draft, profile.tax_regime(), issued_at.date_naive())?;
        let series = draft.series.unwrap_or(profile.default_series());
        validate_numbering(series, options.random_code)?;
        let key = self.load_key(&profile)?;

        let cnpj = digits(profile.cnpj());
        let number = self.series.reserve_next(&cnpj, series, draft.kind).await?;
        info!(%tenant, cnpj, series, number, "reserved document number");

        let mut record = DocumentRecord::reserved(
            tenant.clone(),
            cnpj,
            series,
            number,
            draft.kind,
            profile.environment(),
            profile.region(),
        );
        if let Err(error) = self
            .authorize(&profile, draft, &key, issued_at, &options, &mut record)
            .await
        {
            warn!(%tenant, series, number, %error, "submission failed after reservation");
            record.fail(error.detail());
        }
        self.records.save_document(&record).await?;

        info!(
            %tenant,
            series,
            number,
            state = %record.state,
            code = record.authority_status.as_ref().map(|s| s.code),
            "submission finished"
        );
        Ok(record.result())
    }

    /// Register a cancellation event for an authorized document.
    ///
    /// # Errors
    /// Local checks (justification, document state, protocol) fail before any
    /// remote call. Transport failures are returned as errors; authority
    /// refusals come back as a result with status `Error`.
    pub async fn cancel_invoice(
        &self,
        tenant: &TenantId,
        key: &AccessKey,
        justification: &str,
    ) -> Result<EventResult, EngineError> {
        validate_justification(justification)?;
        let profile = self.profiles.fiscal_profile(tenant).await?;
        let mut record = self.find_record(tenant, key).await?;
        if !record.state.can_transition_to(DocumentState::Cancelled) {
            return Err(EngineError::InvalidTransition {
                from: record.state,
                to: DocumentState::Cancelled,
            });
        }
        let protocol = record
            .protocol
            .clone()
            .ok_or_else(|| EngineError::MissingProtocol(key.clone()))?;
        let material = self.load_key(&profile)?;

        let event = EventDocument::cancellation(
            key.clone(),
            record.environment,
            protocol,
            justification,
            brasilia_now(),
        )?;
        let event_record = self
            .submit_event(tenant, record.environment, record.region, &material, &event)
            .await?;

        if event_record.status == EventStatus::Success {
            record.advance(DocumentState::Cancelled)?;
            self.records.save_document(&record).await?;
            info!(%tenant, access_key = %key, "document cancelled");
        }
        Ok(event_record.result())
    }

    /// Register the next correction letter (CC-e) for an authorized document.
    ///
    /// The sequence number follows the corrections the authority accepted so
    /// far; the document state does not change.
    ///
    /// # Errors
    /// See [`FiscalEngine::cancel_invoice`]. Also fails with
    /// [`EngineError::CorrectionLimit`] once twenty corrections exist.
    pub async fn correct_invoice(
        &self,
        tenant: &TenantId,
        key: &AccessKey,
        text: &str,
    ) -> Result<EventResult, EngineError> {
        validate_correction(text)?;
        let profile = self.profiles.fiscal_profile(tenant).await?;
        let record = self.find_record(tenant, key).await?;
        if record.state != DocumentState::Authorized {
            return Err(EngineError::NotAuthorized {
                key: key.clone(),
                state: record.state,
            });
        }

        let accepted = self
            .records
            .events_for(tenant, key)
            .await?
            .iter()
            .filter(|event| event.kind == EventKind::Correction && event.status == EventStatus::Success)
            .count();
        let sequence = u8::try_from(accepted + 1)
            .ok()
            .filter(|sequence| *sequence <= MAX_CORRECTIONS)
            .ok_or_else(|| EngineError::CorrectionLimit(key.clone()))?;
        let material = self.load_key(&profile)?;

        let event = EventDocument::correction(
            key.clone(),
            record.environment,
            sequence,
            text,
            brasilia_now(),
        )?;
        let event_record = self
            .submit_event(tenant, record.environment, record.region, &material, &event)
            .await?;
        Ok(event_record.result())
    }

    /// Disable the unused numbers `first..=last` of `series`.
    ///
    /// # Errors
    /// Local validation fails before any remote call; transport failures are
    /// returned as errors.
    pub async fn void_range(
        &self,
        tenant: &TenantId,
        series: u16,
        first: u32,
        last: u32,
        justification: &str,
    ) -> Result<EventResult, EngineError> {
        validate_justification(justification)?;
        let profile = self.profiles.fiscal_profile(tenant).await?;
        let year = (brasilia_now().year() % 100) as u8;
        let range = VoidRange::new(
            profile.region(),
            profile.environment(),
            profile.cnpj(),
            year,
            series,
            first,
            last,
            justification,
        )?;
        let material = self.load_key(&profile)?;

        let signed = DocumentSigner::new(&material).sign_void_range(&range)?;
        let transport = self
            .connector
            .connect(profile.environment(), profile.region(), &material)?;
        let reply = transport.submit_void_range(&signed).await?;
        let mapped = map_status(Operation::VoidRange, &reply.status);

        let record = VoidRecord {
            tenant: tenant.clone(),
            cnpj: range.cnpj().to_string(),
            series,
            first,
            last,
            justification: range.justification().to_string(),
            status: event_status(&mapped),
            protocol: reply.protocol.clone(),
            registered_at: reply.timestamp,
            authority_status: reply.status.clone(),
            signed_xml: signed.xml().to_string(),
            recorded_at: Utc::now(),
        };
        self.records.save_void(&record).await?;
        info!(
            %tenant,
            series,
            first,
            last,
            code = mapped.code(),
            outcome = ?mapped.outcome(),
            "void range submitted"
        );
        Ok(record.result())
    }

    /// Ask the authority for the current situation of `key`, bringing the
    /// persisted record in line when it missed a terminal outcome.
    ///
    /// # Errors
    /// Returns profile, certificate and transport failures.
    pub async fn query_status(&self, tenant: &TenantId, key: &AccessKey) -> Result<QueryResult, EngineError> {
        let profile = self.profiles.fiscal_profile(tenant).await?;
        let material = self.load_key(&profile)?;
        let transport = self
            .connector
            .connect(profile.environment(), key.region(), &material)?;
        let reply = transport.query_by_access_key(key).await?;
        let mapped = map_status(Operation::ProtocolQuery, &reply.status);

        let mut record = self.records.find_document(tenant, key).await?;
        let mut reconciled = false;
        if let Some(record) = record.as_mut() {
            if let Some(target) = DocumentState::from_outcome(mapped.outcome()) {
                if target != record.state && record.state.can_reconcile_to(target) {
                    info!(
                        %tenant,
                        access_key = %key,
                        from = %record.state,
                        to = %target,
                        "reconciling document with authority"
                    );
                    reconcile(record, target, &reply);
                    self.records.save_document(record).await?;
                    reconciled = true;
                }
            }
        }

        Ok(QueryResult {
            access_key: key.clone(),
            outcome: mapped.outcome(),
            authority_status: reply.status,
            protocol: reply.protocol,
            state: record.map(|record| record.state),
            reconciled,
        })
    }

    /// Availability of the tenant's authorizer.
    ///
    /// # Errors
    /// Returns profile, certificate and transport failures.
    pub async fn service_status(&self, tenant: &TenantId) -> Result<MappedStatus, EngineError> {
        let profile = self.profiles.fiscal_profile(tenant).await?;
        let material = self.load_key(&profile)?;
        let transport = self
            .connector
            .connect(profile.environment(), profile.region(), &material)?;
        let reply = transport.service_status().await?;
        let mapped = map_status(Operation::ServiceStatus, &reply.status);
        info!(%tenant, region = %profile.region(), code = mapped.code(), "service status");
        Ok(mapped)
    }
}

// Private API
impl FiscalEngine {
    fn load_key(&self, profile: &FiscalProfile) -> Result<KeyMaterial, EngineError> {
        let bundle_key = self
            .config
            .bundle_key()
            .ok_or(CertificateError::MissingBundleKey)?;
        let material = CertificateManager::new(bundle_key).load(profile.certificate())?;
        material.ensure_usable(Utc::now(), &digits(profile.cnpj()))?;
        Ok(material)
    }

    async fn find_record(&self, tenant: &TenantId, key: &AccessKey) -> Result<DocumentRecord, EngineError> {
        self.records
            .find_document(tenant, key)
            .await?
            .ok_or_else(|| EngineError::UnknownDocument(key.clone()))
    }

    /// Steps after the reservation. Intermediate states are persisted as they
    /// are reached; the final record is saved by the caller.
    async fn authorize(
        &self,
        profile: &FiscalProfile,
        draft: &InvoiceDraft,
        key: &KeyMaterial,
        issued_at: DateTime<FixedOffset>,
        options: &SubmitOptions,
        record: &mut DocumentRecord,
    ) -> Result<(), EngineError> {
        let mut builder =
            DocumentBuilder::new(profile, draft, record.series, record.number).issued_at(issued_at);
        if let Some(code) = options.random_code {
            builder = builder.random_code(code);
        }
        let document = builder.build()?;
        record.access_key = Some(document.access_key().clone());
        record.advance(DocumentState::Built)?;
        self.records.save_document(record).await?;

        let signed = DocumentSigner::new(key).sign_document(&document)?;
        record.signed_xml = Some(signed.xml().to_string());
        record.advance(DocumentState::Signed)?;
        self.records.save_document(record).await?;

        let transport = self
            .connector
            .connect(profile.environment(), profile.region(), key)?;
        record.advance(DocumentState::Submitted)?;
        self.records.save_document(record).await?;

        let mut reply = transport
            .submit_for_authorization(&signed, batch_id(), options.synchronous)
            .await?;
        let mut mapped = map_status(Operation::Authorization, &reply.status);

        if mapped.outcome() == Outcome::Processing {
            record.receipt = reply.receipt.clone();
            record.authority_status = Some(reply.status.clone());
            record.advance(DocumentState::Processing)?;
            self.records.save_document(record).await?;

            let receipt = reply
                .receipt
                .clone()
                .ok_or(TransportError::UnexpectedShape("nRec"))?;
            match self.poll_until_resolved(transport.as_ref(), &receipt).await {
                Some((polled, polled_status)) => {
                    reply = polled;
                    mapped = polled_status;
                }
                None => {
                    let attempts = self.config.poll_policy().attempts();
                    record.fail(ErrorDetail::new(
                        FailureKind::Unresolved,
                        format!("still processing after {attempts} attempts; receipt {receipt}"),
                    ));
                    return Ok(());
                }
            }
        }

        apply_authorization(record, &signed, &reply, &mapped)
    }

    /// Poll the receipt until the batch leaves processing or the budget runs
    /// out. Transport failures consume an attempt and are otherwise ignored.
    async fn poll_until_resolved(
        &self,
        transport: &dyn AuthorityTransport,
        receipt: &str,
    ) -> Option<(AuthorityReply, MappedStatus)> {
        let policy = self.config.poll_policy();
        for attempt in 1..=policy.attempts() {
            tokio::time::sleep(policy.delay()).await;
            match transport.poll_receipt(receipt).await {
                Ok(reply) => {
                    let mapped = map_status(Operation::ReceiptQuery, &reply.status);
                    if mapped.outcome() != Outcome::Processing {
                        return Some((reply, mapped));
                    }
                    debug!(attempt, receipt, "batch still processing");
                }
                Err(error) => warn!(attempt, receipt, %error, "receipt poll failed"),
            }
        }
        None
    }

    async fn submit_event(
        &self,
        tenant: &TenantId,
        environment: Environment,
        region: Region,
        material: &KeyMaterial,
        event: &EventDocument,
    ) -> Result<EventRecord, EngineError> {
        let signed = DocumentSigner::new(material).sign_event(event)?;
        let transport = self.connector.connect(environment, region, material)?;
        let reply = transport.submit_event(&signed, batch_id()).await?;
        let mapped = map_status(Operation::Event, &reply.status);

        let record = EventRecord {
            tenant: tenant.clone(),
            access_key: event.access_key().clone(),
            kind: event.kind(),
            sequence: event.sequence(),
            status: event_status(&mapped),
            text: event.text().to_string(),
            protocol: reply.protocol.clone(),
            registered_at: reply.timestamp,
            authority_status: reply.status.clone(),
            signed_xml: signed.xml().to_string(),
            recorded_at: Utc::now(),
        };
        self.records.save_event(&record).await?;
        info!(
            %tenant,
            access_key = %event.access_key(),
            kind = ?event.kind(),
            sequence = event.sequence(),
            code = mapped.code(),
            "event submitted"
        );
        Ok(record)
    }
}

fn apply_authorization(
    record: &mut DocumentRecord,
    signed: &SignedDocument,
    reply: &AuthorityReply,
    mapped: &MappedStatus,
) -> Result<(), EngineError> {
    record.authority_status = Some(reply.status.clone());
    match mapped.outcome() {
        Outcome::Authorized => {
            record.protocol = reply.protocol.clone();
            record.authorized_at = reply.timestamp;
            record.distribution_xml = reply
                .protocol_xml
                .as_deref()
                .map(|protocol| signed.distribution_xml(protocol));
            record.advance(DocumentState::Authorized)
        }
        Outcome::Denied => {
            record.protocol = reply.protocol.clone();
            record.errors.push(ErrorDetail::authority(&reply.status));
            record.advance(DocumentState::Denied)
        }
        _ => {
            record.fail(
                mapped
                    .error_detail()
                    .unwrap_or_else(|| ErrorDetail::authority(&reply.status)),
            );
            Ok(())
        }
    }
}

fn reconcile(record: &mut DocumentRecord, target: DocumentState, reply: &AuthorityReply) {
    record.authority_status = Some(reply.status.clone());
    match target {
        DocumentState::Authorized => {
            record.protocol = reply.protocol.clone().or(record.protocol.take());
            record.authorized_at = reply.timestamp.or(record.authorized_at);
            if let (Some(signed), Some(protocol)) = (&record.signed_xml, &reply.protocol_xml) {
                record.distribution_xml =
                    Some(crate::document::xml::distribution_xml(signed, protocol));
            }
        }
        DocumentState::Denied => record.errors.push(ErrorDetail::authority(&reply.status)),
        _ => {}
    }
    record.state = target;
    record.updated_at = Utc::now();
}

fn event_status(mapped: &MappedStatus) -> EventStatus {
    match mapped.outcome() {
        Outcome::Success => EventStatus::Success,
        _ => EventStatus::Error,
    }
}

/// `idLote`: milliseconds since the epoch, unique enough per issuer.
fn batch_id() -> u64 {
    Utc::now().timestamp_millis().unsigned_abs()
}

fn digits(cnpj: &str) -> String {
    cnpj.chars().filter(char::is_ascii_digit).collect()
}
