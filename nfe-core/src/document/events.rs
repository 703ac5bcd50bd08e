//! Post-authorization events (cancellation, correction letter) and number
//! range voiding.
use chrono::{DateTime, FixedOffset};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde::{Deserialize, Serialize as SerializeDerive};
use tracing::debug;

use super::{
    MODEL_NFE,
    sign::{DocumentSigner, SigningError, ensure_well_formed},
    validation::{DraftField, ValidationError, ValidationKind, validate_correction, validate_justification},
    xml::{
        XmlFormat,
        constants::{CORRECTION_CONDITIONS, EVENT_VERSION, NFE_NS, NFE_VERSION},
        helpers::date_time,
        serialize_element,
    },
};
use crate::{
    access_key::AccessKey,
    config::{Environment, Region},
};

/// Correction letters allowed per document.
pub const MAX_CORRECTIONS: u8 = 20;
const MAX_NUMBER: u32 = 999_999_999;

/// Event type (`tpEvento`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, SerializeDerive, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Cancellation,
    Correction,
}

impl EventKind {
    pub fn code(&self) -> &'static str {
        match self {
            EventKind::Cancellation => "110111",
            EventKind::Correction => "110110",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            EventKind::Cancellation => "Cancelamento",
            EventKind::Correction => "Carta de Correcao",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventDetail {
    Cancellation { protocol: String, justification: String },
    Correction { text: String },
}

/// Unsigned event about one authorized document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDocument {
    access_key: AccessKey,
    environment: Environment,
    cnpj: String,
    sequence: u8,
    occurred_at: DateTime<FixedOffset>,
    detail: EventDetail,
}

impl EventDocument {
    /// Cancellation of an authorized document (sequence 1).
    ///
    /// # Errors
    /// Returns [`ValidationError`] if the justification is not 15 to 255 characters.
    pub fn cancellation(
        access_key: AccessKey,
        environment: Environment,
        protocol: impl Into<String>,
        justification: &str,
        occurred_at: DateTime<FixedOffset>,
    ) -> Result<Self, ValidationError> {
        validate_justification(justification)?;
        Ok(Self {
            cnpj: access_key.cnpj().to_string(),
            access_key,
            environment,
            sequence: 1,
            occurred_at,
            detail: EventDetail::Cancellation {
                protocol: protocol.into(),
                justification: justification.trim().to_string(),
            },
        })
    }

    /// Correction letter number `sequence` (1 to 20).
    ///
    /// # Errors
    /// Returns [`ValidationError`] for an invalid text or sequence.
    pub fn correction(
        access_key: AccessKey,
        environment: Environment,
        sequence: u8,
        text: &str,
        occurred_at: DateTime<FixedOffset>,
    ) -> Result<Self, ValidationError> {
        validate_correction(text)?;
        if sequence == 0 || sequence > MAX_CORRECTIONS {
            return Err(ValidationError::single(DraftField::Correction, ValidationKind::TooLong));
        }
        Ok(Self {
            cnpj: access_key.cnpj().to_string(),
            access_key,
            environment,
            sequence,
            occurred_at,
            detail: EventDetail::Correction {
                text: text.trim().to_string(),
            },
        })
    }

    pub fn kind(&self) -> EventKind {
        match self.detail {
            EventDetail::Cancellation { .. } => EventKind::Cancellation,
            EventDetail::Correction { .. } => EventKind::Correction,
        }
    }

    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn occurred_at(&self) -> DateTime<FixedOffset> {
        self.occurred_at
    }

    /// Justification or correction text.
    pub fn text(&self) -> &str {
        match &self.detail {
            EventDetail::Cancellation { justification, .. } => justification,
            EventDetail::Correction { text } => text,
        }
    }

    /// `ID` + type + key + two-digit sequence.
    pub fn event_id(&self) -> String {
        format!(
            "ID{}{}{:02}",
            self.kind().code(),
            self.access_key,
            self.sequence
        )
    }

    fn region(&self) -> Region {
        self.access_key.region()
    }
}

/// Signed `evento` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEvent {
    access_key: AccessKey,
    kind: EventKind,
    sequence: u8,
    region: Region,
    environment: Environment,
    xml: String,
}

impl SignedEvent {
    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    /// # Errors
    /// Returns [`SigningError::Verification`] on any mismatch.
    pub fn verify(&self) -> Result<(), SigningError> {
        super::sign::verify_xml(&self.xml, "infEvento")
    }
}

/// Range of unused numbers to declare void (`inutNFe`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoidRange {
    region: Region,
    environment: Environment,
    cnpj: String,
    year: u8,
    series: u16,
    first: u32,
    last: u32,
    justification: String,
}

impl VoidRange {
    /// # Errors
    /// Returns [`ValidationError`] for an empty or inverted range, a bad CNPJ
    /// or an invalid justification.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        region: Region,
        environment: Environment,
        cnpj: &str,
        year: u8,
        series: u16,
        first: u32,
        last: u32,
        justification: &str,
    ) -> Result<Self, ValidationError> {
        validate_justification(justification)?;
        let cnpj = crate::access_key::normalize_cnpj(cnpj).map_err(|_| {
            ValidationError::single(DraftField::IssuerCnpj, ValidationKind::InvalidFormat)
        })?;
        if first == 0 || first > last || last > MAX_NUMBER || series > 999 || year > 99 {
            return Err(ValidationError::single(DraftField::Range, ValidationKind::InvalidFormat));
        }
        Ok(Self {
            region,
            environment,
            cnpj,
            year,
            series,
            first,
            last,
            justification: justification.trim().to_string(),
        })
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn cnpj(&self) -> &str {
        &self.cnpj
    }

    pub fn series(&self) -> u16 {
        self.series
    }

    pub fn first(&self) -> u32 {
        self.first
    }

    pub fn last(&self) -> u32 {
        self.last
    }

    pub fn justification(&self) -> &str {
        &self.justification
    }

    pub fn void_id(&self) -> String {
        format!(
            "ID{:02}{:02}{}{}{:03}{:09}{:09}",
            self.region.code(),
            self.year,
            self.cnpj,
            MODEL_NFE,
            self.series,
            self.first,
            self.last
        )
    }
}

/// Signed `inutNFe` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedVoidRange {
    range: VoidRange,
    xml: String,
}

impl SignedVoidRange {
    pub fn range(&self) -> &VoidRange {
        &self.range
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    /// # Errors
    /// Returns [`SigningError::Verification`] on any mismatch.
    pub fn verify(&self) -> Result<(), SigningError> {
        super::sign::verify_xml(&self.xml, "infInut")
    }
}

impl DocumentSigner<'_> {
    /// # Errors
    /// Returns [`SigningError`] if serialization or signing fails.
    pub fn sign_event(&self, event: &EventDocument) -> Result<SignedEvent, SigningError> {
        let inner = serialize_element(&InfEventoXml(event), XmlFormat::Compact)?;
        let parts = self.sign_enveloped(&inner, &event.event_id())?;
        let xml = format!(
            "<evento xmlns=\"{NFE_NS}\" versao=\"{EVENT_VERSION}\">{}{}</evento>",
            parts.canonical_element, parts.signature_xml
        );
        ensure_well_formed(&xml)?;
        debug!(event_id = %event.event_id(), "event signed");
        Ok(SignedEvent {
            access_key: event.access_key.clone(),
            kind: event.kind(),
            sequence: event.sequence,
            region: event.region(),
            environment: event.environment,
            xml,
        })
    }

    /// # Errors
    /// Returns [`SigningError`] if serialization or signing fails.
    pub fn sign_void_range(&self, range: &VoidRange) -> Result<SignedVoidRange, SigningError> {
        let inner = serialize_element(&InfInutXml(range), XmlFormat::Compact)?;
        let parts = self.sign_enveloped(&inner, &range.void_id())?;
        let xml = format!(
            "<inutNFe xmlns=\"{NFE_NS}\" versao=\"{NFE_VERSION}\">{}{}</inutNFe>",
            parts.canonical_element, parts.signature_xml
        );
        ensure_well_formed(&xml)?;
        debug!(void_id = %range.void_id(), "void range signed");
        Ok(SignedVoidRange {
            range: range.clone(),
            xml,
        })
    }
}

struct InfEventoXml<'a>(&'a EventDocument);

impl Serialize for InfEventoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let event = self.0;
        let mut st = s.serialize_struct("infEvento", 11)?;
        st.serialize_field("@xmlns", NFE_NS)?;
        st.serialize_field("@Id", &event.event_id())?;
        st.serialize_field("cOrgao", &event.region().code())?;
        st.serialize_field("tpAmb", &event.environment.code())?;
        st.serialize_field("CNPJ", &event.cnpj)?;
        st.serialize_field("chNFe", event.access_key.as_str())?;
        st.serialize_field("dhEvento", &date_time(&event.occurred_at))?;
        st.serialize_field("tpEvento", event.kind().code())?;
        st.serialize_field("nSeqEvento", &event.sequence)?;
        st.serialize_field("verEvento", EVENT_VERSION)?;
        st.serialize_field("detEvento", &DetEventoXml(event))?;
        st.end()
    }
}

struct DetEventoXml<'a>(&'a EventDocument);

impl Serialize for DetEventoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let event = self.0;
        let mut st = s.serialize_struct("detEvento", 4)?;
        st.serialize_field("@versao", EVENT_VERSION)?;
        st.serialize_field("descEvento", event.kind().description())?;
        match &event.detail {
            EventDetail::Cancellation {
                protocol,
                justification,
            } => {
                st.serialize_field("nProt", protocol)?;
                st.serialize_field("xJust", justification)?;
            }
            EventDetail::Correction { text } => {
                st.serialize_field("xCorrecao", text)?;
                st.serialize_field("xCondUso", CORRECTION_CONDITIONS)?;
            }
        }
        st.end()
    }
}

struct InfInutXml<'a>(&'a VoidRange);

impl Serialize for InfInutXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let range = self.0;
        let mut st = s.serialize_struct("infInut", 11)?;
        st.serialize_field("@xmlns", NFE_NS)?;
        st.serialize_field("@Id", &range.void_id())?;
        st.serialize_field("tpAmb", &range.environment.code())?;
        st.serialize_field("xServ", "INUTILIZAR")?;
        st.serialize_field("cUF", &range.region.code())?;
        st.serialize_field("ano", &format!("{:02}", range.year))?;
        st.serialize_field("CNPJ", &range.cnpj)?;
        st.serialize_field("mod", &MODEL_NFE)?;
        st.serialize_field("serie", &range.series)?;
        st.serialize_field("nNFIni", &range.first)?;
        st.serialize_field("nNFFin", &range.last)?;
        st.serialize_field("xJust", &range.justification)?;
        st.end()
    }
}
