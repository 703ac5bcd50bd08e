//! Fiscal document domain types: issuer profile, draft, line items and taxes.
mod builder;
pub mod events;
pub mod sign;
pub mod validation;
pub mod xml;

pub use builder::{
    BuildError, DocumentBuilder, EMISSION_NORMAL, FiscalDocument, IssuerSection, ItemSection,
    TotalsSection, brasilia_now,
};
pub use validation::{
    DraftField, ValidationError, ValidationIssue, ValidationKind, validate_correction,
    validate_draft, validate_justification, validate_numbering,
};

use bitflags::bitflags;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    access_key::AccessKey,
    certificate::CertificateRef,
    config::{Environment, Region},
};

/// NF-e model code.
pub const MODEL_NFE: u8 = 55;

/// Postal address of issuer or recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub number: String,
    #[serde(default)]
    pub complement: Option<String>,
    pub district: String,
    /// IBGE seven-digit municipality code.
    pub city_code: String,
    pub city: String,
    pub region: Region,
    pub postal_code: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Address {
    pub fn street(&self) -> &str {
        &self.street
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn complement(&self) -> Option<&str> {
        self.complement.as_deref()
    }

    pub fn district(&self) -> &str {
        &self.district
    }

    pub fn city_code(&self) -> &str {
        &self.city_code
    }

    pub fn city(&self) -> &str {
        &self.city
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn postal_code(&self) -> &str {
        &self.postal_code
    }

    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }
}

/// Issuer tax regime (`CRT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxRegime {
    SimplesNacional,
    SimplesNacionalExcess,
    Normal,
}

impl TaxRegime {
    pub fn code(&self) -> u8 {
        match self {
            TaxRegime::SimplesNacional => 1,
            TaxRegime::SimplesNacionalExcess => 2,
            TaxRegime::Normal => 3,
        }
    }

    pub fn is_simples(&self) -> bool {
        !matches!(self, TaxRegime::Normal)
    }
}

/// Issuer record looked up by tenant. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalProfile {
    cnpj: String,
    legal_name: String,
    #[serde(default)]
    trade_name: Option<String>,
    state_registration: String,
    tax_regime: TaxRegime,
    address: Address,
    environment: Environment,
    certificate: CertificateRef,
    #[serde(default = "default_series")]
    default_series: u16,
}

fn default_series() -> u16 {
    1
}

impl FiscalProfile {
    pub fn new(
        cnpj: impl Into<String>,
        legal_name: impl Into<String>,
        state_registration: impl Into<String>,
        tax_regime: TaxRegime,
        address: Address,
        environment: Environment,
        certificate: CertificateRef,
    ) -> Self {
        Self {
            cnpj: cnpj.into(),
            legal_name: legal_name.into(),
            trade_name: None,
            state_registration: state_registration.into(),
            tax_regime,
            address,
            environment,
            certificate,
            default_series: default_series(),
        }
    }

    pub fn with_trade_name(mut self, trade_name: impl Into<String>) -> Self {
        self.trade_name = Some(trade_name.into());
        self
    }

    pub fn with_default_series(mut self, series: u16) -> Self {
        self.default_series = series;
        self
    }

    pub fn cnpj(&self) -> &str {
        &self.cnpj
    }

    pub fn legal_name(&self) -> &str {
        &self.legal_name
    }

    pub fn trade_name(&self) -> Option<&str> {
        self.trade_name.as_deref()
    }

    pub fn state_registration(&self) -> &str {
        &self.state_registration
    }

    pub fn tax_regime(&self) -> TaxRegime {
        self.tax_regime
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Authority region, the issuer's state.
    pub fn region(&self) -> Region {
        self.address.region
    }

    pub fn certificate(&self) -> &CertificateRef {
        &self.certificate
    }

    pub fn default_series(&self) -> u16 {
        self.default_series
    }
}

/// Direction of the document within a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Entry,
    Exit,
    /// Return of goods to the supplier.
    Devolution,
}

impl DocumentKind {
    /// `tpNF`: 0 entry, 1 exit.
    pub fn operation_type(&self) -> u8 {
        match self {
            DocumentKind::Entry => 0,
            DocumentKind::Exit | DocumentKind::Devolution => 1,
        }
    }

    /// `finNFe`: 1 normal, 4 devolution.
    pub fn purpose(&self) -> u8 {
        match self {
            DocumentKind::Entry | DocumentKind::Exit => 1,
            DocumentKind::Devolution => 4,
        }
    }
}

/// Recipient identification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PartyDocument {
    Cnpj(String),
    Cpf(String),
}

impl PartyDocument {
    pub fn digits(&self) -> &str {
        match self {
            PartyDocument::Cnpj(value) | PartyDocument::Cpf(value) => value,
        }
    }
}

/// Customer snapshot taken when the order was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub document: PartyDocument,
    pub name: String,
    #[serde(default)]
    pub state_registration: Option<String>,
    pub address: Address,
    #[serde(default)]
    pub email: Option<String>,
}

impl Recipient {
    pub fn document(&self) -> &PartyDocument {
        &self.document
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_registration(&self) -> Option<&str> {
        self.state_registration.as_deref()
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }
}

bitflags! {
    /// Handling requirements of a product line.
    ///
    /// # Examples
    /// ```rust
    /// use nfe_core::document::ProductFlags;
    ///
    /// let flags = ProductFlags::CONTROLLED | ProductFlags::THERMOLABILE;
    /// assert!(flags.contains(ProductFlags::CONTROLLED));
    /// ```
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ProductFlags: u8 {
        /// Controlled substance; every line must carry its batch.
        const CONTROLLED = 0b001;
        /// Cold chain; a storage temperature range must be declared.
        const THERMOLABILE = 0b010;
    }
}

/// Batch traceability (`rastro`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub number: String,
    pub quantity: f64,
    pub manufactured_on: NaiveDate,
    pub expires_on: NaiveDate,
}

/// Medicine registry data (`med`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicineInfo {
    /// ANVISA registry code, or `ISENTO`.
    pub anvisa_code: String,
    /// Maximum consumer price (`vPMC`).
    pub max_consumer_price: f64,
}

/// Storage temperature range in Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRange {
    pub min_celsius: f64,
    pub max_celsius: f64,
}

/// ICMS treatment of a line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IcmsTax {
    /// CST 00, fully taxed.
    Taxed { origin: u8, rate: f64 },
    /// CST 40, 41 or 50.
    Exempt { origin: u8, cst: String },
    /// Simples Nacional without credit: CSOSN 102, 103, 300 or 400.
    Simples { origin: u8, csosn: String },
}

impl IcmsTax {
    pub fn origin(&self) -> u8 {
        match self {
            IcmsTax::Taxed { origin, .. }
            | IcmsTax::Exempt { origin, .. }
            | IcmsTax::Simples { origin, .. } => *origin,
        }
    }

    pub fn rate(&self) -> f64 {
        match self {
            IcmsTax::Taxed { rate, .. } => *rate,
            _ => 0.0,
        }
    }
}

/// PIS or COFINS treatment of a line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionTax {
    pub cst: String,
    #[serde(default)]
    pub rate: f64,
}

impl ContributionTax {
    /// CSTs 04..=09 carry no base or amount (monophasic, zero rate, suspended).
    pub fn is_non_taxed(&self) -> bool {
        matches!(self.cst.as_str(), "04" | "05" | "06" | "07" | "08" | "09")
    }

    /// CSTs 01 and 02 use the percentage group; everything else is "other".
    pub fn is_rate_based(&self) -> bool {
        matches!(self.cst.as_str(), "01" | "02")
    }
}

/// IPI treatment of a line; its amount is added to the document total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpiTax {
    /// Legal framework code (`cEnq`), `999` when none applies.
    pub framework: String,
    pub cst: String,
    #[serde(default)]
    pub rate: f64,
}

impl IpiTax {
    pub fn is_taxed(&self) -> bool {
        matches!(self.cst.as_str(), "00" | "49" | "50" | "99")
    }
}

/// Tax classification of a line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxClassification {
    pub icms: IcmsTax,
    pub pis: ContributionTax,
    pub cofins: ContributionTax,
    #[serde(default)]
    pub ipi: Option<IpiTax>,
}

/// Ordered product line of a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub code: String,
    #[serde(default)]
    pub gtin: Option<String>,
    pub description: String,
    pub ncm: String,
    /// Overrides the draft-level CFOP for this line.
    #[serde(default)]
    pub cfop: Option<String>,
    pub unit: String,
    pub quantity: f64,
    pub unit_price: f64,
    #[serde(default)]
    pub discount: f64,
    pub tax: TaxClassification,
    #[serde(default)]
    pub flags: ProductFlags,
    #[serde(default)]
    pub medicine: Option<MedicineInfo>,
    #[serde(default)]
    pub batch: Option<Batch>,
    #[serde(default)]
    pub temperature: Option<TemperatureRange>,
}

impl LineItem {
    /// Quantity times unit price, at two decimals.
    pub fn gross_amount(&self) -> f64 {
        round2(self.quantity * self.unit_price)
    }

    pub fn net_amount(&self) -> f64 {
        round2(self.gross_amount() - self.discount)
    }

    /// Taxes added on top of the net amount (IPI).
    pub fn added_tax(&self) -> f64 {
        match &self.tax.ipi {
            Some(ipi) if ipi.is_taxed() => round2(self.net_amount() * ipi.rate / 100.0),
            _ => 0.0,
        }
    }
}

/// Payment means (`tPag`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Cheque,
    CreditCard,
    DebitCard,
    StoreCredit,
    BankSlip,
    BankDeposit,
    Pix,
    NoPayment,
    Other,
}

impl PaymentMethod {
    pub fn code(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "01",
            PaymentMethod::Cheque => "02",
            PaymentMethod::CreditCard => "03",
            PaymentMethod::DebitCard => "04",
            PaymentMethod::StoreCredit => "05",
            PaymentMethod::BankSlip => "15",
            PaymentMethod::BankDeposit => "16",
            PaymentMethod::Pix => "17",
            PaymentMethod::NoPayment => "90",
            PaymentMethod::Other => "99",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub method: PaymentMethod,
    pub amount: f64,
}

/// Freight responsibility (`modFrete`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreightMode {
    Issuer,
    Recipient,
    ThirdParty,
    OwnByIssuer,
    OwnByRecipient,
    #[default]
    NoFreight,
}

impl FreightMode {
    pub fn code(&self) -> u8 {
        match self {
            FreightMode::Issuer => 0,
            FreightMode::Recipient => 1,
            FreightMode::ThirdParty => 2,
            FreightMode::OwnByIssuer => 3,
            FreightMode::OwnByRecipient => 4,
            FreightMode::NoFreight => 9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Carrier {
    pub cnpj: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
    #[serde(default)]
    pub mode: FreightMode,
    #[serde(default)]
    pub carrier: Option<Carrier>,
}

/// Totals declared by the caller; reconciled against the line sums.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InvoiceTotals {
    pub subtotal: f64,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub tax: f64,
    pub total: f64,
}

/// Business data for one invoice. Consumed once, never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDraft {
    pub kind: DocumentKind,
    /// Operation nature text (`natOp`).
    pub operation_nature: String,
    /// Default CFOP for lines without their own.
    pub cfop: String,
    pub recipient: Recipient,
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub payments: Vec<Payment>,
    #[serde(default)]
    pub transport: Transport,
    pub totals: InvoiceTotals,
    #[serde(default)]
    pub notes: Option<String>,
    /// Series override; the profile default otherwise.
    #[serde(default)]
    pub series: Option<u16>,
    /// Document being returned, required for devolutions.
    #[serde(default)]
    pub referenced_key: Option<AccessKey>,
}

impl InvoiceDraft {
    pub fn item_cfop<'a>(&'a self, item: &'a LineItem) -> &'a str {
        item.cfop.as_deref().unwrap_or(&self.cfop)
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
