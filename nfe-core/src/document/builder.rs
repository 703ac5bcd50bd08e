use chrono::{DateTime, Datelike, FixedOffset};
use thiserror::Error;

use super::{
    Address, DocumentKind, IcmsTax, InvoiceDraft, LineItem, MODEL_NFE, PartyDocument, Payment,
    ProductFlags, Recipient, TaxRegime, Transport, round2,
    validation::{ValidationError, validate_draft},
};
use crate::{
    access_key::{self, AccessKey, AccessKeyError, AccessKeyParts},
    config::{Environment, Region},
    document::FiscalProfile,
};

/// Normal emission (`tpEmis` 1).
pub const EMISSION_NORMAL: u8 = 1;

/// Errors raised while assembling a document.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    AccessKey(#[from] AccessKeyError),
}

/// Issuer block as frozen into the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerSection {
    pub cnpj: String,
    pub legal_name: String,
    pub trade_name: Option<String>,
    pub state_registration: String,
    pub tax_regime: TaxRegime,
    pub address: Address,
}

/// One `det` entry with its computed tax blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemSection {
    pub number: usize,
    pub item: LineItem,
    pub cfop: String,
    pub gross: f64,
    pub net: f64,
    pub icms_base: f64,
    pub icms_amount: f64,
    pub pis_base: f64,
    pub pis_amount: f64,
    pub cofins_base: f64,
    pub cofins_amount: f64,
    pub ipi_base: f64,
    pub ipi_amount: f64,
    pub additional_info: Option<String>,
}

/// `ICMSTot` values, all at two decimals.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TotalsSection {
    pub icms_base: f64,
    pub icms_amount: f64,
    pub products: f64,
    pub discount: f64,
    pub ipi: f64,
    pub pis: f64,
    pub cofins: f64,
    pub total: f64,
}

/// Unsigned document model, identified by its access key.
#[derive(Debug, Clone, PartialEq)]
pub struct FiscalDocument {
    pub(crate) access_key: AccessKey,
    pub(crate) environment: Environment,
    pub(crate) issued_at: DateTime<FixedOffset>,
    pub(crate) series: u16,
    pub(crate) number: u32,
    pub(crate) kind: DocumentKind,
    pub(crate) operation_nature: String,
    pub(crate) issuer: IssuerSection,
    pub(crate) recipient: Recipient,
    pub(crate) items: Vec<ItemSection>,
    pub(crate) totals: TotalsSection,
    pub(crate) transport: Transport,
    pub(crate) payments: Vec<Payment>,
    pub(crate) notes: Option<String>,
    pub(crate) referenced_key: Option<AccessKey>,
}

impl FiscalDocument {
    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn region(&self) -> Region {
        self.issuer.address.region
    }

    pub fn issued_at(&self) -> DateTime<FixedOffset> {
        self.issued_at
    }

    pub fn series(&self) -> u16 {
        self.series
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn operation_nature(&self) -> &str {
        &self.operation_nature
    }

    pub fn issuer(&self) -> &IssuerSection {
        &self.issuer
    }

    pub fn recipient(&self) -> &Recipient {
        &self.recipient
    }

    pub fn items(&self) -> &[ItemSection] {
        &self.items
    }

    pub fn totals(&self) -> &TotalsSection {
        &self.totals
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn payments(&self) -> &[Payment] {
        &self.payments
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn referenced_key(&self) -> Option<&AccessKey> {
        self.referenced_key.as_ref()
    }

    /// `idDest`: 1 internal, 2 interstate.
    pub fn destination(&self) -> u8 {
        if self.recipient.address.region == self.issuer.address.region {
            1
        } else {
            2
        }
    }

    /// `indFinal`: natural persons are final consumers.
    pub fn final_consumer(&self) -> bool {
        matches!(self.recipient.document, PartyDocument::Cpf(_))
    }
}

/// Assembles a [`FiscalDocument`] from a draft, the issuer profile and a
/// reserved number.
///
/// # Examples
/// ```rust,ignore
/// let document = DocumentBuilder::new(&profile, &draft, 1, 42)
///     .issued_at(issued_at)
///     .build()?;
/// assert_eq!(document.number(), 42);
/// ```
pub struct DocumentBuilder<'a> {
    profile: &'a FiscalProfile,
    draft: &'a InvoiceDraft,
    series: u16,
    number: u32,
    issued_at: DateTime<FixedOffset>,
    random_code: Option<u32>,
}

impl<'a> DocumentBuilder<'a> {
    pub fn new(profile: &'a FiscalProfile, draft: &'a InvoiceDraft, series: u16, number: u32) -> Self {
        Self {
            profile,
            draft,
            series,
            number,
            issued_at: brasilia_now(),
            random_code: None,
        }
    }

    pub fn issued_at(mut self, issued_at: DateTime<FixedOffset>) -> Self {
        self.issued_at = issued_at;
        self
    }

    /// Fix the eight-digit `cNF` instead of drawing one.
    pub fn random_code(mut self, code: u32) -> Self {
        self.random_code = Some(code);
        self
    }

    /// Validate the draft, compute the access key and line taxes.
    ///
    /// # Errors
    /// Returns [`BuildError`] for validation failures or malformed key components.
    pub fn build(self) -> Result<FiscalDocument, BuildError> {
        let profile = self.profile;
        let draft = self.draft;
        validate_draft(draft, profile.tax_regime(), self.issued_at.date_naive())?;

        let cnpj = access_key::normalize_cnpj(profile.cnpj())?;
        let random_code = self.random_code.unwrap_or_else(|| draw_code(self.number));
        let access_key = AccessKey::generate(&AccessKeyParts {
            region: profile.region(),
            year: (self.issued_at.year() % 100) as u8,
            month: self.issued_at.month() as u8,
            cnpj: cnpj.clone(),
            model: MODEL_NFE,
            series: self.series,
            number: self.number,
            emission_type: EMISSION_NORMAL,
            random_code,
        })?;

        let items: Vec<ItemSection> = draft
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| item_section(index + 1, item, draft.item_cfop(item)))
            .collect();
        let totals = totals_section(&items);

        Ok(FiscalDocument {
            access_key,
            environment: profile.environment(),
            issued_at: self.issued_at,
            series: self.series,
            number: self.number,
            kind: draft.kind,
            operation_nature: draft.operation_nature.trim().to_string(),
            issuer: IssuerSection {
                cnpj,
                legal_name: profile.legal_name().to_string(),
                trade_name: profile.trade_name().map(str::to_string),
                state_registration: profile.state_registration().to_string(),
                tax_regime: profile.tax_regime(),
                address: profile.address().clone(),
            },
            recipient: draft.recipient.clone(),
            items,
            totals,
            transport: draft.transport.clone(),
            payments: draft.payments.clone(),
            notes: draft.notes.clone(),
            referenced_key: draft.referenced_key.clone(),
        })
    }
}

/// Current time at UTC-03:00, the offset used for `dhEmi` and `dhEvento`.
pub fn brasilia_now() -> DateTime<FixedOffset> {
    let now = chrono::Utc::now();
    match FixedOffset::west_opt(3 * 3600) {
        Some(offset) => now.with_timezone(&offset),
        None => now.fixed_offset(),
    }
}

// The authority rejects a cNF equal to nNF.
fn draw_code(number: u32) -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let code = access_key::random_code(&mut rng);
        if code != number {
            return code;
        }
    }
}

fn item_section(number: usize, item: &LineItem, cfop: &str) -> ItemSection {
    let gross = item.gross_amount();
    let net = item.net_amount();

    let (icms_base, icms_amount) = match &item.tax.icms {
        IcmsTax::Taxed { rate, .. } => (net, round2(net * rate / 100.0)),
        IcmsTax::Exempt { .. } | IcmsTax::Simples { .. } => (0.0, 0.0),
    };
    let contribution = |tax: &super::ContributionTax| {
        if tax.is_non_taxed() {
            (0.0, 0.0)
        } else {
            (net, round2(net * tax.rate / 100.0))
        }
    };
    let (pis_base, pis_amount) = contribution(&item.tax.pis);
    let (cofins_base, cofins_amount) = contribution(&item.tax.cofins);
    let ipi_amount = item.added_tax();
    let ipi_base = match &item.tax.ipi {
        Some(ipi) if ipi.is_taxed() => net,
        _ => 0.0,
    };

    ItemSection {
        number,
        item: item.clone(),
        cfop: cfop.to_string(),
        gross,
        net,
        icms_base,
        icms_amount,
        pis_base,
        pis_amount,
        cofins_base,
        cofins_amount,
        ipi_base,
        ipi_amount,
        additional_info: additional_info(item),
    }
}

fn additional_info(item: &LineItem) -> Option<String> {
    let mut notes = Vec::new();
    if let Some(range) = &item.temperature {
        notes.push(format!(
            "Conservar entre {:.1} C e {:.1} C",
            range.min_celsius, range.max_celsius
        ));
    }
    if item.flags.contains(ProductFlags::CONTROLLED) {
        notes.push("Medicamento sujeito a controle especial".to_string());
    }
    if notes.is_empty() {
        None
    } else {
        Some(notes.join("; "))
    }
}

fn totals_section(items: &[ItemSection]) -> TotalsSection {
    let mut totals = TotalsSection::default();
    for item in items {
        totals.icms_base += item.icms_base;
        totals.icms_amount += item.icms_amount;
        totals.products += item.gross;
        totals.discount += item.item.discount;
        totals.ipi += item.ipi_amount;
        totals.pis += item.pis_amount;
        totals.cofins += item.cofins_amount;
    }
    totals.icms_base = round2(totals.icms_base);
    totals.icms_amount = round2(totals.icms_amount);
    totals.products = round2(totals.products);
    totals.discount = round2(totals.discount);
    totals.ipi = round2(totals.ipi);
    totals.pis = round2(totals.pis);
    totals.cofins = round2(totals.cofins);
    totals.total = round2(totals.products - totals.discount + totals.ipi);
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ContributionTax, IpiTax, TaxClassification, TemperatureRange};

    fn line(icms: IcmsTax, ipi: Option<IpiTax>) -> LineItem {
        LineItem {
            code: "001".into(),
            gtin: None,
            description: "Insulina".into(),
            ncm: "30043929".into(),
            cfop: None,
            unit: "UN".into(),
            quantity: 2.0,
            unit_price: 50.0,
            discount: 10.0,
            tax: TaxClassification {
                icms,
                pis: ContributionTax { cst: "01".into(), rate: 2.0 },
                cofins: ContributionTax { cst: "06".into(), rate: 0.0 },
                ipi,
            },
            flags: ProductFlags::THERMOLABILE,
            medicine: None,
            batch: None,
            temperature: Some(TemperatureRange { min_celsius: 2.0, max_celsius: 8.0 }),
        }
    }

    #[test]
    fn item_taxes_follow_classification() {
        let section = item_section(
            1,
            &line(
                IcmsTax::Taxed { origin: 0, rate: 12.0 },
                Some(IpiTax { framework: "999".into(), cst: "50".into(), rate: 10.0 }),
            ),
            "5102",
        );
        assert_eq!(section.gross, 100.0);
        assert_eq!(section.net, 90.0);
        assert_eq!(section.icms_base, 90.0);
        assert_eq!(section.icms_amount, 10.8);
        assert_eq!(section.pis_amount, 1.8);
        assert_eq!(section.cofins_base, 0.0);
        assert_eq!(section.ipi_amount, 9.0);
        assert_eq!(
            section.additional_info.as_deref(),
            Some("Conservar entre 2.0 C e 8.0 C")
        );
    }

    #[test]
    fn totals_add_ipi_and_subtract_discount() {
        let items = vec![
            item_section(
                1,
                &line(
                    IcmsTax::Simples { origin: 0, csosn: "102".into() },
                    Some(IpiTax { framework: "999".into(), cst: "50".into(), rate: 10.0 }),
                ),
                "5102",
            ),
            item_section(2, &line(IcmsTax::Simples { origin: 0, csosn: "102".into() }, None), "5102"),
        ];
        let totals = totals_section(&items);
        assert_eq!(totals.products, 200.0);
        assert_eq!(totals.discount, 20.0);
        assert_eq!(totals.ipi, 9.0);
        assert_eq!(totals.icms_amount, 0.0);
        assert_eq!(totals.total, 189.0);
    }

    #[test]
    fn drawn_code_never_equals_number() {
        for number in [0, 1, 12_345_678] {
            assert_ne!(draw_code(number), number);
        }
    }
}
