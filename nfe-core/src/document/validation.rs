//! Local validation of drafts and event texts. Runs before any number is
//! reserved and before any remote call.
use chrono::NaiveDate;
use std::fmt;
use thiserror::Error;

use crate::access_key::{MAX_RANDOM_CODE, MAX_SERIES};

use super::{DocumentKind, IcmsTax, InvoiceDraft, LineItem, PartyDocument, PaymentMethod, ProductFlags, TaxRegime};

/// Tolerance when reconciling declared totals against line sums.
pub const EPSILON: f64 = 0.01;
pub const MIN_JUSTIFICATION_CHARS: usize = 15;
pub const MAX_JUSTIFICATION_CHARS: usize = 255;
pub const MAX_CORRECTION_CHARS: usize = 1000;
const MAX_NOTES_CHARS: usize = 5000;

/// Structured validation error with field-level issues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed: {}", describe(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }

    pub fn single(field: DraftField, kind: ValidationKind) -> Self {
        Self::new(vec![ValidationIssue::new(field, kind)])
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub fn contains(&self, field: DraftField, kind: ValidationKind) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.field == field && issue.kind == kind)
    }
}

fn describe(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ValidationIssue::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Single validation issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: DraftField,
    pub kind: ValidationKind,
    pub line_item_index: Option<usize>,
}

impl ValidationIssue {
    pub fn new(field: DraftField, kind: ValidationKind) -> Self {
        Self {
            field,
            kind,
            line_item_index: None,
        }
    }

    pub fn at_line(field: DraftField, kind: ValidationKind, index: usize) -> Self {
        Self {
            field,
            kind,
            line_item_index: Some(index),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(index) = self.line_item_index {
            write!(f, "Line {}: ", index + 1)?;
        }
        write!(f, "{} {}", self.field.label(), self.kind.phrase())
    }
}

#[non_exhaustive]
/// Field associated with a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftField {
    LineItems,
    OperationNature,
    Cfop,
    RecipientDocument,
    RecipientName,
    ReferencedKey,
    Subtotal,
    Discount,
    Tax,
    Total,
    Payments,
    Carrier,
    Notes,
    ItemCode,
    ItemDescription,
    ItemNcm,
    ItemCfop,
    ItemQuantity,
    ItemUnitPrice,
    ItemDiscount,
    ItemBatch,
    ItemBatchExpiry,
    ItemTemperature,
    ItemTaxCode,
    ItemTaxRegime,
    Justification,
    Correction,
    Range,
    IssuerCnpj,
    Series,
    RandomCode,
}

impl DraftField {
    fn label(&self) -> &'static str {
        match self {
            DraftField::LineItems => "Line items",
            DraftField::OperationNature => "Operation nature",
            DraftField::Cfop => "Operation code (CFOP)",
            DraftField::RecipientDocument => "Recipient CNPJ/CPF",
            DraftField::RecipientName => "Recipient name",
            DraftField::ReferencedKey => "Referenced access key",
            DraftField::Subtotal => "Invoice subtotal",
            DraftField::Discount => "Invoice discount",
            DraftField::Tax => "Invoice tax",
            DraftField::Total => "Invoice total",
            DraftField::Payments => "Payment breakdown",
            DraftField::Carrier => "Carrier CNPJ",
            DraftField::Notes => "Additional notes",
            DraftField::ItemCode => "Product code",
            DraftField::ItemDescription => "Product description",
            DraftField::ItemNcm => "NCM code",
            DraftField::ItemCfop => "Line operation code (CFOP)",
            DraftField::ItemQuantity => "Quantity",
            DraftField::ItemUnitPrice => "Unit price",
            DraftField::ItemDiscount => "Line discount",
            DraftField::ItemBatch => "Batch",
            DraftField::ItemBatchExpiry => "Batch expiry",
            DraftField::ItemTemperature => "Storage temperature range",
            DraftField::ItemTaxCode => "Tax situation code",
            DraftField::ItemTaxRegime => "Tax classification",
            DraftField::Justification => "Justification",
            DraftField::Correction => "Correction text",
            DraftField::Range => "Number range",
            DraftField::IssuerCnpj => "Issuer CNPJ",
            DraftField::Series => "Series",
            DraftField::RandomCode => "Random code (cNF)",
        }
    }
}

#[non_exhaustive]
/// Classification of validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    Missing,
    Empty,
    InvalidFormat,
    OutOfRange,
    Mismatch,
    Expired,
    TooShort,
    TooLong,
    AboveMaximum,
}

impl ValidationKind {
    fn phrase(&self) -> String {
        match self {
            ValidationKind::Missing => "is required".into(),
            ValidationKind::Empty => "must not be empty".into(),
            ValidationKind::InvalidFormat => "has an invalid format".into(),
            ValidationKind::OutOfRange => "must be greater than zero".into(),
            ValidationKind::Mismatch => "does not match the line items".into(),
            ValidationKind::Expired => "is in the past".into(),
            ValidationKind::TooShort => {
                format!("must have at least {MIN_JUSTIFICATION_CHARS} characters")
            }
            ValidationKind::TooLong => "is too long".into(),
            ValidationKind::AboveMaximum => "is above the allowed maximum".into(),
        }
    }
}

/// Validate a draft for an issuer under `regime`, as of `today`.
///
/// Pure and idempotent: the same inputs always yield the same issues.
///
/// # Errors
/// Returns [`ValidationError`] listing every issue found.
pub fn validate_draft(
    draft: &InvoiceDraft,
    regime: TaxRegime,
    today: NaiveDate,
) -> Result<(), ValidationError> {
    let mut issues = Vec::new();

    if draft.items.is_empty() {
        issues.push(ValidationIssue::new(DraftField::LineItems, ValidationKind::Empty));
    }
    if draft.operation_nature.trim().is_empty() {
        issues.push(ValidationIssue::new(DraftField::OperationNature, ValidationKind::Empty));
    }
    if !is_digits(&draft.cfop, 4) {
        issues.push(ValidationIssue::new(DraftField::Cfop, ValidationKind::InvalidFormat));
    }
    if draft.series.is_some_and(|series| series > MAX_SERIES) {
        issues.push(ValidationIssue::new(DraftField::Series, ValidationKind::AboveMaximum));
    }
    validate_recipient(draft, &mut issues);
    if draft.kind == DocumentKind::Devolution && draft.referenced_key.is_none() {
        issues.push(ValidationIssue::new(DraftField::ReferencedKey, ValidationKind::Missing));
    }

    for (index, item) in draft.items.iter().enumerate() {
        validate_item(item, index, regime, today, &mut issues);
    }

    validate_totals(draft, &mut issues);
    validate_payments(draft, &mut issues);

    if let Some(carrier) = &draft.transport.carrier {
        if !is_digits(&carrier.cnpj, 14) {
            issues.push(ValidationIssue::new(DraftField::Carrier, ValidationKind::InvalidFormat));
        }
    }
    if let Some(notes) = &draft.notes {
        if notes.chars().count() > MAX_NOTES_CHARS {
            issues.push(ValidationIssue::new(DraftField::Notes, ValidationKind::TooLong));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(issues))
    }
}

/// Series and `cNF` that will go into the access key. Checked before a
/// number is reserved so an out-of-range value never consumes one.
///
/// # Errors
/// Returns [`ValidationError`] listing every value above its maximum.
pub fn validate_numbering(series: u16, random_code: Option<u32>) -> Result<(), ValidationError> {
    let mut issues = Vec::new();
    if series > MAX_SERIES {
        issues.push(ValidationIssue::new(DraftField::Series, ValidationKind::AboveMaximum));
    }
    if random_code.is_some_and(|code| code > MAX_RANDOM_CODE) {
        issues.push(ValidationIssue::new(DraftField::RandomCode, ValidationKind::AboveMaximum));
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(issues))
    }
}

/// Cancellation and void justification: 15 to 255 characters after trimming.
///
/// # Errors
/// Returns [`ValidationError`] with [`DraftField::Justification`].
pub fn validate_justification(text: &str) -> Result<(), ValidationError> {
    check_text_length(text, DraftField::Justification, MAX_JUSTIFICATION_CHARS)
}

/// Correction letter text: 15 to 1000 characters after trimming.
///
/// # Errors
/// Returns [`ValidationError`] with [`DraftField::Correction`].
pub fn validate_correction(text: &str) -> Result<(), ValidationError> {
    check_text_length(text, DraftField::Correction, MAX_CORRECTION_CHARS)
}

fn check_text_length(text: &str, field: DraftField, max: usize) -> Result<(), ValidationError> {
    let length = text.trim().chars().count();
    if length < MIN_JUSTIFICATION_CHARS {
        return Err(ValidationError::single(field, ValidationKind::TooShort));
    }
    if length > max {
        return Err(ValidationError::single(field, ValidationKind::TooLong));
    }
    Ok(())
}

fn validate_recipient(draft: &InvoiceDraft, issues: &mut Vec<ValidationIssue>) {
    let recipient = &draft.recipient;
    let document_ok = match &recipient.document {
        PartyDocument::Cnpj(value) => is_digits(value, 14),
        PartyDocument::Cpf(value) => is_digits(value, 11),
    };
    if !document_ok {
        issues.push(ValidationIssue::new(
            DraftField::RecipientDocument,
            ValidationKind::InvalidFormat,
        ));
    }
    if recipient.name.trim().is_empty() {
        issues.push(ValidationIssue::new(DraftField::RecipientName, ValidationKind::Empty));
    }
}

fn validate_item(
    item: &LineItem,
    index: usize,
    regime: TaxRegime,
    today: NaiveDate,
    issues: &mut Vec<ValidationIssue>,
) {
    let mut push = |field, kind| issues.push(ValidationIssue::at_line(field, kind, index));

    if item.code.trim().is_empty() {
        push(DraftField::ItemCode, ValidationKind::Empty);
    }
    if item.description.trim().is_empty() {
        push(DraftField::ItemDescription, ValidationKind::Empty);
    }
    if !is_digits(&item.ncm, 8) {
        push(DraftField::ItemNcm, ValidationKind::InvalidFormat);
    }
    if let Some(cfop) = &item.cfop {
        if !is_digits(cfop, 4) {
            push(DraftField::ItemCfop, ValidationKind::InvalidFormat);
        }
    }
    if !(item.quantity.is_finite() && item.quantity > 0.0) {
        push(DraftField::ItemQuantity, ValidationKind::OutOfRange);
    }
    if !(item.unit_price.is_finite() && item.unit_price > 0.0) {
        push(DraftField::ItemUnitPrice, ValidationKind::OutOfRange);
    }
    if !item.discount.is_finite()
        || item.discount < 0.0
        || item.discount > item.gross_amount() + EPSILON
    {
        push(DraftField::ItemDiscount, ValidationKind::InvalidFormat);
    }

    if item.flags.contains(ProductFlags::CONTROLLED) && item.batch.is_none() {
        push(DraftField::ItemBatch, ValidationKind::Missing);
    }
    if let Some(batch) = &item.batch {
        if batch.number.trim().is_empty() {
            push(DraftField::ItemBatch, ValidationKind::Empty);
        }
        if !(batch.quantity > 0.0) {
            push(DraftField::ItemBatch, ValidationKind::OutOfRange);
        }
        if batch.manufactured_on > batch.expires_on {
            push(DraftField::ItemBatchExpiry, ValidationKind::InvalidFormat);
        }
        if batch.expires_on < today {
            push(DraftField::ItemBatchExpiry, ValidationKind::Expired);
        }
    }

    match &item.temperature {
        None if item.flags.contains(ProductFlags::THERMOLABILE) => {
            push(DraftField::ItemTemperature, ValidationKind::Missing);
        }
        Some(range) if !(range.min_celsius <= range.max_celsius) => {
            push(DraftField::ItemTemperature, ValidationKind::InvalidFormat);
        }
        _ => {}
    }

    match &item.tax.icms {
        IcmsTax::Simples { csosn, .. } => {
            if !regime.is_simples() {
                push(DraftField::ItemTaxRegime, ValidationKind::Mismatch);
            }
            if !matches!(csosn.as_str(), "102" | "103" | "300" | "400") {
                push(DraftField::ItemTaxCode, ValidationKind::InvalidFormat);
            }
        }
        IcmsTax::Exempt { cst, .. } => {
            if regime.is_simples() {
                push(DraftField::ItemTaxRegime, ValidationKind::Mismatch);
            }
            if !matches!(cst.as_str(), "40" | "41" | "50") {
                push(DraftField::ItemTaxCode, ValidationKind::InvalidFormat);
            }
        }
        IcmsTax::Taxed { rate, .. } => {
            if regime.is_simples() {
                push(DraftField::ItemTaxRegime, ValidationKind::Mismatch);
            }
            if !(*rate >= 0.0 && *rate <= 100.0) {
                push(DraftField::ItemTaxCode, ValidationKind::InvalidFormat);
            }
        }
    }
    if item.tax.icms.origin() > 8 {
        push(DraftField::ItemTaxCode, ValidationKind::InvalidFormat);
    }
    for contribution in [&item.tax.pis, &item.tax.cofins] {
        if !is_digits(&contribution.cst, 2) || contribution.rate < 0.0 {
            push(DraftField::ItemTaxCode, ValidationKind::InvalidFormat);
        }
    }
    if let Some(ipi) = &item.tax.ipi {
        if !is_digits(&ipi.cst, 2) || !is_digits(&ipi.framework, 3) || ipi.rate < 0.0 {
            push(DraftField::ItemTaxCode, ValidationKind::InvalidFormat);
        }
    }
}

fn validate_totals(draft: &InvoiceDraft, issues: &mut Vec<ValidationIssue>) {
    let totals = &draft.totals;
    let subtotal: f64 = draft.items.iter().map(LineItem::gross_amount).sum();
    let discount: f64 = draft.items.iter().map(|item| item.discount).sum();
    let tax: f64 = draft.items.iter().map(LineItem::added_tax).sum();

    if (subtotal - totals.subtotal).abs() > EPSILON {
        issues.push(ValidationIssue::new(DraftField::Subtotal, ValidationKind::Mismatch));
    }
    if (discount - totals.discount).abs() > EPSILON {
        issues.push(ValidationIssue::new(DraftField::Discount, ValidationKind::Mismatch));
    }
    if (tax - totals.tax).abs() > EPSILON {
        issues.push(ValidationIssue::new(DraftField::Tax, ValidationKind::Mismatch));
    }
    let expected_total = totals.subtotal - totals.discount + totals.tax;
    if (expected_total - totals.total).abs() > EPSILON {
        issues.push(ValidationIssue::new(DraftField::Total, ValidationKind::Mismatch));
    }
    if !(totals.total > 0.0) {
        issues.push(ValidationIssue::new(DraftField::Total, ValidationKind::OutOfRange));
    }
}

fn validate_payments(draft: &InvoiceDraft, issues: &mut Vec<ValidationIssue>) {
    if draft.payments.is_empty() {
        return;
    }
    let mut paid = 0.0;
    for payment in &draft.payments {
        let amount_ok = match payment.method {
            PaymentMethod::NoPayment => payment.amount == 0.0,
            _ => payment.amount.is_finite() && payment.amount > 0.0,
        };
        if !amount_ok {
            issues.push(ValidationIssue::new(DraftField::Payments, ValidationKind::InvalidFormat));
        }
        paid += payment.amount;
    }
    let unpaid = draft
        .payments
        .iter()
        .all(|payment| payment.method == PaymentMethod::NoPayment);
    if !unpaid && (paid - draft.totals.total).abs() > EPSILON {
        issues.push(ValidationIssue::new(DraftField::Payments, ValidationKind::Mismatch));
    }
}

pub(crate) fn is_digits(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn justification_boundary_is_fifteen_characters() {
        let fourteen = "a".repeat(14);
        let fifteen = "a".repeat(15);
        let err = validate_justification(&fourteen).unwrap_err();
        assert!(err.contains(DraftField::Justification, ValidationKind::TooShort));
        assert_eq!(
            err.issues[0].to_string(),
            "Justification must have at least 15 characters"
        );
        assert!(validate_justification(&fifteen).is_ok());
        // Surrounding whitespace does not count.
        assert!(validate_justification(&format!("  {fourteen}  ")).is_err());
        assert!(validate_justification(&"a".repeat(256)).is_err());
    }

    #[test]
    fn justification_counts_characters_not_bytes() {
        assert!(validate_justification("Cancelamento ñã").is_ok());
        assert!(validate_justification("ççççççççççççç").is_err());
    }

    #[test]
    fn issue_messages_name_the_line() {
        let issue = ValidationIssue::at_line(DraftField::ItemQuantity, ValidationKind::OutOfRange, 2);
        assert_eq!(issue.to_string(), "Line 3: Quantity must be greater than zero");
        let total = ValidationIssue::new(DraftField::Total, ValidationKind::OutOfRange);
        assert_eq!(total.to_string(), "Invoice total must be greater than zero");
    }

    #[test]
    fn error_display_joins_issues() {
        let err = ValidationError::new(vec![
            ValidationIssue::new(DraftField::LineItems, ValidationKind::Empty),
            ValidationIssue::new(DraftField::Total, ValidationKind::OutOfRange),
        ]);
        assert_eq!(
            err.to_string(),
            "validation failed: Line items must not be empty; Invoice total must be greater than zero"
        );
    }

    #[test]
    fn numbering_limits_follow_the_access_key_layout() {
        assert!(validate_numbering(999, Some(99_999_999)).is_ok());
        assert!(validate_numbering(0, None).is_ok());
        let err = validate_numbering(1000, Some(100_000_000)).unwrap_err();
        assert!(err.contains(DraftField::Series, ValidationKind::AboveMaximum));
        assert!(err.contains(DraftField::RandomCode, ValidationKind::AboveMaximum));
        assert_eq!(err.issues[0].to_string(), "Series is above the allowed maximum");
    }

    #[test]
    fn correction_text_allows_up_to_a_thousand_characters() {
        assert!(validate_correction(&"x".repeat(1000)).is_ok());
        assert!(validate_correction(&"x".repeat(1001)).is_err());
        assert!(validate_correction("curta").is_err());
    }
}
