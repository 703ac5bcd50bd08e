mod common;

use chrono::NaiveDate;
use nfe_core::document::xml::ToXml;
use nfe_core::document::{
    Batch, BuildError, DocumentBuilder, DocumentKind, DraftField, IcmsTax, ProductFlags,
    TaxRegime, ValidationKind, validate_draft, validate_justification,
};

fn profile() -> nfe_core::document::FiscalProfile {
    common::profile_with_bundle("unused".into())
}

#[test]
fn builds_document_totalling_one_hundred() {
    let profile = profile();
    let draft = common::sample_draft();
    let document = DocumentBuilder::new(&profile, &draft, 1, 123)
        .issued_at(common::issued_at())
        .random_code(12_345_678)
        .build()
        .expect("build");

    assert_eq!(
        document.access_key().as_str(),
        "35240512345678000195550010000001231123456786"
    );
    assert_eq!(document.totals().total, 100.0);
    assert_eq!(document.totals().products, 100.0);
    assert_eq!(document.totals().icms_amount, 18.0);
    assert_eq!(document.items().len(), 1);
    assert_eq!(document.items()[0].cfop, "5102");

    let xml = document.to_xml().expect("xml");
    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains("Id=\"NFe35240512345678000195550010000001231123456786\""));
    assert!(xml.contains("<vNF>100.00</vNF>"));
    assert!(xml.contains("<vProd>100.00</vProd>"));
    assert!(xml.contains("<qCom>2.0000</qCom>"));
    assert!(xml.contains("<tpAmb>2</tpAmb>"));
    assert!(xml.contains("<cDV>6</cDV>"));
    assert!(xml.contains("<tPag>17</tPag>"));
}

#[test]
fn pretty_output_keeps_content() {
    let profile = profile();
    let draft = common::sample_draft();
    let document = DocumentBuilder::new(&profile, &draft, 1, 123)
        .issued_at(common::issued_at())
        .random_code(12_345_678)
        .build()
        .expect("build");
    let pretty = document.to_xml_pretty().expect("pretty xml");
    assert!(pretty.contains("\n"));
    assert!(pretty.contains("<vNF>100.00</vNF>"));
}

#[test]
fn invalid_draft_fails_build() {
    let profile = profile();
    let mut draft = common::sample_draft();
    draft.items.clear();
    let err = DocumentBuilder::new(&profile, &draft, 1, 1)
        .issued_at(common::issued_at())
        .build()
        .expect_err("empty draft");
    match err {
        BuildError::Validation(validation) => {
            assert!(validation.contains(DraftField::LineItems, ValidationKind::Empty));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn validation_is_idempotent() {
    let mut draft = common::sample_draft();
    draft.cfop = "51".into();
    draft.items[0].quantity = 0.0;
    let first = validate_draft(&draft, TaxRegime::Normal, common::today()).expect_err("invalid");
    let second = validate_draft(&draft, TaxRegime::Normal, common::today()).expect_err("invalid");
    assert_eq!(first, second);
    assert!(first.contains(DraftField::Cfop, ValidationKind::InvalidFormat));
    assert!(first.contains(DraftField::ItemQuantity, ValidationKind::OutOfRange));
    assert!(first.contains(DraftField::Subtotal, ValidationKind::Mismatch));
    assert_eq!(first.issues()[1].line_item_index, Some(0));
}

#[test]
fn pharma_rules_apply_per_line() {
    let mut draft = common::sample_draft();
    draft.items[0].flags = ProductFlags::CONTROLLED | ProductFlags::THERMOLABILE;
    let err = validate_draft(&draft, TaxRegime::Normal, common::today()).expect_err("invalid");
    assert!(err.contains(DraftField::ItemBatch, ValidationKind::Missing));
    assert!(err.contains(DraftField::ItemTemperature, ValidationKind::Missing));

    draft.items[0].flags = ProductFlags::CONTROLLED;
    draft.items[0].batch = Some(Batch {
        number: "L2024-01".into(),
        quantity: 2.0,
        manufactured_on: NaiveDate::from_ymd_opt(2023, 1, 1).expect("date"),
        expires_on: NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"),
    });
    let err = validate_draft(&draft, TaxRegime::Normal, common::today()).expect_err("expired");
    assert!(err.contains(DraftField::ItemBatchExpiry, ValidationKind::Expired));
    assert!(!err.contains(DraftField::ItemBatch, ValidationKind::Missing));
}

#[test]
fn tax_codes_follow_regime() {
    let mut draft = common::sample_draft();
    draft.items[0].tax.icms = IcmsTax::Simples {
        origin: 0,
        csosn: "102".into(),
    };
    let err = validate_draft(&draft, TaxRegime::Normal, common::today()).expect_err("mismatch");
    assert!(err.contains(DraftField::ItemTaxRegime, ValidationKind::Mismatch));
    assert!(validate_draft(&draft, TaxRegime::SimplesNacional, common::today()).is_ok());
}

#[test]
fn devolution_needs_referenced_key() {
    let mut draft = common::sample_draft();
    draft.kind = DocumentKind::Devolution;
    let err = validate_draft(&draft, TaxRegime::Normal, common::today()).expect_err("missing ref");
    assert!(err.contains(DraftField::ReferencedKey, ValidationKind::Missing));
}

#[test]
fn justification_boundary() {
    assert!(validate_justification(&"a".repeat(14)).is_err());
    assert!(validate_justification(&"a".repeat(15)).is_ok());
    assert!(validate_justification(&format!("  {}  ", "a".repeat(14))).is_err());
    let err = validate_justification(&"a".repeat(256)).expect_err("too long");
    assert_eq!(err.issues()[0].kind, ValidationKind::TooLong);
}
