mod common;

use chrono::{Datelike, Utc};
use libxml::parser::Parser;
use libxml::xpath;
use nfe_core::config::{Environment, Region};
use nfe_core::document::DocumentBuilder;
use nfe_core::document::events::{EventDocument, VoidRange};
use nfe_core::document::sign::{DocumentSigner, SignedDocument, SigningError, verify_xml};

const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

fn signed_document() -> SignedDocument {
    let profile = common::profile_with_bundle("unused".into());
    let draft = common::sample_draft();
    let document = DocumentBuilder::new(&profile, &draft, 1, 123)
        .issued_at(common::issued_at())
        .random_code(12_345_678)
        .build()
        .expect("build");
    let key = common::key_material();
    DocumentSigner::new(&key)
        .sign_document(&document)
        .expect("sign document")
}

#[test]
fn signed_document_verifies() {
    let signed = signed_document();
    assert!(signed.xml().starts_with("<NFe xmlns=\"http://www.portalfiscal.inf.br/nfe\">"));
    assert!(!signed.digest_value().is_empty());
    assert!(!signed.signature_value().is_empty());
    signed.verify().expect("signature verifies");

    let doc = Parser::default().parse_string(signed.xml()).expect("parse signed xml");
    let ctx = xpath::Context::new(&doc).expect("xpath context");
    ctx.register_namespace("ds", DS_NS).expect("ds ns");
    let references = ctx
        .evaluate("//ds:Reference")
        .expect("reference xpath")
        .get_nodes_as_vec();
    assert_eq!(references.len(), 1);
    assert_eq!(
        references[0].get_attribute("URI").as_deref(),
        Some("#NFe35240512345678000195550010000001231123456786")
    );
    let certificate = ctx
        .evaluate("//ds:X509Certificate")
        .expect("certificate xpath")
        .get_nodes_as_vec();
    assert!(!certificate[0].get_content().trim().is_empty(), "empty certificate");
}

#[test]
fn tampered_document_fails_verification() {
    let signed = signed_document();
    let tampered = signed.xml().replace("<vNF>100.00</vNF>", "<vNF>900.00</vNF>");
    assert_ne!(tampered, signed.xml());
    let err = verify_xml(&tampered, "infNFe").expect_err("digest mismatch");
    assert!(matches!(err, SigningError::Verification(_)));
}

#[test]
fn signing_is_deterministic_for_the_same_document() {
    // RSA PKCS#1 v1.5 has no randomness.
    let first = signed_document();
    let second = signed_document();
    assert_eq!(first.digest_value(), second.digest_value());
    assert_eq!(first.signature_value(), second.signature_value());
}

#[test]
fn distribution_document_wraps_signed_nfe() {
    let signed = signed_document();
    let proc_xml = signed.distribution_xml("<protNFe versao=\"4.00\"><infProt/></protNFe>");
    assert!(proc_xml.starts_with("<?xml"));
    assert!(proc_xml.contains("<nfeProc xmlns=\"http://www.portalfiscal.inf.br/nfe\" versao=\"4.00\"><NFe"));
    assert!(proc_xml.ends_with("</protNFe></nfeProc>"));
    assert!(signed.to_file_string().starts_with("<?xml"));
}

#[test]
fn cancellation_event_is_signed() {
    let signed = signed_document();
    let key = common::key_material();
    let event = EventDocument::cancellation(
        signed.access_key().clone(),
        Environment::Homologation,
        "135240000012345",
        "Cancelamento solicitado pelo cliente",
        common::issued_at(),
    )
    .expect("event");
    let signed_event = DocumentSigner::new(&key).sign_event(&event).expect("sign event");
    assert!(signed_event.xml().starts_with("<evento"));
    assert!(signed_event.xml().contains(&format!("Id=\"{}\"", event.event_id())));
    signed_event.verify().expect("event verifies");

    let tampered = signed_event.xml().replace("135240000012345", "135240000099999");
    assert!(verify_xml(&tampered, "infEvento").is_err());
}

#[test]
fn void_range_is_signed() {
    let key = common::key_material();
    let year = (Utc::now().year() % 100) as u8;
    let range = VoidRange::new(
        Region::SP,
        Environment::Homologation,
        common::CNPJ,
        year,
        1,
        10,
        15,
        "Falha no sistema de emissao",
    )
    .expect("range");
    let signed = DocumentSigner::new(&key).sign_void_range(&range).expect("sign void");
    assert!(signed.xml().starts_with("<inutNFe"));
    assert!(signed.xml().contains(&range.void_id()));
    signed.verify().expect("void verifies");
}
