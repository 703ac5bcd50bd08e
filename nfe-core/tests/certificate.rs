mod common;

use chrono::Utc;
use nfe_core::certificate::{
    BundleKey, BundleLocation, CertificateError, CertificateManager, CertificateRef,
};
use std::io::Write;

#[test]
fn loads_inline_bundle() {
    let key = common::bundle_key();
    let manager = CertificateManager::new(&key);
    let material = manager
        .load_certificate(&BundleLocation::Inline(common::encrypted_bundle()), common::PASSWORD)
        .expect("load inline bundle");

    let validation = CertificateManager::validate(&material, Utc::now());
    assert!(validation.valid);
    assert!(validation.subject.contains("FARMA DISTRIBUIDORA LTDA"));
    assert!(validation.expires_at > Utc::now());
    assert_eq!(material.info().subject_cnpj(), Some(common::CNPJ));
    material
        .ensure_usable(Utc::now(), common::CNPJ)
        .expect("usable for issuer");
}

#[test]
fn loads_bundle_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(common::encrypted_bundle().as_bytes())
        .expect("write bundle");
    let reference = CertificateRef::new(
        BundleLocation::File(file.path().to_path_buf()),
        common::PASSWORD,
    );

    let key = common::bundle_key();
    let material = CertificateManager::new(&key)
        .load(&reference)
        .expect("load file bundle");
    assert!(material.certificate_base64().expect("der").len() > 100);
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let key = common::bundle_key();
    let err = CertificateManager::new(&key)
        .load_certificate(&BundleLocation::File(dir.path().join("absent.b64")), "x")
        .expect_err("missing file");
    assert!(matches!(err, CertificateError::Io { .. }));
}

#[test]
fn branch_certificate_is_accepted_other_company_is_not() {
    let material = common::key_material();
    // Same eight-digit root, different branch.
    material
        .ensure_usable(Utc::now(), "12345678000276")
        .expect("branch accepted");
    let err = material
        .ensure_usable(Utc::now(), "98765432000198")
        .expect_err("other company");
    assert!(matches!(err, CertificateError::SubjectMismatch { .. }));
}

#[test]
fn wrong_password_is_rejected() {
    let key = common::bundle_key();
    let err = CertificateManager::new(&key)
        .load_certificate(&BundleLocation::Inline(common::encrypted_bundle()), "wrong")
        .expect_err("wrong password");
    assert!(matches!(err, CertificateError::Pkcs12(_)));
}

#[test]
fn wrong_bundle_key_cannot_decrypt() {
    let other = BundleKey::from_bytes(&[7u8; 32]).expect("other key");
    let err = CertificateManager::new(&other)
        .load_certificate(&BundleLocation::Inline(common::encrypted_bundle()), common::PASSWORD)
        .expect_err("wrong key");
    assert!(matches!(err, CertificateError::Decryption));
}

#[test]
fn expired_certificate_is_reported() {
    let (pkey, cert) = common::generate_identity(common::SUBJECT_CN, -30, -1);
    let key = common::bundle_key();
    let bundle = key
        .encrypt(&common::pkcs12_der(&pkey, &cert, common::PASSWORD))
        .expect("encrypt");
    let material = CertificateManager::new(&key)
        .load_certificate(&BundleLocation::Inline(bundle), common::PASSWORD)
        .expect("expired certificates still load");

    let validation = CertificateManager::validate(&material, Utc::now());
    assert!(!validation.valid);
    let err = material
        .ensure_usable(Utc::now(), common::CNPJ)
        .expect_err("expired");
    assert!(matches!(err, CertificateError::Expired { .. }));
}

#[test]
fn future_certificate_is_not_yet_valid() {
    let (pkey, cert) = common::generate_identity(common::SUBJECT_CN, 2, 30);
    let material = nfe_core::certificate::KeyMaterial::new(cert, pkey).expect("material");
    let err = material
        .ensure_usable(Utc::now(), common::CNPJ)
        .expect_err("not yet valid");
    assert!(matches!(err, CertificateError::NotYetValid { .. }));
}
