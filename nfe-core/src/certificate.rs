//! Client certificate handling: at-rest bundle decryption, PKCS#12 parsing and
//! validity checks for ICP-Brasil A1 certificates.
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use openssl::{
    pkcs12::Pkcs12,
    pkey::{PKey, Private},
    rand::rand_bytes,
    symm::{Cipher, decrypt_aead, encrypt_aead},
    x509::X509,
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};
use thiserror::Error;
use tracing::debug;
use x509_cert::{Certificate, der::Decode};
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Certificate loading and validation errors.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to read certificate bundle {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("certificate bundle is not valid base64")]
    Encoding,
    #[error("certificate bundle is too short to contain nonce and tag")]
    Truncated,
    #[error("certificate bundle could not be decrypted")]
    Decryption,
    #[error("certificate bundle could not be encrypted: {0}")]
    Encryption(String),
    #[error("invalid bundle key: {0}")]
    InvalidKey(String),
    #[error("no certificate encryption key configured")]
    MissingBundleKey,
    #[error("failed to open PKCS#12 container: {0}")]
    Pkcs12(String),
    #[error("PKCS#12 container has no {0}")]
    MissingKeyMaterial(&'static str),
    #[error("certificate metadata could not be read: {0}")]
    Metadata(String),
    #[error("certificate expired at {expires_at}")]
    Expired { expires_at: DateTime<Utc> },
    #[error("certificate not valid before {not_before}")]
    NotYetValid { not_before: DateTime<Utc> },
    #[error("certificate subject {subject} does not belong to CNPJ {cnpj}")]
    SubjectMismatch { subject: String, cnpj: String },
}

/// Process-wide AES-256-GCM key protecting certificate bundles at rest.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BundleKey([u8; KEY_LEN]);

impl BundleKey {
    /// # Errors
    /// Returns [`CertificateError::InvalidKey`] unless `bytes` is exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CertificateError> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CertificateError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self(key))
    }

    /// # Errors
    /// Returns [`CertificateError::InvalidKey`] if the input is not base64 of 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, CertificateError> {
        let mut bytes = Base64::decode_vec(encoded.trim())
            .map_err(|_| CertificateError::InvalidKey("not valid base64".into()))?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    pub fn generate() -> Result<Self, CertificateError> {
        let mut key = [0u8; KEY_LEN];
        rand_bytes(&mut key).map_err(|e| CertificateError::Encryption(e.to_string()))?;
        Ok(Self(key))
    }

    pub fn to_base64(&self) -> String {
        Base64::encode_string(&self.0)
    }

    /// Encrypt a PKCS#12 container into the at-rest format:
    /// base64 of `nonce(12) || ciphertext || tag(16)`.
    ///
    /// # Errors
    /// Returns [`CertificateError::Encryption`] if the cipher fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CertificateError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand_bytes(&mut nonce).map_err(|e| CertificateError::Encryption(e.to_string()))?;
        let mut tag = [0u8; TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &self.0,
            Some(&nonce),
            &[],
            plaintext,
            &mut tag,
        )
        .map_err(|e| CertificateError::Encryption(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len() + TAG_LEN);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        blob.extend_from_slice(&tag);
        Ok(Base64::encode_string(&blob))
    }

    /// Reverse of [`BundleKey::encrypt`].
    ///
    /// # Errors
    /// Returns [`CertificateError`] for malformed input or a failed tag check.
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, CertificateError> {
        let compact: String = encoded.split_whitespace().collect();
        let blob = Base64::decode_vec(&compact).map_err(|_| CertificateError::Encoding)?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CertificateError::Truncated);
        }
        let (nonce, rest) = blob.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        decrypt_aead(Cipher::aes_256_gcm(), &self.0, Some(nonce), &[], ciphertext, tag)
            .map_err(|_| CertificateError::Decryption)
    }
}

impl fmt::Debug for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BundleKey(..)")
    }
}

/// Where an encrypted bundle lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BundleLocation {
    /// File containing the base64 blob.
    File(PathBuf),
    /// The base64 blob itself.
    Inline(String),
}

/// Certificate reference carried by a fiscal profile.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRef {
    location: BundleLocation,
    password: String,
}

impl CertificateRef {
    pub fn new(location: BundleLocation, password: impl Into<String>) -> Self {
        Self {
            location,
            password: password.into(),
        }
    }

    pub fn location(&self) -> &BundleLocation {
        &self.location
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for CertificateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRef")
            .field("location", &self.location)
            .field("password", &"***")
            .finish()
    }
}

/// Descriptive metadata of the leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    subject: String,
    issuer: String,
    serial: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl CertificateInfo {
    fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let cert = Certificate::from_der(der)
            .map_err(|e| CertificateError::Metadata(format!("{e:?}")))?;
        let tbs = &cert.tbs_certificate;
        let (issuer, serial) = issuer_and_serial(&cert);
        Ok(Self {
            subject: tbs.subject.to_string(),
            issuer,
            serial,
            not_before: unix_to_utc(tbs.validity.not_before.to_unix_duration())?,
            not_after: unix_to_utc(tbs.validity.not_after.to_unix_duration())?,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Serial number in decimal form.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// CNPJ embedded in an ICP-Brasil subject CN (`NAME:CNPJ`), if any.
    pub fn subject_cnpj(&self) -> Option<&str> {
        let cn = self
            .subject
            .split(',')
            .map(str::trim)
            .find_map(|part| part.strip_prefix("CN="))?;
        let (_, digits) = cn.rsplit_once(':')?;
        (digits.len() == 14 && digits.bytes().all(|b| b.is_ascii_digit())).then_some(digits)
    }
}

/// Outcome of [`CertificateManager::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateValidation {
    pub valid: bool,
    pub expires_at: DateTime<Utc>,
    pub subject: String,
    pub issuer: String,
}

/// Decrypted key material for one workflow. Not cached and not shared across tenants.
pub struct KeyMaterial {
    certificate: X509,
    private_key: PKey<Private>,
    info: CertificateInfo,
}

impl KeyMaterial {
    /// Wrap an already decoded certificate and key.
    ///
    /// # Errors
    /// Returns [`CertificateError::Metadata`] if the certificate cannot be decoded.
    pub fn new(certificate: X509, private_key: PKey<Private>) -> Result<Self, CertificateError> {
        let der = certificate
            .to_der()
            .map_err(|e| CertificateError::Metadata(e.to_string()))?;
        let info = CertificateInfo::from_der(&der)?;
        Ok(Self {
            certificate,
            private_key,
            info,
        })
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }

    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }

    /// DER certificate as base64, the `X509Certificate` content of a signature.
    ///
    /// # Errors
    /// Returns [`CertificateError::Metadata`] if DER encoding fails.
    pub fn certificate_base64(&self) -> Result<String, CertificateError> {
        let der = self
            .certificate
            .to_der()
            .map_err(|e| CertificateError::Metadata(e.to_string()))?;
        Ok(Base64::encode_string(&der))
    }

    /// PEM certificate and PKCS#8 PEM key for the TLS client identity.
    ///
    /// # Errors
    /// Returns [`CertificateError::Metadata`] if PEM encoding fails.
    pub fn identity_pem(&self) -> Result<(Vec<u8>, Vec<u8>), CertificateError> {
        let cert = self
            .certificate
            .to_pem()
            .map_err(|e| CertificateError::Metadata(e.to_string()))?;
        let key = self
            .private_key
            .private_key_to_pem_pkcs8()
            .map_err(|e| CertificateError::Metadata(e.to_string()))?;
        Ok((cert, key))
    }

    /// Refuse material that is outside its validity window or issued to a
    /// different company than `cnpj`.
    ///
    /// # Errors
    /// Returns [`CertificateError::Expired`], [`CertificateError::NotYetValid`]
    /// or [`CertificateError::SubjectMismatch`].
    pub fn ensure_usable(&self, now: DateTime<Utc>, cnpj: &str) -> Result<(), CertificateError> {
        if now > self.info.not_after {
            return Err(CertificateError::Expired {
                expires_at: self.info.not_after,
            });
        }
        if now < self.info.not_before {
            return Err(CertificateError::NotYetValid {
                not_before: self.info.not_before,
            });
        }
        // Branch certificates share the eight-digit company root.
        if let Some(subject_cnpj) = self.info.subject_cnpj() {
            if cnpj.len() < 8 || subject_cnpj[..8] != cnpj[..8] {
                return Err(CertificateError::SubjectMismatch {
                    subject: self.info.subject.clone(),
                    cnpj: cnpj.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("subject", &self.info.subject)
            .field("not_after", &self.info.not_after)
            .finish_non_exhaustive()
    }
}

/// Loads and checks client certificates using the process-wide [`BundleKey`].
#[derive(Debug)]
pub struct CertificateManager<'a> {
    bundle_key: &'a BundleKey,
}

impl<'a> CertificateManager<'a> {
    pub fn new(bundle_key: &'a BundleKey) -> Self {
        Self { bundle_key }
    }

    /// Read, decrypt and open the bundle at `location`.
    ///
    /// # Errors
    /// Returns [`CertificateError`] if any step fails, including a wrong password.
    pub fn load_certificate(
        &self,
        location: &BundleLocation,
        password: &str,
    ) -> Result<KeyMaterial, CertificateError> {
        let encoded = match location {
            BundleLocation::File(path) => {
                std::fs::read_to_string(path).map_err(|source| CertificateError::Io {
                    path: path.clone(),
                    source,
                })?
            }
            BundleLocation::Inline(blob) => blob.clone(),
        };
        let mut der = self.bundle_key.decrypt(&encoded)?;
        let material = open_pkcs12(&der, password);
        der.zeroize();
        let material = material?;
        debug!(subject = %material.info.subject, "loaded client certificate");
        Ok(material)
    }

    /// Load the certificate a profile points at.
    ///
    /// # Errors
    /// See [`CertificateManager::load_certificate`].
    pub fn load(&self, reference: &CertificateRef) -> Result<KeyMaterial, CertificateError> {
        self.load_certificate(reference.location(), reference.password())
    }

    /// Report validity at `now`.
    pub fn validate(material: &KeyMaterial, now: DateTime<Utc>) -> CertificateValidation {
        let info = material.info();
        CertificateValidation {
            valid: now >= info.not_before && now <= info.not_after,
            expires_at: info.not_after,
            subject: info.subject.clone(),
            issuer: info.issuer.clone(),
        }
    }
}

/// Open a PKCS#12 container and pull out the leaf certificate and private key.
///
/// # Errors
/// Returns [`CertificateError::Pkcs12`] for a corrupt container or wrong password.
pub fn open_pkcs12(der: &[u8], password: &str) -> Result<KeyMaterial, CertificateError> {
    let parsed = Pkcs12::from_der(der)
        .and_then(|p12| p12.parse2(password))
        .map_err(|e| CertificateError::Pkcs12(e.to_string()))?;
    let certificate = parsed
        .cert
        .ok_or(CertificateError::MissingKeyMaterial("certificate"))?;
    let private_key = parsed
        .pkey
        .ok_or(CertificateError::MissingKeyMaterial("private key"))?;
    KeyMaterial::new(certificate, private_key)
}

fn unix_to_utc(duration: std::time::Duration) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::<Utc>::from_timestamp(duration.as_secs() as i64, 0)
        .ok_or_else(|| CertificateError::Metadata(format!("timestamp out of range: {duration:?}")))
}

fn issuer_and_serial(cert: &Certificate) -> (String, String) {
    let serial = serial_bytes_to_decimal_string(cert.tbs_certificate.serial_number.as_bytes());
    let issuer = cert
        .tbs_certificate
        .issuer
        .to_string()
        .split(',')
        .map(|part| part.trim())
        .collect::<Vec<_>>()
        .join(", ");
    (issuer, serial)
}

fn serial_bytes_to_decimal_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "0".to_string();
    }

    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }

    while digits.len() > 1 && matches!(digits.last(), Some(0)) {
        digits.pop();
    }

    digits.iter().rev().map(|d| (b'0' + *d) as char).collect()
}
