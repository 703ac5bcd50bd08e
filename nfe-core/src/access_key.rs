//! The 44-digit NF-e access key (chave de acesso).
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::Region;

pub const ACCESS_KEY_LEN: usize = 44;
pub const CNPJ_LEN: usize = 14;
pub const MAX_SERIES: u16 = 999;
pub const MAX_RANDOM_CODE: u32 = 99_999_999;

/// Errors produced while generating or parsing an access key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessKeyError {
    #[error("access key must have {expected} digits, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("access key must contain only digits")]
    NonNumeric,
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: u64 },
    #[error("invalid CNPJ: {0}")]
    InvalidCnpj(String),
    #[error("unknown region code {0}")]
    UnknownRegion(u8),
    #[error("check digit mismatch: expected {expected}, found {found}")]
    CheckDigitMismatch { expected: u8, found: u8 },
}

/// Components of an access key before the check digit is appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyParts {
    pub region: Region,
    /// Two-digit year of emission.
    pub year: u8,
    pub month: u8,
    /// Issuer CNPJ; punctuation is stripped before use.
    pub cnpj: String,
    pub model: u8,
    pub series: u16,
    pub number: u32,
    pub emission_type: u8,
    /// Eight-digit numeric code (`cNF`).
    pub random_code: u32,
}

/// Validated access key.
///
/// # Examples
/// ```rust
/// use nfe_core::access_key::{AccessKey, AccessKeyParts};
/// use nfe_core::config::Region;
///
/// let key = AccessKey::generate(&AccessKeyParts {
///     region: Region::SP,
///     year: 24,
///     month: 5,
///     cnpj: "12.345.678/0001-95".into(),
///     model: 55,
///     series: 1,
///     number: 123,
///     emission_type: 1,
///     random_code: 12_345_678,
/// })?;
/// assert_eq!(key.as_str(), "35240512345678000195550010000001231123456786");
/// assert_eq!(key.check_digit(), 6);
/// # Ok::<(), nfe_core::access_key::AccessKeyError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessKey(String);

impl AccessKey {
    /// Assemble the 43 leading digits from `parts` and append the mod-11 check digit.
    ///
    /// # Errors
    /// Returns [`AccessKeyError`] if any component does not fit its fixed width.
    pub fn generate(parts: &AccessKeyParts) -> Result<Self, AccessKeyError> {
        let cnpj = normalize_cnpj(&parts.cnpj)?;
        ensure_range("year", parts.year as u64, 0, 99)?;
        ensure_range("month", parts.month as u64, 1, 12)?;
        ensure_range("model", parts.model as u64, 1, 99)?;
        ensure_range("series", parts.series as u64, 0, MAX_SERIES as u64)?;
        ensure_range("number", parts.number as u64, 1, 999_999_999)?;
        ensure_range("emission type", parts.emission_type as u64, 1, 9)?;
        ensure_range("random code", parts.random_code as u64, 0, MAX_RANDOM_CODE as u64)?;

        let body = format!(
            "{:02}{:02}{:02}{}{:02}{:03}{:09}{}{:08}",
            parts.region.code(),
            parts.year,
            parts.month,
            cnpj,
            parts.model,
            parts.series,
            parts.number,
            parts.emission_type,
            parts.random_code,
        );
        let digit = check_digit(&body)?;
        Ok(Self(format!("{body}{digit}")))
    }

    /// Parse and verify an existing key. The input must be exactly the 44
    /// digits: surrounding whitespace is rejected, not trimmed.
    ///
    /// # Errors
    /// Returns [`AccessKeyError`] on wrong length, non-digit content, an
    /// unknown region prefix or a check digit that does not match.
    pub fn parse(key: &str) -> Result<Self, AccessKeyError> {
        if key.len() != ACCESS_KEY_LEN {
            return Err(AccessKeyError::InvalidLength {
                expected: ACCESS_KEY_LEN,
                actual: key.len(),
            });
        }
        if !key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AccessKeyError::NonNumeric);
        }
        let region_code = numeric(&key[0..2]) as u8;
        if Region::from_code(region_code).is_none() {
            return Err(AccessKeyError::UnknownRegion(region_code));
        }
        let expected = check_digit(&key[..ACCESS_KEY_LEN - 1])?;
        let found = key.as_bytes()[ACCESS_KEY_LEN - 1] - b'0';
        if expected != found {
            return Err(AccessKeyError::CheckDigitMismatch { expected, found });
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `Id` attribute value of the `infNFe` element.
    pub fn document_id(&self) -> String {
        format!("NFe{}", self.0)
    }

    pub fn check_digit(&self) -> u8 {
        self.0.as_bytes()[ACCESS_KEY_LEN - 1] - b'0'
    }

    pub fn region(&self) -> Region {
        // Validated at construction.
        Region::from_code(numeric(&self.0[0..2]) as u8).unwrap_or(Region::SP)
    }

    pub fn year(&self) -> u8 {
        numeric(&self.0[2..4]) as u8
    }

    pub fn month(&self) -> u8 {
        numeric(&self.0[4..6]) as u8
    }

    pub fn cnpj(&self) -> &str {
        &self.0[6..20]
    }

    pub fn model(&self) -> u8 {
        numeric(&self.0[20..22]) as u8
    }

    pub fn series(&self) -> u16 {
        numeric(&self.0[22..25]) as u16
    }

    pub fn number(&self) -> u32 {
        numeric(&self.0[25..34]) as u32
    }

    pub fn emission_type(&self) -> u8 {
        numeric(&self.0[34..35]) as u8
    }

    pub fn random_code(&self) -> u32 {
        numeric(&self.0[35..43]) as u32
    }

    pub fn parts(&self) -> AccessKeyParts {
        AccessKeyParts {
            region: self.region(),
            year: self.year(),
            month: self.month(),
            cnpj: self.cnpj().to_string(),
            model: self.model(),
            series: self.series(),
            number: self.number(),
            emission_type: self.emission_type(),
            random_code: self.random_code(),
        }
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AccessKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AccessKey {
    type Error = AccessKeyError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        AccessKey::parse(&value)
    }
}

impl From<AccessKey> for String {
    fn from(key: AccessKey) -> Self {
        key.0
    }
}

/// Mod-11 check digit over `digits`, weights 2..=9 cycling from the right.
///
/// # Errors
/// Returns [`AccessKeyError::NonNumeric`] if `digits` contains a non-digit.
pub fn check_digit(digits: &str) -> Result<u8, AccessKeyError> {
    let mut sum: u32 = 0;
    let mut weight: u32 = 2;
    for byte in digits.bytes().rev() {
        if !byte.is_ascii_digit() {
            return Err(AccessKeyError::NonNumeric);
        }
        sum += (byte - b'0') as u32 * weight;
        weight = if weight == 9 { 2 } else { weight + 1 };
    }
    let remainder = sum % 11;
    Ok(if remainder < 2 { 0 } else { (11 - remainder) as u8 })
}

/// Draw an eight-digit `cNF`. Collisions with previous keys are acceptable.
pub fn random_code<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    rng.gen_range(0..=MAX_RANDOM_CODE)
}

/// Strip punctuation from a CNPJ and require exactly fourteen digits.
///
/// # Errors
/// Returns [`AccessKeyError::InvalidCnpj`] otherwise.
pub fn normalize_cnpj(input: &str) -> Result<String, AccessKeyError> {
    let digits: String = input
        .chars()
        .filter(|c| !matches!(c, '.' | '/' | '-' | ' '))
        .collect();
    if digits.len() != CNPJ_LEN || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AccessKeyError::InvalidCnpj(input.to_string()));
    }
    Ok(digits)
}

fn ensure_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), AccessKeyError> {
    if value < min || value > max {
        return Err(AccessKeyError::OutOfRange { field, value });
    }
    Ok(())
}

fn numeric(digits: &str) -> u64 {
    digits
        .bytes()
        .fold(0u64, |acc, b| acc * 10 + (b - b'0') as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn parts() -> AccessKeyParts {
        AccessKeyParts {
            region: Region::SP,
            year: 24,
            month: 5,
            cnpj: "12345678000195".into(),
            model: 55,
            series: 1,
            number: 123,
            emission_type: 1,
            random_code: 12_345_678,
        }
    }

    #[test]
    fn check_digit_matches_known_keys() {
        assert_eq!(check_digit("3524051234567800019555001000000123112345678").unwrap(), 6);
        assert_eq!(check_digit("4324011234567800019555001000000001100000001").unwrap(), 0);
        assert_eq!(check_digit("5206043009348600013155001000000002146553380").unwrap(), 0);
    }

    #[test]
    fn generated_key_layout() {
        let key = AccessKey::generate(&parts()).unwrap();
        assert_eq!(key.as_str().len(), ACCESS_KEY_LEN);
        assert_eq!(key.region(), Region::SP);
        assert_eq!(key.year(), 24);
        assert_eq!(key.month(), 5);
        assert_eq!(key.cnpj(), "12345678000195");
        assert_eq!(key.model(), 55);
        assert_eq!(key.series(), 1);
        assert_eq!(key.number(), 123);
        assert_eq!(key.emission_type(), 1);
        assert_eq!(key.random_code(), 12_345_678);
        assert_eq!(key.parts(), parts());
        assert_eq!(key.document_id(), format!("NFe{key}"));
    }

    #[test]
    fn every_single_digit_mutation_is_detected() {
        let key = AccessKey::generate(&parts()).unwrap();
        // A non-zero digit means the remainder did not fold into the 0/1 bucket,
        // so any single substitution must change it.
        assert_eq!(key.check_digit(), 6);
        let original = key.as_str().as_bytes().to_vec();
        for position in 0..ACCESS_KEY_LEN - 1 {
            for replacement in b'0'..=b'9' {
                if replacement == original[position] {
                    continue;
                }
                let mut mutated = original.clone();
                mutated[position] = replacement;
                let body = std::str::from_utf8(&mutated[..ACCESS_KEY_LEN - 1]).unwrap();
                assert_ne!(
                    check_digit(body).unwrap(),
                    6,
                    "mutation at {position} to {} went undetected",
                    replacement as char
                );
            }
        }
    }

    #[test]
    fn parse_rejects_tampered_keys() {
        let key = AccessKey::generate(&parts()).unwrap();
        assert_eq!(AccessKey::parse(key.as_str()).unwrap(), key);

        let mut tampered = key.as_str().to_string();
        tampered.replace_range(43..44, "7");
        assert_eq!(
            AccessKey::parse(&tampered),
            Err(AccessKeyError::CheckDigitMismatch {
                expected: 6,
                found: 7
            })
        );
        assert!(matches!(
            AccessKey::parse("123"),
            Err(AccessKeyError::InvalidLength { actual: 3, .. })
        ));
        assert_eq!(
            AccessKey::parse("3524051234567800019555001000000123112345678X"),
            Err(AccessKeyError::NonNumeric)
        );
        assert_eq!(
            AccessKey::parse(&format!("99{}", &key.as_str()[2..])),
            Err(AccessKeyError::UnknownRegion(99))
        );
        assert!(matches!(
            AccessKey::parse(&format!(" {key}\n")),
            Err(AccessKeyError::InvalidLength { actual: 46, .. })
        ));
    }

    #[test]
    fn generate_rejects_malformed_components() {
        let mut bad = parts();
        bad.cnpj = "1234".into();
        assert!(matches!(AccessKey::generate(&bad), Err(AccessKeyError::InvalidCnpj(_))));

        let mut bad = parts();
        bad.series = 1000;
        assert_eq!(
            AccessKey::generate(&bad),
            Err(AccessKeyError::OutOfRange { field: "series", value: 1000 })
        );

        let mut bad = parts();
        bad.month = 13;
        assert!(AccessKey::generate(&bad).is_err());

        let mut bad = parts();
        bad.number = 0;
        assert!(AccessKey::generate(&bad).is_err());
    }

    #[test]
    fn random_code_stays_within_eight_digits() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            assert!(random_code(&mut rng) < 100_000_000);
        }
    }

    #[test]
    fn serde_uses_plain_string() {
        let key = AccessKey::generate(&parts()).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{key}\""));
        let back: AccessKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<AccessKey>("\"123\"").is_err());
    }
}
