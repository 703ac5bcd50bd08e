//! Configuration, authority environment and region selection.
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;

use crate::{api::endpoints::EndpointTable, certificate::BundleKey};

pub const ENV_BUNDLE_KEY: &str = "NFE_CERT_ENCRYPTION_KEY";
pub const ENV_BASE_URL: &str = "NFE_AUTHORITY_BASE_URL";
pub const ENV_POLL_ATTEMPTS: &str = "NFE_POLL_ATTEMPTS";
pub const ENV_POLL_DELAY_MS: &str = "NFE_POLL_DELAY_MS";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "NFE_HTTP_TIMEOUT_SECS";

/// Authority environment (`tpAmb`).
/// - Production: documents have legal value.
/// - Homologation: the authority's test environment; documents are accepted
///   and signed but carry no fiscal effect.
///
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use nfe_core::config::Environment;
///
/// let env = Environment::from_str("homologacao")?;
/// assert_eq!(env, Environment::Homologation);
/// assert_eq!(env.code(), 2);
/// # Ok::<(), nfe_core::config::ConfigError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    Homologation,
}

/// Error returned when parsing configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid environment: {input}")]
    InvalidEnvironment { input: String },
    #[error("invalid region: {input}")]
    InvalidRegion { input: String },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid certificate encryption key: {0}")]
    InvalidBundleKey(String),
}

impl FromStr for Environment {
    type Err = ConfigError;
    fn from_str(env: &str) -> Result<Environment, ConfigError> {
        match env.trim().to_ascii_lowercase().as_str() {
            "production" | "producao" | "1" => Ok(Environment::Production),
            "homologation" | "homologacao" | "2" => Ok(Environment::Homologation),
            _ => Err(ConfigError::InvalidEnvironment {
                input: env.to_string(),
            }),
        }
    }
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Homologation => "homologation",
        }
    }

    /// Numeric `tpAmb` value carried by every request body.
    pub fn code(&self) -> u8 {
        match self {
            Environment::Production => 1,
            Environment::Homologation => 2,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! regions {
    ($($variant:ident = $code:literal),+ $(,)?) => {
        /// Brazilian federative unit, identified by its IBGE code (`cUF`).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum Region {
            $($variant),+
        }

        impl Region {
            pub const ALL: &'static [Region] = &[$(Region::$variant),+];

            pub fn code(&self) -> u8 {
                match self {
                    $(Region::$variant => $code),+
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Region::$variant => stringify!($variant)),+
                }
            }

            pub fn from_code(code: u8) -> Option<Region> {
                match code {
                    $($code => Some(Region::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

regions! {
    RO = 11, AC = 12, AM = 13, RR = 14, PA = 15, AP = 16, TO = 17,
    MA = 21, PI = 22, CE = 23, RN = 24, PB = 25, PE = 26, AL = 27, SE = 28, BA = 29,
    MG = 31, ES = 32, RJ = 33, SP = 35,
    PR = 41, SC = 42, RS = 43,
    MS = 50, MT = 51, GO = 52, DF = 53,
}

impl FromStr for Region {
    type Err = ConfigError;
    fn from_str(input: &str) -> Result<Region, ConfigError> {
        let trimmed = input.trim();
        let found = match trimmed.parse::<u8>() {
            Ok(code) => Region::from_code(code),
            Err(_) => Region::ALL
                .iter()
                .copied()
                .find(|region| region.as_str().eq_ignore_ascii_case(trimmed)),
        };
        found.ok_or_else(|| ConfigError::InvalidRegion {
            input: input.to_string(),
        })
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempt budget and delay for asynchronous receipt polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    attempts: u32,
    delay: Duration,
}

impl PollPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(2),
        }
    }
}

/// Process-wide engine configuration.
///
/// # Examples
/// ```rust
/// use std::time::Duration;
/// use nfe_core::config::{Config, PollPolicy};
///
/// let config = Config::default().with_poll_policy(PollPolicy::new(3, Duration::from_millis(10)));
/// assert_eq!(config.poll_policy().attempts(), 3);
/// assert_eq!(config.timeout(), Duration::from_secs(60));
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    timeout: Duration,
    poll_policy: PollPolicy,
    endpoints: EndpointTable,
    bundle_key: Option<BundleKey>,
}

impl Config {
    pub fn new(bundle_key: BundleKey) -> Self {
        Self::default().with_bundle_key(bundle_key)
    }

    /// Build a configuration from `NFE_*` environment variables, falling back
    /// to defaults for anything unset.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(value) = read_env(ENV_BUNDLE_KEY) {
            let key = BundleKey::from_base64(&value)
                .map_err(|e| ConfigError::InvalidBundleKey(e.to_string()))?;
            config = config.with_bundle_key(key);
        }
        if let Some(value) = read_env(ENV_BASE_URL) {
            config = config.with_endpoints(EndpointTable::uniform(&value));
        }
        let mut attempts = config.poll_policy.attempts();
        let mut delay = config.poll_policy.delay();
        if let Some(value) = read_env(ENV_POLL_ATTEMPTS) {
            attempts = parse_attempts(&value)?;
        }
        if let Some(value) = read_env(ENV_POLL_DELAY_MS) {
            delay = Duration::from_millis(parse_number(ENV_POLL_DELAY_MS, &value)?);
        }
        config = config.with_poll_policy(PollPolicy::new(attempts, delay));
        if let Some(value) = read_env(ENV_HTTP_TIMEOUT_SECS) {
            let secs = parse_number(ENV_HTTP_TIMEOUT_SECS, &value)?;
            config = config.with_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_policy(mut self, poll_policy: PollPolicy) -> Self {
        self.poll_policy = poll_policy;
        self
    }

    pub fn with_endpoints(mut self, endpoints: EndpointTable) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_bundle_key(mut self, bundle_key: BundleKey) -> Self {
        self.bundle_key = Some(bundle_key);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_policy(&self) -> PollPolicy {
        self.poll_policy
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    pub fn bundle_key(&self) -> Option<&BundleKey> {
        self.bundle_key.as_ref()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: Duration::from_secs(60),
            poll_policy: PollPolicy::default(),
            endpoints: EndpointTable::sefaz(),
            bundle_key: None,
        }
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_number(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_attempts(value: &str) -> Result<u32, ConfigError> {
    u32::try_from(parse_number(ENV_POLL_ATTEMPTS, value)?).map_err(|_| ConfigError::InvalidValue {
        key: ENV_POLL_ATTEMPTS,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_portuguese_and_numeric_forms() {
        assert_eq!(Environment::from_str("1").unwrap(), Environment::Production);
        assert_eq!(
            Environment::from_str("Homologacao").unwrap(),
            Environment::Homologation
        );
        assert!(matches!(
            Environment::from_str("staging"),
            Err(ConfigError::InvalidEnvironment { .. })
        ));
    }

    #[test]
    fn region_round_trips_code_and_abbreviation() {
        assert_eq!(Region::from_str("sp").unwrap(), Region::SP);
        assert_eq!(Region::from_str("43").unwrap(), Region::RS);
        assert_eq!(Region::SP.code(), 35);
        assert_eq!(Region::ALL.len(), 27);
        for region in Region::ALL {
            assert_eq!(Region::from_code(region.code()), Some(*region));
        }
        assert!(Region::from_str("XX").is_err());
        assert!(Region::from_str("99").is_err());
    }

    #[test]
    fn default_poll_policy_is_ten_attempts_two_seconds() {
        let policy = PollPolicy::default();
        assert_eq!(policy.attempts(), 10);
        assert_eq!(policy.delay(), Duration::from_secs(2));
    }

    #[test]
    fn parse_number_rejects_garbage() {
        assert_eq!(parse_number(ENV_POLL_ATTEMPTS, "12").unwrap(), 12);
        assert!(matches!(
            parse_number(ENV_POLL_ATTEMPTS, "ten"),
            Err(ConfigError::InvalidValue { key: ENV_POLL_ATTEMPTS, .. })
        ));
    }

    #[test]
    fn poll_attempts_above_u32_are_rejected() {
        assert_eq!(parse_attempts("4294967295").unwrap(), u32::MAX);
        assert!(matches!(
            parse_attempts("4294967296"),
            Err(ConfigError::InvalidValue { key: ENV_POLL_ATTEMPTS, .. })
        ));
    }
}
