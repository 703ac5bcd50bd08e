//! Rust engine for Brazilian NF-e (model 55) fiscal documents: access keys,
//! certificates, document assembly, XML-DSig, SEFAZ transport and the
//! authorization lifecycle.
//!
//! # Examples
//! ```rust
//! use nfe_core::access_key::{AccessKey, AccessKeyParts};
//! use nfe_core::config::Region;
//!
//! let key = AccessKey::generate(&AccessKeyParts {
//!     region: Region::SP,
//!     year: 24,
//!     month: 5,
//!     cnpj: "12345678000195".into(),
//!     model: 55,
//!     series: 1,
//!     number: 123,
//!     emission_type: 1,
//!     random_code: 12_345_678,
//! })?;
//! assert_eq!(key.as_str().len(), 44);
//! # Ok::<(), nfe_core::access_key::AccessKeyError>(())
//! ```
pub mod access_key;
pub mod api;
pub mod certificate;
pub mod config;
pub mod document;
pub mod engine;
pub mod memory;
pub mod ports;
pub mod status;

use thiserror::Error;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    AccessKey(#[from] access_key::AccessKeyError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Certificate(#[from] certificate::CertificateError),
    #[error(transparent)]
    Validation(#[from] document::ValidationError),
    #[error(transparent)]
    Build(#[from] document::BuildError),
    #[error(transparent)]
    Xml(#[from] document::xml::DocumentXmlError),
    #[error(transparent)]
    Signing(#[from] document::sign::SigningError),
    #[error(transparent)]
    Transport(#[from] api::TransportError),
    #[error(transparent)]
    Store(#[from] ports::StoreError),
    #[error(transparent)]
    Engine(#[from] engine::EngineError),
}
