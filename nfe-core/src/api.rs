//! SEFAZ web service client: SOAP transport, authority replies and the
//! connector used by the engine.
pub mod endpoints;
mod envelope;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use reqwest::{Client, Identity, header::CONTENT_TYPE};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    access_key::AccessKey,
    certificate::KeyMaterial,
    config::{Config, Environment, Region},
    document::{
        events::{SignedEvent, SignedVoidRange},
        sign::SignedDocument,
    },
    status::AuthorityStatus,
};
use endpoints::{EndpointSet, EndpointTable, Service};
use envelope::StatusSource;

/// Errors raised while talking to the authority.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no endpoints configured for {region} in {environment}")]
    UnsupportedRegion {
        environment: Environment,
        region: Region,
    },
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("malformed response envelope: {0}")]
    MalformedEnvelope(String),
    #[error("response is missing {0}")]
    UnexpectedShape(&'static str),
    #[error("SOAP fault: {0}")]
    Fault(String),
    #[error("client identity error: {0}")]
    Identity(String),
}

/// What the authority answered, before any interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityReply {
    /// Status describing the operation (protocol or event status when present).
    pub status: AuthorityStatus,
    /// The other status of the response, usually the batch one.
    pub batch_status: Option<AuthorityStatus>,
    pub protocol: Option<String>,
    pub receipt: Option<String>,
    pub timestamp: Option<DateTime<FixedOffset>>,
    /// Raw `protNFe` element, attached to the distributable document.
    pub protocol_xml: Option<String>,
}

impl AuthorityReply {
    pub fn new(status: AuthorityStatus) -> Self {
        Self {
            status,
            batch_status: None,
            protocol: None,
            receipt: None,
            timestamp: None,
            protocol_xml: None,
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(receipt.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<FixedOffset>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_protocol_xml(mut self, protocol_xml: impl Into<String>) -> Self {
        self.protocol_xml = Some(protocol_xml.into());
        self
    }
}

/// Remote operations of one authorizer, bound to one environment, region and
/// client certificate.
#[async_trait]
pub trait AuthorityTransport: Send + Sync {
    async fn submit_for_authorization(
        &self,
        document: &SignedDocument,
        batch_id: u64,
        synchronous: bool,
    ) -> Result<AuthorityReply, TransportError>;

    async fn poll_receipt(&self, receipt: &str) -> Result<AuthorityReply, TransportError>;

    async fn query_by_access_key(&self, key: &AccessKey) -> Result<AuthorityReply, TransportError>;

    async fn submit_event(&self, event: &SignedEvent, batch_id: u64) -> Result<AuthorityReply, TransportError>;

    async fn submit_void_range(&self, range: &SignedVoidRange) -> Result<AuthorityReply, TransportError>;

    async fn service_status(&self) -> Result<AuthorityReply, TransportError>;
}

/// Opens a transport for one workflow. The key material lives only as long as
/// the returned transport.
pub trait TransportConnector: Send + Sync {
    fn connect(
        &self,
        environment: Environment,
        region: Region,
        key: &KeyMaterial,
    ) -> Result<Box<dyn AuthorityTransport>, TransportError>;
}

/// Connector for the real SEFAZ services.
#[derive(Debug, Clone)]
pub struct SefazConnector {
    timeout: Duration,
    endpoints: EndpointTable,
}

impl SefazConnector {
    pub fn new(timeout: Duration, endpoints: EndpointTable) -> Self {
        Self { timeout, endpoints }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.timeout(), config.endpoints().clone())
    }
}

impl TransportConnector for SefazConnector {
    fn connect(
        &self,
        environment: Environment,
        region: Region,
        key: &KeyMaterial,
    ) -> Result<Box<dyn AuthorityTransport>, TransportError> {
        let endpoints = self.endpoints.lookup(environment, region)?.clone();
        let client = SefazClient::new(environment, region, endpoints, key, self.timeout)?;
        Ok(Box::new(client))
    }
}

/// SOAP 1.2 client authenticated with the issuer's certificate.
///
/// # Examples
/// ```rust,no_run
/// use nfe_core::api::{AuthorityTransport, SefazClient};
/// use nfe_core::api::endpoints::EndpointTable;
/// use nfe_core::config::{Environment, Region};
/// # async fn run(key: &nfe_core::certificate::KeyMaterial) -> Result<(), nfe_core::api::TransportError> {
/// let endpoints = EndpointTable::sefaz()
///     .lookup(Environment::Homologation, Region::SP)?
///     .clone();
/// let client = SefazClient::new(
///     Environment::Homologation,
///     Region::SP,
///     endpoints,
///     key,
///     std::time::Duration::from_secs(60),
/// )?;
/// let reply = client.service_status().await?;
/// println!("{}", reply.status);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SefazClient {
    client: Client,
    environment: Environment,
    region: Region,
    endpoints: EndpointSet,
    timeout: Duration,
}

// Public API
impl SefazClient {
    /// # Errors
    /// Returns [`TransportError::Identity`] if the certificate cannot be used
    /// as a TLS identity, or [`TransportError::Http`] if the client cannot be built.
    pub fn new(
        environment: Environment,
        region: Region,
        endpoints: EndpointSet,
        key: &KeyMaterial,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let (cert_pem, key_pem) = key
            .identity_pem()
            .map_err(|e| TransportError::Identity(e.to_string()))?;
        let identity = Identity::from_pkcs8_pem(&cert_pem, &key_pem)
            .map_err(|e| TransportError::Identity(e.to_string()))?;
        let client = Client::builder()
            .use_native_tls()
            .identity(identity)
            .timeout(timeout)
            .build()
            .map_err(TransportError::Http)?;

        Ok(Self {
            client,
            environment,
            region,
            endpoints,
            timeout,
        })
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn region(&self) -> Region {
        self.region
    }
}

#[async_trait]
impl AuthorityTransport for SefazClient {
    async fn submit_for_authorization(
        &self,
        document: &SignedDocument,
        batch_id: u64,
        synchronous: bool,
    ) -> Result<AuthorityReply, TransportError> {
        let body = envelope::authorization_body(document, batch_id, synchronous);
        let response = self.call(Service::Authorization, &body).await?;
        envelope::parse_reply(&response, StatusSource::Inner)
    }

    async fn poll_receipt(&self, receipt: &str) -> Result<AuthorityReply, TransportError> {
        let body = envelope::receipt_body(self.environment, receipt)?;
        let response = self.call(Service::ReceiptQuery, &body).await?;
        envelope::parse_reply(&response, StatusSource::Inner)
    }

    async fn query_by_access_key(&self, key: &AccessKey) -> Result<AuthorityReply, TransportError> {
        let body = envelope::protocol_query_body(self.environment, key)?;
        let response = self.call(Service::ProtocolQuery, &body).await?;
        envelope::parse_reply(&response, StatusSource::Outer)
    }

    async fn submit_event(&self, event: &SignedEvent, batch_id: u64) -> Result<AuthorityReply, TransportError> {
        let body = envelope::event_body(event, batch_id);
        let response = self.call(Service::Events, &body).await?;
        envelope::parse_reply(&response, StatusSource::Inner)
    }

    async fn submit_void_range(&self, range: &SignedVoidRange) -> Result<AuthorityReply, TransportError> {
        let body = envelope::void_body(range);
        let response = self.call(Service::VoidRange, &body).await?;
        envelope::parse_reply(&response, StatusSource::Inner)
    }

    async fn service_status(&self) -> Result<AuthorityReply, TransportError> {
        let body = envelope::status_body(self.environment, self.region)?;
        let response = self.call(Service::ServiceStatus, &body).await?;
        envelope::parse_reply(&response, StatusSource::Outer)
    }
}

// Private API
impl SefazClient {
    async fn call(&self, service: Service, body: &str) -> Result<String, TransportError> {
        let url = self.endpoints.url(service);
        debug!(?service, url, region = %self.region, "calling authority");
        let content_type = format!(
            "application/soap+xml; charset=utf-8; action=\"{}\"",
            service.soap_action()
        );
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .body(envelope::envelope(service, body))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.classify(e))?;
        if status.is_success() {
            return Ok(text);
        }
        // SOAP 1.2 faults travel with a 500 status.
        if status.is_server_error() && text.contains("Fault") {
            return Ok(text);
        }
        warn!(?service, status = status.as_u16(), "authority returned HTTP error");
        Err(TransportError::HttpStatus {
            status: status.as_u16(),
            body: text,
        })
    }

    fn classify(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Http(error)
        }
    }
}
