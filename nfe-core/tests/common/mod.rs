use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use nfe_core::api::{AuthorityReply, AuthorityTransport, TransportConnector, TransportError};
use nfe_core::certificate::{BundleKey, BundleLocation, CertificateRef, KeyMaterial};
use nfe_core::config::{Config, Environment, PollPolicy, Region};
use nfe_core::document::events::{SignedEvent, SignedVoidRange};
use nfe_core::document::sign::SignedDocument;
use nfe_core::document::{
    Address, ContributionTax, DocumentKind, FiscalProfile, IcmsTax, InvoiceDraft, InvoiceTotals,
    LineItem, PartyDocument, Payment, PaymentMethod, ProductFlags, Recipient, TaxClassification,
    TaxRegime, Transport,
};
use nfe_core::access_key::AccessKey;
use nfe_core::engine::FiscalEngine;
use nfe_core::memory::{InMemoryRecordStore, InMemorySeriesCounter, StaticProfileStore};
use nfe_core::ports::TenantId;
use nfe_core::status::AuthorityStatus;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

#[allow(dead_code)]
pub const CNPJ: &str = "12345678000195";
#[allow(dead_code)]
pub const PASSWORD: &str = "s3cret";
#[allow(dead_code)]
pub const SUBJECT_CN: &str = "FARMA DISTRIBUIDORA LTDA:12345678000195";

/// Self-signed RSA certificate valid from `from_days` to `to_days` around now.
#[allow(dead_code)]
pub fn generate_identity(common_name: &str, from_days: i64, to_days: i64) -> (PKey<Private>, X509) {
    let rsa = Rsa::generate(2048).expect("rsa key");
    let pkey = PKey::from_rsa(rsa).expect("pkey");

    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_nid(Nid::COUNTRYNAME, "BR").expect("country");
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "ICP-Brasil")
        .expect("organization");
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)
        .expect("common name");
    let name = name.build();

    let now = chrono::Utc::now().timestamp();
    let not_before = Asn1Time::from_unix(now + from_days * 86_400).expect("not before");
    let not_after = Asn1Time::from_unix(now + to_days * 86_400).expect("not after");
    let serial = BigNum::from_u32(4242)
        .and_then(|n| n.to_asn1_integer())
        .expect("serial");

    let mut builder = X509::builder().expect("x509 builder");
    builder.set_version(2).expect("version");
    builder.set_serial_number(&serial).expect("serial number");
    builder.set_subject_name(&name).expect("subject");
    builder.set_issuer_name(&name).expect("issuer");
    builder.set_pubkey(&pkey).expect("public key");
    builder.set_not_before(&not_before).expect("validity start");
    builder.set_not_after(&not_after).expect("validity end");
    builder.sign(&pkey, MessageDigest::sha256()).expect("self sign");
    (pkey, builder.build())
}

/// The issuer's certificate, generated once per test binary.
#[allow(dead_code)]
pub fn identity() -> &'static (PKey<Private>, X509) {
    static IDENTITY: OnceLock<(PKey<Private>, X509)> = OnceLock::new();
    IDENTITY.get_or_init(|| generate_identity(SUBJECT_CN, -1, 365))
}

#[allow(dead_code)]
pub fn key_material() -> KeyMaterial {
    let (pkey, cert) = identity();
    KeyMaterial::new(cert.clone(), pkey.clone()).expect("key material")
}

#[allow(dead_code)]
pub fn pkcs12_der(pkey: &PKey<Private>, cert: &X509, password: &str) -> Vec<u8> {
    Pkcs12::builder()
        .name("nfe")
        .pkey(pkey)
        .cert(cert)
        .build2(password)
        .expect("pkcs12")
        .to_der()
        .expect("pkcs12 der")
}

#[allow(dead_code)]
pub fn bundle_key() -> BundleKey {
    BundleKey::from_bytes(&[42u8; 32]).expect("bundle key")
}

/// Encrypted at-rest bundle of the shared identity.
#[allow(dead_code)]
pub fn encrypted_bundle() -> String {
    let (pkey, cert) = identity();
    bundle_key()
        .encrypt(&pkcs12_der(pkey, cert, PASSWORD))
        .expect("encrypt bundle")
}

#[allow(dead_code)]
pub fn address(region: Region) -> Address {
    Address {
        street: "Rua das Flores".into(),
        number: "100".into(),
        complement: None,
        district: "Centro".into(),
        city_code: "3550308".into(),
        city: "Sao Paulo".into(),
        region,
        postal_code: "01001000".into(),
        phone: Some("1133334444".into()),
    }
}

#[allow(dead_code)]
pub fn profile_with_bundle(bundle: String) -> FiscalProfile {
    FiscalProfile::new(
        CNPJ,
        "FARMA DISTRIBUIDORA LTDA",
        "110042490114",
        TaxRegime::Normal,
        address(Region::SP),
        Environment::Homologation,
        CertificateRef::new(BundleLocation::Inline(bundle), PASSWORD),
    )
}

#[allow(dead_code)]
pub fn sample_profile() -> FiscalProfile {
    profile_with_bundle(encrypted_bundle())
}

#[allow(dead_code)]
pub fn sample_item() -> LineItem {
    LineItem {
        code: "7891234".into(),
        gtin: None,
        description: "Dipirona 500mg cx 10".into(),
        ncm: "30049099".into(),
        cfop: None,
        unit: "CX".into(),
        quantity: 2.0,
        unit_price: 50.0,
        discount: 0.0,
        tax: TaxClassification {
            icms: IcmsTax::Taxed { origin: 0, rate: 18.0 },
            pis: ContributionTax { cst: "01".into(), rate: 1.65 },
            cofins: ContributionTax { cst: "01".into(), rate: 7.6 },
            ipi: None,
        },
        flags: ProductFlags::empty(),
        medicine: None,
        batch: None,
        temperature: None,
    }
}

/// Exit document totalling 100.00, paid with Pix.
#[allow(dead_code)]
pub fn sample_draft() -> InvoiceDraft {
    InvoiceDraft {
        kind: DocumentKind::Exit,
        operation_nature: "Venda de mercadoria".into(),
        cfop: "5102".into(),
        recipient: Recipient {
            document: PartyDocument::Cnpj("98765432000198".into()),
            name: "DROGARIA CENTRAL LTDA".into(),
            state_registration: Some("123456789012".into()),
            address: address(Region::SP),
            email: None,
        },
        items: vec![sample_item()],
        payments: vec![Payment {
            method: PaymentMethod::Pix,
            amount: 100.0,
        }],
        transport: Transport::default(),
        totals: InvoiceTotals {
            subtotal: 100.0,
            discount: 0.0,
            tax: 0.0,
            total: 100.0,
        },
        notes: None,
        series: None,
        referenced_key: None,
    }
}

#[allow(dead_code)]
pub fn issued_at() -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339("2024-05-10T10:00:00-03:00").expect("issued at")
}

#[allow(dead_code)]
pub fn today() -> NaiveDate {
    issued_at().date_naive()
}

#[allow(dead_code)]
pub fn authorized(protocol: &str) -> AuthorityReply {
    AuthorityReply::new(AuthorityStatus::new(100, "Autorizado o uso da NF-e"))
        .with_protocol(protocol)
        .with_timestamp(issued_at())
        .with_protocol_xml(format!(
            "<protNFe versao=\"4.00\"><infProt><cStat>100</cStat><nProt>{protocol}</nProt></infProt></protNFe>"
        ))
}

#[allow(dead_code)]
pub fn received(receipt: &str) -> AuthorityReply {
    AuthorityReply::new(AuthorityStatus::new(103, "Lote recebido com sucesso")).with_receipt(receipt)
}

#[allow(dead_code)]
pub fn still_processing(receipt: &str) -> AuthorityReply {
    AuthorityReply::new(AuthorityStatus::new(105, "Lote em processamento")).with_receipt(receipt)
}

#[allow(dead_code)]
pub fn event_registered(protocol: &str) -> AuthorityReply {
    AuthorityReply::new(AuthorityStatus::new(135, "Evento registrado e vinculado a NF-e"))
        .with_protocol(protocol)
        .with_timestamp(issued_at())
}

#[allow(dead_code)]
pub fn reply(code: u16, message: &str) -> AuthorityReply {
    AuthorityReply::new(AuthorityStatus::new(code, message))
}

/// One scripted answer of the fake authority.
#[allow(dead_code)]
pub enum Step {
    Reply(AuthorityReply),
    Timeout,
}

/// Answers in order, whatever the operation, and records what was called.
#[allow(dead_code)]
#[derive(Default)]
pub struct Script {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<&'static str>>,
    payloads: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl Script {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            ..Self::default()
        })
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().expect("steps").push_back(step);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("calls").clone()
    }

    /// Signed XML of every document, event and void range sent.
    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().expect("payloads").clone()
    }

    fn next(&self, call: &'static str, payload: Option<&str>) -> Result<AuthorityReply, TransportError> {
        self.calls.lock().expect("calls").push(call);
        if let Some(payload) = payload {
            self.payloads.lock().expect("payloads").push(payload.to_string());
        }
        match self.steps.lock().expect("steps").pop_front() {
            Some(Step::Reply(reply)) => Ok(reply),
            Some(Step::Timeout) => Err(TransportError::Timeout(Duration::from_secs(60))),
            None => Err(TransportError::UnexpectedShape("scripted reply")),
        }
    }
}

#[allow(dead_code)]
pub struct ScriptedTransport {
    script: Arc<Script>,
}

#[async_trait]
impl AuthorityTransport for ScriptedTransport {
    async fn submit_for_authorization(
        &self,
        document: &SignedDocument,
        _batch_id: u64,
        _synchronous: bool,
    ) -> Result<AuthorityReply, TransportError> {
        self.script.next("authorize", Some(document.xml()))
    }

    async fn poll_receipt(&self, _receipt: &str) -> Result<AuthorityReply, TransportError> {
        self.script.next("poll", None)
    }

    async fn query_by_access_key(&self, _key: &AccessKey) -> Result<AuthorityReply, TransportError> {
        self.script.next("query", None)
    }

    async fn submit_event(&self, event: &SignedEvent, _batch_id: u64) -> Result<AuthorityReply, TransportError> {
        self.script.next("event", Some(event.xml()))
    }

    async fn submit_void_range(&self, range: &SignedVoidRange) -> Result<AuthorityReply, TransportError> {
        self.script.next("void", Some(range.xml()))
    }

    async fn service_status(&self) -> Result<AuthorityReply, TransportError> {
        self.script.next("status", None)
    }
}

#[allow(dead_code)]
pub struct ScriptedConnector {
    script: Arc<Script>,
}

impl TransportConnector for ScriptedConnector {
    fn connect(
        &self,
        _environment: Environment,
        _region: Region,
        _key: &KeyMaterial,
    ) -> Result<Box<dyn AuthorityTransport>, TransportError> {
        Ok(Box::new(ScriptedTransport {
            script: Arc::clone(&self.script),
        }))
    }
}

/// Engine wired to in-memory collaborators and a scripted authority.
#[allow(dead_code)]
pub struct Harness {
    pub engine: Arc<FiscalEngine>,
    pub tenant: TenantId,
    pub records: Arc<InMemoryRecordStore>,
    pub series: Arc<InMemorySeriesCounter>,
    pub script: Arc<Script>,
}

#[allow(dead_code)]
pub fn harness(steps: Vec<Step>) -> Harness {
    harness_with_profile(sample_profile(), steps)
}

#[allow(dead_code)]
pub fn harness_with_profile(profile: FiscalProfile, steps: Vec<Step>) -> Harness {
    let tenant = TenantId::new("farma");
    let profiles = StaticProfileStore::new().with_profile(tenant.clone(), profile);
    let series = Arc::new(InMemorySeriesCounter::new());
    series
        .open_series(CNPJ, 1, DocumentKind::Exit, 1)
        .expect("open series");
    let records = Arc::new(InMemoryRecordStore::new());
    let script = Script::new(steps);
    let config = Config::new(bundle_key()).with_poll_policy(PollPolicy::new(10, Duration::ZERO));
    let engine = FiscalEngine::new(
        config,
        Arc::new(profiles),
        series.clone(),
        records.clone(),
        Arc::new(ScriptedConnector {
            script: Arc::clone(&script),
        }),
    );
    Harness {
        engine: Arc::new(engine),
        tenant,
        records,
        series,
        script,
    }
}
