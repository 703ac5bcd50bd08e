//! XML serialization for fiscal documents.
pub(crate) mod constants;

use super::{
    Address, IcmsTax, PartyDocument, Payment, PaymentMethod, Recipient, Transport,
    builder::{FiscalDocument, IssuerSection, ItemSection, TotalsSection},
};
use crate::config::Environment;

use constants::{APP_VERSION, NFE_NS, NFE_VERSION};
use helpers::{FixedPrecision, date, date_time, money};
use quick_xml::se::{SeError, Serializer as QuickXmlSerializer};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

pub(crate) const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Recipient name the authority requires in homologation.
const HOMOLOGATION_RECIPIENT: &str = "NF-E EMITIDA EM AMBIENTE DE HOMOLOGACAO - SEM VALOR FISCAL";

/// XML serialization error.
#[derive(Debug, Error)]
pub enum DocumentXmlError {
    #[error("failed to serialize document to XML: {source}")]
    Serialize {
        #[from]
        source: SeError,
    },
}

/// XML formatting options.
#[derive(Debug, Clone, Copy, Default)]
pub enum XmlFormat {
    #[default]
    Compact,
    Pretty {
        indent_char: char,
        indent_size: usize,
    },
}

/// Serialize a document to XML.
///
/// Signing always works on the compact form; pretty output is for humans.
pub trait ToXml {
    fn to_xml_with_format(&self, format: XmlFormat) -> Result<String, DocumentXmlError>;

    fn to_xml(&self) -> Result<String, DocumentXmlError> {
        self.to_xml_with_format(XmlFormat::Compact)
    }

    fn to_xml_pretty(&self) -> Result<String, DocumentXmlError> {
        self.to_xml_with_format(XmlFormat::Pretty {
            indent_char: ' ',
            indent_size: 2,
        })
    }
}

impl ToXml for FiscalDocument {
    fn to_xml_with_format(&self, format: XmlFormat) -> Result<String, DocumentXmlError> {
        let body = serialize_element(&NfeXml(self), format)?;
        Ok(format!("{XML_DECLARATION}{body}"))
    }
}

impl FiscalDocument {
    /// Standalone `infNFe` carrying its namespace, the signed element.
    pub(crate) fn inf_nfe_xml(&self) -> Result<String, DocumentXmlError> {
        serialize_element(
            &InfNfeXml {
                document: self,
                namespace: Some(NFE_NS),
            },
            XmlFormat::Compact,
        )
    }
}

/// Serialize `value` as a root element without an XML declaration.
pub(crate) fn serialize_element<T: Serialize>(
    value: &T,
    format: XmlFormat,
) -> Result<String, DocumentXmlError> {
    let mut buffer = String::with_capacity(4096);
    {
        let mut serializer = QuickXmlSerializer::new(&mut buffer);
        if let XmlFormat::Pretty {
            indent_char,
            indent_size,
        } = format
        {
            serializer.indent(indent_char, indent_size);
        }
        value.serialize(serializer)?;
    }
    Ok(buffer)
}

/// `nfeProc`: the signed document plus the authority's protocol stamp.
pub fn distribution_xml(signed_nfe: &str, protocol_xml: &str) -> String {
    format!(
        "{XML_DECLARATION}<nfeProc xmlns=\"{NFE_NS}\" versao=\"{NFE_VERSION}\">{signed_nfe}{protocol_xml}</nfeProc>"
    )
}

pub(crate) mod helpers {
    use chrono::{DateTime, FixedOffset, NaiveDate};
    use serde::ser::{Serialize, Serializer};
    use std::fmt::{self, Display, Formatter};

    pub(crate) struct FixedPrecision {
        value: f64,
        precision: usize,
    }

    impl FixedPrecision {
        pub(crate) fn new(value: f64, precision: usize) -> Self {
            Self { value, precision }
        }
    }

    impl Display for FixedPrecision {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            // Avoid rendering "-0.00".
            let value = if self.value == 0.0 { 0.0 } else { self.value };
            write!(f, "{:.*}", self.precision, value)
        }
    }

    impl Serialize for FixedPrecision {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(self)
        }
    }

    pub(crate) fn money(value: f64) -> FixedPrecision {
        FixedPrecision::new(value, 2)
    }

    pub(crate) fn date_time(value: &DateTime<FixedOffset>) -> String {
        value.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
    }

    pub(crate) fn date(value: &NaiveDate) -> String {
        value.format("%Y-%m-%d").to_string()
    }
}

struct NfeXml<'a>(&'a FiscalDocument);

impl Serialize for NfeXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut root = s.serialize_struct("NFe", 2)?;
        root.serialize_field("@xmlns", NFE_NS)?;
        root.serialize_field(
            "infNFe",
            &InfNfeXml {
                document: self.0,
                namespace: None,
            },
        )?;
        root.end()
    }
}

struct InfNfeXml<'a> {
    document: &'a FiscalDocument,
    namespace: Option<&'static str>,
}

impl Serialize for InfNfeXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let doc = self.document;
        let mut st = s.serialize_struct("infNFe", 12)?;
        if let Some(namespace) = self.namespace {
            st.serialize_field("@xmlns", namespace)?;
        }
        st.serialize_field("@Id", &doc.access_key.document_id())?;
        st.serialize_field("@versao", NFE_VERSION)?;
        st.serialize_field("ide", &IdeXml(doc))?;
        st.serialize_field("emit", &EmitXml(&doc.issuer))?;
        st.serialize_field(
            "dest",
            &DestXml {
                recipient: &doc.recipient,
                environment: doc.environment,
            },
        )?;
        for item in &doc.items {
            st.serialize_field("det", &DetXml(item))?;
        }
        st.serialize_field("total", &TotalXml(&doc.totals))?;
        st.serialize_field("transp", &TranspXml(&doc.transport))?;
        st.serialize_field("pag", &PagXml(&doc.payments))?;
        if let Some(notes) = &doc.notes {
            st.serialize_field("infAdic", &InfAdicXml(notes))?;
        }
        st.end()
    }
}

struct IdeXml<'a>(&'a FiscalDocument);

impl Serialize for IdeXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let doc = self.0;
        let key = &doc.access_key;
        let mut st = s.serialize_struct("ide", 21)?;
        st.serialize_field("cUF", &key.region().code())?;
        st.serialize_field("cNF", &format!("{:08}", key.random_code()))?;
        st.serialize_field("natOp", &doc.operation_nature)?;
        st.serialize_field("mod", &key.model())?;
        st.serialize_field("serie", &doc.series)?;
        st.serialize_field("nNF", &doc.number)?;
        st.serialize_field("dhEmi", &date_time(&doc.issued_at))?;
        st.serialize_field("tpNF", &doc.kind.operation_type())?;
        st.serialize_field("idDest", &doc.destination())?;
        st.serialize_field("cMunFG", &doc.issuer.address.city_code)?;
        // DANFE portrait.
        st.serialize_field("tpImp", &1u8)?;
        st.serialize_field("tpEmis", &key.emission_type())?;
        st.serialize_field("cDV", &key.check_digit())?;
        st.serialize_field("tpAmb", &doc.environment.code())?;
        st.serialize_field("finNFe", &doc.kind.purpose())?;
        st.serialize_field("indFinal", &u8::from(doc.final_consumer()))?;
        st.serialize_field("indPres", &9u8)?;
        st.serialize_field("procEmi", &0u8)?;
        st.serialize_field("verProc", APP_VERSION)?;
        if let Some(referenced) = &doc.referenced_key {
            st.serialize_field("NFref", &RefXml(referenced.as_str()))?;
        }
        st.end()
    }
}

struct RefXml<'a>(&'a str);

impl Serialize for RefXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("NFref", 1)?;
        st.serialize_field("refNFe", self.0)?;
        st.end()
    }
}

struct EmitXml<'a>(&'a IssuerSection);

impl Serialize for EmitXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let issuer = self.0;
        let mut st = s.serialize_struct("emit", 6)?;
        st.serialize_field("CNPJ", &issuer.cnpj)?;
        st.serialize_field("xNome", &issuer.legal_name)?;
        if let Some(trade_name) = &issuer.trade_name {
            st.serialize_field("xFant", trade_name)?;
        }
        st.serialize_field("enderEmit", &AddressXml(&issuer.address))?;
        st.serialize_field("IE", &issuer.state_registration)?;
        st.serialize_field("CRT", &issuer.tax_regime.code())?;
        st.end()
    }
}

struct AddressXml<'a>(&'a Address);

impl Serialize for AddressXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let address = self.0;
        let mut st = s.serialize_struct("ender", 11)?;
        st.serialize_field("xLgr", &address.street)?;
        st.serialize_field("nro", &address.number)?;
        if let Some(complement) = &address.complement {
            st.serialize_field("xCpl", complement)?;
        }
        st.serialize_field("xBairro", &address.district)?;
        st.serialize_field("cMun", &address.city_code)?;
        st.serialize_field("xMun", &address.city)?;
        st.serialize_field("UF", address.region.as_str())?;
        st.serialize_field("CEP", &address.postal_code)?;
        st.serialize_field("cPais", "1058")?;
        st.serialize_field("xPais", "BRASIL")?;
        if let Some(phone) = &address.phone {
            st.serialize_field("fone", phone)?;
        }
        st.end()
    }
}

struct DestXml<'a> {
    recipient: &'a Recipient,
    environment: Environment,
}

impl Serialize for DestXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let recipient = self.recipient;
        let mut st = s.serialize_struct("dest", 7)?;
        match &recipient.document {
            PartyDocument::Cnpj(cnpj) => st.serialize_field("CNPJ", cnpj)?,
            PartyDocument::Cpf(cpf) => st.serialize_field("CPF", cpf)?,
        }
        let name = match self.environment {
            Environment::Production => recipient.name.as_str(),
            Environment::Homologation => HOMOLOGATION_RECIPIENT,
        };
        st.serialize_field("xNome", name)?;
        st.serialize_field("enderDest", &AddressXml(&recipient.address))?;
        match recipient.state_registration.as_deref() {
            Some(ie) if ie.eq_ignore_ascii_case("ISENTO") => {
                st.serialize_field("indIEDest", &2u8)?;
            }
            Some(ie) => {
                st.serialize_field("indIEDest", &1u8)?;
                st.serialize_field("IE", ie)?;
            }
            None => st.serialize_field("indIEDest", &9u8)?,
        }
        if let Some(email) = &recipient.email {
            st.serialize_field("email", email)?;
        }
        st.end()
    }
}

struct DetXml<'a>(&'a ItemSection);

impl Serialize for DetXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let section = self.0;
        let mut st = s.serialize_struct("det", 4)?;
        st.serialize_field("@nItem", &section.number)?;
        st.serialize_field("prod", &ProdXml(section))?;
        st.serialize_field("imposto", &ImpostoXml(section))?;
        if let Some(info) = &section.additional_info {
            st.serialize_field("infAdProd", info)?;
        }
        st.end()
    }
}

struct ProdXml<'a>(&'a ItemSection);

impl Serialize for ProdXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let section = self.0;
        let item = &section.item;
        let gtin = item.gtin.as_deref().unwrap_or("SEM GTIN");
        let mut st = s.serialize_struct("prod", 20)?;
        st.serialize_field("cProd", &item.code)?;
        st.serialize_field("cEAN", gtin)?;
        st.serialize_field("xProd", &item.description)?;
        st.serialize_field("NCM", &item.ncm)?;
        st.serialize_field("CFOP", &section.cfop)?;
        st.serialize_field("uCom", &item.unit)?;
        st.serialize_field("qCom", &FixedPrecision::new(item.quantity, 4))?;
        st.serialize_field("vUnCom", &FixedPrecision::new(item.unit_price, 10))?;
        st.serialize_field("vProd", &money(section.gross))?;
        st.serialize_field("cEANTrib", gtin)?;
        st.serialize_field("uTrib", &item.unit)?;
        st.serialize_field("qTrib", &FixedPrecision::new(item.quantity, 4))?;
        st.serialize_field("vUnTrib", &FixedPrecision::new(item.unit_price, 10))?;
        if item.discount > 0.0 {
            st.serialize_field("vDesc", &money(item.discount))?;
        }
        st.serialize_field("indTot", &1u8)?;
        if let Some(batch) = &item.batch {
            st.serialize_field("rastro", &RastroXml(batch))?;
        }
        if let Some(medicine) = &item.medicine {
            st.serialize_field("med", &MedXml(medicine))?;
        }
        st.end()
    }
}

struct RastroXml<'a>(&'a super::Batch);

impl Serialize for RastroXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let batch = self.0;
        let mut st = s.serialize_struct("rastro", 4)?;
        st.serialize_field("nLote", &batch.number)?;
        st.serialize_field("qLote", &FixedPrecision::new(batch.quantity, 3))?;
        st.serialize_field("dFab", &date(&batch.manufactured_on))?;
        st.serialize_field("dVal", &date(&batch.expires_on))?;
        st.end()
    }
}

struct MedXml<'a>(&'a super::MedicineInfo);

impl Serialize for MedXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("med", 2)?;
        st.serialize_field("cProdANVISA", &self.0.anvisa_code)?;
        st.serialize_field("vPMC", &money(self.0.max_consumer_price))?;
        st.end()
    }
}

struct ImpostoXml<'a>(&'a ItemSection);

impl Serialize for ImpostoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let section = self.0;
        let tax = &section.item.tax;
        let mut st = s.serialize_struct("imposto", 4)?;
        st.serialize_field("ICMS", &IcmsXml(section))?;
        if let Some(ipi) = &tax.ipi {
            st.serialize_field("IPI", &IpiXml { ipi, section })?;
        }
        st.serialize_field(
            "PIS",
            &ContributionXml {
                tax: &tax.pis,
                base: section.pis_base,
                amount: section.pis_amount,
                tags: PIS_TAGS,
            },
        )?;
        st.serialize_field(
            "COFINS",
            &ContributionXml {
                tax: &tax.cofins,
                base: section.cofins_base,
                amount: section.cofins_amount,
                tags: COFINS_TAGS,
            },
        )?;
        st.end()
    }
}

struct IcmsXml<'a>(&'a ItemSection);

impl Serialize for IcmsXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let section = self.0;
        let mut st = s.serialize_struct("ICMS", 1)?;
        match &section.item.tax.icms {
            IcmsTax::Taxed { origin, rate } => st.serialize_field(
                "ICMS00",
                &Icms00Xml {
                    origin: *origin,
                    base: section.icms_base,
                    rate: *rate,
                    amount: section.icms_amount,
                },
            )?,
            IcmsTax::Exempt { origin, cst } => st.serialize_field(
                "ICMS40",
                &CodeOnlyXml {
                    origin: Some(*origin),
                    code_tag: "CST",
                    code: cst,
                },
            )?,
            IcmsTax::Simples { origin, csosn } => st.serialize_field(
                "ICMSSN102",
                &CodeOnlyXml {
                    origin: Some(*origin),
                    code_tag: "CSOSN",
                    code: csosn,
                },
            )?,
        }
        st.end()
    }
}

struct Icms00Xml {
    origin: u8,
    base: f64,
    rate: f64,
    amount: f64,
}

impl Serialize for Icms00Xml {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("ICMS00", 6)?;
        st.serialize_field("orig", &self.origin)?;
        st.serialize_field("CST", "00")?;
        // Base is the operation value.
        st.serialize_field("modBC", &3u8)?;
        st.serialize_field("vBC", &money(self.base))?;
        st.serialize_field("pICMS", &FixedPrecision::new(self.rate, 2))?;
        st.serialize_field("vICMS", &money(self.amount))?;
        st.end()
    }
}

struct CodeOnlyXml<'a> {
    origin: Option<u8>,
    code_tag: &'static str,
    code: &'a str,
}

impl Serialize for CodeOnlyXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("group", 2)?;
        if let Some(origin) = self.origin {
            st.serialize_field("orig", &origin)?;
        }
        st.serialize_field(self.code_tag, self.code)?;
        st.end()
    }
}

struct IpiXml<'a> {
    ipi: &'a super::IpiTax,
    section: &'a ItemSection,
}

impl Serialize for IpiXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("IPI", 2)?;
        st.serialize_field("cEnq", &self.ipi.framework)?;
        if self.ipi.is_taxed() {
            st.serialize_field(
                "IPITrib",
                &RatedXml {
                    cst: &self.ipi.cst,
                    base: self.section.ipi_base,
                    rate: self.ipi.rate,
                    amount: self.section.ipi_amount,
                    tags: ("pIPI", "vIPI"),
                },
            )?;
        } else {
            st.serialize_field(
                "IPINT",
                &CodeOnlyXml {
                    origin: None,
                    code_tag: "CST",
                    code: &self.ipi.cst,
                },
            )?;
        }
        st.end()
    }
}

struct ContributionTags {
    rated: &'static str,
    non_taxed: &'static str,
    other: &'static str,
    rate: &'static str,
    amount: &'static str,
}

const PIS_TAGS: ContributionTags = ContributionTags {
    rated: "PISAliq",
    non_taxed: "PISNT",
    other: "PISOutr",
    rate: "pPIS",
    amount: "vPIS",
};

const COFINS_TAGS: ContributionTags = ContributionTags {
    rated: "COFINSAliq",
    non_taxed: "COFINSNT",
    other: "COFINSOutr",
    rate: "pCOFINS",
    amount: "vCOFINS",
};

struct ContributionXml<'a> {
    tax: &'a super::ContributionTax,
    base: f64,
    amount: f64,
    tags: ContributionTags,
}

impl Serialize for ContributionXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("contribution", 1)?;
        if self.tax.is_non_taxed() {
            st.serialize_field(
                self.tags.non_taxed,
                &CodeOnlyXml {
                    origin: None,
                    code_tag: "CST",
                    code: &self.tax.cst,
                },
            )?;
        } else {
            let tag = if self.tax.is_rate_based() {
                self.tags.rated
            } else {
                self.tags.other
            };
            st.serialize_field(
                tag,
                &RatedXml {
                    cst: &self.tax.cst,
                    base: self.base,
                    rate: self.tax.rate,
                    amount: self.amount,
                    tags: (self.tags.rate, self.tags.amount),
                },
            )?;
        }
        st.end()
    }
}

struct RatedXml<'a> {
    cst: &'a str,
    base: f64,
    rate: f64,
    amount: f64,
    tags: (&'static str, &'static str),
}

impl Serialize for RatedXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("rated", 4)?;
        st.serialize_field("CST", self.cst)?;
        st.serialize_field("vBC", &money(self.base))?;
        st.serialize_field(self.tags.0, &FixedPrecision::new(self.rate, 4))?;
        st.serialize_field(self.tags.1, &money(self.amount))?;
        st.end()
    }
}

struct TotalXml<'a>(&'a TotalsSection);

impl Serialize for TotalXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("total", 1)?;
        st.serialize_field("ICMSTot", &IcmsTotXml(self.0))?;
        st.end()
    }
}

struct IcmsTotXml<'a>(&'a TotalsSection);

impl Serialize for IcmsTotXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let totals = self.0;
        let zero = money(0.0);
        let mut st = s.serialize_struct("ICMSTot", 19)?;
        st.serialize_field("vBC", &money(totals.icms_base))?;
        st.serialize_field("vICMS", &money(totals.icms_amount))?;
        st.serialize_field("vICMSDeson", &zero)?;
        st.serialize_field("vFCP", &zero)?;
        st.serialize_field("vBCST", &zero)?;
        st.serialize_field("vST", &zero)?;
        st.serialize_field("vFCPST", &zero)?;
        st.serialize_field("vFCPSTRet", &zero)?;
        st.serialize_field("vProd", &money(totals.products))?;
        st.serialize_field("vFrete", &zero)?;
        st.serialize_field("vSeg", &zero)?;
        st.serialize_field("vDesc", &money(totals.discount))?;
        st.serialize_field("vII", &zero)?;
        st.serialize_field("vIPI", &money(totals.ipi))?;
        st.serialize_field("vIPIDevol", &zero)?;
        st.serialize_field("vPIS", &money(totals.pis))?;
        st.serialize_field("vCOFINS", &money(totals.cofins))?;
        st.serialize_field("vOutro", &zero)?;
        st.serialize_field("vNF", &money(totals.total))?;
        st.end()
    }
}

struct TranspXml<'a>(&'a Transport);

impl Serialize for TranspXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let transport = self.0;
        let mut st = s.serialize_struct("transp", 2)?;
        st.serialize_field("modFrete", &transport.mode.code())?;
        if let Some(carrier) = &transport.carrier {
            st.serialize_field("transporta", &CarrierXml(carrier))?;
        }
        st.end()
    }
}

struct CarrierXml<'a>(&'a super::Carrier);

impl Serialize for CarrierXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("transporta", 2)?;
        st.serialize_field("CNPJ", &self.0.cnpj)?;
        st.serialize_field("xNome", &self.0.name)?;
        st.end()
    }
}

struct PagXml<'a>(&'a [Payment]);

impl Serialize for PagXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("pag", self.0.len().max(1))?;
        if self.0.is_empty() {
            st.serialize_field(
                "detPag",
                &DetPagXml(&Payment {
                    method: PaymentMethod::NoPayment,
                    amount: 0.0,
                }),
            )?;
        }
        for payment in self.0 {
            st.serialize_field("detPag", &DetPagXml(payment))?;
        }
        st.end()
    }
}

struct DetPagXml<'a>(&'a Payment);

impl Serialize for DetPagXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("detPag", 2)?;
        st.serialize_field("tPag", self.0.method.code())?;
        st.serialize_field("vPag", &money(self.0.amount))?;
        st.end()
    }
}

struct InfAdicXml<'a>(&'a str);

impl Serialize for InfAdicXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("infAdic", 1)?;
        st.serialize_field("infCpl", self.0)?;
        st.end()
    }
}

#[cfg(test)]
mod tests {
    use super::helpers::*;

    #[test]
    fn fixed_precision_pads_and_never_prints_negative_zero() {
        assert_eq!(money(100.0).to_string(), "100.00");
        assert_eq!(money(-0.0).to_string(), "0.00");
        assert_eq!(FixedPrecision::new(2.0, 4).to_string(), "2.0000");
        assert_eq!(FixedPrecision::new(12.5, 10).to_string(), "12.5000000000");
    }

    #[test]
    fn date_time_keeps_offset() {
        let value = chrono::DateTime::parse_from_rfc3339("2024-05-10T09:30:00-03:00").unwrap();
        assert_eq!(date_time(&value), "2024-05-10T09:30:00-03:00");
        let day = chrono::NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();
        assert_eq!(date(&day), "2025-01-31");
    }

    #[test]
    fn distribution_wraps_document_and_protocol() {
        let proc = super::distribution_xml("<NFe/>", "<protNFe/>");
        assert!(proc.starts_with(super::XML_DECLARATION));
        assert!(proc.contains(
            "<nfeProc xmlns=\"http://www.portalfiscal.inf.br/nfe\" versao=\"4.00\"><NFe/><protNFe/></nfeProc>"
        ));
    }
}
