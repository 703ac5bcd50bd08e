//! SOAP 1.2 request bodies and response extraction.
//!
//! Parsing happens synchronously on the response text; libxml documents never
//! cross an await point.
use chrono::DateTime;
use libxml::{parser::Parser, tree::Document, xpath};
use serde::ser::{Serialize, SerializeStruct, Serializer};

use super::{AuthorityReply, TransportError, endpoints::Service};
use crate::{
    access_key::AccessKey,
    config::{Environment, Region},
    document::{
        events::{SignedEvent, SignedVoidRange},
        sign::SignedDocument,
        xml::{
            XmlFormat,
            constants::{EVENT_VERSION, NFE_NS, NFE_VERSION},
            serialize_element,
        },
    },
    status::AuthorityStatus,
};

const SOAP_TEMPLATE: &str = include_str!("../../assets/templates/soap_envelope.xml");

/// Which `cStat` describes the operation's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusSource {
    /// Per-document protocol or event status wins over the batch status.
    Inner,
    /// The top-level status is the answer (situation queries).
    Outer,
}

pub(crate) fn envelope(service: Service, body: &str) -> String {
    SOAP_TEMPLATE
        .replace("{wsdl_namespace}", &service.wsdl_namespace())
        .replace("{body}", body)
}

pub(crate) fn authorization_body(document: &SignedDocument, batch_id: u64, synchronous: bool) -> String {
    format!(
        "<enviNFe xmlns=\"{NFE_NS}\" versao=\"{NFE_VERSION}\"><idLote>{batch_id}</idLote><indSinc>{}</indSinc>{}</enviNFe>",
        u8::from(synchronous),
        document.xml()
    )
}

pub(crate) fn event_body(event: &SignedEvent, batch_id: u64) -> String {
    format!(
        "<envEvento xmlns=\"{NFE_NS}\" versao=\"{EVENT_VERSION}\"><idLote>{batch_id}</idLote>{}</envEvento>",
        event.xml()
    )
}

pub(crate) fn void_body(range: &SignedVoidRange) -> String {
    range.xml().to_string()
}

pub(crate) fn receipt_body(environment: Environment, receipt: &str) -> Result<String, TransportError> {
    serialize_body(&ReceiptQuery {
        environment,
        receipt,
    })
}

pub(crate) fn protocol_query_body(environment: Environment, key: &AccessKey) -> Result<String, TransportError> {
    serialize_body(&ProtocolQuery { environment, key })
}

pub(crate) fn status_body(environment: Environment, region: Region) -> Result<String, TransportError> {
    serialize_body(&StatusQuery {
        environment,
        region,
    })
}

fn serialize_body<T: Serialize>(body: &T) -> Result<String, TransportError> {
    serialize_element(body, XmlFormat::Compact)
        .map_err(|e| TransportError::MalformedEnvelope(e.to_string()))
}

struct ReceiptQuery<'a> {
    environment: Environment,
    receipt: &'a str,
}

impl Serialize for ReceiptQuery<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("consReciNFe", 4)?;
        st.serialize_field("@xmlns", NFE_NS)?;
        st.serialize_field("@versao", NFE_VERSION)?;
        st.serialize_field("tpAmb", &self.environment.code())?;
        st.serialize_field("nRec", self.receipt)?;
        st.end()
    }
}

struct ProtocolQuery<'a> {
    environment: Environment,
    key: &'a AccessKey,
}

impl Serialize for ProtocolQuery<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("consSitNFe", 5)?;
        st.serialize_field("@xmlns", NFE_NS)?;
        st.serialize_field("@versao", NFE_VERSION)?;
        st.serialize_field("tpAmb", &self.environment.code())?;
        st.serialize_field("xServ", "CONSULTAR")?;
        st.serialize_field("chNFe", self.key.as_str())?;
        st.end()
    }
}

struct StatusQuery {
    environment: Environment,
    region: Region,
}

impl Serialize for StatusQuery {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("consStatServ", 5)?;
        st.serialize_field("@xmlns", NFE_NS)?;
        st.serialize_field("@versao", NFE_VERSION)?;
        st.serialize_field("tpAmb", &self.environment.code())?;
        st.serialize_field("cUF", &self.region.code())?;
        st.serialize_field("xServ", "STATUS")?;
        st.end()
    }
}

const INNER_STATUS: &str = "//*[local-name()='infProt' or local-name()='infEvento']";
const OUTER_STATUS: &str = "//*[local-name()='Body']//*[local-name()='cStat'][not(ancestor::*[local-name()='infProt' or local-name()='infEvento'])]";

/// Extract status, protocol, receipt and timestamp from a response envelope.
///
/// # Errors
/// [`TransportError::MalformedEnvelope`] if the text is not a SOAP envelope,
/// [`TransportError::Fault`] for SOAP faults and
/// [`TransportError::UnexpectedShape`] when no status element is present.
pub(crate) fn parse_reply(xml: &str, source: StatusSource) -> Result<AuthorityReply, TransportError> {
    let doc = Parser::default()
        .parse_string(xml)
        .map_err(|e| TransportError::MalformedEnvelope(format!("{e:?}")))?;
    let ctx = xpath::Context::new(&doc)
        .map_err(|e| TransportError::MalformedEnvelope(format!("XPath context error: {e:?}")))?;

    if let Some(fault) = first_text(&ctx, "//*[local-name()='Fault']//*[local-name()='Text' or local-name()='faultstring']") {
        return Err(TransportError::Fault(fault));
    }
    if nodes(&ctx, "//*[local-name()='Body']").is_empty() {
        return Err(TransportError::MalformedEnvelope("missing SOAP body".into()));
    }

    let outer = status_at(&ctx, OUTER_STATUS);
    let inner = status_at(&ctx, &format!("{INNER_STATUS}/*[local-name()='cStat']"));
    let (status, batch_status) = match (source, inner, outer) {
        (StatusSource::Inner, Some(inner), outer) => (inner, outer),
        (StatusSource::Inner, None, Some(outer)) => (outer, None),
        (StatusSource::Outer, inner, Some(outer)) => (outer, inner),
        (StatusSource::Outer, Some(inner), None) => (inner, None),
        (_, None, None) => return Err(TransportError::UnexpectedShape("cStat")),
    };

    let mut reply = AuthorityReply::new(status);
    reply.batch_status = batch_status;
    reply.protocol = first_text(&ctx, "//*[local-name()='nProt']");
    reply.receipt = first_text(&ctx, "//*[local-name()='infRec']/*[local-name()='nRec']")
        .or_else(|| first_text(&ctx, "//*[local-name()='nRec']"));
    reply.timestamp = [
        "//*[local-name()='infProt']/*[local-name()='dhRecbto']",
        "//*[local-name()='infEvento']/*[local-name()='dhRegEvento']",
        "//*[local-name()='dhRecbto']",
    ]
    .iter()
    .find_map(|expr| first_text(&ctx, expr))
    .and_then(|value| DateTime::parse_from_rfc3339(&value).ok());
    reply.protocol_xml = nodes(&ctx, "//*[local-name()='protNFe']")
        .first()
        .map(|node| doc_string(&doc, node));
    Ok(reply)
}

fn status_at(ctx: &xpath::Context, cstat_expr: &str) -> Option<AuthorityStatus> {
    let node = nodes(ctx, cstat_expr).into_iter().next()?;
    let code = node.get_content().trim().parse::<u16>().ok()?;
    let message = node
        .get_parent()
        .and_then(|parent| {
            parent
                .get_child_elements()
                .into_iter()
                .find(|child| child.get_name() == "xMotivo")
        })
        .map(|motivo| motivo.get_content().trim().to_string())
        .unwrap_or_default();
    Some(AuthorityStatus::new(code, message))
}

fn nodes(ctx: &xpath::Context, expr: &str) -> Vec<libxml::tree::Node> {
    ctx.evaluate(expr)
        .map(|object| object.get_nodes_as_vec())
        .unwrap_or_default()
}

fn first_text(ctx: &xpath::Context, expr: &str) -> Option<String> {
    nodes(ctx, expr)
        .first()
        .map(|node| node.get_content().trim().to_string())
        .filter(|value| !value.is_empty())
}

fn doc_string(doc: &Document, node: &libxml::tree::Node) -> String {
    doc.node_to_string(node)
}
