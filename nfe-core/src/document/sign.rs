//! Enveloped XML-DSig for documents, events and void ranges.
//!
//! Every signed payload follows the same recipe: the referenced element is
//! canonicalized (C14N 1.0, inclusive), digested with SHA-1, and the canonical
//! `SignedInfo` is signed with RSA-SHA1 using the issuer's certificate key.
//! The resulting `Signature` is appended as the last child of the wrapper
//! element, right after the signed element.
use base64ct::{Base64, Encoding};
use libxml::{
    parser::Parser,
    tree::{Document, Node, c14n},
    xpath,
};
use openssl::{
    hash::MessageDigest,
    sign::{Signer, Verifier},
    x509::X509,
};
use thiserror::Error;
use tracing::debug;

use super::{
    builder::FiscalDocument,
    xml::{
        DocumentXmlError, XML_DECLARATION, distribution_xml,
        constants::{DS_NS, NFE_NS, SIGNATURE_TEMPLATE, SIGNED_INFO_TEMPLATE},
    },
};
use crate::{
    access_key::AccessKey,
    certificate::{CertificateError, KeyMaterial},
    config::{Environment, Region},
};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing error: {0}")]
    Signing(String),
    #[error("signature verification failed: {0}")]
    Verification(String),
    #[error(transparent)]
    Xml(#[from] DocumentXmlError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// Values produced while signing one element.
#[derive(Debug, Clone)]
pub(crate) struct SignatureParts {
    pub(crate) canonical_element: String,
    pub(crate) digest_value: String,
    pub(crate) signature_value: String,
    pub(crate) signature_xml: String,
}

/// Signs payloads with one certificate.
pub struct DocumentSigner<'a> {
    key: &'a KeyMaterial,
}

impl<'a> DocumentSigner<'a> {
    pub fn new(key: &'a KeyMaterial) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &KeyMaterial {
        self.key
    }

    /// Sign a built document, producing the `NFe` element ready to submit.
    ///
    /// # Errors
    /// Returns [`SigningError`] if serialization, canonicalization or the RSA
    /// operation fails.
    pub fn sign_document(&self, document: &FiscalDocument) -> Result<SignedDocument, SigningError> {
        let access_key = document.access_key();
        let inner = document.inf_nfe_xml()?;
        let parts = self.sign_enveloped(&inner, &access_key.document_id())?;
        let xml = format!(
            "<NFe xmlns=\"{NFE_NS}\">{}{}</NFe>",
            parts.canonical_element, parts.signature_xml
        );
        ensure_well_formed(&xml)?;
        debug!(access_key = %access_key, "document signed");

        Ok(SignedDocument {
            access_key: access_key.clone(),
            environment: document.environment(),
            region: document.region(),
            xml,
            digest_value: parts.digest_value,
            signature_value: parts.signature_value,
        })
    }

    /// Canonicalize `element_xml`, digest it and build the `Signature` that
    /// references `#reference_id`.
    ///
    /// `element_xml` must be a standalone element declaring its namespace.
    pub(crate) fn sign_enveloped(
        &self,
        element_xml: &str,
        reference_id: &str,
    ) -> Result<SignatureParts, SigningError> {
        let canonical_element = canonicalize_fragment(element_xml)?;
        let digest_value = Base64::encode_string(&openssl::sha::sha1(canonical_element.as_bytes()));

        let signed_info = SIGNED_INFO_TEMPLATE
            .replace("{reference_id}", reference_id)
            .replace("{digest_value}", &digest_value);
        let canonical_signed_info = canonicalize_fragment(&signed_info)?;

        let mut signer = Signer::new(MessageDigest::sha1(), self.key.private_key())
            .map_err(|e| SigningError::Signing(format!("signer setup failed: {e}")))?;
        signer
            .update(canonical_signed_info.as_bytes())
            .map_err(|e| SigningError::Signing(format!("signer update failed: {e}")))?;
        let signature = signer
            .sign_to_vec()
            .map_err(|e| SigningError::Signing(format!("RSA signing failed: {e}")))?;
        let signature_value = Base64::encode_string(&signature);

        // SignedInfo goes in last so its content is never rescanned.
        let signature_xml = SIGNATURE_TEMPLATE
            .replace("{signature_value}", &signature_value)
            .replace("{certificate}", &self.key.certificate_base64()?)
            .replace("{signed_info}", &canonical_signed_info);

        Ok(SignatureParts {
            canonical_element,
            digest_value,
            signature_value,
            signature_xml,
        })
    }
}

/// Signed `NFe` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    access_key: AccessKey,
    environment: Environment,
    region: Region,
    xml: String,
    digest_value: String,
    signature_value: String,
}

impl SignedDocument {
    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// The `NFe` element without an XML declaration, as embedded in batches.
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn digest_value(&self) -> &str {
        &self.digest_value
    }

    pub fn signature_value(&self) -> &str {
        &self.signature_value
    }

    /// Standalone file content with the XML declaration.
    pub fn to_file_string(&self) -> String {
        format!("{XML_DECLARATION}{}", self.xml)
    }

    /// `nfeProc` with the authority's `protNFe` attached.
    pub fn distribution_xml(&self, protocol_xml: &str) -> String {
        distribution_xml(&self.xml, protocol_xml)
    }

    /// Check digest and signature against the embedded certificate.
    ///
    /// # Errors
    /// Returns [`SigningError::Verification`] on any mismatch.
    pub fn verify(&self) -> Result<(), SigningError> {
        verify_xml(&self.xml, "infNFe")
    }
}

/// Verify an enveloped signature over the first `element` carrying an `Id`.
///
/// # Errors
/// Returns [`SigningError::Verification`] if the reference, digest or RSA
/// signature does not match, or the signature parts are missing.
pub fn verify_xml(xml: &str, element: &str) -> Result<(), SigningError> {
    let doc = parse(xml)?;
    let ctx = xpath::Context::new(&doc)
        .map_err(|e| SigningError::Verification(format!("XPath context error: {e:?}")))?;

    let signed = first_node(&ctx, &format!("//*[local-name()='{element}'][@Id]"), element)?;
    let id = signed
        .get_attribute("Id")
        .ok_or_else(|| SigningError::Verification(format!("{element} has no Id")))?;

    let reference = first_node(&ctx, "//*[local-name()='Reference']", "Reference")?;
    let uri = reference.get_attribute("URI").unwrap_or_default();
    if uri != format!("#{id}") {
        return Err(SigningError::Verification(format!(
            "reference {uri} does not point at {id}"
        )));
    }

    let canonical = canonicalize_fragment(&standalone(&doc, &signed, NFE_NS))?;
    let digest = Base64::encode_string(&openssl::sha::sha1(canonical.as_bytes()));
    let stored_digest = xpath_text_value(&ctx, "//*[local-name()='DigestValue']", "DigestValue")?;
    if digest != stored_digest {
        return Err(SigningError::Verification("digest mismatch".into()));
    }

    let signed_info = first_node(&ctx, "//*[local-name()='SignedInfo']", "SignedInfo")?;
    let canonical_signed_info = canonicalize_fragment(&standalone(&doc, &signed_info, DS_NS))?;
    let signature = decode(&xpath_text_value(
        &ctx,
        "//*[local-name()='SignatureValue']",
        "SignatureValue",
    )?)?;
    let certificate = decode(&xpath_text_value(
        &ctx,
        "//*[local-name()='X509Certificate']",
        "X509Certificate",
    )?)?;

    let public_key = X509::from_der(&certificate)
        .and_then(|cert| cert.public_key())
        .map_err(|e| SigningError::Verification(format!("embedded certificate: {e}")))?;
    let mut verifier = Verifier::new(MessageDigest::sha1(), &public_key)
        .map_err(|e| SigningError::Verification(e.to_string()))?;
    verifier
        .update(canonical_signed_info.as_bytes())
        .map_err(|e| SigningError::Verification(e.to_string()))?;
    let valid = verifier
        .verify(&signature)
        .map_err(|e| SigningError::Verification(e.to_string()))?;
    if !valid {
        return Err(SigningError::Verification("signature value mismatch".into()));
    }
    Ok(())
}

pub(crate) fn canonicalize_fragment(xml: &str) -> Result<String, SigningError> {
    let doc = parse(xml)?;
    let options = c14n::CanonicalizationOptions {
        mode: c14n::CanonicalizationMode::Canonical1_0,
        inclusive_ns_prefixes: vec![],
        with_comments: false,
    };
    doc.canonicalize(options, None)
        .map_err(|e| SigningError::Signing(format!("failed to canonicalize xml: {e:?}")))
}

pub(crate) fn ensure_well_formed(xml: &str) -> Result<(), SigningError> {
    parse(xml).map(|_| ())
}

fn parse(xml: &str) -> Result<Document, SigningError> {
    Parser::default()
        .parse_string(xml)
        .map_err(|e| SigningError::Signing(format!("XML parse error: {e:?}")))
}

// Serialized subtrees drop inherited namespace declarations; put the default
// namespace back so the fragment canonicalizes as it does in context.
fn standalone(doc: &Document, node: &Node, namespace: &str) -> String {
    let xml = doc.node_to_string(node);
    let tag_end = xml.find('>').unwrap_or(xml.len());
    if xml[..tag_end].contains("xmlns=") {
        return xml;
    }
    let name_end = xml[1..tag_end]
        .find(|c: char| c.is_whitespace() || c == '/')
        .map_or(tag_end, |pos| pos + 1);
    format!(
        "{} xmlns=\"{namespace}\"{}",
        &xml[..name_end],
        &xml[name_end..]
    )
}

fn first_node(ctx: &xpath::Context, expr: &str, label: &str) -> Result<Node, SigningError> {
    ctx.evaluate(expr)
        .map_err(|e| SigningError::Verification(format!("XPath error for {label}: {e:?}")))?
        .get_nodes_as_vec()
        .into_iter()
        .next()
        .ok_or_else(|| SigningError::Verification(format!("missing {label}")))
}

fn xpath_text_value(ctx: &xpath::Context, expr: &str, label: &str) -> Result<String, SigningError> {
    let value: String = first_node(ctx, expr, label)?
        .get_content()
        .split_whitespace()
        .collect();
    if value.is_empty() {
        return Err(SigningError::Verification(format!("empty {label}")));
    }
    Ok(value)
}

fn decode(value: &str) -> Result<Vec<u8>, SigningError> {
    Base64::decode_vec(value)
        .map_err(|e| SigningError::Verification(format!("invalid base64: {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_expands_empty_elements_and_sorts_attributes() {
        let canonical = canonicalize_fragment(
            r#"<a xmlns="urn:x" b="2" a="1"><e/><t>x &amp; y</t></a>"#,
        )
        .unwrap();
        assert_eq!(
            canonical,
            r#"<a xmlns="urn:x" a="1" b="2"><e></e><t>x &amp; y</t></a>"#
        );
    }

    #[test]
    fn standalone_restores_inherited_namespace() {
        let doc = parse(r#"<Signature xmlns="urn:ds"><SignedInfo><X/></SignedInfo></Signature>"#)
            .unwrap();
        let ctx = xpath::Context::new(&doc).unwrap();
        let node = first_node(&ctx, "//*[local-name()='SignedInfo']", "SignedInfo").unwrap();
        let fragment = standalone(&doc, &node, "urn:ds");
        assert!(fragment.starts_with(r#"<SignedInfo xmlns="urn:ds">"#));
        assert_eq!(
            canonicalize_fragment(&fragment).unwrap(),
            r#"<SignedInfo xmlns="urn:ds"><X></X></SignedInfo>"#
        );
    }

    #[test]
    fn signed_info_template_has_placeholders() {
        assert!(SIGNED_INFO_TEMPLATE.contains("URI=\"#{reference_id}\""));
        assert!(SIGNED_INFO_TEMPLATE.contains("{digest_value}"));
        assert!(SIGNATURE_TEMPLATE.contains("{signed_info}"));
    }
}
