//! Rendering of outbound requests and parsing of inbound responses.

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use roxmltree::{Document, Node};
use samael::{
    schema::{
        AuthnContextClassRef, AuthnContextComparison, AuthnRequest, Issuer,
        RequestedAuthnContext,
    },
    traits::ToXml,
};

use super::{
    AuthnRequestEnvelope, EncryptedPayload, ParsedAssertion, ResponseDocument, ResponseStatus,
    ToolkitError,
};

const AES256_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes256-gcm";
const RSA_OAEP_MGF1P: &str = "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p";

/// Serialize the request with samael, then splice the encrypted extension in
/// after the `Issuer`, where the protocol schema places `Extensions`.
pub fn render_authn_request(envelope: &AuthnRequestEnvelope) -> Result<String, ToolkitError> {
    let request = AuthnRequest {
        id: envelope.id.clone(),
        version: "2.0".to_string(),
        issue_instant: envelope.issue_instant,
        destination: Some(envelope.destination.clone()),
        issuer: Some(Issuer {
            value: Some(envelope.issuer.clone()),
            ..Issuer::default()
        }),
        requested_authn_context: envelope.requested_authn_context.as_ref().map(|class_ref| {
            RequestedAuthnContext {
                authn_context_class_refs: Some(vec![AuthnContextClassRef {
                    value: Some(class_ref.clone()),
                }]),
                authn_context_decl_refs: None,
                comparison: Some(AuthnContextComparison::Exact),
            }
        }),
        ..AuthnRequest::default()
    };

    let request_xml = ToXml::to_string(&request)
        .map_err(|e| ToolkitError::Crypto(format!("Failed to serialize AuthnRequest: {e:?}")))?;

    let Some(payload) = &envelope.encrypted_extension else {
        return Ok(request_xml);
    };

    let issuer_end = {
        let doc = Document::parse(&request_xml)
            .map_err(|e| ToolkitError::Malformed(format!("invalid AuthnRequest XML: {e}")))?;
        child(doc.root_element(), "Issuer")
            .map(|issuer| issuer.range().end)
            .ok_or_else(|| ToolkitError::Malformed("AuthnRequest missing Issuer".to_string()))?
    };

    let mut spliced = String::with_capacity(request_xml.len() + 2048);
    spliced.push_str(&request_xml[..issuer_end]);
    spliced.push_str(r#"<samlp:Extensions xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol">"#);
    spliced.push_str(&render_encrypted_element("saml:EncryptedAttribute", payload));
    spliced.push_str("</samlp:Extensions>");
    spliced.push_str(&request_xml[issuer_end..]);
    Ok(spliced)
}

/// Render `payload` as an XML Encryption element named `element`.
pub fn render_encrypted_element(element: &str, payload: &EncryptedPayload) -> String {
    format!(
        r#"<{element} xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"><xenc:EncryptedData xmlns:xenc="http://www.w3.org/2001/04/xmlenc#" Type="http://www.w3.org/2001/04/xmlenc#Element"><xenc:EncryptionMethod Algorithm="{AES256_GCM}"/><ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><xenc:EncryptedKey><xenc:EncryptionMethod Algorithm="{RSA_OAEP_MGF1P}"/><xenc:CipherData><xenc:CipherValue>{}</xenc:CipherValue></xenc:CipherData></xenc:EncryptedKey></ds:KeyInfo><xenc:CipherData><xenc:CipherValue>{}</xenc:CipherValue></xenc:CipherData></xenc:EncryptedData></{element}>"#,
        payload.encrypted_key_b64(),
        payload.cipher_value_b64(),
    )
}

pub fn parse_response(response_xml: &str) -> Result<ResponseDocument, ToolkitError> {
    let doc = Document::parse(response_xml)
        .map_err(|e| ToolkitError::Malformed(format!("invalid response XML: {e}")))?;
    let root = doc.root_element();
    if root.tag_name().name() != "Response" {
        return Err(ToolkitError::Malformed(format!(
            "expected Response, found {}",
            root.tag_name().name()
        )));
    }

    let id = required_attribute(root, "ID")?;

    let status_node = child(root, "Status")
        .ok_or_else(|| ToolkitError::Malformed("Response missing Status".to_string()))?;
    let status_code = child(status_node, "StatusCode")
        .ok_or_else(|| ToolkitError::Malformed("Status missing StatusCode".to_string()))?;
    let status = ResponseStatus {
        code: required_attribute(status_code, "Value")?,
        sub_code: child(status_code, "StatusCode")
            .and_then(|sub| sub.attribute("Value"))
            .map(str::to_string),
        message: child(status_node, "StatusMessage").and_then(text),
    };

    if child(root, "Assertion").is_some() {
        return Err(ToolkitError::Malformed(
            "unencrypted assertions are not accepted".to_string(),
        ));
    }

    let encrypted_assertions = children(root, "EncryptedAssertion")
        .map(parse_encrypted_element)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ResponseDocument {
        id,
        in_response_to: root.attribute("InResponseTo").map(str::to_string),
        issuer: child(root, "Issuer").and_then(text),
        destination: root.attribute("Destination").map(str::to_string),
        status,
        encrypted_assertions,
    })
}

/// Extract the wrapped key and cipher value from an encrypted element.
///
/// The `EncryptedKey` may sit inside the `EncryptedData`'s `KeyInfo` or next
/// to the `EncryptedData`; both layouts are in common use.
fn parse_encrypted_element(node: Node<'_, '_>) -> Result<EncryptedPayload, ToolkitError> {
    let encrypted_data = child(node, "EncryptedData")
        .ok_or_else(|| ToolkitError::Malformed("EncryptedAssertion missing EncryptedData".into()))?;
    let encrypted_key = descendant(node, "EncryptedKey")
        .ok_or_else(|| ToolkitError::Malformed("EncryptedAssertion missing EncryptedKey".into()))?;

    Ok(EncryptedPayload {
        encrypted_key: cipher_value(encrypted_key)?,
        cipher_value: cipher_value(encrypted_data)?,
    })
}

/// Parse a standalone encrypted element, as produced by
/// [`render_encrypted_element`].
#[cfg(test)]
pub(crate) fn parse_encrypted_fragment(fragment: &str) -> Result<EncryptedPayload, ToolkitError> {
    let doc = Document::parse(fragment)
        .map_err(|e| ToolkitError::Malformed(format!("invalid encrypted element: {e}")))?;
    parse_encrypted_element(doc.root_element())
}

fn cipher_value(node: Node<'_, '_>) -> Result<Vec<u8>, ToolkitError> {
    let value = child(node, "CipherData")
        .and_then(|data| child(data, "CipherValue"))
        .and_then(text)
        .ok_or_else(|| {
            ToolkitError::Malformed(format!("{} missing CipherValue", node.tag_name().name()))
        })?;
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();

    STANDARD
        .decode(compact)
        .map_err(|e| ToolkitError::Malformed(format!("CipherValue is not base64: {e}")))
}

pub fn parse_assertion(assertion_xml: &str) -> Result<ParsedAssertion, ToolkitError> {
    let doc = Document::parse(assertion_xml)
        .map_err(|e| ToolkitError::Malformed(format!("invalid assertion XML: {e}")))?;
    let root = doc.root_element();
    if root.tag_name().name() != "Assertion" {
        return Err(ToolkitError::Malformed(format!(
            "expected Assertion, found {}",
            root.tag_name().name()
        )));
    }

    let subject = child(root, "Subject");
    let conditions = child(root, "Conditions");

    let subject_confirmation_not_on_or_after = subject
        .and_then(|s| child(s, "SubjectConfirmation"))
        .and_then(|c| child(c, "SubjectConfirmationData"))
        .map(|data| optional_instant(data, "NotOnOrAfter"))
        .transpose()?
        .flatten();

    let audiences = conditions
        .map(|c| {
            children(c, "AudienceRestriction")
                .flat_map(|restriction| children(restriction, "Audience"))
                .filter_map(text)
                .collect()
        })
        .unwrap_or_default();

    let authn_context_class_ref = child(root, "AuthnStatement")
        .and_then(|s| child(s, "AuthnContext"))
        .and_then(|c| child(c, "AuthnContextClassRef"))
        .and_then(text);

    let mut attributes = std::collections::BTreeMap::new();
    for statement in children(root, "AttributeStatement") {
        for attribute in children(statement, "Attribute") {
            let Some(name) = attribute
                .attribute("Name")
                .or_else(|| attribute.attribute("FriendlyName"))
            else {
                continue;
            };
            let values: &mut Vec<String> = attributes.entry(name.to_string()).or_default();
            values.extend(children(attribute, "AttributeValue").filter_map(text));
        }
    }

    Ok(ParsedAssertion {
        id: required_attribute(root, "ID")?,
        issuer: child(root, "Issuer").and_then(text),
        name_id: subject.and_then(|s| child(s, "NameID")).and_then(text),
        not_before: conditions
            .map(|c| optional_instant(c, "NotBefore"))
            .transpose()?
            .flatten(),
        not_on_or_after: conditions
            .map(|c| optional_instant(c, "NotOnOrAfter"))
            .transpose()?
            .flatten(),
        subject_confirmation_not_on_or_after,
        audiences,
        authn_context_class_ref,
        attributes,
    })
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn children<'a, 'input>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn descendant<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn text(node: Node<'_, '_>) -> Option<String> {
    node.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn required_attribute(node: Node<'_, '_>, name: &str) -> Result<String, ToolkitError> {
    node.attribute(name).map(str::to_string).ok_or_else(|| {
        ToolkitError::Malformed(format!("{} missing {name}", node.tag_name().name()))
    })
}

fn optional_instant(node: Node<'_, '_>, name: &str) -> Result<Option<DateTime<Utc>>, ToolkitError> {
    node.attribute(name)
        .map(|value| {
            DateTime::parse_from_rfc3339(value)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| ToolkitError::Malformed(format!("invalid {name} timestamp: {value}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::tests::fixtures::{AssertionBuilder, ResponseBuilder};

    #[test]
    fn test_render_escapes_attribute_values() {
        let envelope = AuthnRequestEnvelope {
            id: "_1".to_string(),
            issue_instant: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            destination: "https://hub.example/sso?a=1&b=2".to_string(),
            issuer: "http://sp.example".to_string(),
            requested_authn_context: Some("urn:level2".to_string()),
            encrypted_extension: None,
        };

        let xml = render_authn_request(&envelope).unwrap();
        let doc = Document::parse(&xml).unwrap();
        let root = doc.root_element();
        assert_eq!(root.tag_name().name(), "AuthnRequest");
        assert_eq!(root.attribute("ID"), Some("_1"));
        assert_eq!(root.attribute("Destination"), Some("https://hub.example/sso?a=1&b=2"));
        assert_eq!(
            optional_instant(root, "IssueInstant").unwrap(),
            Some(envelope.issue_instant)
        );
        assert_eq!(
            child(root, "Issuer").and_then(text).as_deref(),
            Some("http://sp.example")
        );
        assert_eq!(
            descendant(root, "AuthnContextClassRef").and_then(text).as_deref(),
            Some("urn:level2")
        );
        assert!(child(root, "Extensions").is_none());
    }

    #[test]
    fn test_render_places_extensions_after_issuer() {
        let envelope = AuthnRequestEnvelope {
            id: "_2".to_string(),
            issue_instant: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            destination: "https://hub.example/sso".to_string(),
            issuer: "http://sp.example".to_string(),
            requested_authn_context: None,
            encrypted_extension: Some(EncryptedPayload {
                encrypted_key: vec![1, 2, 3],
                cipher_value: vec![4, 5, 6],
            }),
        };

        let xml = render_authn_request(&envelope).unwrap();
        let doc = Document::parse(&xml).unwrap();
        let elements: Vec<_> = doc
            .root_element()
            .children()
            .filter(|n| n.is_element())
            .map(|n| n.tag_name().name())
            .collect();
        assert_eq!(elements[..2], ["Issuer", "Extensions"]);

        let extensions = child(doc.root_element(), "Extensions").unwrap();
        assert!(child(extensions, "EncryptedAttribute").is_some());
    }

    #[test]
    fn test_encrypted_element_round_trips_through_parser() {
        let payload = EncryptedPayload {
            encrypted_key: vec![1, 2, 3],
            cipher_value: vec![4, 5, 6, 7],
        };
        let xml = render_encrypted_element("saml:EncryptedAssertion", &payload);

        assert_eq!(parse_encrypted_fragment(&xml).unwrap(), payload);
    }

    #[test]
    fn test_parse_response_with_negative_status() {
        let xml = ResponseBuilder::new("_resp1")
            .in_response_to("_req1")
            .status(
                "urn:oasis:names:tc:SAML:2.0:status:Responder",
                Some("urn:oasis:names:tc:SAML:2.0:status:AuthnFailed"),
            )
            .build();

        let response = parse_response(&xml).unwrap();
        assert_eq!(response.id, "_resp1");
        assert_eq!(response.in_response_to.as_deref(), Some("_req1"));
        assert_eq!(
            response.status.sub_code.as_deref(),
            Some("urn:oasis:names:tc:SAML:2.0:status:AuthnFailed")
        );
        assert!(response.encrypted_assertions.is_empty());
    }

    #[test]
    fn test_parse_response_accepts_sibling_encrypted_key() {
        let xml = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" xmlns:xenc="http://www.w3.org/2001/04/xmlenc#" ID="_r">
  <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
  <saml:EncryptedAssertion>
    <xenc:EncryptedData><xenc:CipherData><xenc:CipherValue>BAUG
    Bw==</xenc:CipherValue></xenc:CipherData></xenc:EncryptedData>
    <xenc:EncryptedKey><xenc:CipherData><xenc:CipherValue>AQID</xenc:CipherValue></xenc:CipherData></xenc:EncryptedKey>
  </saml:EncryptedAssertion>
</samlp:Response>"#;

        let response = parse_response(xml).unwrap();
        assert_eq!(
            response.encrypted_assertions,
            vec![EncryptedPayload {
                encrypted_key: vec![1, 2, 3],
                cipher_value: vec![4, 5, 6, 7],
            }]
        );
    }

    #[test]
    fn test_parse_response_rejects_plain_assertion() {
        let xml = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_r">
  <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
  <saml:Assertion ID="_a"/>
</samlp:Response>"#;

        let err = parse_response(xml).unwrap_err();
        assert!(err.to_string().contains("unencrypted"));
    }

    #[test]
    fn test_parse_response_rejects_other_root() {
        let err = parse_response("<LogoutResponse ID=\"_x\"/>").unwrap_err();
        assert!(err.to_string().contains("expected Response"));
    }

    #[test]
    fn test_parse_assertion_extracts_conditions_and_attributes() {
        let not_before = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let not_on_or_after = Utc.with_ymd_and_hms(2026, 5, 1, 10, 5, 0).unwrap();
        let xml = AssertionBuilder::new("_a1", "http://sp.example")
            .window(not_before, not_on_or_after)
            .attribute("firstName", &["Jane"])
            .attribute("addresses", &["1 High St", "2 Low Rd"])
            .build();

        let assertion = parse_assertion(&xml).unwrap();
        assert_eq!(assertion.id, "_a1");
        assert_eq!(assertion.name_id.as_deref(), Some("pid-1234"));
        assert_eq!(assertion.not_before, Some(not_before));
        assert_eq!(assertion.not_on_or_after, Some(not_on_or_after));
        assert_eq!(assertion.subject_confirmation_not_on_or_after, Some(not_on_or_after));
        assert_eq!(assertion.audiences, vec!["http://sp.example".to_string()]);
        assert_eq!(assertion.attributes["firstName"], vec!["Jane".to_string()]);
        assert_eq!(assertion.attributes["addresses"].len(), 2);
    }

    #[test]
    fn test_parse_assertion_rejects_bad_timestamp() {
        let xml = r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_a"><saml:Conditions NotBefore="yesterday"/></saml:Assertion>"#;
        let err = parse_assertion(xml).unwrap_err();
        assert!(err.to_string().contains("invalid NotBefore timestamp"));
    }
}
