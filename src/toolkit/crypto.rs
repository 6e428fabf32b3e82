//! OpenSSL-backed toolkit.
//!
//! Requests are signed with the SAML HTTP-Redirect binding (the signature
//! covers the encoded query, not the XML), responses are verified with the
//! HTTP-POST-SimpleSign binding, and encrypted content follows XML Encryption
//! 1.1: an AES-256-GCM content key transported with RSA-OAEP.

use std::io::Write;

use base64::{Engine, engine::general_purpose::STANDARD};
use flate2::{Compression, write::DeflateEncoder};
use openssl::{
    encrypt::{Decrypter, Encrypter},
    hash::MessageDigest,
    pkey::{Id, PKey, Public},
    rsa::Padding,
    sign::{Signer, Verifier},
    symm::{Cipher, decrypt_aead, encrypt_aead},
};

use super::{
    AuthnRequestEnvelope, EncryptedPayload, KeyPair, KeyUsage, MetadataResolver,
    ParsedAssertion, RawResponse, ResponseDocument, SamlToolkit, SignedAuthnRequest,
    ToolkitError, xml,
};

pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const ECDSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";

const CONTENT_KEY_LEN: usize = 32;
const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

/// Production [`SamlToolkit`] built on OpenSSL and `roxmltree`.
#[derive(Debug, Clone, Default)]
pub struct OpensslToolkit;

impl OpensslToolkit {
    pub fn new() -> Self {
        Self
    }
}

impl SamlToolkit for OpensslToolkit {
    fn sign(
        &self,
        envelope: &AuthnRequestEnvelope,
        key_pair: &KeyPair,
    ) -> Result<SignedAuthnRequest, ToolkitError> {
        let request_xml = xml::render_authn_request(envelope)?;

        let mut compressed = vec![];
        {
            let mut encoder = DeflateEncoder::new(&mut compressed, Compression::default());
            encoder.write_all(request_xml.as_bytes()).map_err(|e| {
                ToolkitError::Crypto(format!("Failed to compress AuthnRequest: {e}"))
            })?;
            encoder.finish().map_err(|e| {
                ToolkitError::Crypto(format!("Failed to compress AuthnRequest: {e}"))
            })?;
        }
        let saml_request = STANDARD.encode(&compressed);

        // Determine signature algorithm based on key type
        let sig_alg = if key_pair.private_key().ec_key().is_ok() {
            ECDSA_SHA256
        } else {
            RSA_SHA256
        };

        // Redirect binding: sign `SAMLRequest=value&SigAlg=value`, URL-encoded
        let signed_content = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("SAMLRequest", &saml_request)
            .append_pair("SigAlg", sig_alg)
            .finish();

        let mut signer = Signer::new(MessageDigest::sha256(), key_pair.private_key())?;
        signer.update(signed_content.as_bytes())?;
        let signature = signer.sign_to_vec()?;

        tracing::debug!(
            request_id = %envelope.id,
            sig_alg,
            encrypted_extension = envelope.encrypted_extension.is_some(),
            "Signed AuthnRequest"
        );

        Ok(SignedAuthnRequest {
            saml_request,
            sig_alg: sig_alg.to_string(),
            signature: STANDARD.encode(signature),
        })
    }

    fn encrypt(
        &self,
        payload: &[u8],
        public_key: &PKey<Public>,
    ) -> Result<EncryptedPayload, ToolkitError> {
        let mut content_key = [0u8; CONTENT_KEY_LEN];
        let mut iv = [0u8; GCM_IV_LEN];
        openssl::rand::rand_bytes(&mut content_key)?;
        openssl::rand::rand_bytes(&mut iv)?;

        let mut tag = [0u8; GCM_TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &content_key,
            Some(&iv),
            &[],
            payload,
            &mut tag,
        )?;

        let mut cipher_value = Vec::with_capacity(GCM_IV_LEN + ciphertext.len() + GCM_TAG_LEN);
        cipher_value.extend_from_slice(&iv);
        cipher_value.extend_from_slice(&ciphertext);
        cipher_value.extend_from_slice(&tag);

        let mut encrypter = Encrypter::new(public_key)?;
        encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
        let mut encrypted_key = vec![0u8; encrypter.encrypt_len(&content_key)?];
        let len = encrypter.encrypt(&content_key, &mut encrypted_key)?;
        encrypted_key.truncate(len);

        Ok(EncryptedPayload {
            encrypted_key,
            cipher_value,
        })
    }

    fn decrypt(
        &self,
        ciphertext: &EncryptedPayload,
        key_pair: &KeyPair,
    ) -> Result<Vec<u8>, ToolkitError> {
        let content_key = unwrap_content_key(&ciphertext.encrypted_key, key_pair)?;
        if content_key.len() != CONTENT_KEY_LEN {
            return Err(ToolkitError::DecryptionFailed(format!(
                "unexpected content key length {}",
                content_key.len()
            )));
        }

        let data = &ciphertext.cipher_value;
        if data.len() < GCM_IV_LEN + GCM_TAG_LEN {
            return Err(ToolkitError::DecryptionFailed(
                "cipher value too short".to_string(),
            ));
        }
        let (iv, rest) = data.split_at(GCM_IV_LEN);
        let (body, tag) = rest.split_at(rest.len() - GCM_TAG_LEN);

        decrypt_aead(Cipher::aes_256_gcm(), &content_key, Some(iv), &[], body, tag)
            .map_err(|_| ToolkitError::DecryptionFailed("content authentication failed".into()))
    }

    fn verify_signature(
        &self,
        response: &RawResponse,
        resolver: &MetadataResolver,
    ) -> Result<(), ToolkitError> {
        // SECURITY: only accept algorithms from the allowlist
        if response.sig_alg != RSA_SHA256 && response.sig_alg != ECDSA_SHA256 {
            return Err(ToolkitError::SignatureInvalid(format!(
                "unsupported signature algorithm {}",
                response.sig_alg
            )));
        }

        let signature = STANDARD
            .decode(response.signature.trim())
            .map_err(|e| ToolkitError::SignatureInvalid(format!("signature is not base64: {e}")))?;

        let signed_content = simple_sign_content(response);

        let snapshot = resolver.snapshot();
        if snapshot.signing_certificates.is_empty() {
            return Err(ToolkitError::SignatureInvalid(format!(
                "no signing certificates published for {}",
                snapshot.entity_id
            )));
        }

        let expected_key_type = if response.sig_alg == RSA_SHA256 {
            Id::RSA
        } else {
            Id::EC
        };

        for certificate in &snapshot.signing_certificates {
            let Ok(public_key) = certificate.public_key() else {
                tracing::debug!(entity_id = %snapshot.entity_id, "Skipping certificate with unreadable key");
                continue;
            };
            if public_key.id() != expected_key_type {
                continue;
            }
            let verified = Verifier::new(MessageDigest::sha256(), &public_key)
                .and_then(|mut verifier| {
                    verifier.update(signed_content.as_bytes())?;
                    verifier.verify(&signature)
                })
                .unwrap_or(false);
            if verified {
                return Ok(());
            }
        }

        Err(ToolkitError::SignatureInvalid(format!(
            "signature does not match any key published for {}",
            snapshot.entity_id
        )))
    }

    fn extract_public_key(
        &self,
        resolver: &MetadataResolver,
        expected_entity_id: &str,
    ) -> Result<PKey<Public>, ToolkitError> {
        let snapshot = resolver.snapshot();
        let no_key = || ToolkitError::NoKeyFound {
            entity_id: expected_entity_id.to_string(),
            usage: KeyUsage::Encryption,
        };

        if snapshot.entity_id != expected_entity_id {
            return Err(no_key());
        }

        let certificate = snapshot.encryption_certificates.first().ok_or_else(no_key)?;
        Ok(certificate.public_key()?)
    }

    fn parse_response(&self, response: &RawResponse) -> Result<ResponseDocument, ToolkitError> {
        let response_bytes = STANDARD
            .decode(response.saml_response.trim())
            .map_err(|e| ToolkitError::Malformed(format!("response is not base64: {e}")))?;
        let response_xml = String::from_utf8(response_bytes)
            .map_err(|e| ToolkitError::Malformed(format!("response is not UTF-8: {e}")))?;

        xml::parse_response(&response_xml)
    }

    fn parse_assertion(&self, plaintext: &[u8]) -> Result<ParsedAssertion, ToolkitError> {
        let assertion_xml = std::str::from_utf8(plaintext)
            .map_err(|e| ToolkitError::Malformed(format!("assertion is not UTF-8: {e}")))?;

        xml::parse_assertion(assertion_xml)
    }
}

fn unwrap_content_key(encrypted_key: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>, ToolkitError> {
    let failed = |_| ToolkitError::DecryptionFailed("content key could not be unwrapped".into());

    let mut decrypter = Decrypter::new(key_pair.private_key()).map_err(failed)?;
    decrypter
        .set_rsa_padding(Padding::PKCS1_OAEP)
        .map_err(failed)?;
    let mut content_key = vec![0u8; decrypter.decrypt_len(encrypted_key).map_err(failed)?];
    let len = decrypter
        .decrypt(encrypted_key, &mut content_key)
        .map_err(failed)?;
    content_key.truncate(len);

    Ok(content_key)
}

/// The octet string covered by an HTTP-POST-SimpleSign signature.
///
/// Values are concatenated as posted, without URL-encoding.
pub fn simple_sign_content(response: &RawResponse) -> String {
    let mut content = format!("SAMLResponse={}", response.saml_response);
    if let Some(relay_state) = &response.relay_state {
        content.push_str("&RelayState=");
        content.push_str(relay_state);
    }
    content.push_str("&SigAlg=");
    content.push_str(&response.sig_alg);
    content
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use chrono::{TimeZone, Utc};
    use flate2::read::DeflateDecoder;

    use super::*;
    use crate::tests::fixtures;

    fn envelope(encrypted_extension: Option<EncryptedPayload>) -> AuthnRequestEnvelope {
        AuthnRequestEnvelope {
            id: "_abc123".to_string(),
            issue_instant: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            destination: "https://hub.example/SAML2/SSO".to_string(),
            issuer: "http://sp.example".to_string(),
            requested_authn_context: None,
            encrypted_extension,
        }
    }

    fn inflate(saml_request: &str) -> String {
        let compressed = STANDARD.decode(saml_request).unwrap();
        let mut xml = String::new();
        DeflateDecoder::new(compressed.as_slice())
            .read_to_string(&mut xml)
            .unwrap();
        xml
    }

    #[test]
    fn test_sign_produces_verifiable_redirect_signature() {
        let toolkit = OpensslToolkit::new();
        let key_pair = fixtures::key_pair(0);

        let signed = toolkit.sign(&envelope(None), &key_pair).unwrap();
        assert_eq!(signed.sig_alg, RSA_SHA256);

        let signed_content = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("SAMLRequest", &signed.saml_request)
            .append_pair("SigAlg", &signed.sig_alg)
            .finish();
        let signature = STANDARD.decode(&signed.signature).unwrap();
        let mut verifier = Verifier::new(MessageDigest::sha256(), key_pair.public_key()).unwrap();
        verifier.update(signed_content.as_bytes()).unwrap();
        assert!(verifier.verify(&signature).unwrap());

        let xml = inflate(&signed.saml_request);
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let root = doc.root_element();
        assert_eq!(root.attribute("ID"), Some("_abc123"));
        assert_eq!(root.attribute("Destination"), Some("https://hub.example/SAML2/SSO"));
        assert!(root.descendants().any(|n| n.tag_name().name() == "Issuer"
            && n.text() == Some("http://sp.example")));
        assert!(!xml.contains("Extensions"));
    }

    #[test]
    fn test_signature_does_not_verify_under_other_key() {
        let toolkit = OpensslToolkit::new();
        let signed = toolkit.sign(&envelope(None), &fixtures::key_pair(0)).unwrap();

        let signed_content = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("SAMLRequest", &signed.saml_request)
            .append_pair("SigAlg", &signed.sig_alg)
            .finish();
        let signature = STANDARD.decode(&signed.signature).unwrap();
        let other = fixtures::key_pair(1);
        let mut verifier = Verifier::new(MessageDigest::sha256(), other.public_key()).unwrap();
        verifier.update(signed_content.as_bytes()).unwrap();
        assert!(!verifier.verify(&signature).unwrap_or(false));
    }

    #[test]
    fn test_signed_request_embeds_encrypted_extension() {
        let toolkit = OpensslToolkit::new();
        let hub_key = fixtures::key_pair(2);
        let extension = toolkit
            .encrypt(b"<saml:Attribute/>", hub_key.public_key())
            .unwrap();

        let signed = toolkit
            .sign(&envelope(Some(extension.clone())), &fixtures::key_pair(0))
            .unwrap();
        let xml = inflate(&signed.saml_request);

        assert!(xml.contains("<samlp:Extensions"));
        assert!(xml.contains("EncryptedAttribute"));
        assert!(xml.contains(&extension.cipher_value_b64()));
        assert!(!xml.contains("<saml:Attribute/>"));
    }

    #[test]
    fn test_encrypt_then_decrypt_with_matching_key() {
        let toolkit = OpensslToolkit::new();
        let key_pair = fixtures::key_pair(1);

        let payload = toolkit
            .encrypt(b"<saml:Assertion/>", key_pair.public_key())
            .unwrap();
        assert_ne!(payload.cipher_value, b"<saml:Assertion/>".to_vec());

        let plaintext = toolkit.decrypt(&payload, &key_pair).unwrap();
        assert_eq!(plaintext, b"<saml:Assertion/>");
    }

    #[test]
    fn test_decrypt_with_wrong_key_signals_decryption_failed() {
        let toolkit = OpensslToolkit::new();
        let payload = toolkit
            .encrypt(b"secret", fixtures::key_pair(1).public_key())
            .unwrap();

        let err = toolkit.decrypt(&payload, &fixtures::key_pair(0)).unwrap_err();
        assert!(matches!(err, ToolkitError::DecryptionFailed(_)));
    }

    #[test]
    fn test_decrypt_tampered_cipher_value_fails() {
        let toolkit = OpensslToolkit::new();
        let key_pair = fixtures::key_pair(1);
        let mut payload = toolkit.encrypt(b"secret", key_pair.public_key()).unwrap();
        let last = payload.cipher_value.len() - 1;
        payload.cipher_value[last] ^= 0xff;

        let err = toolkit.decrypt(&payload, &key_pair).unwrap_err();
        assert!(matches!(err, ToolkitError::DecryptionFailed(_)));
    }

    #[test]
    fn test_decrypt_truncated_cipher_value_fails() {
        let toolkit = OpensslToolkit::new();
        let key_pair = fixtures::key_pair(1);
        let mut payload = toolkit.encrypt(b"secret", key_pair.public_key()).unwrap();
        payload.cipher_value.truncate(8);

        let err = toolkit.decrypt(&payload, &key_pair).unwrap_err();
        assert!(matches!(err, ToolkitError::DecryptionFailed(_)));
    }

    #[test]
    fn test_verify_signature_accepts_trusted_signer() {
        let toolkit = OpensslToolkit::new();
        let msa_key = fixtures::key_pair(2);
        let resolver = fixtures::resolver(fixtures::MSA_ENTITY_ID, &msa_key, &msa_key);

        let raw = fixtures::sign_response("<samlp:Response/>", Some("state"), &msa_key);
        assert!(toolkit.verify_signature(&raw, &resolver).is_ok());
    }

    #[test]
    fn test_verify_signature_rejects_untrusted_signer() {
        let toolkit = OpensslToolkit::new();
        let msa_key = fixtures::key_pair(2);
        let resolver = fixtures::resolver(fixtures::MSA_ENTITY_ID, &msa_key, &msa_key);

        let raw = fixtures::sign_response("<samlp:Response/>", None, &fixtures::key_pair(0));
        let err = toolkit.verify_signature(&raw, &resolver).unwrap_err();
        assert!(matches!(err, ToolkitError::SignatureInvalid(_)));
    }

    #[test]
    fn test_verify_signature_rejects_modified_relay_state() {
        let toolkit = OpensslToolkit::new();
        let msa_key = fixtures::key_pair(2);
        let resolver = fixtures::resolver(fixtures::MSA_ENTITY_ID, &msa_key, &msa_key);

        let mut raw = fixtures::sign_response("<samlp:Response/>", Some("state"), &msa_key);
        raw.relay_state = Some("other".to_string());
        assert!(toolkit.verify_signature(&raw, &resolver).is_err());
    }

    #[test]
    fn test_verify_signature_rejects_unlisted_algorithm() {
        let toolkit = OpensslToolkit::new();
        let msa_key = fixtures::key_pair(2);
        let resolver = fixtures::resolver(fixtures::MSA_ENTITY_ID, &msa_key, &msa_key);

        let mut raw = fixtures::sign_response("<samlp:Response/>", None, &msa_key);
        raw.sig_alg = "http://www.w3.org/2000/09/xmldsig#rsa-sha1".to_string();
        let err = toolkit.verify_signature(&raw, &resolver).unwrap_err();
        assert!(err.to_string().contains("unsupported signature algorithm"));
    }

    fn resolver_publishing(signing: &[&KeyPair]) -> MetadataResolver {
        let mut snapshot =
            fixtures::snapshot(fixtures::MSA_ENTITY_ID, signing[0], signing[0]);
        for key_pair in &signing[1..] {
            let other = fixtures::snapshot(fixtures::MSA_ENTITY_ID, key_pair, key_pair);
            snapshot.signing_certificates.extend(other.signing_certificates);
        }
        MetadataResolver::new(
            fixtures::metadata_source("https://msa.example/metadata", fixtures::MSA_ENTITY_ID),
            std::sync::Arc::new(fixtures::StaticLoader::new(snapshot.clone())),
            snapshot,
        )
    }

    fn ecdsa_signed(key_pair: &KeyPair) -> RawResponse {
        let mut raw = fixtures::sign_response("<samlp:Response/>", None, key_pair);
        raw.sig_alg = ECDSA_SHA256.to_string();
        let mut signer = Signer::new(MessageDigest::sha256(), key_pair.private_key()).unwrap();
        signer.update(simple_sign_content(&raw).as_bytes()).unwrap();
        raw.signature = STANDARD.encode(signer.sign_to_vec().unwrap());
        raw
    }

    #[test]
    fn test_verify_signature_skips_keys_of_other_type() {
        let toolkit = OpensslToolkit::new();
        let rsa_key = fixtures::key_pair(2);
        let ec_key = fixtures::ec_key_pair();

        let rsa_signed = fixtures::sign_response("<samlp:Response/>", None, &rsa_key);
        let err = toolkit
            .verify_signature(&rsa_signed, &resolver_publishing(&[&ec_key]))
            .unwrap_err();
        assert!(matches!(err, ToolkitError::SignatureInvalid(_)), "{err:?}");

        assert!(toolkit
            .verify_signature(&rsa_signed, &resolver_publishing(&[&ec_key, &rsa_key]))
            .is_ok());
    }

    #[test]
    fn test_verify_signature_accepts_ecdsa_signer() {
        let toolkit = OpensslToolkit::new();
        let ec_key = fixtures::ec_key_pair();
        let resolver = resolver_publishing(&[&fixtures::key_pair(2), &ec_key]);

        let raw = ecdsa_signed(&ec_key);
        assert!(toolkit.verify_signature(&raw, &resolver).is_ok());

        // Claiming RSA for an EC signature matches no published key
        let mut mislabelled = raw.clone();
        mislabelled.sig_alg = RSA_SHA256.to_string();
        let err = toolkit.verify_signature(&mislabelled, &resolver).unwrap_err();
        assert!(matches!(err, ToolkitError::SignatureInvalid(_)), "{err:?}");
    }

    #[test]
    fn test_extract_public_key_returns_encryption_key() {
        let toolkit = OpensslToolkit::new();
        let signing = fixtures::key_pair(0);
        let encryption = fixtures::key_pair(1);
        let resolver = fixtures::resolver(fixtures::HUB_ENTITY_ID, &signing, &encryption);

        let key = toolkit
            .extract_public_key(&resolver, fixtures::HUB_ENTITY_ID)
            .unwrap();
        assert!(key.public_eq(encryption.public_key()));
    }

    #[test]
    fn test_extract_public_key_for_other_entity_fails() {
        let toolkit = OpensslToolkit::new();
        let key_pair = fixtures::key_pair(0);
        let resolver = fixtures::resolver(fixtures::HUB_ENTITY_ID, &key_pair, &key_pair);

        let err = toolkit
            .extract_public_key(&resolver, "https://someone-else.example")
            .unwrap_err();
        assert!(matches!(
            err,
            ToolkitError::NoKeyFound {
                usage: KeyUsage::Encryption,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_response_rejects_invalid_base64() {
        let toolkit = OpensslToolkit::new();
        let raw = RawResponse {
            saml_response: "not valid base64!!!".to_string(),
            relay_state: None,
            sig_alg: RSA_SHA256.to_string(),
            signature: String::new(),
        };
        let err = toolkit.parse_response(&raw).unwrap_err();
        assert!(matches!(err, ToolkitError::Malformed(_)));
    }

    #[test]
    fn test_simple_sign_content_omits_absent_relay_state() {
        let raw = RawResponse {
            saml_response: "PHNhbWw+".to_string(),
            relay_state: None,
            sig_alg: RSA_SHA256.to_string(),
            signature: String::new(),
        };
        assert_eq!(
            simple_sign_content(&raw),
            format!("SAMLResponse=PHNhbWw+&SigAlg={RSA_SHA256}")
        );
    }
}
