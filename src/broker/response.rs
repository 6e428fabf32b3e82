//! Translation of inbound authentication responses.

use std::{collections::BTreeMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    BrokerError, ClockSkewPolicy, DecryptionKeyRing, EntityIdScope, LevelOfAssurance,
    MSA_METADATA, Purpose, TrustAnchor,
};
use crate::toolkit::{ParsedAssertion, RawResponse, ResponseDocument, SamlToolkit, ToolkitError};

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
const STATUS_RESPONDER: &str = "urn:oasis:names:tc:SAML:2.0:status:Responder";
const STATUS_AUTHN_FAILED: &str = "urn:oasis:names:tc:SAML:2.0:status:AuthnFailed";
const STATUS_NO_AUTHN_CONTEXT: &str = "urn:oasis:names:tc:SAML:2.0:status:NoAuthnContext";
const STATUS_REQUEST_DENIED: &str = "urn:oasis:names:tc:SAML:2.0:status:RequestDenied";

/// The normalized result of translating a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "outcome",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum TranslatedResponseOutcome {
    /// The user authenticated at the required level.
    Authenticated {
        /// Persistent identifier of the user, from the subject's NameID.
        pid: String,
        level_of_assurance: LevelOfAssurance,
        attributes: BTreeMap<String, Vec<String>>,
    },
    /// The hub reported that the user did not authenticate.
    NotAuthenticated { reason: NotAuthenticatedReason },
    /// The response failed validation.
    AuthenticationError { reason: AuthenticationErrorReason },
    /// The requested entity id is outside the configured scope.
    InvalidEntityId { message: String },
}

/// Why a well-formed, correctly signed response is negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotAuthenticatedReason {
    AuthnFailed,
    NoAuthnContext,
    RequestDenied,
}

/// Why a response was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationErrorReason {
    SignatureInvalid,
    DecryptionFailed,
    ResponseExpired,
    AudienceMismatch,
    MalformedResponse,
    RequestIdMismatch,
    UnknownLevelOfAssurance,
    UnexpectedStatus,
}

impl fmt::Display for AuthenticationErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            AuthenticationErrorReason::SignatureInvalid => "signature invalid",
            AuthenticationErrorReason::DecryptionFailed => "decryption failed",
            AuthenticationErrorReason::ResponseExpired => "response expired",
            AuthenticationErrorReason::AudienceMismatch => "audience mismatch",
            AuthenticationErrorReason::MalformedResponse => "malformed response",
            AuthenticationErrorReason::RequestIdMismatch => "request id mismatch",
            AuthenticationErrorReason::UnknownLevelOfAssurance => "unknown level of assurance",
            AuthenticationErrorReason::UnexpectedStatus => "unexpected status",
        };
        f.write_str(reason)
    }
}

/// Validation stages, in the order a response passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    SignatureChecked,
    Decrypted,
    TimeValidated,
    AudienceValidated,
}

fn rejected(
    stage: Stage,
    reason: AuthenticationErrorReason,
    detail: impl fmt::Display,
) -> TranslatedResponseOutcome {
    tracing::warn!(?stage, %reason, %detail, "Rejected authentication response");
    TranslatedResponseOutcome::AuthenticationError { reason }
}

/// Validates inbound responses and translates them into outcomes.
pub struct ResponseOrchestrator {
    scope: Arc<EntityIdScope>,
    msa: Arc<TrustAnchor>,
    toolkit: Arc<dyn SamlToolkit>,
    key_ring: DecryptionKeyRing,
    clock_skew: ClockSkewPolicy,
}

impl ResponseOrchestrator {
    pub fn new(
        scope: Arc<EntityIdScope>,
        msa: Arc<TrustAnchor>,
        toolkit: Arc<dyn SamlToolkit>,
        key_ring: DecryptionKeyRing,
        clock_skew: ClockSkewPolicy,
    ) -> Self {
        Self {
            scope,
            msa,
            toolkit,
            key_ring,
            clock_skew,
        }
    }

    /// Translate `raw` for `requested_entity_id`.
    ///
    /// When `expected_request_id` is given, a successful response must answer
    /// that request. Only trust infrastructure failures are errors; every
    /// verdict on the response itself is an outcome.
    #[tracing::instrument(name = "broker.translate_response", skip(self, raw))]
    pub async fn translate(
        &self,
        raw: &RawResponse,
        requested_entity_id: Option<&str>,
        expected_request_id: Option<&str>,
    ) -> Result<TranslatedResponseOutcome, BrokerError> {
        self.translate_at(raw, requested_entity_id, expected_request_id, Utc::now())
            .await
    }

    pub(crate) async fn translate_at(
        &self,
        raw: &RawResponse,
        requested_entity_id: Option<&str>,
        expected_request_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TranslatedResponseOutcome, BrokerError> {
        let entity_id = match self
            .scope
            .resolve(requested_entity_id, Purpose::ResponseTranslation)
        {
            Ok(entity_id) => entity_id,
            Err(BrokerError::InvalidEntityId(message)) => {
                return Ok(TranslatedResponseOutcome::InvalidEntityId { message });
            }
            Err(other) => return Err(other),
        };

        let resolver = self
            .msa
            .resolver()
            .await
            .map_err(|e| BrokerError::from_toolkit(MSA_METADATA, e))?;

        match self.toolkit.verify_signature(raw, &resolver) {
            Ok(()) => {}
            Err(ToolkitError::SignatureInvalid(detail)) => {
                return Ok(rejected(
                    Stage::Received,
                    AuthenticationErrorReason::SignatureInvalid,
                    detail,
                ));
            }
            Err(e) => return Err(BrokerError::from_toolkit(MSA_METADATA, e)),
        }

        let document = match self.toolkit.parse_response(raw) {
            Ok(document) => document,
            Err(ToolkitError::Malformed(detail)) => {
                return Ok(rejected(
                    Stage::SignatureChecked,
                    AuthenticationErrorReason::MalformedResponse,
                    detail,
                ));
            }
            Err(e) => return Err(BrokerError::Toolkit(e)),
        };
        tracing::debug!(response_id = %document.id, status = %document.status.code, "Response signature verified");

        if document.status.code != STATUS_SUCCESS {
            return Ok(classify_negative(&document));
        }

        let assertion = match self.decrypt_assertion(&document)? {
            Ok(assertion) => assertion,
            Err(outcome) => return Ok(outcome),
        };

        // Conditions bounds are optional; the bearer confirmation expiry is not
        if !self.clock_skew.check_conditions(
            assertion.not_before,
            assertion.not_on_or_after,
            now,
        ) || !assertion
            .subject_confirmation_not_on_or_after
            .is_some_and(|instant| self.clock_skew.is_after_now(instant, now))
        {
            return Ok(rejected(
                Stage::Decrypted,
                AuthenticationErrorReason::ResponseExpired,
                format_args!("assertion {} is outside its validity window at {now}", assertion.id),
            ));
        }

        if !assertion.audiences.iter().any(|audience| audience == &entity_id) {
            return Ok(rejected(
                Stage::TimeValidated,
                AuthenticationErrorReason::AudienceMismatch,
                format_args!("audiences {:?} do not include {entity_id}", assertion.audiences),
            ));
        }

        if let Some(expected) = expected_request_id
            && document.in_response_to.as_deref() != Some(expected)
        {
            return Ok(rejected(
                Stage::AudienceValidated,
                AuthenticationErrorReason::RequestIdMismatch,
                format_args!(
                    "response answers {:?}, expected {expected}",
                    document.in_response_to
                ),
            ));
        }

        Ok(classify_success(&document, assertion))
    }

    /// Decrypt and parse the single assertion of a successful response.
    ///
    /// The inner `Result` carries a rejection outcome; the outer one a
    /// toolkit fault.
    fn decrypt_assertion(
        &self,
        document: &ResponseDocument,
    ) -> Result<Result<ParsedAssertion, TranslatedResponseOutcome>, BrokerError> {
        let [encrypted] = document.encrypted_assertions.as_slice() else {
            return Ok(Err(rejected(
                Stage::SignatureChecked,
                AuthenticationErrorReason::MalformedResponse,
                format_args!(
                    "successful response carries {} encrypted assertions, expected one",
                    document.encrypted_assertions.len()
                ),
            )));
        };

        let plaintext = match self.key_ring.try_decrypt(encrypted, self.toolkit.as_ref()) {
            Ok(plaintext) => plaintext,
            Err(ToolkitError::DecryptionFailed(detail)) => {
                return Ok(Err(rejected(
                    Stage::SignatureChecked,
                    AuthenticationErrorReason::DecryptionFailed,
                    detail,
                )));
            }
            Err(e) => return Err(BrokerError::Toolkit(e)),
        };

        match self.toolkit.parse_assertion(&plaintext) {
            Ok(assertion) => Ok(Ok(assertion)),
            Err(ToolkitError::Malformed(detail)) => Ok(Err(rejected(
                Stage::Decrypted,
                AuthenticationErrorReason::MalformedResponse,
                detail,
            ))),
            Err(e) => Err(BrokerError::Toolkit(e)),
        }
    }
}

fn classify_negative(document: &ResponseDocument) -> TranslatedResponseOutcome {
    let reason = if document.status.code == STATUS_RESPONDER {
        match document.status.sub_code.as_deref() {
            Some(STATUS_AUTHN_FAILED) => Some(NotAuthenticatedReason::AuthnFailed),
            Some(STATUS_NO_AUTHN_CONTEXT) => Some(NotAuthenticatedReason::NoAuthnContext),
            Some(STATUS_REQUEST_DENIED) => Some(NotAuthenticatedReason::RequestDenied),
            _ => None,
        }
    } else {
        None
    };

    match reason {
        Some(reason) => {
            tracing::info!(response_id = %document.id, ?reason, "User not authenticated");
            TranslatedResponseOutcome::NotAuthenticated { reason }
        }
        None => rejected(
            Stage::SignatureChecked,
            AuthenticationErrorReason::UnexpectedStatus,
            format_args!(
                "status {} / {:?}",
                document.status.code, document.status.sub_code
            ),
        ),
    }
}

fn classify_success(
    document: &ResponseDocument,
    assertion: ParsedAssertion,
) -> TranslatedResponseOutcome {
    let Some(level_of_assurance) = assertion
        .authn_context_class_ref
        .as_deref()
        .and_then(LevelOfAssurance::from_authn_context)
    else {
        return rejected(
            Stage::AudienceValidated,
            AuthenticationErrorReason::UnknownLevelOfAssurance,
            format_args!("authn context {:?}", assertion.authn_context_class_ref),
        );
    };

    let Some(pid) = assertion.name_id else {
        return rejected(
            Stage::AudienceValidated,
            AuthenticationErrorReason::MalformedResponse,
            "assertion subject has no NameID",
        );
    };

    tracing::info!(
        response_id = %document.id,
        assertion_id = %assertion.id,
        %level_of_assurance,
        "User authenticated"
    );

    TranslatedResponseOutcome::Authenticated {
        pid,
        level_of_assurance,
        attributes: assertion.attributes,
    }
}
