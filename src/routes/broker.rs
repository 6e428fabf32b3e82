//! Request generation and response translation endpoints.

use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::{
    broker::{BrokerError, LevelOfAssurance, TranslatedResponseOutcome},
    toolkit::RawResponse,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GenerateRequestBody {
    /// Entity id to issue the request for; defaults to the only configured id.
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Overrides the configured level of assurance.
    #[serde(default)]
    pub level_of_assurance: Option<LevelOfAssurance>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequestResponse {
    pub request_id: String,
    pub issue_instant: DateTime<Utc>,
    pub destination: String,
    pub saml_request: String,
    pub sig_alg: String,
    pub signature: String,
    pub signed_encoded_request: String,
    pub redirect_url: String,
}

/// Generate a signed authentication request for the hub.
#[tracing::instrument(name = "routes.generate_request", skip(state, body))]
pub async fn generate_request(
    State(state): State<AppState>,
    Json(body): Json<GenerateRequestBody>,
) -> Result<Json<GenerateRequestResponse>, BrokerError> {
    let request = state
        .broker
        .generate_request(body.entity_id.as_deref(), body.level_of_assurance)
        .await?;

    Ok(Json(GenerateRequestResponse {
        redirect_url: request.redirect_url(),
        request_id: request.request_id,
        issue_instant: request.issue_instant,
        destination: request.destination,
        saml_request: request.saml_request,
        sig_alg: request.sig_alg,
        signature: request.signature,
        signed_encoded_request: request.signed_encoded_request,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TranslateResponseBody {
    /// Base64-encoded response, as posted by the matching service.
    pub saml_response: String,
    pub sig_alg: String,
    pub signature: String,
    #[serde(default)]
    pub relay_state: Option<String>,
    /// The request id this response must answer.
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
}

/// Translate a response posted back from the matching service.
///
/// Authenticated and NotAuthenticated outcomes are successes; every other
/// outcome is a client error.
#[tracing::instrument(name = "routes.translate_response", skip(state, body))]
pub async fn translate_response(
    State(state): State<AppState>,
    Json(body): Json<TranslateResponseBody>,
) -> Result<(StatusCode, Json<TranslatedResponseOutcome>), BrokerError> {
    let raw = RawResponse {
        saml_response: body.saml_response,
        relay_state: body.relay_state,
        sig_alg: body.sig_alg,
        signature: body.signature,
    };

    let outcome = state
        .broker
        .translate_response(&raw, body.entity_id.as_deref(), body.request_id.as_deref())
        .await?;

    let status = match outcome {
        TranslatedResponseOutcome::Authenticated { .. }
        | TranslatedResponseOutcome::NotAuthenticated { .. } => StatusCode::OK,
        TranslatedResponseOutcome::AuthenticationError { .. }
        | TranslatedResponseOutcome::InvalidEntityId { .. } => StatusCode::BAD_REQUEST,
    };

    Ok((status, Json(outcome)))
}
