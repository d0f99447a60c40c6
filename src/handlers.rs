//! HTTP handlers for the client-facing API

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::kv::SipCredentials;
use crate::{AppState, Error, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPushRequest {
    pub user_id: Option<String>,
    pub push_token: Option<String>,
    pub platform: Option<String>,
    pub device_id: Option<String>,
}

pub async fn register_push(
    State(state): State<AppState>,
    Json(req): Json<RegisterPushRequest>,
) -> Result<Json<Value>> {
    let user_id = req
        .user_id
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::BadRequest("userId is required".to_string()))?;
    let push_token = req
        .push_token
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::BadRequest("pushToken is required".to_string()))?;
    let platform = req
        .platform
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::BadRequest("platform is required".to_string()))?;

    state.realtime.ensure_user(&user_id).await?;
    state
        .realtime
        .save_push_token(&user_id, &push_token, &platform, req.device_id.as_deref())
        .await?;

    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsQuery {
    pub call_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsResponse {
    pub call_id: String,
    pub sip_credentials: SipCredentials,
}

pub async fn call_credentials(
    State(state): State<AppState>,
    Query(query): Query<CredentialsQuery>,
) -> Result<Json<CredentialsResponse>> {
    let call_token = query
        .call_token
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::BadRequest("callToken is required".to_string()))?;

    let call = state.orchestrator.call_credentials(&call_token).await?;
    Ok(Json(CredentialsResponse {
        call_id: call.call_id,
        sip_credentials: call.credentials,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndCallRequest {
    pub call_token: Option<String>,
}

/// Shared by /calls/end and its /calls/reject alias.
pub async fn end_call(
    State(state): State<AppState>,
    Json(req): Json<EndCallRequest>,
) -> Result<Json<Value>> {
    let call_token = req
        .call_token
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::BadRequest("callToken is required".to_string()))?;

    state.orchestrator.end_call(&call_token).await?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingCredentialsResponse {
    pub outgoing_token: String,
    pub sip_credentials: SipCredentials,
}

pub async fn outgoing_credentials(
    State(state): State<AppState>,
) -> Result<Json<OutgoingCredentialsResponse>> {
    let (outgoing_token, sip_credentials) = state.orchestrator.mint_outgoing().await?;
    Ok(Json(OutgoingCredentialsResponse {
        outgoing_token,
        sip_credentials,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingCleanupRequest {
    pub outgoing_token: Option<String>,
}

pub async fn outgoing_cleanup(
    State(state): State<AppState>,
    Json(req): Json<OutgoingCleanupRequest>,
) -> Result<Json<Value>> {
    let outgoing_token = req
        .outgoing_token
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::BadRequest("outgoingToken is required".to_string()))?;

    state.orchestrator.cleanup_outgoing(&outgoing_token).await?;
    Ok(Json(json!({"ok": true})))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "service": "intercom-orchestrator",
        "config": {
            "baseUrl": state.config.server_domain,
        }
    }))
}
