//! HTTP endpoints of the facilitator.
//!
//! Protocol-critical endpoints (`/verify`, `/settle`) run behind two
//! pre-checks: a fixed-window rate limiter and the idempotency cache. A
//! cached response is replayed byte-for-byte, including its timestamp, so
//! retried requests are safe for client receipt storage. Discovery endpoints
//! (`/api/info`, `/supported`, `/health`) describe the running configuration.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use alloy::primitives::keccak256;

use crate::config::FacilitatorMode;
use crate::fee::{self, FEE_BPS, FeeBreakdown};
use crate::header as payment_header;
use crate::idempotency::{IdempotencyCache, fingerprint};
use crate::rate_limit::FixedWindowLimiter;
use crate::registry::{Network, Registry};
use crate::settle::Settler;
use crate::types::{PaymentRequirements, SettleRequest, SettlementStatus, VerifyRequest};
use crate::verify::{Verifier, VerifyOutcome};

/// Timeout on the per-network probe behind `/health`.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const CODE_VERIFICATION_ERROR: &str = "VERIFICATION_ERROR";
const CODE_SETTLEMENT_ERROR: &str = "SETTLEMENT_ERROR";
const CODE_RATE_LIMITED: &str = "RATE_LIMITED";

/// Shared state behind every endpoint.
pub struct AppState {
    pub registry: Arc<Registry>,
    pub verifier: Verifier,
    pub settler: Settler,
    pub idempotency: IdempotencyCache,
    pub limiter: FixedWindowLimiter,
    pub mode: FacilitatorMode,
    pub default_chain: Network,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_root))
        .route("/api/info", get(get_info))
        .route("/health", get(get_health))
        .route("/supported", get(get_supported))
        .route("/verify", post(post_verify))
        .route("/settle", post(post_settle))
}

/// `GET /`: greeting, mainly useful as a liveness probe.
#[instrument(skip_all)]
async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

/// `GET /api/info`: service metadata.
#[instrument(skip_all)]
async fn get_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "facilitatorMode": state.mode.as_str(),
        "defaultChain": state.default_chain,
        "feeBps": FEE_BPS,
        "networks": state.registry.supported_networks(),
    }))
}

/// `GET /supported`: payment kinds this facilitator accepts, one entry per
/// configured network.
#[instrument(skip_all)]
async fn get_supported(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let kinds: Vec<Value> = state
        .registry
        .supported_networks()
        .into_iter()
        .map(|network| {
            json!({
                "x402Version": 1,
                "scheme": "exact",
                "network": network,
            })
        })
        .collect();
    Json(json!({ "kinds": kinds }))
}

/// `GET /health`: 200 when every configured network answers an RPC probe,
/// 503 otherwise, with per-network detail either way.
#[instrument(skip_all)]
async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut networks = serde_json::Map::new();
    let mut healthy = true;
    let supported = state.registry.supported_networks();
    if supported.is_empty() {
        healthy = false;
    }
    for network in supported {
        let token = network.default_token();
        let probe = match state.registry.public_client(network) {
            Ok(client) => {
                match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, client.block_number()).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("RPC probe timed out".to_string()),
                }
            }
            Err(e) => Err(e.to_string()),
        };
        let entry = match probe {
            Ok(()) => json!({ "rpcHealthy": true, "token": token, "status": "ok" }),
            Err(error) => {
                healthy = false;
                json!({ "rpcHealthy": false, "token": token, "status": "error", "error": error })
            }
        };
        networks.insert(network.slug().to_string(), entry);
    }
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "healthy": healthy,
        "facilitatorMode": state.mode.as_str(),
        "networks": networks,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    });
    (status, Json(body))
}

/// `POST /verify`: verify a payment authorization against requirements and
/// live chain state. Always answers 200 with a structured verdict unless the
/// body itself is malformed.
#[instrument(skip_all)]
async fn post_verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> Response {
    if !state.limiter.check(&client_key(&headers)) {
        return rate_limited();
    }
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return bad_request(CODE_VERIFICATION_ERROR, rejection),
    };

    let key = request_key(&headers, "/verify", &request);
    if let Some(body) = state.idempotency.lookup(&key) {
        return replay(body);
    }

    let stable_timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let outcome = state.verifier.verify(&request).await;
    let breakdown = breakdown_for(&state.registry, &request.payment_requirements, &outcome);
    let consensus_proof = outcome
        .is_valid
        .then(|| consensus_proof(&key, &stable_timestamp));

    let body = json!({
        "isValid": outcome.is_valid,
        "invalidReason": outcome.invalid_reason,
        "consensusProof": consensus_proof,
        "reportId": report_id(),
        "timestamp": stable_timestamp,
        "amount": breakdown.amount,
        "fee": breakdown.fee,
        "net": breakdown.net,
    });
    let serialized = body.to_string();
    state.idempotency.store(&key, serialized.clone());
    replay(serialized)
}

/// `POST /settle`: verify, then execute the payment on-chain. A failed
/// verification settles nothing and reports `success: false`; a settlement
/// submission error maps to a 400.
#[instrument(skip_all)]
async fn post_settle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<SettleRequest>, JsonRejection>,
) -> Response {
    if !state.limiter.check(&client_key(&headers)) {
        return rate_limited();
    }
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return bad_request(CODE_SETTLEMENT_ERROR, rejection),
    };

    let key = request_key(&headers, "/settle", &request);
    if let Some(body) = state.idempotency.lookup(&key) {
        return replay(body);
    }

    let stable_timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let network = request.payment_requirements.network;
    let outcome = state.verifier.verify(&request).await;
    let breakdown = breakdown_for(&state.registry, &request.payment_requirements, &outcome);

    if !outcome.is_valid {
        let body = json!({
            "success": false,
            "error": outcome.invalid_reason,
            "txHash": Value::Null,
            "networkId": network,
            "consensusProof": Value::Null,
            "timestamp": stable_timestamp,
            "amount": breakdown.amount,
            "fee": breakdown.fee,
            "net": breakdown.net,
            "status": SettlementStatus::Failed,
        });
        let serialized = body.to_string();
        state.idempotency.store(&key, serialized.clone());
        return replay(serialized);
    }

    let amount = outcome.amount.unwrap_or(0);
    let (fee_base, net_base) = fee::split_amount(amount, FEE_BPS);
    let settled = match state.settler.settle(&request, fee_base, net_base).await {
        Ok(settled) => settled,
        Err(e) => {
            tracing::warn!(error = %e, "settlement failed");
            return json_error(
                StatusCode::BAD_REQUEST,
                e.to_string(),
                CODE_SETTLEMENT_ERROR,
                None,
            );
        }
    };

    let success = matches!(
        settled.status,
        SettlementStatus::Confirmed | SettlementStatus::Pending
    );
    let mut body = json!({
        "success": success,
        "error": Value::Null,
        "txHash": settled.tx_hash,
        "networkId": network,
        "consensusProof": consensus_proof(&key, &stable_timestamp),
        "timestamp": stable_timestamp,
        "amount": breakdown.amount,
        "fee": breakdown.fee,
        "net": breakdown.net,
        "status": settled.status,
    });
    if let Some(tx_hash_fee) = settled.tx_hash_fee {
        body["txHashFee"] = json!(tx_hash_fee);
    }
    if let Some(anchor) = settled.anchor {
        body["evidenceHash"] = json!(anchor.evidence_hash);
        body["proofOfAgency"] = json!(anchor.proof_of_agency);
    }
    let serialized = body.to_string();
    state.idempotency.store(&key, serialized.clone());
    replay(serialized)
}

/// Client identifier for rate limiting: an explicit token, else the first
/// forwarded hop, else a shared bucket.
fn client_key(headers: &HeaderMap) -> String {
    if let Some(token) = headers.get("x-client-id").and_then(|v| v.to_str().ok()) {
        return token.to_string();
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first_hop) = forwarded.split(',').next() {
            return first_hop.trim().to_string();
        }
    }
    "global".to_string()
}

/// Idempotency key: explicit `Idempotency-Key` header, else the derived
/// request fingerprint.
fn request_key(headers: &HeaderMap, route: &str, request: &VerifyRequest) -> String {
    if let Some(key) = headers.get("idempotency-key").and_then(|v| v.to_str().ok()) {
        return key.to_string();
    }
    let nonce = payment_header::normalize(&request.payment_header)
        .map(|auth| auth.nonce)
        .unwrap_or_default();
    fingerprint(route, &nonce, &request.payment_requirements)
}

/// Fee breakdown for the response; populated even for invalid outcomes, with
/// best-effort token resolution when verification stopped early.
fn breakdown_for(
    registry: &Registry,
    requirements: &PaymentRequirements,
    outcome: &VerifyOutcome,
) -> FeeBreakdown {
    let (decimals, symbol) = match (outcome.decimals, &outcome.symbol) {
        (Some(decimals), Some(symbol)) => (decimals, symbol.clone()),
        _ => match registry.resolve_asset(requirements.network, &requirements.asset) {
            Ok((token, _)) => (token.decimals, token.symbol.clone()),
            Err(_) => (0, requirements.asset.clone()),
        },
    };
    let amount = outcome
        .amount
        .or_else(|| fee::parse_base_units(&requirements.max_amount_required).ok())
        .unwrap_or(0);
    fee::breakdown(amount, decimals, &symbol)
}

fn consensus_proof(key: &str, stable_timestamp: &str) -> String {
    hex::encode(keccak256(format!("{key}:{stable_timestamp}").as_bytes()))
}

fn report_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!("req_{}_{}", Utc::now().timestamp_millis(), suffix)
}

/// Emit a stored or fresh serialized body verbatim.
fn replay(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn rate_limited() -> Response {
    json_error(
        StatusCode::TOO_MANY_REQUESTS,
        "Rate limit exceeded".to_string(),
        CODE_RATE_LIMITED,
        None,
    )
}

fn bad_request(code: &str, rejection: JsonRejection) -> Response {
    json_error(
        StatusCode::BAD_REQUEST,
        "Invalid request body".to_string(),
        code,
        Some(rejection.body_text()),
    )
}

fn json_error(status: StatusCode, error: String, code: &str, details: Option<String>) -> Response {
    let mut body = json!({ "error": error, "code": code });
    if let Some(details) = details {
        body["details"] = json!(details);
    }
    (status, Json(body)).into_response()
}
