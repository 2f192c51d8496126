//! Reward API Endpoints
//!
//! - `POST /posts/reward/token`            grant the configured reward to a wallet
//! - `GET  /users/reward/token?address=`   token balance of a wallet
//! - `GET  /rewards/transfers/{ref}`       poll a transfer's state
//! - `GET  /rewards/transfers?limit=`      recent transfers
//! - `GET  /rewards/intents/{id}`          resolve an intent id (e.g. after `outcome_unknown`)
//! - `GET  /rewards/stats`                 queue and reservation counters

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::middleware::{REQUESTER_HEADER, ThrottleState, throttle_middleware};
use crate::error::RewardError;
use crate::ledger::{TransferRef, TransferState, format_units};
use crate::reward::{IntentStatus, IssuerStats, RewardIssuer, RewardRequest, Transfer};

const DEFAULT_TRANSFER_PAGE: usize = 50;
const MAX_TRANSFER_PAGE: usize = 500;

/// API state for reward endpoints
#[derive(Clone)]
pub struct RewardApiState {
    pub issuer: Arc<RewardIssuer>,
    /// Base units granted per reward
    pub reward_amount: u128,
    pub symbol: String,
    pub decimals: u8,
}

// Request / response types

#[derive(Debug, Deserialize)]
pub struct GrantRewardBody {
    pub address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransfersQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub message: String,
    pub data: T,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRewardData {
    pub tx_hash: TransferRef,
    pub state: TransferState,
    pub intent_id: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalanceData {
    pub balance: String,
    pub symbol: String,
    pub raw_balance: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub message: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<u64>,
}

impl IntoResponse for RewardError {
    fn into_response(self) -> Response {
        let status = match &self {
            RewardError::Invalid(_) => StatusCode::BAD_REQUEST,
            RewardError::TransferNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            message: self.to_string(),
            code: self.code(),
            intent_id: self.intent_id(),
        };
        (status, Json(body)).into_response()
    }
}

fn ok<T: Serialize>(message: &str, data: T) -> Response {
    (
        StatusCode::OK,
        Json(ApiResponse {
            message: message.to_string(),
            data,
        }),
    )
        .into_response()
}

/// Grant the configured reward to `address`
pub async fn grant_reward(
    State(state): State<RewardApiState>,
    headers: HeaderMap,
    Json(body): Json<GrantRewardBody>,
) -> Result<Response, RewardError> {
    let requester_id = headers
        .get(REQUESTER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let amount = i128::try_from(state.reward_amount).unwrap_or(i128::MAX);
    let request = RewardRequest::new(requester_id, body.address.unwrap_or_default(), amount);

    let outcome = state.issuer.grant(request).await?;

    info!(
        intent_id = outcome.intent_id,
        transfer_ref = %outcome.transfer_ref,
        "Reward granted"
    );

    Ok(ok(
        "give_reward_success",
        GrantRewardData {
            tx_hash: outcome.transfer_ref,
            state: outcome.state,
            intent_id: outcome.intent_id,
        },
    ))
}

/// Token balance of a wallet
pub async fn get_token_balance(
    State(state): State<RewardApiState>,
    Query(query): Query<BalanceQuery>,
) -> Result<Response, RewardError> {
    let address = query.address.unwrap_or_default();
    let raw = state.issuer.balance_of(&address).await?;

    Ok(ok(
        "get_reward_token_success",
        TokenBalanceData {
            balance: format_units(raw, state.decimals),
            symbol: state.symbol.clone(),
            raw_balance: raw.to_string(),
        },
    ))
}

/// Refresh and return a transfer this service submitted
pub async fn get_transfer(
    State(state): State<RewardApiState>,
    Path(transfer_ref): Path<String>,
) -> Result<Response, RewardError> {
    let transfer_ref = TransferRef::new(transfer_ref);
    state.issuer.poll_status(&transfer_ref).await?;

    let transfer: Transfer = state
        .issuer
        .transfer(&transfer_ref)
        .ok_or_else(|| RewardError::TransferNotFound(transfer_ref.to_string()))?;

    Ok(ok("get_transfer_success", transfer))
}

/// Where an intent stands: recorded transfer, in flight, or unresolved
pub async fn get_intent(
    State(state): State<RewardApiState>,
    Path(intent_id): Path<u64>,
) -> Result<Response, RewardError> {
    let status: IntentStatus = state.issuer.transfer_by_intent(intent_id).await?;
    Ok(ok("get_intent_success", status))
}

/// Recent transfers, newest first
pub async fn list_transfers(
    State(state): State<RewardApiState>,
    Query(query): Query<TransfersQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TRANSFER_PAGE)
        .min(MAX_TRANSFER_PAGE);
    ok("get_transfers_success", state.issuer.recent_transfers(limit))
}

pub async fn get_stats(State(state): State<RewardApiState>) -> Json<IssuerStats> {
    Json(state.issuer.stats())
}

/// Build the reward router; only the grant route is throttled
pub fn create_router(state: RewardApiState, throttle: ThrottleState) -> Router {
    Router::new()
        .route(
            "/posts/reward/token",
            post(grant_reward).route_layer(middleware::from_fn_with_state(throttle, throttle_middleware)),
        )
        .route("/users/reward/token", get(get_token_balance))
        .route("/rewards/transfers", get(list_transfers))
        .route("/rewards/transfers/{transfer_ref}", get(get_transfer))
        .route("/rewards/intents/{intent_id}", get(get_intent))
        .route("/rewards/stats", get(get_stats))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ConfirmationMode, InMemoryLedger};
    use crate::reward::IssuerSettings;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    const CUSTODIAL: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
    const USER: &str = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359";
    const ONE_TOKEN: u128 = 1_000_000_000_000_000_000;

    fn app(ledger: Arc<InMemoryLedger>, rate_limit: u32) -> Router {
        app_with(ledger, rate_limit, IssuerSettings::default())
    }

    fn app_with(ledger: Arc<InMemoryLedger>, rate_limit: u32, settings: IssuerSettings) -> Router {
        let settings = IssuerSettings {
            max_amount: 10 * ONE_TOKEN,
            ..settings
        };
        let (issuer, _worker) = RewardIssuer::start(ledger, settings, None);
        create_router(
            RewardApiState {
                issuer: Arc::new(issuer),
                reward_amount: ONE_TOKEN,
                symbol: "CTK".to_string(),
                decimals: 18,
            },
            ThrottleState::new(rate_limit),
        )
    }

    fn grant_request(requester: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/posts/reward/token")
            .header("content-type", "application/json");
        if let Some(requester) = requester {
            builder = builder.header(REQUESTER_HEADER, requester);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_grant_success() {
        let ledger = Arc::new(InMemoryLedger::new(CUSTODIAL, 5 * ONE_TOKEN));
        ledger.script_transfer_refs(["tx123"]).await;

        let response = app(ledger, 10)
            .oneshot(grant_request(Some("user-1"), &format!(r#"{{"address":"{}"}}"#, USER)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["data"]["txHash"], "tx123");
        assert_eq!(body["data"]["state"], "submitted");
    }

    #[tokio::test]
    async fn test_grant_without_requester_is_bad_request() {
        let ledger = Arc::new(InMemoryLedger::new(CUSTODIAL, 5 * ONE_TOKEN));

        let response = app(ledger.clone(), 10)
            .oneshot(grant_request(None, &format!(r#"{{"address":"{}"}}"#, USER)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json(response).await;
        assert_eq!(body["code"], "missing_requester");
        assert!(body.get("data").is_none());
        assert_eq!(ledger.submit_count().await, 0);
    }

    #[tokio::test]
    async fn test_grant_without_address_is_bad_request() {
        let ledger = Arc::new(InMemoryLedger::new(CUSTODIAL, 5 * ONE_TOKEN));

        let response = app(ledger, 10)
            .oneshot(grant_request(Some("user-1"), "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], "malformed_address");
    }

    #[tokio::test]
    async fn test_grant_insufficient_balance_is_server_error() {
        let ledger = Arc::new(InMemoryLedger::new(CUSTODIAL, 0));

        let response = app(ledger, 10)
            .oneshot(grant_request(Some("user-1"), &format!(r#"{{"address":"{}"}}"#, USER)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json(response).await;
        assert_eq!(body["code"], "insufficient_balance");
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn test_outcome_unknown_then_lookup_by_intent() {
        let ledger = Arc::new(
            InMemoryLedger::new(CUSTODIAL, 5 * ONE_TOKEN).with_confirmation_mode(ConfirmationMode::Manual),
        );
        ledger.script_transfer_refs(["tx-late"]).await;
        ledger.set_ack_delay(Duration::from_millis(200)).await;
        let app = app_with(
            ledger,
            10,
            IssuerSettings {
                queue_timeout: Duration::from_millis(50),
                ..IssuerSettings::default()
            },
        );

        let response = app
            .clone()
            .oneshot(grant_request(Some("user-1"), &format!(r#"{{"address":"{}"}}"#, USER)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json(response).await;
        assert_eq!(body["code"], "outcome_unknown");
        assert_eq!(body["intentId"], 1);

        tokio::time::sleep(Duration::from_millis(300)).await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/rewards/intents/1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["data"]["status"], "recorded");
        assert_eq!(body["data"]["transferRef"], "tx-late");
        assert_eq!(body["data"]["state"], "submitted");

        let missing = app
            .oneshot(Request::builder().uri("/rewards/intents/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_error_body_omits_intent_for_other_errors() {
        let ledger = Arc::new(InMemoryLedger::new(CUSTODIAL, 0));

        let response = app(ledger, 10)
            .oneshot(grant_request(Some("user-1"), &format!(r#"{{"address":"{}"}}"#, USER)))
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["code"], "insufficient_balance");
        assert!(body.get("intentId").is_none());
    }

    #[tokio::test]
    async fn test_grant_is_throttled_per_requester() {
        let ledger = Arc::new(InMemoryLedger::new(CUSTODIAL, 5 * ONE_TOKEN));
        let app = app(ledger, 1);
        let body = format!(r#"{{"address":"{}"}}"#, USER);

        let first = app.clone().oneshot(grant_request(Some("user-1"), &body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.clone().oneshot(grant_request(Some("user-1"), &body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let other = app.oneshot(grant_request(Some("user-2"), &body)).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_token_balance() {
        let ledger = Arc::new(InMemoryLedger::new(CUSTODIAL, 0));
        ledger.set_balance(USER, ONE_TOKEN / 2).await;

        let response = app(ledger, 10)
            .oneshot(
                Request::builder()
                    .uri(format!("/users/reward/token?address={}", USER))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["data"]["balance"], "0.5");
        assert_eq!(body["data"]["symbol"], "CTK");
        assert_eq!(body["data"]["rawBalance"], "500000000000000000");
    }

    #[tokio::test]
    async fn test_token_balance_rejects_bad_address() {
        let ledger = Arc::new(InMemoryLedger::new(CUSTODIAL, 0));

        let response = app(ledger, 10)
            .oneshot(
                Request::builder()
                    .uri("/users/reward/token?address=0x1234")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_poll_transfer() {
        let ledger = Arc::new(
            InMemoryLedger::new(CUSTODIAL, 5 * ONE_TOKEN).with_confirmation_mode(ConfirmationMode::Immediate),
        );
        ledger.script_transfer_refs(["tx123"]).await;
        let app = app(ledger, 10);

        let granted = app
            .clone()
            .oneshot(grant_request(Some("user-1"), &format!(r#"{{"address":"{}"}}"#, USER)))
            .await
            .unwrap();
        assert_eq!(granted.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/rewards/transfers/tx123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["data"]["state"], "confirmed");
        assert_eq!(body["data"]["amount"], ONE_TOKEN.to_string());

        let missing = app
            .oneshot(
                Request::builder()
                    .uri("/rewards/transfers/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
