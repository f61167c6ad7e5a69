// =============================================================================
// Signal Gateway (C4) -- webhook HTTP endpoint, source-IP allowlisting, and
// the health probe endpoint the Health Supervisor polls. Router construction
// mirrors the teacher's api/rest.rs (one `Router::new()` chain, `.with_state`)
// and the "reject before the handler body runs" shape of api/auth.rs's
// `AuthBearer` extractor -- generalized here from a bearer-token compare to
// an IP-allowlist membership check, since that's what spec.md §4.4 calls for.
// =============================================================================

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::{request::Parts, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::strategy::StrategyCore;

#[derive(Clone)]
pub struct GatewayState {
    pub strategy: Arc<StrategyCore>,
}

/// Builds the router: `GET /health` (public, never blocks) and
/// `POST /webhook` (IP-gated, hands the body to the strategy core). CORS is
/// permissive (the caller is a server-side charting webhook, not a browser)
/// and every request gets one structured trace span, matching the teacher's
/// `api/rest.rs` router-construction shape.
pub fn router(strategy: Arc<StrategyCore>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let middleware = ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors);

    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .with_state(GatewayState { strategy })
        .layer(middleware)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Extractor that rejects a request before the handler body runs unless the
/// caller's IP is in the configured allowlist.
struct AllowedCaller;

struct IpRejection;

impl IntoResponse for IpRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "status": "error", "message": "source IP not allowlisted" });
        (StatusCode::FORBIDDEN, Json(body)).into_response()
    }
}

impl FromRequestParts<GatewayState> for AllowedCaller {
    type Rejection = IpRejection;

    async fn from_request_parts(parts: &mut Parts, state: &GatewayState) -> Result<Self, Self::Rejection> {
        match extract_caller_ip(parts) {
            Some(ip) if state.strategy.config.allowed_ips.contains(&ip) => Ok(AllowedCaller),
            Some(ip) => {
                warn!(%ip, "webhook caller not in allowlist");
                Err(IpRejection)
            }
            None => {
                warn!("webhook request carried no identifiable source IP");
                Err(IpRejection)
            }
        }
    }
}

/// Honors `X-Forwarded-For` (first element) then `X-Real-IP`, falling back
/// to the TCP peer address recorded via `ConnectInfo`.
fn extract_caller_ip(parts: &Parts) -> Option<IpAddr> {
    if let Some(xff) = parts.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }
    if let Some(real_ip) = parts.headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if let Ok(ip) = real_ip.trim().parse::<IpAddr>() {
            return Some(ip);
        }
    }
    parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|ci| ci.0.ip())
}

async fn webhook(caller: Result<AllowedCaller, IpRejection>, State(state): State<GatewayState>, body: String) -> Response {
    if let Err(rejection) = caller {
        return rejection.into_response();
    }

    let body = body.trim();
    if body.is_empty() {
        let payload = serde_json::json!({ "status": "error", "message": "empty webhook body" });
        return (StatusCode::BAD_REQUEST, Json(payload)).into_response();
    }

    let outcome = state.strategy.process_webhook(body).await;
    Json(outcome).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn parts_with_headers(headers: &[(&str, &str)]) -> Parts {
        let mut builder = axum::http::Request::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn xff_prefers_first_hop() {
        let parts = parts_with_headers(&[("x-forwarded-for", "1.2.3.4, 5.6.7.8")]);
        assert_eq!(extract_caller_ip(&parts), Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
    }

    #[test]
    fn falls_back_to_x_real_ip() {
        let parts = parts_with_headers(&[("x-real-ip", "9.9.9.9")]);
        assert_eq!(extract_caller_ip(&parts), Some(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))));
    }

    #[test]
    fn no_header_and_no_connect_info_yields_none() {
        let parts = parts_with_headers(&[]);
        assert_eq!(extract_caller_ip(&parts), None);
    }
}
