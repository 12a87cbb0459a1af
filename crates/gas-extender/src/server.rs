//! HTTP surface of the extender
//!
//! Two POST endpoints the orchestrator calls, plus a liveness probe. The
//! orchestrator's extender client treats any non-200 as a skipped extender,
//! so request problems (wrong method, wrong content type, undecodable body)
//! all answer 400 and unknown paths answer 404.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::extender::{ExtenderArgs, ExtenderBindingArgs, GasExtender};

/// Largest request body we are willing to decode (filter args carry a whole
/// pod plus the node name list)
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Create the extender router with both scheduling endpoints
pub fn extender_router(extender: Arc<GasExtender>) -> Router {
    Router::new()
        .route("/scheduler/filter", any(filter_handler))
        .route("/scheduler/bind", any(bind_handler))
        .route("/healthz", get(|| async { StatusCode::OK }))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(extender)
}

async fn filter_handler(
    State(extender): State<Arc<GasExtender>>,
    request: Request<Body>,
) -> Response {
    let args: ExtenderArgs = match decode_request(request).await {
        Ok(args) => args,
        Err(status) => return status.into_response(),
    };

    debug!(
        nodes = args.node_names.as_ref().map(Vec::len).unwrap_or(0),
        "filter request"
    );
    Json(extender.filter_nodes(&args).await).into_response()
}

async fn bind_handler(
    State(extender): State<Arc<GasExtender>>,
    request: Request<Body>,
) -> Response {
    let args: ExtenderBindingArgs = match decode_request(request).await {
        Ok(args) => args,
        Err(status) => return status.into_response(),
    };

    debug!(pod = %args.pod_name, node = %args.node, "bind request");
    Json(extender.bind_node(&args).await).into_response()
}

/// Decode a scheduling request: POST, `application/json`, valid body
async fn decode_request<T: DeserializeOwned>(request: Request<Body>) -> Result<T, StatusCode> {
    if request.method() != Method::POST {
        return Err(StatusCode::BAD_REQUEST);
    }

    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Err(StatusCode::BAD_REQUEST);
    }

    let bytes = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    serde_json::from_slice(&bytes).map_err(|e| {
        warn!(error = %e, "undecodable scheduling request");
        StatusCode::BAD_REQUEST
    })
}
