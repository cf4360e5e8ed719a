use crate::aggregator::Aggregator;
use crate::config::ApiConfig;
use crate::error::StoreError;
use crate::models::{ProductMention, WarehouseSummary};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Aggregator,
}

/// Query parameters for the top-products report.
///
/// `limit` is taken as raw text so malformed values get the same JSON error
/// body as out-of-range ones.
#[derive(Debug, Deserialize)]
pub struct TopProductsQuery {
    pub limit: Option<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

impl From<StoreError> for (StatusCode, Json<ErrorResponse>) {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::InvalidQueryParameter { .. } => {
                api_error(StatusCode::BAD_REQUEST, err.to_string(), "INVALID_QUERY_PARAMETER")
            }
            e if e.is_transient() => {
                warn!(error = %err, "Warehouse unavailable");
                api_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Warehouse unavailable",
                    "STORE_UNAVAILABLE",
                )
            }
            _ => {
                error!(error = %err, "Report query failed");
                api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to run report query",
                    "QUERY_ERROR",
                )
            }
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/reports/top-products", get(top_products))
        .route("/api/reports/top-products", get(top_products))
        .route("/reports/summary", get(summary))
        .route("/api/reports/summary", get(summary))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "medgram-api"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.aggregator.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Most-mentioned products
#[instrument(skip(state))]
async fn top_products(
    State(state): State<AppState>,
    Query(params): Query<TopProductsQuery>,
) -> Result<Json<Vec<ProductMention>>, ApiError> {
    let limit = match params.limit.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
            api_error(
                StatusCode::BAD_REQUEST,
                format!("Invalid query parameter `limit`: expected a positive integer, got {raw:?}"),
                "INVALID_QUERY_PARAMETER",
            )
        })?),
    };

    let mentions = state.aggregator.top_products(limit).await?;
    Ok(Json(mentions))
}

/// Warehouse-wide totals
#[instrument(skip(state))]
async fn summary(State(state): State<AppState>) -> Result<Json<WarehouseSummary>, ApiError> {
    Ok(Json(state.aggregator.summary().await?))
}

/// Start the reporting API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting reporting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryWarehouse;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router_with(store: Arc<InMemoryWarehouse>) -> Router {
        let state = AppState {
            aggregator: Aggregator::new(store),
        };
        create_router(state, &ApiConfig::default())
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn store_with_tie() -> Arc<InMemoryWarehouse> {
        let store = Arc::new(InMemoryWarehouse::new());
        for id in 0..50 {
            store.record_product_mention(id, "paracetamol");
            store.record_product_mention(1_000 + id, "ibuprofen");
        }
        store
    }

    #[tokio::test]
    async fn test_top_products_tie_broken_alphabetically() {
        let (status, body) =
            get_json(router_with(store_with_tie()), "/reports/top-products?limit=1").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!([{"product_name": "ibuprofen", "mention_count": 50}])
        );
    }

    #[tokio::test]
    async fn test_legacy_api_prefix_served() {
        let (status, body) =
            get_json(router_with(store_with_tie()), "/api/reports/top-products").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_positive_limit_is_bad_request() {
        for uri in [
            "/reports/top-products?limit=0",
            "/reports/top-products?limit=-5",
            "/reports/top-products?limit=ten",
        ] {
            let (status, body) = get_json(router_with(store_with_tie()), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["code"], "INVALID_QUERY_PARAMETER");
        }
    }

    #[tokio::test]
    async fn test_store_unavailable_is_503() {
        let store = store_with_tie();
        store.set_available(false);

        let (status, body) = get_json(router_with(store.clone()), "/reports/top-products").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "STORE_UNAVAILABLE");

        let (status, _) = get_json(router_with(store), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let (status, body) = get_json(router_with(store_with_tie()), "/reports/summary").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_messages"], 0);
        assert_eq!(body["total_detections"], 0);
    }
}
