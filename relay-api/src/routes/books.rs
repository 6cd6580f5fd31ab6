//! Reconstructed order-book endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use relay_core::{BookKey, BookView, Depth};
use serde::Serialize;
use tracing::error;

use crate::AppState;

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(code: StatusCode, error: impl ToString) -> ApiError {
    (
        code,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// Current reconstructed book for `(symbol, depth)`
async fn get_book(
    State(state): State<AppState>,
    Path((symbol, depth)): Path<(String, u32)>,
) -> Result<Json<BookView>, ApiError> {
    let depth = Depth::new(depth).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    let key = BookKey::new(&symbol, depth).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;

    match state.relay.book_view(key.clone()).await {
        Ok(Some(view)) => Ok(Json(view)),
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("{} has no subscribers", key),
        )),
        Err(e) => {
            error!("Book query for {} failed: {}", key, e);
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, e))
        }
    }
}

/// Create book routes
pub fn routes() -> Router<AppState> {
    Router::new().route("/books/{symbol}/{depth}", get(get_book))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::app_state;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get(uri: &str) -> (StatusCode, Value) {
        let response = routes()
            .with_state(app_state())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_unknown_book_is_not_found() {
        let (status, body) = get("/books/btcusdt/50").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "orderbook.50.BTCUSDT has no subscribers");
    }

    #[tokio::test]
    async fn test_invalid_depth_is_bad_request() {
        let (status, body) = get("/books/BTCUSDT/30").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("30"));

        let (status, _) = get("/books/BTCUSDT/deep").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_symbol_is_bad_request() {
        let (status, _) = get("/books/BTC%2FUSDT/50").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
