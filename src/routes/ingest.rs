use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use chrono::Utc;

use crate::error::{AppError, AppResult};
use crate::services::pipeline::CycleSummary;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", post(ingest))
}

/// Check `Authorization: Bearer <token>` against the configured ingest token.
fn authorize(headers: &HeaderMap, expected: Option<&str>) -> AppResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let provided = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

/// Run one ingestion cycle on a raw GQL dump.
async fn ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> AppResult<Json<CycleSummary>> {
    authorize(&headers, state.config.ingest.token.as_deref())?;

    if body.trim().is_empty() {
        return Err(AppError::BadRequest("Request body is empty".to_string()));
    }

    let summary = state.pipeline.run_payload(&body, Utc::now()).await?;
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(auth: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = auth {
            headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn open_when_no_token_is_configured() {
        assert!(authorize(&headers(None), None).is_ok());
    }

    #[test]
    fn bearer_token_must_match() {
        assert!(authorize(&headers(Some("Bearer s3cret")), Some("s3cret")).is_ok());
        assert!(matches!(
            authorize(&headers(Some("Bearer wrong")), Some("s3cret")),
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            authorize(&headers(Some("s3cret")), Some("s3cret")),
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            authorize(&headers(None), Some("s3cret")),
            Err(AppError::Unauthorized)
        ));
    }
}
