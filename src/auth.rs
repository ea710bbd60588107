//! API key authentication, mirroring `vantage-collector/app/auth.py`: a
//! single shared secret carried in the `X-API-Key` header. Disabled by
//! default; when enabled, a missing configured key is a startup error
//! rather than something discovered on the first request.

use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

const HEADER_NAME: &str = "x-api-key";

#[derive(Debug, Clone)]
pub struct ApiKeyAuth {
    enabled: bool,
    api_key: Option<String>,
}

impl ApiKeyAuth {
    /// Fails fast if auth is enabled without a configured key, instead of
    /// rejecting every request at runtime with a 500.
    pub fn new(enabled: bool, api_key: Option<String>) -> Result<Self, anyhow::Error> {
        if enabled && api_key.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("auth is enabled but no API key is configured");
        }
        Ok(ApiKeyAuth { enabled, api_key })
    }

    fn verify(&self, provided: Option<&HeaderValue>) -> Result<(), StatusCode> {
        if !self.enabled {
            return Ok(());
        }
        let expected = self.api_key.as_deref().unwrap_or("");
        let provided = provided.and_then(|v| v.to_str().ok()).unwrap_or("");
        if provided.is_empty() {
            return Err(StatusCode::UNAUTHORIZED);
        }
        if provided.as_bytes().ct_eq(expected.as_bytes()).into() {
            Ok(())
        } else {
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

pub async fn require_api_key(
    axum::extract::State(auth): axum::extract::State<ApiKeyAuth>,
    request: Request,
    next: Next,
) -> Response {
    let header = request.headers().get(HEADER_NAME).cloned();
    match auth.verify(header.as_ref()) {
        Ok(()) => next.run(request).await,
        Err(status) => (status, "invalid or missing API key").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_auth_allows_anything() {
        let auth = ApiKeyAuth::new(false, None).unwrap();
        assert!(auth.verify(None).is_ok());
    }

    #[test]
    fn enabled_without_key_fails_to_construct() {
        assert!(ApiKeyAuth::new(true, None).is_err());
        assert!(ApiKeyAuth::new(true, Some(String::new())).is_err());
    }

    #[test]
    fn enabled_rejects_missing_header() {
        let auth = ApiKeyAuth::new(true, Some("secret".into())).unwrap();
        assert_eq!(auth.verify(None), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn enabled_rejects_wrong_key() {
        let auth = ApiKeyAuth::new(true, Some("secret".into())).unwrap();
        let header = HeaderValue::from_static("wrong");
        assert_eq!(auth.verify(Some(&header)), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn enabled_accepts_matching_key() {
        let auth = ApiKeyAuth::new(true, Some("secret".into())).unwrap();
        let header = HeaderValue::from_static("secret");
        assert!(auth.verify(Some(&header)).is_ok());
    }
}
