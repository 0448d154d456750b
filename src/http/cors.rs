use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::config::AppConfig;

const ALLOWED_METHODS: &str = "POST, OPTIONS";
const MAX_AGE_SECS: &str = "86400";

/// Headers echoed for an allow-listed origin. Empty for any other origin.
pub fn cors_headers(config: &AppConfig, request: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let Some(origin) = request.get(ORIGIN) else {
        return headers;
    };
    let allowed = origin
        .to_str()
        .map(|o| config.is_origin_allowed(o))
        .unwrap_or(false);
    if allowed {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.insert(VARY, HeaderValue::from_static("Origin"));
    }
    if let Some(requested) = request.get(ACCESS_CONTROL_REQUEST_HEADERS) {
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
    headers
}

/// Copy the CORS headers onto a response, leaving existing ones alone.
pub fn with_cors(config: &AppConfig, request: &HeaderMap, mut response: Response) -> Response {
    for (name, value) in cors_headers(config, request) {
        if let Some(name) = name {
            response.headers_mut().entry(name).or_insert(value);
        }
    }
    response
}

/// 204 for `OPTIONS /chat`. Only a full browser preflight gets the method
/// and max-age headers.
pub fn preflight(config: &AppConfig, request: &HeaderMap) -> Response {
    let is_preflight = request.contains_key(ORIGIN)
        && request.contains_key(ACCESS_CONTROL_REQUEST_METHOD)
        && request.contains_key(ACCESS_CONTROL_REQUEST_HEADERS);
    if !is_preflight {
        return StatusCode::NO_CONTENT.into_response();
    }

    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.extend(cors_headers(config, request));
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOWED_METHODS));
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(MAX_AGE_SECS));
    response
}
