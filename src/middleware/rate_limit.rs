// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Rate limiting middleware.

use crate::services::rate_limit::RateLimitDecision;
use crate::AppState;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// Body of a 429 response.
#[derive(Serialize)]
struct RateLimitedResponse {
    detail: &'static str,
    retry_after: u64,
    limit: u32,
    window: u64,
}

/// Rate-limited action for a request, if any.
pub fn action_for(method: &Method, path: &str) -> Option<&'static str> {
    if path.starts_with("/audio/predict") && !path.starts_with("/audio/predictions") {
        if method == Method::POST || method == Method::PUT {
            return Some("prediction");
        }
    } else if path.starts_with("/audio/waveform") && method == Method::POST {
        return Some("upload");
    }
    None
}

/// Client identifier for rate limiting.
///
/// With no trusted proxies this is the peer address. Behind `trusted_hops`
/// proxies, each of which appends the address it received from, the client
/// is the `trusted_hops`-th `X-Forwarded-For` entry from the right; entries
/// left of it are client controlled and ignored. A header shorter than
/// that falls back to the peer.
pub fn client_identifier(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_hops: usize,
) -> String {
    forwarded_client(headers, trusted_hops)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_client(headers: &HeaderMap, trusted_hops: usize) -> Option<String> {
    if trusted_hops == 0 {
        return None;
    }

    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .collect();

    let index = hops.len().checked_sub(trusted_hops)?;
    Some(hops[index])
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Enforce per-client limits on prediction and upload endpoints.
pub async fn enforce_rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(action) = action_for(request.method(), request.uri().path()) else {
        return next.run(request).await;
    };

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identifier = client_identifier(request.headers(), peer, state.config.trusted_proxy_hops);

    let Some(decision) = state.rate_limiter.check(&identifier, action).await else {
        return next.run(request).await;
    };

    match decision {
        RateLimitDecision::Limited {
            retry_after,
            limit,
            window_secs,
        } => {
            tracing::warn!(
                identifier = %identifier,
                action,
                retry_after,
                "Rate limit exceeded"
            );
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(RateLimitedResponse {
                    detail: "Rate limit exceeded",
                    retry_after,
                    limit,
                    window: window_secs,
                }),
            )
                .into_response();
            response
                .headers_mut()
                .insert("Retry-After", HeaderValue::from(retry_after));
            response
        }
        RateLimitDecision::Allowed {
            remaining,
            limit,
            window_secs,
        } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
            headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
            headers.insert("X-RateLimit-Window", HeaderValue::from(window_secs));
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_mapping() {
        assert_eq!(action_for(&Method::POST, "/audio/predict"), Some("prediction"));
        assert_eq!(action_for(&Method::PUT, "/audio/predict"), Some("prediction"));
        assert_eq!(action_for(&Method::GET, "/audio/predict"), None);
        assert_eq!(action_for(&Method::POST, "/audio/waveform"), Some("upload"));
        assert_eq!(action_for(&Method::GET, "/audio/predictions"), None);
        assert_eq!(action_for(&Method::GET, "/"), None);
        assert_eq!(action_for(&Method::HEAD, "/health"), None);
    }

    #[test]
    fn test_client_identifier_without_proxy() {
        let peer: SocketAddr = "10.0.0.7:5555".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(client_identifier(&headers, Some(peer), 0), "10.0.0.7");
        assert_eq!(client_identifier(&headers, None, 0), "unknown");

        // Not trusted without a configured proxy
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_identifier(&headers, Some(peer), 0), "10.0.0.7");
    }

    #[test]
    fn test_client_identifier_behind_trusted_proxies() {
        let peer: SocketAddr = "10.0.0.7:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.1.1.1, 203.0.113.9, 10.0.0.1"),
        );

        // Leftmost entry is whatever the client sent
        assert_eq!(client_identifier(&headers, Some(peer), 1), "10.0.0.1");
        assert_eq!(client_identifier(&headers, Some(peer), 2), "203.0.113.9");
        assert_eq!(client_identifier(&headers, Some(peer), 4), "10.0.0.7");
    }

    #[test]
    fn test_client_identifier_joins_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.append("x-forwarded-for", HeaderValue::from_static("1.1.1.1"));
        headers.append("x-forwarded-for", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(client_identifier(&headers, None, 1), "198.51.100.4");

        headers.insert("x-forwarded-for", HeaderValue::from_static(" , "));
        assert_eq!(client_identifier(&headers, None, 1), "unknown");
    }
}
