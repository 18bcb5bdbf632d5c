//! Admission middleware for the credential endpoints.

use crate::session::{Admission, AdmissionControl, SessionError};
use axum::{
    body::Body,
    extract::{ConnectInfo, Extension},
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{net::SocketAddr, sync::Arc};
use tracing::warn;

/// Identify the caller: first `x-forwarded-for` hop, then `x-real-ip`, then the peer.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty());
    if let Some(hop) = forwarded {
        return hop.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string())
}

pub async fn admit(
    admission: Extension<Arc<AdmissionControl>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(request.headers(), peer);

    match admission.admit(&key) {
        Admission::Allowed => next.run(request).await,
        Admission::Denied { retry_after } => {
            warn!(client = %key, path = %request.uri().path(), "request denied by admission control");
            let seconds = retry_after
                .as_secs()
                .saturating_add(u64::from(retry_after.subsec_nanos() > 0))
                .max(1);
            let mut response = SessionError::TooManyRequests.into_response();
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
            response
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn client_key_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.5, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(client_key(&headers, Some(peer)), "203.0.113.5");

        headers.remove("x-forwarded-for");
        assert_eq!(client_key(&headers, Some(peer)), "198.51.100.7");

        headers.remove("x-real-ip");
        assert_eq!(client_key(&headers, Some(peer)), "127.0.0.1");
        assert_eq!(client_key(&headers, None), "unknown");
    }
}
