//! Caller identity for rate limiting and session records.

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{header::USER_AGENT, request::Parts, HeaderMap},
};
use std::{convert::Infallible, net::SocketAddr};

use crate::credentials::ClientContext;

/// Used when neither the proxy headers nor the socket yield an address.
pub const UNKNOWN_CLIENT_IP: &str = "unknown";

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Resolve the caller's address: first `X-Forwarded-For` hop, then `X-Real-IP`, then
/// `CF-Connecting-IP`, then the socket peer.
#[must_use]
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = header_value(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    forwarded
        .or_else(|| header_value(headers, "x-real-ip"))
        .or_else(|| header_value(headers, "cf-connecting-ip"))
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT_IP.to_string())
}

/// Extractor wrapping the resolved [`ClientContext`].
pub struct Client(pub ClientContext);

#[async_trait]
impl<S> FromRequestParts<S> for Client
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let peer = ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .ok()
            .map(|ConnectInfo(addr)| addr);
        let ip_address = resolve_client_ip(&parts.headers, peer);
        let user_agent = header_value(&parts.headers, USER_AGENT.as_str()).unwrap_or_default();
        Ok(Self(ClientContext::new(&ip_address, user_agent)))
    }
}
