//! Client key derivation.

use axum::extract::{ConnectInfo, Request};
use std::net::SocketAddr;

use crate::config::ClientKeySource;
use crate::error::{RatekeeperError, Result};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// A key that identifies the caller a rate limit applies to.
///
/// Derived from the connection or its forwarding headers, so clients behind
/// the same NAT or proxy share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the key for a request according to `source`.
    ///
    /// Fails when the peer address is needed but the server was not started
    /// with connection info attached.
    pub fn from_request(source: ClientKeySource, request: &Request) -> Result<Self> {
        if source == ClientKeySource::ForwardedFor {
            let first_hop = request
                .headers()
                .get(X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());

            if let Some(hop) = first_hop {
                return Ok(Self::new(hop));
            }
        }

        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr)
            .ok_or_else(|| {
                RatekeeperError::Config("peer address not available on request".to_string())
            })?;

        Ok(match source {
            ClientKeySource::PeerAddr => Self::new(peer.to_string()),
            ClientKeySource::PeerIp | ClientKeySource::ForwardedFor => {
                Self::new(peer.ip().to_string())
            }
        })
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
