//! Caller identity resolution.
//!
//! An API key always wins over any address. Without one, the caller is the
//! last hop listed in the forwarding header, falling back to the transport
//! peer. Only the last forwarded entry is trusted: it is the one our own
//! proxy appended. This is not a defense against spoofed forwarding chains
//! when no trusted proxy sits in front of the gateway.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use axum::http::{HeaderMap, HeaderName};

use super::key::{IdentityClass, RateKey};
use crate::config::IdentityConfig;
use crate::error::{Result, ThrottleError};

/// Derives a [`RateKey`] from request headers and the peer address.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    api_key_header: HeaderName,
    forwarded_header: HeaderName,
}

impl IdentityResolver {
    /// Create a resolver reading the given header names.
    pub fn new(api_key_header: &str, forwarded_header: &str) -> Result<Self> {
        Ok(Self {
            api_key_header: parse_header_name(api_key_header)?,
            forwarded_header: parse_header_name(forwarded_header)?,
        })
    }

    pub fn from_config(config: &IdentityConfig) -> Result<Self> {
        Self::new(&config.api_key_header, &config.forwarded_header)
    }

    /// Resolve the caller's identity.
    ///
    /// `peer` is the transport address in `host:port` form.
    pub fn resolve(&self, headers: &HeaderMap, peer: &str) -> Result<RateKey> {
        if let Some(token) = self.api_key(headers)? {
            return Ok(RateKey::new(IdentityClass::Token, token));
        }

        if let Some(ip) = self.forwarded_address(headers) {
            return Ok(RateKey::new(IdentityClass::Address, ip.to_string()));
        }

        let ip = parse_peer(peer)?;
        Ok(RateKey::new(IdentityClass::Address, ip.to_string()))
    }

    /// The API key, read from the raw header bytes so non-ASCII keys still
    /// count as tokens. Keys that are not UTF-8 cannot form a key.
    fn api_key<'a>(&self, headers: &'a HeaderMap) -> Result<Option<&'a str>> {
        let Some(value) = headers.get(&self.api_key_header) else {
            return Ok(None);
        };
        if value.is_empty() {
            return Ok(None);
        }
        std::str::from_utf8(value.as_bytes()).map(Some).map_err(|_| {
            ThrottleError::IdentityResolution(format!(
                "{} header is not valid UTF-8",
                self.api_key_header
            ))
        })
    }

    fn forwarded_address(&self, headers: &HeaderMap) -> Option<IpAddr> {
        let chain = header_str(headers, &self.forwarded_header)?;
        let last = chain.rsplit(',').next()?.trim();
        last.parse().ok()
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self {
            api_key_header: HeaderName::from_static("api_key"),
            forwarded_header: HeaderName::from_static("x-forwarded-for"),
        }
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|e| ThrottleError::Config(format!("invalid header name '{}': {}", name, e)))
}

/// Non-empty visible-ASCII value of a header, if any.
fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn parse_peer(peer: &str) -> Result<IpAddr> {
    let addr: SocketAddr = peer.parse().map_err(|_| {
        ThrottleError::IdentityResolution(format!("cannot derive client address from '{}'", peer))
    })?;

    Ok(match addr.ip() {
        IpAddr::V6(ip) if ip == Ipv6Addr::LOCALHOST => IpAddr::V4(Ipv4Addr::LOCALHOST),
        ip => ip,
    })
}
