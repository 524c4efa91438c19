//! Client key extraction.
//!
//! A [`ClientKey`] is the identity under which quota is tracked. Requests are
//! mapped to keys by a [`KeyExtractor`]; the built-in [`KeySource`] covers the
//! caller's network address, a proxy-forwarded address and arbitrary headers
//! such as API keys or user ids.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::http::{HeaderName, Request};
use serde::{Deserialize, Serialize};

use crate::error::{FloodgateError, Result};

/// Key shared by every request whose origin cannot be resolved.
///
/// Built-in sources prefix their keys, so no request can produce this one.
const FALLBACK_KEY: &str = "unknown";

const IP_PREFIX: &str = "ip:";
const HEADER_PREFIX: &str = "hdr:";

const FORWARDED_FOR: &str = "x-forwarded-for";

/// An opaque identifier for the origin of a request.
///
/// Cloning is cheap; the underlying string is reference counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(Arc<str>);

impl ClientKey {
    /// Create a key from any string-like identity.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// The single shared key used when extraction fails.
    ///
    /// All unidentifiable callers share one budget, so a missing key limits
    /// more strictly instead of letting requests through.
    pub fn fallback() -> Self {
        Self(Arc::from(FALLBACK_KEY))
    }

    /// Whether this is the shared fallback key.
    pub fn is_fallback(&self) -> bool {
        &*self.0 == FALLBACK_KEY
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        Self::new(format!("{}{}", IP_PREFIX, ip))
    }
}

impl From<&str> for ClientKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the [`ClientKey`] of a request.
///
/// Returning `None` means the origin could not be resolved; the controller
/// then charges the request to [`ClientKey::fallback`].
pub trait KeyExtractor: Send + Sync + 'static {
    /// Extract the client key from a request.
    fn extract<B>(&self, request: &Request<B>) -> Option<ClientKey>;
}

/// Built-in key extractors, selectable from configuration.
///
/// Addresses are keyed as `ip:<addr>` and header values as `hdr:<value>`, so a
/// header can never impersonate an address or the fallback key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySource {
    /// The IP address of the connected peer.
    #[default]
    Peer,
    /// The first hop of `X-Forwarded-For`, falling back to the peer address.
    ///
    /// Only meaningful behind a trusted proxy that sets the header.
    ForwardedFor,
    /// The value of a named request header, e.g. an API key.
    Header {
        /// Header name, case-insensitive
        name: String,
    },
}

impl KeySource {
    /// Check that the source is usable.
    pub fn validate(&self) -> Result<()> {
        if let KeySource::Header { name } = self {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                FloodgateError::Config(format!("invalid key header name {:?}: {}", name, e))
            })?;
        }
        Ok(())
    }
}

impl KeyExtractor for KeySource {
    fn extract<B>(&self, request: &Request<B>) -> Option<ClientKey> {
        match self {
            KeySource::Peer => peer_ip(request).map(ClientKey::from),
            KeySource::ForwardedFor => forwarded_ip(request)
                .or_else(|| peer_ip(request))
                .map(ClientKey::from),
            KeySource::Header { name } => request
                .headers()
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| ClientKey::new(format!("{}{}", HEADER_PREFIX, value))),
        }
    }
}

/// The peer IP recorded by `into_make_service_with_connect_info`.
fn peer_ip<B>(request: &Request<B>) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn forwarded_ip<B>(request: &Request<B>) -> Option<IpAddr> {
    request
        .headers()
        .get(FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}
