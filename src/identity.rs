//! Identity types for admission requests: client IPs, user ids and emails.
use std::fmt;
use std::net::IpAddr;

use axum::http::{HeaderMap, HeaderName};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("user id must be between 1 and {max} characters")]
    UserIdLength { max: usize },
    #[error("user id may not contain whitespace or control characters")]
    UserIdCharacters,
    #[error("email address must contain a local part and a domain")]
    EmailFormat,
}

/// Canonical, lower-cased client address used as the anonymous rate-limit key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIp(String);

impl ClientIp {
    pub const UNKNOWN: &'static str = "unknown";

    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::unknown();
        }
        Self(trimmed.to_ascii_lowercase())
    }

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_owned())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proxy headers consulted after the trusted platform header, in order.
const FORWARDING_HEADERS: [&str; 5] = [
    "x-forwarded-for",
    "cf-connecting-ip",
    "x-real-ip",
    "x-client-ip",
    "remote-addr",
];

/// Derives the client address from request metadata.
///
/// The first non-empty source wins: the trusted platform header (when one is
/// configured), the forwarding headers in [`FORWARDING_HEADERS`] order, the
/// TCP peer, and finally `"unknown"`.
#[derive(Debug, Clone, Default)]
pub struct ClientIpResolver {
    trusted_header: Option<HeaderName>,
}

impl ClientIpResolver {
    pub const fn new(trusted_header: Option<HeaderName>) -> Self {
        Self { trusted_header }
    }

    pub fn resolve(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> ClientIp {
        let trusted = self
            .trusted_header
            .as_ref()
            .and_then(|name| header_value(headers, name.as_str()));
        let forwarded = || {
            FORWARDING_HEADERS
                .iter()
                .find_map(|name| header_value(headers, name))
        };

        trusted
            .or_else(forwarded)
            .or_else(|| peer.map(|addr| addr.to_string()))
            .map_or_else(ClientIp::unknown, |raw| ClientIp::new(&raw))
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(name)?.to_str().ok()?;
    // x-forwarded-for carries the whole proxy chain; the client is first.
    let first = raw.split(',').next().unwrap_or_default().trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_owned())
    }
}

/// Stable identifier supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub const MAX_LEN: usize = 128;

    pub fn parse(input: &str) -> Result<Self, IdentityError> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed.len() > Self::MAX_LEN {
            return Err(IdentityError::UserIdLength { max: Self::MAX_LEN });
        }
        if trimmed
            .chars()
            .any(|c| c.is_control() || c.is_whitespace() || c == '/')
        {
            return Err(IdentityError::UserIdCharacters);
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A syntactically plausible email address with its lower-cased domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    address: String,
    domain: String,
}

impl EmailAddress {
    pub fn parse(input: &str) -> Result<Self, IdentityError> {
        let trimmed = input.trim();
        let (local, domain) = trimmed.rsplit_once('@').ok_or(IdentityError::EmailFormat)?;
        if local.is_empty() || domain.is_empty() || domain.contains(char::is_whitespace) {
            return Err(IdentityError::EmailFormat);
        }
        Ok(Self {
            address: trimmed.to_owned(),
            domain: domain.to_ascii_lowercase(),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}
