//! # Domain Types
//!
//! Core identifiers used across the pipeline, wrapped in newtypes so a
//! connection id can never be confused with an event sequence number and a
//! tenant id is valid by construction.
//!
//! ## Invariants
//!
//! - [`ConnId`]: monotonic per process, assigned on transport accept, never
//!   reused while the process lives.
//! - [`TenantId`]: 1..=63 chars, alphanumeric or ASCII hyphen, no leading or
//!   trailing hyphen. Case-sensitive. Any string that fails validation
//!   derives to the reserved `default` tenant instead of erroring.
//! - [`SubId`]: 1..=71 bytes of printable ASCII excluding `"` and `\`,
//!   unique per connection (the client picks it).

use std::fmt;

use crate::error::{Error, Result};

/// Maximum length of a subscription id, in bytes.
pub const MAX_SUBID_SIZE: usize = 71;

/// Maximum length of a tenant id, in characters.
pub const MAX_TENANT_ID_SIZE: usize = 63;

// =============================================================================
// Connection Identity
// =============================================================================

/// A monotonic 64-bit connection identifier.
///
/// Assigned by the transport side on accept. Every message that carries a
/// `ConnId` is routed to `workers[connId % N]`, which pins all work for one
/// connection to one worker in each pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Tenant Identity
// =============================================================================

/// The reserved tenant every unaddressed connection lands in.
pub const DEFAULT_TENANT: &str = "default";

/// A validated tenant namespace identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    /// Parses and validates a tenant id.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() || s.len() > MAX_TENANT_ID_SIZE {
            return Err(Error::proto("tenant id has invalid length"));
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(Error::proto("tenant id has invalid characters"));
        }
        if s.starts_with('-') || s.ends_with('-') {
            return Err(Error::proto("tenant id may not start or end with hyphen"));
        }
        Ok(Self(s.to_string()))
    }

    /// The reserved `default` tenant.
    pub fn default_tenant() -> Self {
        Self(DEFAULT_TENANT.to_string())
    }

    /// Derives the tenant for a connection from its HTTP `Host` header and
    /// URL path.
    ///
    /// The path takes precedence: a non-root path names the tenant directly
    /// (`/blue` addresses tenant `blue`), while `/` pins the connection to
    /// `default`. Only an empty path falls through to the leftmost hostname
    /// label. Any validation failure yields `default` rather than an error,
    /// so derivation is total and idempotent.
    pub fn derive(host: &str, path: &str) -> Self {
        if !path.is_empty() && path != "/" {
            let candidate = path.trim_start_matches('/').trim_end_matches('/');
            return match Self::parse(candidate) {
                Ok(t) => t,
                Err(_) => Self::default_tenant(),
            };
        }
        if path == "/" {
            return Self::default_tenant();
        }

        let hostname = host.split(':').next().unwrap_or("");
        let label = match hostname.split_once('.') {
            Some((label, _)) => label,
            None => return Self::default_tenant(),
        };
        match Self::parse(label) {
            Ok(t) => t,
            Err(_) => Self::default_tenant(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Subscription Identity
// =============================================================================

/// A client-chosen subscription identifier, unique within its connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubId(String);

impl SubId {
    /// Validates and wraps a subscription id.
    pub fn new(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::proto("subscription id too short"));
        }
        if s.len() > MAX_SUBID_SIZE {
            return Err(Error::proto("subscription id too long"));
        }
        let bad = |c: char| (c as u32) < 0x20 || c == '\\' || c == '"' || (c as u32) >= 0x7F;
        if s.chars().any(bad) {
            return Err(Error::proto("invalid character in subscription id"));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
