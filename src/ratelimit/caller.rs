//! Caller identity resolution.

use std::fmt;

/// Which identity a request is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Network origin of the request
    Address,
    /// Opaque access token supplied by the caller
    Token,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Address => write!(f, "address"),
            Dimension::Token => write!(f, "token"),
        }
    }
}

/// The single identity that governs a request.
///
/// A non-empty token always wins; the address is then neither checked nor
/// counted. Keys are used exactly as supplied, without normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller<'a> {
    pub dimension: Dimension,
    pub key: &'a str,
}

impl<'a> Caller<'a> {
    pub fn resolve(address: &'a str, token: &'a str) -> Self {
        if token.is_empty() {
            Self {
                dimension: Dimension::Address,
                key: address,
            }
        } else {
            Self {
                dimension: Dimension::Token,
                key: token,
            }
        }
    }
}
