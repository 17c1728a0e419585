//! Outcome of a rate limit check.

use std::fmt;

use super::caller::Dimension;

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    AddressLimitExceeded,
    TokenLimitExceeded,
    AddressBlocked,
    TokenBlocked,
    /// The storage gateway could not answer; the engine fails closed
    StorageFailure,
}

impl RejectReason {
    pub(crate) fn limit_exceeded(dimension: Dimension) -> Self {
        match dimension {
            Dimension::Address => RejectReason::AddressLimitExceeded,
            Dimension::Token => RejectReason::TokenLimitExceeded,
        }
    }

    pub(crate) fn blocked(dimension: Dimension) -> Self {
        match dimension {
            Dimension::Address => RejectReason::AddressBlocked,
            Dimension::Token => RejectReason::TokenBlocked,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressLimitExceeded => write!(f, "address rate limit exceeded"),
            Self::TokenLimitExceeded => write!(f, "token rate limit exceeded"),
            Self::AddressBlocked => write!(f, "address is blocked"),
            Self::TokenBlocked => write!(f, "token is blocked"),
            Self::StorageFailure => write!(f, "rate limit storage unavailable"),
        }
    }
}

/// Admit or reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Reject(RejectReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}
