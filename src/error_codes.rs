//! Error codes carried by realtime service `Error` and `Nack` frames.
//!
//! Codes serialize using `SCREAMING_SNAKE_CASE` to match the service's JSON format.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error codes returned by the realtime service.
///
/// The service sends these as `"SCREAMING_SNAKE_CASE"` strings (e.g., `"TOKEN_EXPIRED"`).
///
/// Use [`description()`](ErrorCode::description) for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication errors
    TokenMissing,
    TokenInvalid,
    TokenExpired,

    // Channel errors
    ChannelDenied,
    ChannelNotFound,
    PublishRejected,
    PresenceNotAllowed,
    MessageTooLarge,

    // Rate limiting
    RateLimitExceeded,
    ConnectionLimitExceeded,

    // Service errors
    InternalError,
    ServiceUnavailable,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::TokenMissing => "No realtime token was supplied with the connection.",
            Self::TokenInvalid => {
                "The realtime token is malformed or was not issued for this service. Start the session again to obtain a new token."
            }
            Self::TokenExpired => {
                "The realtime token has expired. Fetch a fresh token and reconnect."
            }
            Self::ChannelDenied => "The token does not grant access to this channel.",
            Self::ChannelNotFound => "The requested channel does not exist.",
            Self::PublishRejected => "The service refused to accept the published message.",
            Self::PresenceNotAllowed => "Presence is not enabled for this channel.",
            Self::MessageTooLarge => {
                "The message size exceeds the maximum allowed limit. Please send a smaller message."
            }
            Self::RateLimitExceeded => {
                "Too many messages in a short time. Please slow down and try again later."
            }
            Self::ConnectionLimitExceeded => {
                "Too many active connections for this account. Close other connections first."
            }
            Self::InternalError => {
                "An internal service error occurred. Please try again or contact support if the issue persists."
            }
            Self::ServiceUnavailable => {
                "The service is temporarily unavailable. Please try again in a few moments."
            }
        }
    }

    /// Whether this code means the connection credentials are unusable.
    ///
    /// The connection moves to `Failed` on these and is only retried on an
    /// explicit reconnect.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::TokenMissing | Self::TokenInvalid | Self::TokenExpired
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
