//! Quiz backend implementations.
//!
//! | Feature        | Backend              |
//! |----------------|----------------------|
//! | `http-backend` | [`HttpQuizBackend`]  |

#[cfg(feature = "http-backend")]
pub mod http;

#[cfg(feature = "http-backend")]
pub use http::{ApiCredentials, HttpBackendConfig, HttpQuizBackend};
