//! Remote operations interface.
//!
//! The engine never talks to a cloud API itself. A resource adapter
//! implements [`RemoteOps`] and is handed to the
//! [`Reconciler`](crate::reconciler::Reconciler) explicitly; there is no
//! ambient client.
//!
//! The engine does not assume any of these calls are idempotent. Every
//! mutation carries a [`RequestToken`] that stays the same across retries of
//! one operation. Adapters whose backend deduplicates on such tokens report
//! it through [`RemoteOps::supports_request_tokens`]; for the others the
//! engine calls [`RemoteOps::find_existing`] before re-issuing a create.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RemoteError;
use crate::planner::Delta;
use crate::value::Block;

/// Result type for remote calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Client-side token identifying one logical mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestToken(String);

/// Context passed with every remote call.
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    /// Resource type, selecting the adapter's API.
    pub resource_type: String,
    /// Resource name from configuration.
    pub name: String,
    /// Token shared by all attempts of this operation.
    pub token: RequestToken,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// A remote object returned by create or lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// External identifier assigned by the remote system.
    pub identifier: String,
    /// State the remote system reports for the object.
    pub observed: Block,
}

/// Operations the engine needs from the remote system.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteOps: Send + Sync {
    /// Creates an object from a fully resolved desired block.
    async fn create(&self, request: &RemoteRequest, desired: &Block) -> RemoteResult<Created>;

    /// Reads the current state of an object.
    ///
    /// Returns [`RemoteError::NotFound`] if the object does not exist.
    async fn read(&self, request: &RemoteRequest, identifier: &str) -> RemoteResult<Block>;

    /// Applies a field-level delta in place and returns the new state.
    ///
    /// `desired` is the full resolved desired block for adapters that need to
    /// send whole objects.
    async fn update(
        &self,
        request: &RemoteRequest,
        identifier: &str,
        delta: &Delta,
        desired: &Block,
    ) -> RemoteResult<Block>;

    /// Deletes an object.
    async fn delete(&self, request: &RemoteRequest, identifier: &str) -> RemoteResult<()>;

    /// Looks for an object created by an earlier, unconfirmed attempt.
    ///
    /// Adapters match on the request token or on the resource's natural key
    /// (for example name plus resource group). The default finds nothing.
    async fn find_existing(
        &self,
        _request: &RemoteRequest,
        _desired: &Block,
    ) -> RemoteResult<Option<Created>> {
        Ok(None)
    }

    /// Returns true if the backend deduplicates mutations by request token.
    fn supports_request_tokens(&self) -> bool {
        false
    }
}

impl RequestToken {
    /// Generates a fresh token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an existing token, for example one restored from state.
    #[must_use]
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RemoteRequest {
    /// Creates a request context for the first attempt.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>, token: RequestToken) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            token,
            attempt: 1,
        }
    }

    /// Returns a copy for the given attempt number.
    #[must_use]
    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(RequestToken::generate(), RequestToken::generate());
        assert_eq!(RequestToken::from_string("t-1").as_str(), "t-1");
    }

    #[test]
    fn test_request_attempts_share_token() {
        let request = RemoteRequest::new("virtual_machine", "vm1", RequestToken::generate());
        let retry = request.for_attempt(3);
        assert_eq!(retry.attempt, 3);
        assert_eq!(retry.token, request.token);
    }
}
