//! OAuth2 token provider seam.
//!
//! Credential acquisition itself lives outside this crate; callers inject any
//! source of bearer tokens with sufficient scope for the AlloyDB Admin API
//! (`https://www.googleapis.com/auth/cloud-platform`), typically backed by
//! application default credentials.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use async_trait::async_trait;
// self
use crate::_prelude::*;

/// Bearer OAuth2 access token.
///
/// The token value is intentionally excluded from `Debug` output; it is only
/// readable through [`AccessToken::secret`].
#[derive(Clone)]
pub struct AccessToken(String);
impl AccessToken {
	/// Wrap a raw bearer token string.
	pub fn new(token: impl Into<String>) -> Self {
		Self(token.into())
	}

	/// Raw token value, for placement in an `Authorization` header or the
	/// metadata exchange.
	pub fn secret(&self) -> &str {
		&self.0
	}
}
impl Debug for AccessToken {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.write_str("AccessToken(<redacted>)")
	}
}

/// Source of OAuth2 access tokens for Admin API calls and IAM database
/// authentication.
///
/// Implementations are expected to serve cached tokens while they remain
/// valid and refresh them transparently; the connector calls
/// [`TokenProvider::access_token`] immediately before every operation that
/// needs one so the token carries as much remaining lifetime as the provider
/// can offer.
#[async_trait]
pub trait TokenProvider: Debug + Send + Sync {
	/// Produce a currently-valid access token.
	async fn access_token(&self) -> Result<AccessToken>;
}

/// Token provider serving one fixed token.
///
/// Suitable for tests and short-lived tooling; production deployments should
/// inject a provider backed by real application credentials.
#[derive(Clone, Debug)]
pub struct StaticTokenProvider {
	token: AccessToken,
}
impl StaticTokenProvider {
	/// Build a provider that always returns `token`.
	pub fn new(token: impl Into<String>) -> Self {
		Self { token: AccessToken::new(token) }
	}
}
#[async_trait]
impl TokenProvider for StaticTokenProvider {
	async fn access_token(&self) -> Result<AccessToken> {
		Ok(self.token.clone())
	}
}
