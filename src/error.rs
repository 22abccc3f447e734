//! Crate-wide error types and `Result` alias.

// self
use crate::refresh::IpType;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the AlloyDB connector crate.
///
/// Every variant corresponds to one failure class a database driver may want
/// to react to differently; the kind survives all internal retry and refresh
/// plumbing. The enum is `Clone` so a single refresh outcome can be fanned
/// out to every caller waiting on it.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
	/// Malformed instance URI, unknown option value, or missing required
	/// configuration. Never retried.
	#[error("Invalid configuration for {field}: {reason}")]
	Config {
		/// Configuration field that failed validation.
		field: &'static str,
		/// Human-readable description of the violation.
		reason: String,
	},
	/// The injected token source failed to produce a usable OAuth2 token.
	#[error("Credential source failed: {0}")]
	Auth(String),
	/// Non-2xx response from the AlloyDB Admin API.
	#[error("AlloyDB Admin API returned {status}: {message}")]
	ControlPlane {
		/// HTTP status returned by the API.
		status: http::StatusCode,
		/// Server-provided error body, truncated for logging safety.
		message: String,
	},
	/// TCP connect, DNS resolution, TLS handshake, or transport failure.
	#[error("Network failure: {0}")]
	Network(String),
	/// The metadata exchange was rejected or its framing was malformed.
	#[error("Metadata exchange failed: {0}")]
	Protocol(String),
	/// The issued client certificate is expired, malformed, or unusable.
	#[error("Certificate error: {0}")]
	Certificate(String),
	/// The instance does not expose an address of the requested kind.
	#[error("Instance has no {ip_type} connectivity configured")]
	IpTypeNotSupported {
		/// Address kind that was requested but is absent.
		ip_type: IpType,
	},
	/// The connector was closed while the operation was pending.
	#[error("Connector is closed")]
	Closed,
}
impl Error {
	/// Whether the refresh machinery may retry the failed operation.
	///
	/// Only server-side (5xx) control-plane failures and transport-level
	/// failures qualify; 4xx responses, credential failures, and
	/// configuration errors are surfaced immediately.
	pub(crate) fn is_transient(&self) -> bool {
		match self {
			Self::ControlPlane { status, .. } => status.is_server_error(),
			Self::Network(_) => true,
			_ => false,
		}
	}
}
