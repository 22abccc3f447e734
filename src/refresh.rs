//! Refresh result assembly.
//!
//! A refresh turns one round of Admin API calls into an immutable
//! [`ConnectionInfo`]: the instance addresses, its server-assigned identity,
//! the certificate expiry, and a ready-to-dial TLS configuration performing
//! mutual authentication.

// std
use std::{fmt, str::FromStr};
// crates.io
use rustls::{
	ClientConfig, RootCertStore,
	pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};
use serde::{Deserialize, Serialize};
use x509_parser::pem::parse_x509_pem;
// self
use crate::{
	_prelude::*,
	api::client::ApiClient,
	keys::{self, SharedKeyPair},
	token::TokenProvider,
	uri::InstanceUri,
};

/// Lead time before certificate expiry at which a new refresh must run.
pub(crate) const REFRESH_BUFFER: Duration = Duration::from_secs(4 * 60);
/// Tolerated clock skew, in seconds, when validating a freshly issued leaf
/// certificate.
const CLOCK_SKEW_SECS: i64 = 30;

/// Kind of endpoint used to reach an instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IpType {
	/// PSA-based private IP address (default).
	#[default]
	Private,
	/// Public IP address.
	Public,
	/// Private Service Connect DNS name.
	Psc,
}
impl FromStr for IpType {
	type Err = Error;

	fn from_str(value: &str) -> Result<Self> {
		match value.to_ascii_uppercase().as_str() {
			"PRIVATE" => Ok(Self::Private),
			"PUBLIC" => Ok(Self::Public),
			"PSC" => Ok(Self::Psc),
			_ => Err(Error::Config {
				field: "ip_type",
				reason: format!("Must be one of PRIVATE, PUBLIC, or PSC, got '{value}'."),
			}),
		}
	}
}
impl fmt::Display for IpType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Private => "PRIVATE",
			Self::Public => "PUBLIC",
			Self::Psc => "PSC",
		})
	}
}

/// Addresses an instance can be reached at, keyed by [`IpType`].
#[derive(Clone, Debug, Default)]
pub(crate) struct IpAddrs {
	pub private: Option<String>,
	pub public: Option<String>,
	pub psc_dns: Option<String>,
}

/// Immutable result of one successful refresh operation.
///
/// Holds everything a dial needs; instance caches replace whole values
/// atomically and never mutate one in place.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionInfo {
	pub ip_addrs: IpAddrs,
	/// Server-assigned identity, verified as the TLS peer SAN.
	pub instance_uid: String,
	/// UTC instant at which the leaf certificate stops being valid.
	pub expiration: DateTime<Utc>,
	/// Client TLS configuration pinned to the cluster CA, TLS 1.3 only.
	pub tls: Arc<ClientConfig>,
}
impl ConnectionInfo {
	/// Select the endpoint for the requested address kind.
	pub(crate) fn endpoint(&self, ip_type: IpType) -> Result<&str> {
		let address = match ip_type {
			IpType::Private => self.ip_addrs.private.as_deref(),
			IpType::Public => self.ip_addrs.public.as_deref(),
			IpType::Psc => self.ip_addrs.psc_dns.as_deref(),
		};

		address
			.filter(|address| !address.is_empty())
			.ok_or(Error::IpTypeNotSupported { ip_type })
	}

	/// Whether the certificate is still within its validity window.
	pub(crate) fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
		now < self.expiration
	}

	/// Whether the certificate is fresh enough to hand to a new connection.
	///
	/// Expiry is padded by [`REFRESH_BUFFER`] so a handed-out configuration
	/// has comfortable time left to complete a handshake.
	pub(crate) fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
		now < self.expiration - TimeDelta::seconds(REFRESH_BUFFER.as_secs() as i64)
	}
}

/// Delay before the next proactive refresh for a certificate expiring at
/// `expiration`.
///
/// Usually half the remaining lifetime; certificates within twice the
/// pre-expiry buffer are refreshed immediately.
pub(crate) fn refresh_delay(expiration: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
	let buffer = REFRESH_BUFFER.as_secs() as i64;
	let remaining = (expiration - now).num_seconds();

	if remaining <= 2 * buffer {
		Duration::ZERO
	} else {
		Duration::from_secs((remaining / 2 - buffer) as u64)
	}
}

/// Performs one full refresh round against the Admin API.
#[derive(Clone, Debug)]
pub(crate) struct Refresher {
	api: Arc<ApiClient>,
	token: Arc<dyn TokenProvider>,
	keys: SharedKeyPair,
}
impl Refresher {
	pub(crate) fn new(
		api: Arc<ApiClient>,
		token: Arc<dyn TokenProvider>,
		keys: SharedKeyPair,
	) -> Self {
		Self { api, token, keys }
	}

	/// Retrieve fresh connection metadata and a newly signed client
	/// certificate for `uri`.
	///
	/// The token is fetched immediately before the two RPCs so the
	/// certificate is signed under a token with full remaining lifetime; the
	/// RPCs themselves run concurrently.
	#[tracing::instrument(skip(self), fields(instance = %uri))]
	pub(crate) async fn refresh(&self, uri: &InstanceUri) -> Result<ConnectionInfo> {
		let keys = self.keys.get_or_try_init(keys::generate_key_pair).await?.clone();
		let token = self.token.access_token().await?;
		let (info, certs) = tokio::try_join!(
			self.api.connection_info(uri, &token),
			self.api.generate_client_certificate(uri, &token, keys.public_key_pem()),
		)?;
		let expiration = leaf_expiration(&certs.pem_certificate_chain[0], Utc::now())?;
		let tls = build_tls_config(
			&certs.ca_cert,
			&certs.pem_certificate_chain,
			keys.private_key_der(),
		)?;

		tracing::debug!(expiration = %expiration, "connection info refresh complete");

		Ok(ConnectionInfo {
			ip_addrs: IpAddrs {
				private: info.ip_address,
				public: info.public_ip_address,
				psc_dns: info.psc_dns_name,
			},
			instance_uid: info.instance_uid,
			expiration,
			tls,
		})
	}
}

/// Parse the leaf certificate and confirm it is currently usable.
///
/// Returns the `notAfter` instant; a leaf outside its validity window (with a
/// small skew tolerance on `notBefore`) is rejected rather than cached.
fn leaf_expiration(leaf_pem: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
	let (_, pem) = parse_x509_pem(leaf_pem.as_bytes())
		.map_err(|err| Error::Certificate(format!("Malformed leaf certificate PEM: {err}.")))?;
	let cert = pem
		.parse_x509()
		.map_err(|err| Error::Certificate(format!("Malformed leaf certificate: {err}.")))?;
	let validity = cert.validity();
	let not_before = DateTime::<Utc>::from_timestamp(validity.not_before.timestamp(), 0)
		.ok_or_else(|| Error::Certificate("Leaf notBefore is out of range.".into()))?;
	let not_after = DateTime::<Utc>::from_timestamp(validity.not_after.timestamp(), 0)
		.ok_or_else(|| Error::Certificate("Leaf notAfter is out of range.".into()))?;

	if now + TimeDelta::seconds(CLOCK_SKEW_SECS) < not_before {
		return Err(Error::Certificate(format!(
			"Leaf certificate is not yet valid (notBefore = {not_before})."
		)));
	}
	if now >= not_after {
		return Err(Error::Certificate(format!(
			"Leaf certificate is already expired (notAfter = {not_after})."
		)));
	}

	Ok(not_after)
}

/// Assemble the mutual-TLS client configuration for one refresh result.
///
/// Trust root is the returned cluster CA only; the client identity is the
/// full returned chain plus the shared RSA key. TLS 1.3 exclusively.
pub(crate) fn build_tls_config(
	ca_cert_pem: &str,
	chain_pems: &[String],
	private_key_der: &[u8],
) -> Result<Arc<ClientConfig>> {
	let mut roots = RootCertStore::empty();

	for cert in pem_certificates(ca_cert_pem)? {
		roots
			.add(cert)
			.map_err(|err| Error::Certificate(format!("Unusable CA certificate: {err}.")))?;
	}

	if roots.is_empty() {
		return Err(Error::Certificate("Admin API returned no CA certificate.".into()));
	}

	let mut chain = Vec::with_capacity(chain_pems.len());

	for pem in chain_pems {
		chain.extend(pem_certificates(pem)?);
	}

	let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(private_key_der.to_vec()));
	let provider = Arc::new(rustls::crypto::ring::default_provider());
	let config = ClientConfig::builder_with_provider(provider)
		.with_protocol_versions(&[&rustls::version::TLS13])
		.map_err(|err| Error::Certificate(format!("TLS 1.3 configuration failed: {err}.")))?
		.with_root_certificates(roots)
		.with_client_auth_cert(chain, key)
		.map_err(|err| Error::Certificate(format!("Client identity rejected: {err}.")))?;

	Ok(Arc::new(config))
}

fn pem_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
	rustls_pemfile::certs(&mut pem.as_bytes())
		.collect::<std::result::Result<Vec<_>, _>>()
		.map_err(|err| Error::Certificate(format!("Malformed certificate PEM: {err}.")))
}
