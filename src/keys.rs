//! Shared RSA key pair generation.
//!
//! One 2048-bit RSA key pair is produced per connector lifetime and shared by
//! every instance cache. The public half travels to the Admin API inside
//! `GenerateClientCertificate` requests; the private half signs the client
//! side of every TLS handshake.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use rand_core::OsRng;
use rsa::{
	RsaPrivateKey,
	pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding},
};
use tokio::sync::OnceCell;
// self
use crate::_prelude::*;

const RSA_KEY_BITS: usize = 2_048;

/// Key pair cell shared across all instance caches of a connector.
///
/// Generation is started eagerly at connector construction when a runtime is
/// available; the first refresh otherwise pays the cost exactly once.
pub(crate) type SharedKeyPair = Arc<OnceCell<ClientKeyPair>>;

/// RSA-2048 key pair backing all client certificates of a connector.
#[derive(Clone)]
pub(crate) struct ClientKeyPair {
	private_key_der: Arc<Vec<u8>>,
	public_key_pem: String,
}
impl ClientKeyPair {
	/// PKCS#8 DER encoding of the private key.
	pub(crate) fn private_key_der(&self) -> &[u8] {
		&self.private_key_der
	}

	/// SPKI PEM encoding of the public key, as sent to the Admin API.
	pub(crate) fn public_key_pem(&self) -> &str {
		&self.public_key_pem
	}
}
impl Debug for ClientKeyPair {
	// Key material never reaches logs.
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("ClientKeyPair").field("private_key_der", &"<redacted>").finish()
	}
}

/// Generate a fresh RSA-2048 key pair on a blocking worker thread.
///
/// Prime generation is CPU-heavy, so it must never run on the async request
/// path directly.
pub(crate) async fn generate_key_pair() -> Result<ClientKeyPair> {
	tokio::task::spawn_blocking(generate_key_pair_blocking)
		.await
		.map_err(|err| Error::Certificate(format!("Key generation task failed: {err}.")))?
}

pub(crate) fn generate_key_pair_blocking() -> Result<ClientKeyPair> {
	let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
		.map_err(|err| Error::Certificate(format!("RSA key generation failed: {err}.")))?;
	let public_key_pem = private_key
		.to_public_key()
		.to_public_key_pem(LineEnding::LF)
		.map_err(|err| Error::Certificate(format!("Public key encoding failed: {err}.")))?;
	let private_key_der = private_key
		.to_pkcs8_der()
		.map_err(|err| Error::Certificate(format!("Private key encoding failed: {err}.")))?
		.as_bytes()
		.to_vec();

	tracing::debug!("client RSA key pair generated");

	Ok(ClientKeyPair { private_key_der: Arc::new(private_key_der), public_key_pem })
}

/// Kick off key generation in the background when a runtime is available.
pub(crate) fn spawn_generation(keys: SharedKeyPair) {
	if let Ok(handle) = tokio::runtime::Handle::try_current() {
		handle.spawn(async move {
			if let Err(err) = keys.get_or_try_init(generate_key_pair).await {
				tracing::debug!(error = %err, "eager key generation failed");
			}
		});
	}
}
