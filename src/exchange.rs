//! Post-handshake metadata exchange.
//!
//! Immediately after the TLS handshake, the connector and the server-side
//! proxy trade one message pair over the encrypted stream before the database
//! protocol takes over. Each message is framed as a 4-byte big-endian length
//! (excluding itself) followed by the protobuf-encoded body; field numbers
//! are fixed for compatibility with the sibling connectors.

// crates.io
use prost::Message;
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
	time::timeout,
};
// self
use crate::{_prelude::*, token::AccessToken};

/// Port the AlloyDB server-side proxy receives connections on.
pub(crate) const SERVER_PROXY_PORT: u16 = 5_433;
/// Maximum time to wait for any single exchange read or write.
const IO_TIMEOUT: Duration = Duration::from_secs(30);
/// Size guard for the response frame; real responses are a few bytes.
const MAX_RESPONSE_LEN: u32 = 16_384;

/// Authentication mode announced during the metadata exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum AuthType {
	/// No authentication mode specified.
	Unspecified = 0,
	/// Built-in database authentication with a password.
	DbNative = 1,
	/// Automatic IAM database authentication via an OAuth2 token.
	AutoIam = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub(crate) enum ResponseCode {
	Unspecified = 0,
	Ok = 1,
	Error = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct MetadataExchangeRequest {
	#[prost(string, tag = "1")]
	pub user_agent: String,
	#[prost(enumeration = "AuthType", tag = "2")]
	pub auth_type: i32,
	#[prost(string, tag = "3")]
	pub oauth2_token: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct MetadataExchangeResponse {
	#[prost(enumeration = "ResponseCode", tag = "1")]
	pub response_code: i32,
	#[prost(string, tag = "2")]
	pub error: String,
}

/// Run the metadata exchange over an established TLS stream.
///
/// `token` must be `Some` exactly when `auth_type` is [`AuthType::AutoIam`];
/// the caller fetches it immediately beforehand so it carries full remaining
/// lifetime.
pub(crate) async fn exchange_metadata<S>(
	stream: &mut S,
	user_agent: &str,
	auth_type: AuthType,
	token: Option<&AccessToken>,
) -> Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	let request = MetadataExchangeRequest {
		user_agent: user_agent.into(),
		auth_type: auth_type as i32,
		oauth2_token: token.map(|token| token.secret().into()).unwrap_or_default(),
	};
	let body = request.encode_to_vec();
	let mut frame = Vec::with_capacity(4 + body.len());

	frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
	frame.extend_from_slice(&body);

	bounded(stream.write_all(&frame)).await?;

	let mut len_buf = [0_u8; 4];

	bounded(stream.read_exact(&mut len_buf)).await?;

	let len = u32::from_be_bytes(len_buf);

	if len > MAX_RESPONSE_LEN {
		return Err(Error::Protocol(format!("Oversized response frame ({len} bytes).")));
	}

	let mut body = vec![0_u8; len as usize];

	bounded(stream.read_exact(&mut body)).await?;

	let response = MetadataExchangeResponse::decode(body.as_slice())
		.map_err(|err| Error::Protocol(format!("Malformed response message: {err}.")))?;

	match ResponseCode::try_from(response.response_code) {
		Ok(ResponseCode::Ok) => Ok(()),
		_ => Err(Error::Protocol(format!(
			"Server rejected the connection: {}.",
			if response.error.is_empty() { "unspecified error" } else { response.error.as_str() }
		))),
	}
}

async fn bounded<T>(
	operation: impl Future<Output = std::io::Result<T>>,
) -> Result<T> {
	timeout(IO_TIMEOUT, operation)
		.await
		.map_err(|_| Error::Protocol("Timed out during the metadata exchange.".into()))?
		.map_err(|err| Error::Network(format!("Connection failed mid-exchange: {err}.")))
}
