//! HTTP client for the AlloyDB Admin API.
//!
//! Wraps the two control-plane RPCs the connector needs: `connectionInfo`
//! (instance addresses and UID) and `generateClientCertificate` (ephemeral
//! mTLS material). Transient failures are retried with jittered exponential
//! backoff; 4xx responses surface immediately.

// crates.io
use http::StatusCode;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;
// self
use crate::{
	_prelude::*,
	api::retry::{AttemptBudget, RetryExecutor, RetryPolicy},
	token::AccessToken,
	uri::InstanceUri,
};

const API_VERSION: &str = "v1beta";
/// Validity requested for issued client certificates.
const CERT_DURATION: &str = "3600s";
/// Upper bound on error bodies captured into error messages.
const MAX_ERROR_BODY: usize = 2_048;

/// Addresses and identity returned by the `connectionInfo` RPC.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConnectionInfoResponse {
	/// PSA-based private IP address, when configured.
	#[serde(default)]
	pub ip_address: Option<String>,
	/// Public IP address, when enabled on the instance.
	#[serde(default)]
	pub public_ip_address: Option<String>,
	/// Private Service Connect DNS name, when PSC is enabled.
	#[serde(default)]
	pub psc_dns_name: Option<String>,
	/// Server-assigned instance identity, presented as the TLS peer SAN.
	pub instance_uid: String,
}

/// Certificate material returned by the `generateClientCertificate` RPC.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClientCertificateResponse {
	/// Leaf-first certificate chain ending in the cluster CA.
	pub pem_certificate_chain: Vec<String>,
	/// Cluster CA certificate anchoring server verification.
	pub ca_cert: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientCertificateRequest<'a> {
	public_key: &'a str,
	cert_duration: &'a str,
	use_metadata_exchange: bool,
}

/// Admin API adapter shared by every instance cache of a connector.
#[derive(Debug)]
pub(crate) struct ApiClient {
	http: Client,
	base_url: Url,
	quota_project: Option<String>,
	retry_policy: RetryPolicy,
}
impl ApiClient {
	/// Build an API client against the given endpoint.
	///
	/// `endpoint` accepts a bare host (`alloydb.googleapis.com`), or a full
	/// `http://`/`https://` URL for non-standard deployments and tests; bare
	/// hosts are dialed over HTTPS.
	pub(crate) fn new(
		endpoint: &str,
		quota_project: Option<String>,
		user_agent: &str,
		retry_policy: RetryPolicy,
	) -> Result<Self> {
		retry_policy.validate()?;

		let normalized = if endpoint.contains("://") {
			endpoint.trim_end_matches('/').to_string()
		} else {
			format!("https://{}", endpoint.trim_end_matches('/'))
		};
		let base_url = Url::parse(&normalized).map_err(|err| Error::Config {
			field: "api_endpoint",
			reason: format!("Invalid endpoint '{endpoint}': {err}."),
		})?;
		let http = Client::builder()
			.user_agent(user_agent)
			.connect_timeout(Duration::from_secs(5))
			.build()
			.map_err(|err| Error::Config {
				field: "api_endpoint",
				reason: format!("Failed to build the HTTP client: {err}."),
			})?;

		Ok(Self { http, base_url, quota_project, retry_policy })
	}

	/// Fetch instance addresses and the server-assigned UID.
	///
	/// A trailing dot on the PSC DNS name is stripped, matching the form the
	/// TLS stack expects to dial.
	pub(crate) async fn connection_info(
		&self,
		uri: &InstanceUri,
		token: &AccessToken,
	) -> Result<ConnectionInfoResponse> {
		let url = format!("{}/{API_VERSION}/{uri}/connectionInfo", self.base_url_str());
		let mut info: ConnectionInfoResponse =
			self.execute(|timeout| self.get(&url, token, timeout)).await?;

		if let Some(dns) = info.psc_dns_name.as_mut() {
			while dns.ends_with('.') {
				dns.pop();
			}
		}

		Ok(info)
	}

	/// Obtain a short-lived client certificate chain for `public_key_pem`.
	pub(crate) async fn generate_client_certificate(
		&self,
		uri: &InstanceUri,
		token: &AccessToken,
		public_key_pem: &str,
	) -> Result<ClientCertificateResponse> {
		let url = format!(
			"{}/{API_VERSION}/{}:generateClientCertificate",
			self.base_url_str(),
			uri.cluster_path()
		);
		let body = ClientCertificateRequest {
			public_key: public_key_pem,
			cert_duration: CERT_DURATION,
			use_metadata_exchange: true,
		};
		let response: ClientCertificateResponse =
			self.execute(|timeout| self.post(&url, token, timeout).json(&body)).await?;

		if response.pem_certificate_chain.is_empty() {
			return Err(Error::Certificate(
				"Admin API returned an empty certificate chain.".into(),
			));
		}

		Ok(response)
	}

	fn base_url_str(&self) -> &str {
		self.base_url.as_str().trim_end_matches('/')
	}

	fn get(&self, url: &str, token: &AccessToken, timeout: Duration) -> RequestBuilder {
		self.decorate(self.http.get(url), token, timeout)
	}

	fn post(&self, url: &str, token: &AccessToken, timeout: Duration) -> RequestBuilder {
		self.decorate(self.http.post(url), token, timeout)
	}

	fn decorate(
		&self,
		builder: RequestBuilder,
		token: &AccessToken,
		timeout: Duration,
	) -> RequestBuilder {
		let builder = builder.bearer_auth(token.secret()).timeout(timeout);

		if let Some(project) = &self.quota_project {
			builder.header("x-goog-user-project", project)
		} else {
			builder
		}
	}

	async fn execute<T, F>(&self, mut build: F) -> Result<T>
	where
		T: DeserializeOwned,
		F: FnMut(Duration) -> RequestBuilder,
	{
		let mut executor = RetryExecutor::new(&self.retry_policy);
		let mut last_error = None;

		while let AttemptBudget::Granted { timeout } = executor.attempt_budget() {
			match attempt(build(timeout)).await {
				Ok(value) => return Ok(value),
				Err(err) => {
					if !err.is_transient() || !executor.can_retry() {
						return Err(err);
					}

					tracing::debug!(error = %err, "transient Admin API failure, backing off");

					last_error = Some(err);

					executor.sleep_backoff().await;
				},
			}
		}

		Err(last_error
			.unwrap_or_else(|| Error::Network("Admin API retry budget exhausted.".into())))
	}
}

async fn attempt<T>(builder: RequestBuilder) -> Result<T>
where
	T: DeserializeOwned,
{
	let response = builder
		.send()
		.await
		.map_err(|err| Error::Network(format!("Admin API request failed: {err}.")))?;
	let status = response.status();

	if status.is_success() {
		let bytes = response
			.bytes()
			.await
			.map_err(|err| Error::Network(format!("Admin API response aborted: {err}.")))?;

		return serde_json::from_slice(&bytes).map_err(|err| Error::ControlPlane {
			status,
			message: format!("Malformed response body: {err}."),
		});
	}

	let mut message = response.text().await.unwrap_or_default();

	if message.len() > MAX_ERROR_BODY {
		let mut cut = MAX_ERROR_BODY;

		while !message.is_char_boundary(cut) {
			cut -= 1;
		}

		message.truncate(cut);
	}

	if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
		Err(Error::Auth(format!("Admin API rejected the credentials ({status}): {message}")))
	} else {
		Err(Error::ControlPlane { status, message })
	}
}
