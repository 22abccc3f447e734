//! Connector facade and configuration.
//!
//! The connector owns the per-instance cache map, the shared key pair, and
//! the Admin API client. `connect()` resolves an instance URI to fresh
//! credentials, dials the server-side proxy, completes the mutual-TLS
//! handshake pinned to the instance identity, and runs the metadata exchange
//! before handing the socket to the caller's database driver.

// std
use std::{
	collections::HashMap,
	str::FromStr,
	sync::{
		Mutex, MutexGuard, PoisonError,
		atomic::{AtomicBool, Ordering},
	},
};
// crates.io
use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, sync::OnceCell, time::timeout};
use tokio_rustls::{TlsConnector, client::TlsStream};
// self
use crate::{
	_prelude::*,
	api::{client::ApiClient, retry::RetryPolicy},
	cache::{ConnectionInfoCache, lazy::LazyRefreshCache, refresh_ahead::RefreshAheadCache},
	exchange::{self, AuthType},
	keys::{self, SharedKeyPair},
	refresh::{ConnectionInfo, IpType, Refresher},
	token::TokenProvider,
	uri::InstanceUri,
};

const DEFAULT_API_ENDPOINT: &str = "alloydb.googleapis.com";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const BASE_USER_AGENT: &str = concat!("alloydb-rust-connector/", env!("CARGO_PKG_VERSION"));

/// Mutually-TLS-authenticated stream to an AlloyDB instance, ready for the
/// database protocol.
pub type AlloyDbStream = TlsStream<TcpStream>;

/// When connection info is refreshed relative to certificate expiry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefreshStrategy {
	/// Proactive renewal on a background timer (default).
	#[default]
	Background,
	/// Renewal on demand inside `connect()`; suits serverless environments.
	Lazy,
}
impl FromStr for RefreshStrategy {
	type Err = Error;

	fn from_str(value: &str) -> Result<Self> {
		match value.to_ascii_uppercase().as_str() {
			"BACKGROUND" => Ok(Self::Background),
			"LAZY" => Ok(Self::Lazy),
			_ => Err(Error::Config {
				field: "refresh_strategy",
				reason: format!("Must be BACKGROUND or LAZY, got '{value}'."),
			}),
		}
	}
}

/// Per-connect overrides; unset fields fall back to connector defaults.
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
	/// Endpoint kind to dial for this connection.
	pub ip_type: Option<IpType>,
	/// Whether to announce automatic IAM database authentication.
	pub enable_iam_auth: Option<bool>,
	/// Database driver tag appended to the exchanged user agent.
	pub driver: Option<String>,
	/// Server-side proxy port override for non-standard deployments and
	/// tests; production instances listen on 5433.
	pub proxy_port: Option<u16>,
}
impl ConnectOptions {
	/// Start from connector defaults.
	pub fn new() -> Self {
		Self::default()
	}

	/// Dial the given endpoint kind.
	pub fn with_ip_type(mut self, ip_type: IpType) -> Self {
		self.ip_type = Some(ip_type);

		self
	}

	/// Enable or disable automatic IAM database authentication.
	pub fn with_iam_auth(mut self, enable: bool) -> Self {
		self.enable_iam_auth = Some(enable);

		self
	}

	/// Tag the metadata exchange with the database driver in use.
	pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
		self.driver = Some(driver.into());

		self
	}
}

/// Builder for [`Connector`].
#[derive(Debug)]
pub struct ConnectorBuilder {
	credentials: Option<Arc<dyn TokenProvider>>,
	quota_project: Option<String>,
	api_endpoint: String,
	user_agent: Option<String>,
	ip_type: IpType,
	enable_iam_auth: bool,
	refresh_strategy: RefreshStrategy,
	retry_policy: RetryPolicy,
	connect_timeout: Duration,
}
impl ConnectorBuilder {
	/// Create a builder with default configuration.
	pub fn new() -> Self {
		Self {
			credentials: None,
			quota_project: None,
			api_endpoint: DEFAULT_API_ENDPOINT.into(),
			user_agent: None,
			ip_type: IpType::default(),
			enable_iam_auth: false,
			refresh_strategy: RefreshStrategy::default(),
			retry_policy: RetryPolicy::default(),
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
		}
	}

	/// Inject the OAuth2 token source used for Admin API calls and IAM
	/// database authentication. Required.
	pub fn credentials(mut self, provider: Arc<dyn TokenProvider>) -> Self {
		self.credentials = Some(provider);

		self
	}

	/// Project to bill Admin API quota against, when different from the
	/// instance's project.
	pub fn quota_project(mut self, project: impl Into<String>) -> Self {
		self.quota_project = Some(project.into());

		self
	}

	/// Override the Admin API endpoint; accepts a bare host or a full URL.
	pub fn api_endpoint(mut self, endpoint: impl Into<String>) -> Self {
		self.api_endpoint = endpoint.into();

		self
	}

	/// Append a custom token to the outbound user agent.
	pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
		self.user_agent = Some(agent.into());

		self
	}

	/// Default endpoint kind for all connections.
	pub fn ip_type(mut self, ip_type: IpType) -> Self {
		self.ip_type = ip_type;

		self
	}

	/// Default authentication mode announced during the metadata exchange.
	pub fn enable_iam_auth(mut self, enable: bool) -> Self {
		self.enable_iam_auth = enable;

		self
	}

	/// Refresh strategy applied to every instance cache.
	pub fn refresh_strategy(mut self, strategy: RefreshStrategy) -> Self {
		self.refresh_strategy = strategy;

		self
	}

	/// Retry policy for Admin API requests.
	pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
		self.retry_policy = policy;

		self
	}

	/// Bound on TCP connection establishment to the instance.
	pub fn connect_timeout(mut self, timeout: Duration) -> Self {
		self.connect_timeout = timeout;

		self
	}

	/// Finalise the configuration and construct a [`Connector`].
	///
	/// Key pair generation starts in the background immediately when called
	/// inside a tokio runtime.
	pub fn build(self) -> Result<Connector> {
		let credentials = self.credentials.ok_or(Error::Config {
			field: "credentials",
			reason: "A token provider is required; see `ConnectorBuilder::credentials`.".into(),
		})?;
		let user_agent = match &self.user_agent {
			Some(custom) => format!("{BASE_USER_AGENT} {custom}"),
			None => BASE_USER_AGENT.into(),
		};
		let api = ApiClient::new(
			&self.api_endpoint,
			self.quota_project.clone(),
			&user_agent,
			self.retry_policy.clone(),
		)?;
		let keys = Arc::new(OnceCell::new());

		keys::spawn_generation(keys.clone());

		Ok(Connector {
			inner: Arc::new(Inner {
				api: Arc::new(api),
				credentials,
				keys,
				caches: Mutex::new(HashMap::new()),
				closed: AtomicBool::new(false),
				ip_type: self.ip_type,
				enable_iam_auth: self.enable_iam_auth,
				refresh_strategy: self.refresh_strategy,
				connect_timeout: self.connect_timeout,
				user_agent: self.user_agent,
			}),
		})
	}
}
impl Default for ConnectorBuilder {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug)]
struct Inner {
	api: Arc<ApiClient>,
	credentials: Arc<dyn TokenProvider>,
	keys: SharedKeyPair,
	caches: Mutex<HashMap<InstanceUri, Arc<ConnectionInfoCache>>>,
	closed: AtomicBool,
	ip_type: IpType,
	enable_iam_auth: bool,
	refresh_strategy: RefreshStrategy,
	connect_timeout: Duration,
	user_agent: Option<String>,
}
impl Inner {
	fn lock_caches(&self) -> MutexGuard<'_, HashMap<InstanceUri, Arc<ConnectionInfoCache>>> {
		self.caches.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn shutdown(&self) {
		self.closed.store(true, Ordering::Release);

		let caches: Vec<_> = self.lock_caches().drain().map(|(_, cache)| cache).collect();

		for cache in caches {
			cache.close();
		}
	}

	/// User agent for the metadata exchange, tagged with the driver when the
	/// caller names one.
	fn exchange_user_agent(&self, driver: Option<&str>) -> String {
		let base = match driver {
			Some(driver) => format!("{BASE_USER_AGENT}+{driver}"),
			None => BASE_USER_AGENT.into(),
		};

		match &self.user_agent {
			Some(custom) => format!("{base} {custom}"),
			None => base,
		}
	}
}
impl Drop for Inner {
	// Background refresh tasks must not outlive the connector, even when the
	// caller forgets to close it.
	fn drop(&mut self) {
		self.shutdown();
	}
}

/// Process-wide facade creating authenticated connections to AlloyDB
/// instances.
///
/// Cheap to clone; all clones share the same caches, key pair, and API
/// client. Designed for concurrent use by many callers.
#[derive(Clone, Debug)]
pub struct Connector {
	inner: Arc<Inner>,
}
impl Connector {
	/// Create a [`ConnectorBuilder`] for configuration.
	pub fn builder() -> ConnectorBuilder {
		ConnectorBuilder::new()
	}

	/// Connect to the given instance with connector defaults.
	pub async fn connect(&self, instance_uri: &str) -> Result<AlloyDbStream> {
		self.connect_with(instance_uri, ConnectOptions::default()).await
	}

	/// Connect to the given instance with per-connect overrides.
	///
	/// Returns the raw TLS stream; the caller's driver performs the database
	/// handshake on top of it.
	pub async fn connect_with(
		&self,
		instance_uri: &str,
		options: ConnectOptions,
	) -> Result<AlloyDbStream> {
		if self.inner.closed.load(Ordering::Acquire) {
			return Err(Error::Closed);
		}

		let uri: InstanceUri = instance_uri.parse()?;
		let ip_type = options.ip_type.unwrap_or(self.inner.ip_type);
		let iam_auth = options.enable_iam_auth.unwrap_or(self.inner.enable_iam_auth);
		let port = options.proxy_port.unwrap_or(exchange::SERVER_PROXY_PORT);
		let cache = self.cache_for(&uri)?;
		// A failed refresh or an unsupported address kind poisons nothing
		// beyond this instance: drop its cache so the next attempt starts
		// clean, and surface the typed error.
		let (info, endpoint) = match cache.connect_info().await {
			Ok(info) => match info.endpoint(ip_type) {
				Ok(endpoint) => {
					let endpoint = endpoint.to_string();

					(info, endpoint)
				},
				Err(err) => {
					self.evict(&uri);

					return Err(err);
				},
			},
			Err(err) => {
				self.evict(&uri);

				return Err(err);
			},
		};

		tracing::debug!(instance = %uri, endpoint = %endpoint, port, "connecting");

		match self.dial(&info, &endpoint, port, iam_auth, options.driver.as_deref()).await {
			Ok(stream) => Ok(stream),
			Err(err) => {
				// Stale credentials are the usual culprit for handshake and
				// exchange failures; refresh so the next attempt recovers.
				cache.force_refresh().await;

				Err(err)
			},
		}
	}

	/// Close the connector: cancel background refreshes, drop cached
	/// credentials, and fail pending and future calls with a typed error.
	pub fn close(&self) {
		self.inner.shutdown();
	}

	async fn dial(
		&self,
		info: &ConnectionInfo,
		endpoint: &str,
		port: u16,
		iam_auth: bool,
		driver: Option<&str>,
	) -> Result<AlloyDbStream> {
		let tcp = timeout(self.inner.connect_timeout, TcpStream::connect((endpoint, port)))
			.await
			.map_err(|_| Error::Network(format!("Connection to {endpoint}:{port} timed out.")))?
			.map_err(|err| {
				Error::Network(format!("Failed to connect to {endpoint}:{port}: {err}."))
			})?;
		// The dialed address is an IP (or PSC DNS name), so hostname
		// verification is pinned to the server-assigned instance UID instead.
		let server_name = ServerName::try_from(info.instance_uid.clone()).map_err(|_| {
			Error::Certificate(format!(
				"Instance UID '{}' is not usable as a TLS server name.",
				info.instance_uid
			))
		})?;
		let mut stream = TlsConnector::from(info.tls.clone())
			.connect(server_name, tcp)
			.await
			.map_err(|err| {
				Error::Network(format!("TLS handshake with {endpoint}:{port} failed: {err}."))
			})?;
		let (auth_type, token) = if iam_auth {
			// Fetched here, not earlier, so the server sees a token with full
			// remaining lifetime.
			(AuthType::AutoIam, Some(self.inner.credentials.access_token().await?))
		} else {
			(AuthType::DbNative, None)
		};
		let user_agent = self.inner.exchange_user_agent(driver);

		exchange::exchange_metadata(&mut stream, &user_agent, auth_type, token.as_ref())
			.await?;

		Ok(stream)
	}

	fn cache_for(&self, uri: &InstanceUri) -> Result<Arc<ConnectionInfoCache>> {
		let mut caches = self.inner.lock_caches();

		if self.inner.closed.load(Ordering::Acquire) {
			return Err(Error::Closed);
		}
		if let Some(cache) = caches.get(uri) {
			return Ok(cache.clone());
		}

		let refresher = Refresher::new(
			self.inner.api.clone(),
			self.inner.credentials.clone(),
			self.inner.keys.clone(),
		);
		let cache = match self.inner.refresh_strategy {
			RefreshStrategy::Background => ConnectionInfoCache::RefreshAhead(
				RefreshAheadCache::new(uri.clone(), refresher),
			),
			RefreshStrategy::Lazy =>
				ConnectionInfoCache::Lazy(LazyRefreshCache::new(uri.clone(), refresher)),
		};
		let cache = Arc::new(cache);

		tracing::debug!(instance = %uri, strategy = ?self.inner.refresh_strategy, "connection info cache created");
		caches.insert(uri.clone(), cache.clone());

		Ok(cache)
	}

	fn evict(&self, uri: &InstanceUri) {
		let cache = self.inner.lock_caches().remove(uri);

		if let Some(cache) = cache {
			tracing::debug!(instance = %uri, "removing connection info from cache");
			cache.close();
		}
	}
}
