//! Test doubles for the end-to-end suite: a throwaway PKI, a mock Admin API,
//! and a TLS proxy stub that speaks the metadata exchange.

// std
use std::sync::{Arc, Mutex, RwLock};
// crates.io
use prost::Message;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
	ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
	SubjectPublicKeyInfo, string::Ia5String,
};
use rustls::{
	RootCertStore, ServerConfig,
	pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
	server::WebPkiClientVerifier,
};
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpListener,
	task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;
use wiremock::{
	Mock, MockServer, Request, Respond, ResponseTemplate,
	matchers::{method, path},
};

pub const TEST_URI: &str =
	"projects/test-project/locations/us-central1/clusters/test-cluster/instances/test-instance";
pub const CONNECTION_INFO_PATH: &str =
	"/v1beta/projects/test-project/locations/us-central1/clusters/test-cluster/instances/test-instance/connectionInfo";
pub const CERTIFICATE_PATH: &str =
	"/v1beta/projects/test-project/locations/us-central1/clusters/test-cluster:generateClientCertificate";

/// Wire-compatible mirror of the connector's exchange request, decoded by the
/// proxy stub exactly as the server-side proxy would.
#[derive(Clone, PartialEq, Message)]
pub struct ExchangeRequest {
	#[prost(string, tag = "1")]
	pub user_agent: String,
	#[prost(int32, tag = "2")]
	pub auth_type: i32,
	#[prost(string, tag = "3")]
	pub oauth2_token: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ExchangeResponse {
	#[prost(int32, tag = "1")]
	pub response_code: i32,
	#[prost(string, tag = "2")]
	pub error: String,
}

pub const RESPONSE_OK: i32 = 1;
pub const RESPONSE_ERROR: i32 = 2;
pub const AUTH_DB_NATIVE: i32 = 1;
pub const AUTH_AUTO_IAM: i32 = 2;

/// Self-signed CA issuing client and server identities for one test.
pub struct TestPki {
	ca_key_pem: String,
	ca_cert_pem: String,
}
impl TestPki {
	pub fn new() -> Self {
		let key_pair = KeyPair::generate().expect("ca key");
		let mut params = CertificateParams::default();
		let mut dn = DistinguishedName::new();

		dn.push(DnType::CommonName, DnValue::Utf8String("test-cluster-ca".into()));
		params.distinguished_name = dn;
		params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		params.key_usages = vec![
			KeyUsagePurpose::KeyCertSign,
			KeyUsagePurpose::CrlSign,
			KeyUsagePurpose::DigitalSignature,
		];
		params.not_before = OffsetDateTime::now_utc() - TimeDuration::hours(1);
		params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(365);

		let cert = params.self_signed(&key_pair).expect("ca cert");

		Self { ca_key_pem: key_pair.serialize_pem(), ca_cert_pem: cert.pem() }
	}

	pub fn ca_cert_pem(&self) -> &str {
		&self.ca_cert_pem
	}

	fn issuer(&self) -> Issuer<'_, KeyPair> {
		let key = KeyPair::from_pem(&self.ca_key_pem).expect("ca key pem");

		Issuer::from_ca_cert_pem(&self.ca_cert_pem, key).expect("issuer")
	}

	/// Sign a client leaf for the public key carried by a certificate
	/// request, as the real `generateClientCertificate` RPC does.
	pub fn sign_client_cert(&self, public_key_pem: &str, ttl_secs: i64) -> String {
		let spki = SubjectPublicKeyInfo::from_pem(public_key_pem).expect("client spki");
		let mut params = CertificateParams::default();
		let mut dn = DistinguishedName::new();

		dn.push(DnType::CommonName, DnValue::Utf8String("alloydb-client".into()));
		params.distinguished_name = dn;
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
		params.not_before = OffsetDateTime::now_utc() - TimeDuration::hours(1);
		params.not_after = OffsetDateTime::now_utc() + TimeDuration::seconds(ttl_secs);

		params.signed_by(&spki, &self.issuer()).expect("client cert").pem()
	}

	/// Server-side TLS configuration presenting `instance_uid` as the SAN and
	/// demanding a client certificate chained to this CA.
	pub fn server_config(&self, instance_uid: &str) -> Arc<ServerConfig> {
		let server_key = KeyPair::generate().expect("server key");
		let mut params = CertificateParams::default();
		let mut dn = DistinguishedName::new();

		dn.push(DnType::CommonName, DnValue::Utf8String("alloydb-proxy".into()));
		params.distinguished_name = dn;
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		params.subject_alt_names = vec![SanType::DnsName(
			Ia5String::try_from(instance_uid.to_string()).expect("uid san"),
		)];
		params.not_before = OffsetDateTime::now_utc() - TimeDuration::hours(1);
		params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(1);

		let cert = params.signed_by(&server_key, &self.issuer()).expect("server cert");
		let mut roots = RootCertStore::empty();

		for ca in pem_certificates(&self.ca_cert_pem) {
			roots.add(ca).expect("ca root");
		}

		let provider = Arc::new(rustls::crypto::ring::default_provider());
		let verifier =
			WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
				.build()
				.expect("client verifier");
		let chain = vec![cert.der().clone(), pem_certificates(&self.ca_cert_pem).remove(0)];
		let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server_key.serialize_der()));
		let config = ServerConfig::builder_with_provider(provider)
			.with_protocol_versions(&[&rustls::version::TLS13])
			.expect("tls13 server config")
			.with_client_cert_verifier(verifier)
			.with_single_cert(chain, key)
			.expect("server identity");

		Arc::new(config)
	}
}

fn pem_certificates(pem: &str) -> Vec<CertificateDer<'static>> {
	rustls_pemfile::certs(&mut pem.as_bytes())
		.collect::<Result<Vec<_>, _>>()
		.expect("pem certificates")
}

/// Mount the two Admin API endpoints, pointing the instance at `127.0.0.1`.
pub async fn mount_admin_api(
	server: &MockServer,
	pki: Arc<TestPki>,
	instance_uid: &str,
	ttl_secs: i64,
) {
	mount_connection_info(server, instance_uid, true, false).await;
	mount_certificate_endpoint(server, pki, ttl_secs, None).await;
}

/// Mount `connectionInfo` with a configurable address set.
pub async fn mount_connection_info(
	server: &MockServer,
	instance_uid: &str,
	private: bool,
	public: bool,
) {
	let mut body = serde_json::json!({ "instanceUid": instance_uid });

	if private {
		body["ipAddress"] = "127.0.0.1".into();
	}
	if public {
		body["publicIpAddress"] = "127.0.0.1".into();
	}

	Mock::given(method("GET"))
		.and(path(CONNECTION_INFO_PATH))
		.respond_with(ResponseTemplate::new(200).set_body_json(body))
		.mount(server)
		.await;
}

/// Mount `generateClientCertificate`, signing whatever key arrives.
pub async fn mount_certificate_endpoint(
	server: &MockServer,
	pki: Arc<TestPki>,
	ttl_secs: i64,
	expected_calls: Option<u64>,
) {
	struct SignCertificate {
		pki: Arc<TestPki>,
		ttl_secs: i64,
	}
	impl Respond for SignCertificate {
		fn respond(&self, request: &Request) -> ResponseTemplate {
			let body: serde_json::Value =
				serde_json::from_slice(&request.body).expect("json body");
			let public_key = body["publicKey"].as_str().expect("publicKey field");
			let leaf = self.pki.sign_client_cert(public_key, self.ttl_secs);

			ResponseTemplate::new(200)
				.set_delay(std::time::Duration::from_millis(100))
				.set_body_json(serde_json::json!({
					"pemCertificateChain": [leaf, self.pki.ca_cert_pem()],
					"caCert": self.pki.ca_cert_pem(),
				}))
		}
	}

	let mock = Mock::given(method("POST"))
		.and(path(CERTIFICATE_PATH))
		.respond_with(SignCertificate { pki, ttl_secs });
	let mock = match expected_calls {
		Some(calls) => mock.expect(calls),
		None => mock,
	};

	mock.mount(server).await;
}

/// Count certificate issuances observed by the mock Admin API.
pub async fn certificate_requests(server: &MockServer) -> usize {
	server
		.received_requests()
		.await
		.unwrap_or_default()
		.iter()
		.filter(|request| request.url.path() == CERTIFICATE_PATH)
		.count()
}

/// TLS stub standing in for the AlloyDB server-side proxy.
///
/// Accepts mTLS connections, runs the metadata exchange, records every decoded
/// request, and answers with a configurable response.
pub struct MockProxy {
	port: u16,
	config: Arc<RwLock<Arc<ServerConfig>>>,
	response: Arc<RwLock<ExchangeResponse>>,
	requests: Arc<Mutex<Vec<ExchangeRequest>>>,
	accept_loop: JoinHandle<()>,
}
impl MockProxy {
	pub async fn start(server_config: Arc<ServerConfig>) -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("proxy bind");
		let port = listener.local_addr().expect("proxy addr").port();
		let config = Arc::new(RwLock::new(server_config));
		let response = Arc::new(RwLock::new(ExchangeResponse {
			response_code: RESPONSE_OK,
			error: String::new(),
		}));
		let requests = Arc::new(Mutex::new(Vec::new()));
		let accept_loop = tokio::spawn({
			let config = config.clone();
			let response = response.clone();
			let requests = requests.clone();

			async move {
				loop {
					let Ok((tcp, _)) = listener.accept().await else {
						return;
					};
					let acceptor =
						TlsAcceptor::from(config.read().expect("config lock").clone());
					let response = response.read().expect("response lock").clone();
					let requests = requests.clone();

					tokio::spawn(async move {
						// Handshake failures (e.g. identity-mismatch aborts
						// from the client) are part of several scenarios.
						let Ok(mut stream) = acceptor.accept(tcp).await else {
							return;
						};
						let mut len_buf = [0_u8; 4];

						if stream.read_exact(&mut len_buf).await.is_err() {
							return;
						}

						let mut body = vec![0_u8; u32::from_be_bytes(len_buf) as usize];

						if stream.read_exact(&mut body).await.is_err() {
							return;
						}

						if let Ok(request) = ExchangeRequest::decode(body.as_slice()) {
							requests.lock().expect("requests lock").push(request);
						}

						let body = response.encode_to_vec();
						let mut frame = (body.len() as u32).to_be_bytes().to_vec();

						frame.extend_from_slice(&body);

						if stream.write_all(&frame).await.is_err() {
							return;
						}

						// Hold the session open until the client hangs up, as
						// the real proxy hands over to the database protocol.
						let mut sink = [0_u8; 256];

						while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
					});
				}
			}
		});

		Self { port, config, response, requests, accept_loop }
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	/// Swap the presented server identity, simulating a mid-session rotation.
	pub fn set_server_config(&self, config: Arc<ServerConfig>) {
		*self.config.write().expect("config lock") = config;
	}

	/// Make the proxy reject future exchanges with the given error text.
	pub fn reject_with(&self, error: impl Into<String>) {
		*self.response.write().expect("response lock") =
			ExchangeResponse { response_code: RESPONSE_ERROR, error: error.into() };
	}

	/// Exchange requests decoded so far.
	pub fn requests(&self) -> Vec<ExchangeRequest> {
		self.requests.lock().expect("requests lock").clone()
	}
}
impl Drop for MockProxy {
	fn drop(&mut self) {
		self.accept_loop.abort();
	}
}
