//! Metadata exchange and credential rotation scenarios.

// std
use std::{sync::Arc, time::Duration};
// crates.io
use alloydb_connector::{ConnectOptions, Connector, Error, StaticTokenProvider};
use wiremock::MockServer;
// self
use super::support::{self, MockProxy, TestPki};

fn options_for(proxy: &MockProxy) -> ConnectOptions {
	ConnectOptions { proxy_port: Some(proxy.port()), ..ConnectOptions::default() }
}

#[tokio::test]
async fn iam_auth_sends_a_fresh_token_in_the_exchange() {
	let server = MockServer::start().await;
	let pki = Arc::new(TestPki::new());

	support::mount_admin_api(&server, pki.clone(), "uid-1", 3_600).await;

	let proxy = MockProxy::start(pki.server_config("uid-1")).await;
	let connector = Connector::builder()
		.credentials(Arc::new(StaticTokenProvider::new("tok-XYZ")))
		.api_endpoint(server.uri())
		.enable_iam_auth(true)
		.build()
		.expect("connector");

	connector
		.connect_with(support::TEST_URI, options_for(&proxy))
		.await
		.expect("connect");

	let requests = proxy.requests();

	assert_eq!(requests.len(), 1);
	assert_eq!(requests[0].auth_type, support::AUTH_AUTO_IAM);
	assert_eq!(requests[0].oauth2_token, "tok-XYZ");
}

#[tokio::test]
async fn driver_override_enables_iam_auth_per_connect() {
	let server = MockServer::start().await;
	let pki = Arc::new(TestPki::new());

	support::mount_admin_api(&server, pki.clone(), "uid-1", 3_600).await;

	let proxy = MockProxy::start(pki.server_config("uid-1")).await;
	let connector = Connector::builder()
		.credentials(Arc::new(StaticTokenProvider::new("tok-XYZ")))
		.api_endpoint(server.uri())
		.build()
		.expect("connector");

	connector
		.connect_with(
			support::TEST_URI,
			options_for(&proxy).with_iam_auth(true).with_driver("tokio-postgres"),
		)
		.await
		.expect("connect");

	let requests = proxy.requests();

	assert_eq!(requests[0].auth_type, support::AUTH_AUTO_IAM);
	assert!(requests[0].user_agent.contains("+tokio-postgres"));
}

#[tokio::test]
async fn rejected_exchange_surfaces_the_server_error() {
	let server = MockServer::start().await;
	let pki = Arc::new(TestPki::new());

	support::mount_admin_api(&server, pki.clone(), "uid-1", 3_600).await;

	let proxy = MockProxy::start(pki.server_config("uid-1")).await;

	proxy.reject_with("IAM principal is not authorized to connect");

	let connector = Connector::builder()
		.credentials(Arc::new(StaticTokenProvider::new("tok-XYZ")))
		.api_endpoint(server.uri())
		.build()
		.expect("connector");
	let err =
		connector.connect_with(support::TEST_URI, options_for(&proxy)).await.unwrap_err();

	assert!(matches!(
		&err,
		Error::Protocol(reason) if reason.contains("not authorized")
	));
}

#[tokio::test]
async fn identity_rotation_fails_the_handshake_then_recovers_after_force_refresh() {
	let server = MockServer::start().await;
	let pki = Arc::new(TestPki::new());

	support::mount_admin_api(&server, pki.clone(), "uid-1", 3_600).await;

	let proxy = MockProxy::start(pki.server_config("uid-1")).await;
	let connector = Connector::builder()
		.credentials(Arc::new(StaticTokenProvider::new("tok-XYZ")))
		.api_endpoint(server.uri())
		.build()
		.expect("connector");

	connector
		.connect_with(support::TEST_URI, options_for(&proxy))
		.await
		.expect("initial connect");

	let exchanges_before = proxy.requests().len();
	let certificates_before = support::certificate_requests(&server).await;

	// The server rotates to an identity the client is not pinned to; the
	// handshake must fail before any application data is written.
	proxy.set_server_config(pki.server_config("uid-other"));

	let err =
		connector.connect_with(support::TEST_URI, options_for(&proxy)).await.unwrap_err();

	assert!(matches!(err, Error::Network(_)));
	assert_eq!(proxy.requests().len(), exchanges_before);

	// The failure triggers a force refresh; give it a moment to finish.
	tokio::time::sleep(Duration::from_secs(1)).await;

	assert!(support::certificate_requests(&server).await > certificates_before);

	// Rotate back: the refreshed credentials connect again.
	proxy.set_server_config(pki.server_config("uid-1"));
	connector
		.connect_with(support::TEST_URI, options_for(&proxy))
		.await
		.expect("connect after recovery");
}
