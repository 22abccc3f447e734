//! On-demand refresh cache.
//!
//! Refreshes connection info only when a caller asks for it and the cached
//! result is missing, flagged stale, or within four minutes of expiry. No
//! background tasks run, which suits serverless environments where the
//! process may be frozen between requests.

// crates.io
use tokio::sync::Mutex;
// self
use crate::{
	_prelude::*,
	refresh::{ConnectionInfo, Refresher},
	uri::InstanceUri,
};

#[derive(Debug, Default)]
struct State {
	cached: Option<Arc<ConnectionInfo>>,
	needs_refresh: bool,
}

/// Lazy-strategy cache for a single instance.
///
/// The state mutex is held across the refresh itself, which is what
/// serialises concurrent callers onto one upstream operation.
#[derive(Debug)]
pub(crate) struct LazyRefreshCache {
	uri: InstanceUri,
	refresher: Refresher,
	state: Mutex<State>,
}
impl LazyRefreshCache {
	pub(crate) fn new(uri: InstanceUri, refresher: Refresher) -> Self {
		Self { uri, refresher, state: Mutex::new(State::default()) }
	}

	/// Return cached connection info, refreshing first when it is missing,
	/// invalidated, or too close to expiry to be worth handing out.
	pub(crate) async fn connect_info(&self) -> Result<Arc<ConnectionInfo>> {
		let mut state = self.state.lock().await;

		if let Some(info) = &state.cached
			&& !state.needs_refresh
			&& info.is_fresh_at(Utc::now())
		{
			tracing::debug!(
				instance = %self.uri,
				"connection info is still valid, using cached info"
			);

			return Ok(info.clone());
		}

		tracing::debug!(instance = %self.uri, "connection info refresh operation started");

		let info = match self.refresher.refresh(&self.uri).await {
			Ok(info) => Arc::new(info),
			Err(err) => {
				tracing::debug!(
					instance = %self.uri,
					error = %err,
					"connection info refresh operation failed"
				);

				return Err(err);
			},
		};

		tracing::debug!(
			instance = %self.uri,
			expiration = %info.expiration,
			"connection info refresh operation complete"
		);

		state.cached = Some(info.clone());
		state.needs_refresh = false;

		Ok(info)
	}

	/// Invalidate the cache so the next `connect_info()` fetches fresh
	/// credentials; the cached result keeps serving until then.
	pub(crate) async fn force_refresh(&self) {
		self.state.lock().await.needs_refresh = true;
	}
}
