//! Per-instance connection info caches.
//!
//! A cache owns the refresh lifecycle for exactly one instance and answers
//! `connect_info()` with the freshest [`ConnectionInfo`](crate::refresh::ConnectionInfo)
//! it can produce. Two interchangeable strategies exist: proactive background
//! renewal and on-demand lazy renewal.

pub(crate) mod lazy;
pub(crate) mod rate_limit;
pub(crate) mod refresh_ahead;

// self
use crate::{
	_prelude::*,
	cache::{lazy::LazyRefreshCache, refresh_ahead::RefreshAheadCache},
	refresh::ConnectionInfo,
};

/// Strategy-selected cache for a single instance.
#[derive(Debug)]
pub(crate) enum ConnectionInfoCache {
	/// Proactive renewal on a background timer.
	RefreshAhead(RefreshAheadCache),
	/// On-demand renewal inside `connect_info()`.
	Lazy(LazyRefreshCache),
}
impl ConnectionInfoCache {
	/// Obtain connection info, waiting for an in-flight refresh if necessary.
	pub(crate) async fn connect_info(&self) -> Result<Arc<ConnectionInfo>> {
		match self {
			Self::RefreshAhead(cache) => cache.connect_info().await,
			Self::Lazy(cache) => cache.connect_info().await,
		}
	}

	/// Request fresh credentials for future connection attempts.
	///
	/// The existing result keeps serving callers until a replacement lands;
	/// calling this on a closed cache is a no-op.
	pub(crate) async fn force_refresh(&self) {
		match self {
			Self::RefreshAhead(cache) => cache.force_refresh(),
			Self::Lazy(cache) => cache.force_refresh().await,
		}
	}

	/// Stop all refresh work; pending waiters observe a closed error.
	pub(crate) fn close(&self) {
		match self {
			Self::RefreshAhead(cache) => cache.close(),
			Self::Lazy(_) => {},
		}
	}
}
