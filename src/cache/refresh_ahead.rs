//! Proactive background refresh cache.
//!
//! Keeps a valid [`ConnectionInfo`] available ahead of certificate expiry by
//! scheduling the next refresh at roughly half the remaining lifetime, four
//! minutes before expiry at the latest. Exactly one refresh is in flight per
//! instance at any time; every waiter observes the outcome of that shared
//! attempt.

// std
use std::sync::{
	Mutex, MutexGuard, PoisonError,
	atomic::{AtomicU64, Ordering},
};
// crates.io
use tokio::{sync::watch, task::JoinHandle, time};
// self
use crate::{
	_prelude::*,
	api::retry::{JitterStrategy, RetryPolicy},
	cache::rate_limit::RateLimiter,
	refresh::{self, ConnectionInfo, Refresher},
	uri::InstanceUri,
};

/// Refresh pacing: allow a burst of two API rounds, then one per 30 seconds.
const LIMITER_BURST: f64 = 2.;
const LIMITER_RATE: f64 = 1. / 30.;

type RefreshOutcome = std::result::Result<Arc<ConnectionInfo>, Error>;

/// One refresh attempt, observable by any number of waiters.
///
/// The channel starts at `None` and receives exactly one `Some` when the
/// attempt settles. Waiters hold receiver clones; dropping a waiter never
/// affects the attempt itself.
#[derive(Clone, Debug)]
struct Slot {
	id: u64,
	rx: watch::Receiver<Option<RefreshOutcome>>,
}
impl Slot {
	/// Whether this slot settled with a result that is still valid now.
	fn is_valid(&self, now: DateTime<Utc>) -> bool {
		matches!(&*self.rx.borrow(), Some(Ok(info)) if info.is_valid_at(now))
	}
}

#[derive(Debug)]
struct State {
	current: Slot,
	next: Slot,
	next_task: Option<JoinHandle<()>>,
	refresh_in_progress: bool,
	error_count: u32,
	closed: bool,
}

#[derive(Debug)]
struct Inner {
	uri: InstanceUri,
	refresher: Refresher,
	limiter: RateLimiter,
	failure_backoff: RetryPolicy,
	slot_ids: AtomicU64,
	state: Mutex<State>,
}
impl Inner {
	fn lock(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Spawn a refresh attempt that fires after `delay`.
	///
	/// Must not be called with the state lock released between deciding to
	/// schedule and storing the returned slot; callers hold `state` across
	/// both steps.
	fn schedule(self: &Arc<Self>, delay: Duration) -> (Slot, JoinHandle<()>) {
		let (tx, rx) = watch::channel(None);
		let id = self.slot_ids.fetch_add(1, Ordering::Relaxed);
		let inner = self.clone();
		let handle = tokio::spawn(async move {
			inner.run_refresh(delay, id, tx).await;
		});

		(Slot { id, rx }, handle)
	}

	async fn run_refresh(
		self: Arc<Self>,
		delay: Duration,
		id: u64,
		tx: watch::Sender<Option<RefreshOutcome>>,
	) {
		if !delay.is_zero() {
			time::sleep(delay).await;
		}

		{
			let mut state = self.lock();

			if state.closed {
				return;
			}

			state.refresh_in_progress = true;
		}

		self.limiter.acquire().await;

		tracing::debug!(instance = %self.uri, "connection info refresh operation started");

		let outcome = match self.refresher.refresh(&self.uri).await {
			// A leaf that expired between issuance and now means the control
			// plane handed out garbage; treat it as a failed refresh.
			Ok(info) if !info.is_valid_at(Utc::now()) => Err(Error::Certificate(
				"Refresh produced an already-expired certificate.".into(),
			)),
			Ok(info) => Ok(Arc::new(info)),
			Err(err) => Err(err),
		};

		{
			let mut state = self.lock();

			state.refresh_in_progress = false;

			if state.closed {
				let _ = tx.send(Some(Err(Error::Closed)));

				return;
			}

			match &outcome {
				Ok(info) => {
					let delay = refresh::refresh_delay(info.expiration, Utc::now());

					tracing::debug!(
						instance = %self.uri,
						expiration = %info.expiration,
						next_refresh_in = ?delay,
						"connection info refresh operation complete"
					);

					state.error_count = 0;
					state.current = Slot { id, rx: tx.subscribe() };

					let (slot, handle) = self.schedule(delay);

					state.next = slot;
					state.next_task = Some(handle);
				},
				Err(err) => {
					state.error_count = state.error_count.saturating_add(1);

					let delay =
						self.failure_backoff.compute_backoff(state.error_count - 1);

					tracing::debug!(
						instance = %self.uri,
						error = %err,
						retry_in = ?delay,
						"connection info refresh operation failed"
					);

					// Never replace a still-valid result with a failure; the
					// last known good credentials keep serving connects.
					if !state.current.is_valid(Utc::now()) {
						state.current = Slot { id, rx: tx.subscribe() };
					}

					let (slot, handle) = self.schedule(delay);

					state.next = slot;
					state.next_task = Some(handle);
				},
			}
		}

		let _ = tx.send(Some(outcome));
	}
}

/// Background-strategy cache for a single instance.
#[derive(Debug)]
pub(crate) struct RefreshAheadCache {
	inner: Arc<Inner>,
}
impl RefreshAheadCache {
	/// Create the cache and immediately schedule the initial refresh.
	///
	/// Until that first refresh settles, `connect_info()` callers block on
	/// its outcome.
	pub(crate) fn new(uri: InstanceUri, refresher: Refresher) -> Self {
		let (tx, rx) = watch::channel(None);
		let initial = Slot { id: 0, rx };
		let inner = Arc::new(Inner {
			uri,
			refresher,
			limiter: RateLimiter::new(LIMITER_BURST, LIMITER_RATE),
			failure_backoff: RetryPolicy {
				max_retries: u32::MAX,
				initial_backoff: Duration::from_millis(200),
				max_backoff: Duration::from_secs(30),
				jitter: JitterStrategy::Full,
				..Default::default()
			},
			slot_ids: AtomicU64::new(1),
			state: Mutex::new(State {
				current: initial.clone(),
				next: initial,
				next_task: None,
				refresh_in_progress: false,
				error_count: 0,
				closed: false,
			}),
		});
		// The handle is stored under the same lock acquisition that precedes
		// the spawn, so the task cannot observe (and overwrite) `next_task`
		// before the initial handle lands.
		{
			let mut state = inner.lock();
			let handle = tokio::spawn({
				let inner = inner.clone();

				async move {
					inner.run_refresh(Duration::ZERO, 0, tx).await;
				}
			});

			state.next_task = Some(handle);
		}

		Self { inner }
	}

	/// Return the current connection info, waiting for the in-flight refresh
	/// when none has completed yet.
	pub(crate) async fn connect_info(&self) -> Result<Arc<ConnectionInfo>> {
		let mut rx = {
			let state = self.inner.lock();

			if state.closed {
				return Err(Error::Closed);
			}

			state.current.rx.clone()
		};
		let settled = rx.wait_for(Option::is_some).await.map_err(|_| Error::Closed)?;

		settled.clone().ok_or(Error::Closed)?
	}

	/// Start a refresh immediately for future connection attempts.
	///
	/// A refresh already in flight is shared rather than duplicated, and the
	/// current result keeps serving callers until the replacement succeeds.
	pub(crate) fn force_refresh(&self) {
		let mut state = self.inner.lock();

		if state.closed {
			return;
		}

		// The in-flight attempt (or the imminent initial one) already covers
		// this request; otherwise drop the scheduled timer and go now.
		if !state.refresh_in_progress && state.next.id != state.current.id {
			if let Some(task) = state.next_task.take() {
				task.abort();
			}

			tracing::debug!(instance = %self.inner.uri, "force refresh scheduled");

			let (slot, handle) = self.inner.schedule(Duration::ZERO);

			state.next = slot;
			state.next_task = Some(handle);
		}

		// Callers must not keep observing an invalid result when a newer
		// attempt exists; valid results are preserved until replaced.
		if !state.current.is_valid(Utc::now()) {
			state.current = state.next.clone();
		}
	}

	/// Cancel all scheduled and in-flight refresh work.
	pub(crate) fn close(&self) {
		let task = {
			let mut state = self.inner.lock();

			state.closed = true;

			tracing::debug!(instance = %self.inner.uri, "canceling refresh operations");

			state.next_task.take()
		};

		if let Some(task) = task {
			task.abort();
		}
	}
}
impl Drop for RefreshAheadCache {
	fn drop(&mut self) {
		self.close();
	}
}
