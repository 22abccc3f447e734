//! Token-bucket pacing for refresh operations.
//!
//! A flapping instance combined with aggressive force-refreshing could
//! otherwise hammer the Admin API; every refresh-ahead cache acquires a token
//! here before touching the control plane.

// crates.io
use tokio::{sync::Mutex, time::Instant};
// self
use crate::_prelude::*;

/// Async token bucket.
///
/// Starts full, allowing an initial burst, then refills continuously at the
/// configured rate.
#[derive(Debug)]
pub(crate) struct RateLimiter {
	capacity: f64,
	rate_per_sec: f64,
	bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
	tokens: f64,
	updated_at: Instant,
}

impl RateLimiter {
	/// Create a bucket holding `capacity` tokens refilled at `rate_per_sec`.
	pub(crate) fn new(capacity: f64, rate_per_sec: f64) -> Self {
		Self {
			capacity,
			rate_per_sec,
			bucket: Mutex::new(Bucket { tokens: capacity, updated_at: Instant::now() }),
		}
	}

	/// Take one token, sleeping until the bucket can provide it.
	pub(crate) async fn acquire(&self) {
		loop {
			let wait = {
				let mut bucket = self.bucket.lock().await;
				let now = Instant::now();
				let elapsed = now.saturating_duration_since(bucket.updated_at);

				bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate_per_sec)
					.min(self.capacity);
				bucket.updated_at = now;

				if bucket.tokens >= 1. {
					bucket.tokens -= 1.;

					return;
				}

				Duration::from_secs_f64((1. - bucket.tokens) / self.rate_per_sec)
			};

			tokio::time::sleep(wait).await;
		}
	}
}
