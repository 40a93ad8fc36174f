use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Backoff before retry number `attempt` (zero-based): `min << attempt` plus random jitter of up
/// to the same amount, clamped to `max`. A zero `min` disables backoff.
pub fn retry_backoff(attempt: usize, min: Duration, max: Duration) -> Duration {
	if min.is_zero() {
		return Duration::ZERO;
	}

	let shift = u32::try_from(attempt).unwrap_or(u32::MAX).min(31);
	let base = min.checked_mul(1 << shift).unwrap_or(max);
	if base >= max {
		return max;
	}

	let jitter = rand::thread_rng().gen_range(Duration::ZERO..=base);
	(base + jitter).min(max)
}

/// Sleep for `dur`, waking early with [Error::Cancelled] when `token` fires.
pub async fn sleep(token: &CancellationToken, dur: Duration) -> Result<()> {
	if dur.is_zero() {
		return Ok(());
	}

	tokio::select! {
		_ = token.cancelled() => Err(Error::Cancelled),
		_ = tokio::time::sleep(dur) => Ok(()),
	}
}
