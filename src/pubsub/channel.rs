use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::Session;
use crate::{
	model::pubsub::{Message, Response},
	Error,
};

/// Pause after consecutive receive failures.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Tuning for [super::PubSub::channel_with_options()].
#[derive(Debug, Clone)]
pub struct ChannelOptions {
	/// Messages buffered before delivery blocks. Default: 100.
	pub size: usize,
	/// How long a blocked delivery waits for the consumer before the message is dropped.
	/// Default: 60s.
	pub send_timeout: Duration,
	/// Idle time after which a `PING` checks the connection; `None` disables the check.
	/// Default: 3s.
	pub health_check_interval: Option<Duration>,
}

impl Default for ChannelOptions {
	fn default() -> Self {
		Self {
			size: 100,
			send_timeout: Duration::from_secs(60),
			health_check_interval: Some(Duration::from_secs(3)),
		}
	}
}

/// The receiving end of background delivery. Clones share one queue.
#[derive(Debug, Clone)]
pub struct Channel {
	rx: Arc<Mutex<mpsc::Receiver<Response>>>,
}

impl Channel {
	/// The next delivered frame, or `None` once the session is closed.
	pub async fn recv(&self) -> Option<Response> {
		self.rx.lock().await.recv().await
	}

	/// The next published message, skipping subscription confirmations.
	pub async fn recv_message(&self) -> Option<Message> {
		loop {
			if let Response::Message(msg) = self.recv().await? {
				return Some(msg);
			}
		}
	}
}

pub(super) fn spawn(session: Arc<Session>, with_subscriptions: bool, opts: ChannelOptions) -> Channel {
	let (tx, rx) = mpsc::channel(opts.size.max(1));
	let (activity_tx, activity_rx) = mpsc::channel(1);

	if let Some(interval) = opts.health_check_interval {
		tokio::spawn(health_check(Arc::clone(&session), activity_rx, interval));
	}
	tokio::spawn(deliver(session, tx, activity_tx, with_subscriptions, opts.send_timeout));

	Channel {
		rx: Arc::new(Mutex::new(rx)),
	}
}

async fn deliver(
	session: Arc<Session>,
	tx: mpsc::Sender<Response>,
	activity: mpsc::Sender<()>,
	with_subscriptions: bool,
	send_timeout: Duration,
) {
	let mut failures = 0u32;

	loop {
		let res = tokio::select! {
			_ = session.exit.cancelled() => break,
			res = session.receive(None) => res,
		};

		let msg = match res {
			Ok(msg) => msg,
			Err(Error::Closed) => break,
			Err(err) => {
				failures += 1;
				warn!(%err, failures, "pubsub receive failed");
				if failures > 1 {
					tokio::select! {
						_ = session.exit.cancelled() => break,
						_ = tokio::time::sleep(ERROR_BACKOFF) => {}
					}
				}
				continue;
			}
		};

		failures = 0;
		// any traffic counts as a successful health check
		let _ = activity.try_send(());

		let forward = match &msg {
			Response::Message(_) => true,
			Response::Subscribe(_) | Response::Unsubscribe(_) => with_subscriptions,
			Response::Pong(_) => false,
		};
		if !forward {
			continue;
		}

		let sent = tokio::select! {
			_ = session.exit.cancelled() => break,
			sent = tokio::time::timeout(send_timeout, tx.send(msg)) => sent,
		};

		match sent {
			Ok(Ok(())) => {}
			Ok(Err(_)) => {
				debug!("pubsub channel receiver dropped");
				break;
			}
			Err(_) => warn!(?send_timeout, "pubsub channel full; message dropped"),
		}
	}
}

async fn health_check(session: Arc<Session>, mut activity: mpsc::Receiver<()>, interval: Duration) {
	loop {
		tokio::select! {
			_ = session.exit.cancelled() => break,
			seen = activity.recv() => {
				if seen.is_none() {
					break;
				}
			}
			_ = tokio::time::sleep(interval) => {
				if let Err(err) = session.ping(None).await {
					if matches!(err, Error::Closed) {
						break;
					}
					warn!(%err, "pubsub health check failed");
					session.force_reconnect(&err).await;
				}
			}
		}
	}
}
