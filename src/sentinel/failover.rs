use std::{
	fmt,
	future::Future,
	sync::{Arc, Mutex, PoisonError, Weak},
	time::Duration,
};

use async_trait::async_trait;
use futures::{stream::FuturesUnordered, StreamExt};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{FailoverOptions, SentinelClient};
use crate::{
	connection::{Connection, Dialer, TcpDialer},
	model::sentinel::{parse_replica_addrs, parse_sentinel_addrs, parse_switch_master},
	pubsub::{Channel, PubSub},
	Client, Error, Result,
};

const SWITCH_MASTER: &[u8] = b"+switch-master";
const REPLICA_RECONF_DONE: &[u8] = b"+replica-reconf-done";

type FailoverHook = Box<dyn Fn(&str) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct State {
	/// Known sentinels; the last one to answer comes first.
	sentinel_addrs: Vec<String>,
	sentinel: Option<SentinelClient>,
	/// Event subscription on `sentinel`.
	events: Option<PubSub>,
}

struct Inner {
	opt: FailoverOptions,
	state: tokio::sync::Mutex<State>,
	master_addr: Mutex<String>,
	on_failover: Mutex<Vec<FailoverHook>>,
	closing: CancellationToken,
}

/// Tracks the current master of a Sentinel-managed deployment.
///
/// One sentinel connection is cached and queried first; when it fails every known sentinel is
/// asked concurrently and the first to answer becomes the cached one. The cached sentinel's
/// `+switch-master` events keep the master address current between lookups.
#[derive(Clone)]
pub struct SentinelFailover {
	inner: Arc<Inner>,
}

impl fmt::Debug for SentinelFailover {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SentinelFailover")
			.field("master_name", &self.inner.opt.master_name)
			.field("master_addr", &*lock(&self.inner.master_addr))
			.finish_non_exhaustive()
	}
}

impl SentinelFailover {
	/// # Panics
	///
	/// When the master name or the sentinel list is empty.
	pub fn new(opt: FailoverOptions) -> Self {
		assert!(!opt.master_name.is_empty(), "sentinel: master name is required");
		assert!(!opt.sentinel_addrs.is_empty(), "sentinel: at least one sentinel address is required");

		let state = State {
			sentinel_addrs: opt.sentinel_addrs.clone(),
			..State::default()
		};

		Self {
			inner: Arc::new(Inner {
				opt,
				state: tokio::sync::Mutex::new(state),
				master_addr: Mutex::new(String::new()),
				on_failover: Mutex::new(Vec::new()),
				closing: CancellationToken::new(),
			}),
		}
	}

	pub fn options(&self) -> &FailoverOptions {
		&self.inner.opt
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closing.is_cancelled()
	}

	/// Register a hook run with the new address whenever the master changes. Hooks run in
	/// registration order while the master address is locked.
	pub fn on_failover(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
		lock(&self.inner.on_failover).push(Box::new(hook));
	}

	/// The last master address recorded by [Self::try_switch_master()], if any.
	pub fn current_master_addr(&self) -> Option<String> {
		let addr = lock(&self.inner.master_addr);
		(!addr.is_empty()).then(|| addr.clone())
	}

	/// Record `addr` as the master, running the failover hooks if it changed. Returns whether it
	/// changed.
	pub fn try_switch_master(&self, addr: &str) -> bool {
		let mut master = lock(&self.inner.master_addr);
		if *master == addr {
			return false;
		}

		info!(
			master = %self.inner.opt.master_name,
			old = %master,
			new = addr,
			"sentinel: new master"
		);
		*master = addr.to_owned();

		for hook in lock(&self.inner.on_failover).iter() {
			hook(addr);
		}
		true
	}

	/// Known sentinel addresses, most recently successful first.
	pub async fn sentinel_addrs(&self) -> Vec<String> {
		self.inner.state.lock().await.sentinel_addrs.clone()
	}

	/// The current master address.
	#[instrument(level = "debug", skip(self), fields(master = %self.inner.opt.master_name))]
	pub async fn master_addr(&self) -> Result<String> {
		let name = self.inner.opt.master_name.clone();
		self.lookup(move |sentinel| {
			let name = name.clone();
			async move { sentinel.get_master_addr_by_name(&name).await }
		})
		.await
	}

	/// Addresses of the replicas that are up. Replicas disconnected from the master are only
	/// included when `use_disconnected` is set.
	#[instrument(level = "debug", skip(self), fields(master = %self.inner.opt.master_name))]
	pub async fn replica_addrs(&self, use_disconnected: bool) -> Result<Vec<String>> {
		let name = self.inner.opt.master_name.clone();
		self.lookup(move |sentinel| {
			let name = name.clone();
			async move {
				let replicas = sentinel.replicas(&name).await?;
				Ok(parse_replica_addrs(&replicas, use_disconnected))
			}
		})
		.await
	}

	/// A random healthy replica; disconnected replicas when allowed and nothing else is up; the
	/// master as a last resort.
	pub async fn random_replica_addr(&self) -> Result<String> {
		let mut addrs = self.replica_addrs(false).await?;
		if addrs.is_empty() && self.inner.opt.use_disconnected_replicas {
			addrs = self.replica_addrs(true).await?;
		}

		if addrs.is_empty() {
			return self.master_addr().await;
		}

		let idx = rand::thread_rng().gen_range(0..addrs.len());
		Ok(addrs.swap_remove(idx))
	}

	/// Ask the cached sentinel, then every known sentinel at once.
	async fn lookup<T, F, Fut>(&self, query: F) -> Result<T>
	where
		F: Fn(SentinelClient) -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		if self.is_closed() {
			return Err(Error::Closed);
		}

		let cached = self.inner.state.lock().await.sentinel.clone();
		if let Some(sentinel) = cached {
			match query(sentinel.clone()).await {
				Ok(res) => return Ok(res),
				Err(Error::Cancelled) => return Err(Error::Cancelled),
				Err(err) => {
					warn!(sentinel = sentinel.addr(), %err, "sentinel: cached sentinel failed");
					let mut state = self.inner.state.lock().await;
					if state.sentinel.as_ref().map_or(false, |s| s.ptr_eq(&sentinel)) {
						Self::close_sentinel_locked(&mut state).await;
					}
				}
			}
		}

		let mut state = self.inner.state.lock().await;

		// another caller may have found a sentinel while this one waited
		if let Some(sentinel) = state.sentinel.clone() {
			match query(sentinel.clone()).await {
				Ok(res) => return Ok(res),
				Err(err) => {
					warn!(sentinel = sentinel.addr(), %err, "sentinel: cached sentinel failed");
					Self::close_sentinel_locked(&mut state).await;
				}
			}
		}

		let addrs = state.sentinel_addrs.clone();
		let query = &query;
		let mut pending: FuturesUnordered<_> = addrs
			.iter()
			.enumerate()
			.map(|(idx, addr)| async move {
				let sentinel = SentinelClient::new(self.inner.opt.sentinel_options(addr))?;
				match query(sentinel.clone()).await {
					Ok(res) => Ok((idx, sentinel, res)),
					Err(err) => {
						let _ = sentinel.close();
						Err(err)
					}
				}
			})
			.collect();

		let mut errors = Vec::new();
		loop {
			let Some(res) = pending.next().await else {
				break;
			};

			match res {
				Ok((idx, sentinel, res)) => {
					// the remaining lookups are dropped along with their clients
					drop(pending);
					state.sentinel_addrs.swap(0, idx);
					self.set_sentinel_locked(&mut state, sentinel).await;
					return Ok(res);
				}
				Err(err) => errors.push(err),
			}
		}

		warn!(master = %self.inner.opt.master_name, "sentinel: no sentinel answered");
		Err(Error::SentinelsUnreachable(errors))
	}

	async fn set_sentinel_locked(&self, state: &mut State, sentinel: SentinelClient) {
		debug!(sentinel = sentinel.addr(), "sentinel: caching connection");
		self.discover_sentinels_locked(state, &sentinel).await;

		let events = sentinel
			.subscribe([SWITCH_MASTER, REPLICA_RECONF_DONE])
			.await;
		self.spawn_listener(events.channel());

		state.sentinel = Some(sentinel);
		state.events = Some(events);
	}

	async fn discover_sentinels_locked(&self, state: &mut State, sentinel: &SentinelClient) {
		let nodes = match sentinel.sentinels(&self.inner.opt.master_name).await {
			Ok(nodes) => nodes,
			Err(err) => {
				warn!(sentinel = sentinel.addr(), %err, "sentinel: peer discovery failed");
				return;
			}
		};

		for addr in parse_sentinel_addrs(&nodes) {
			if !state.sentinel_addrs.contains(&addr) {
				info!(master = %self.inner.opt.master_name, sentinel = %addr, "sentinel: discovered new sentinel");
				state.sentinel_addrs.push(addr);
			}
		}
	}

	fn spawn_listener(&self, channel: Channel) {
		let failover = Arc::downgrade(&self.inner);
		let closing = self.inner.closing.clone();
		tokio::spawn(listen(failover, channel, closing));
	}

	async fn close_sentinel_locked(state: &mut State) {
		if let Some(events) = state.events.take() {
			let _ = events.close().await;
		}

		if let Some(sentinel) = state.sentinel.take() {
			let _ = sentinel.close();
		}
	}

	/// Drop the cached sentinel and stop listening for events. Lookups fail afterwards.
	pub async fn close(&self) -> Result<()> {
		if self.inner.closing.is_cancelled() {
			return Err(Error::Closed);
		}

		self.inner.closing.cancel();
		let mut state = self.inner.state.lock().await;
		Self::close_sentinel_locked(&mut state).await;
		Ok(())
	}
}

async fn listen(failover: Weak<Inner>, channel: Channel, closing: CancellationToken) {
	loop {
		let msg = tokio::select! {
			_ = closing.cancelled() => break,
			msg = channel.recv_message() => match msg {
				Some(msg) => msg,
				None => break,
			},
		};

		match &msg.channel[..] {
			SWITCH_MASTER => {
				let Some((name, addr)) = parse_switch_master(&msg.payload) else {
					warn!(payload = ?msg.payload, "sentinel: invalid +switch-master message");
					continue;
				};

				let Some(inner) = failover.upgrade() else {
					break;
				};

				if name != inner.opt.master_name {
					debug!(%name, "sentinel: ignoring switch of another master");
					continue;
				}

				SentinelFailover { inner }.try_switch_master(&addr);
			}
			REPLICA_RECONF_DONE => {
				debug!(payload = ?msg.payload, "sentinel: replica reconfigured");
			}
			_ => {}
		}
	}
}

/// Dials wherever a [SentinelFailover] currently points: the master, or a random replica in
/// replica-only mode.
#[derive(Debug, Clone)]
pub struct FailoverDialer {
	failover: SentinelFailover,
	timeout: Duration,
}

impl FailoverDialer {
	pub fn new(failover: SentinelFailover, timeout: Duration) -> Self {
		Self { failover, timeout }
	}
}

#[async_trait]
impl Dialer for FailoverDialer {
	async fn dial(&self) -> Result<Connection> {
		let addr = if self.failover.options().replica_only {
			self.failover.random_replica_addr().await?
		} else {
			let addr = self.failover.master_addr().await?;
			self.failover.try_switch_master(&addr);
			addr
		};

		TcpDialer {
			addr,
			timeout: self.timeout,
		}
		.dial()
		.await
	}

	fn accepts(&self, addr: &str) -> bool {
		if self.failover.options().replica_only {
			return true;
		}

		self.failover
			.current_master_addr()
			.map_or(true, |master| master == addr)
	}
}

/// A [Client] for the master (or a replica) of a Sentinel-managed deployment.
///
/// When the master changes, pooled connections to any other address are closed. Closing the
/// client also closes the failover coordinator.
pub fn new_failover_client(opt: FailoverOptions) -> Result<Client> {
	let failover = SentinelFailover::new(opt);
	let opt = &failover.inner.opt;
	let dialer = FailoverDialer::new(failover.clone(), opt.client.dial_timeout);
	let client = Client::new(opt.client_options(dialer))?;

	if !opt.replica_only {
		let weak = client.downgrade();
		failover.on_failover(move |addr| {
			if let Some(client) = weak.upgrade() {
				client.pool().retain(|conn, _| conn.addr() == addr);
			}
		});
	}

	let closing = client.closing();
	tokio::spawn(async move {
		closing.cancelled().await;
		let _ = failover.close().await;
	});

	Ok(client)
}

#[cfg(test)]
mod test {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use test_log::test;

	use super::*;

	#[test]
	#[should_panic(expected = "master name")]
	fn requires_master_name() {
		SentinelFailover::new(FailoverOptions::new("", ["localhost:26379"]));
	}

	#[test]
	#[should_panic(expected = "sentinel address")]
	fn requires_sentinels() {
		SentinelFailover::new(FailoverOptions::new("mymaster", Vec::<String>::new()));
	}

	#[test]
	fn switch_master_is_idempotent() {
		let failover = SentinelFailover::new(FailoverOptions::new("mymaster", ["localhost:26379"]));
		let calls = Arc::new(AtomicUsize::new(0));
		{
			let calls = calls.clone();
			failover.on_failover(move |addr| {
				assert_eq!(addr, "10.0.0.2:6379");
				calls.fetch_add(1, Ordering::SeqCst);
			});
		}

		assert!(failover.try_switch_master("10.0.0.2:6379"));
		assert!(!failover.try_switch_master("10.0.0.2:6379"));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(failover.current_master_addr().as_deref(), Some("10.0.0.2:6379"));
	}

	#[test(tokio::test)]
	async fn closed() {
		let failover = SentinelFailover::new(FailoverOptions::new("mymaster", ["localhost:26379"]));
		failover.close().await.expect("close");
		assert!(matches!(failover.close().await, Err(Error::Closed)));
		assert!(matches!(failover.master_addr().await, Err(Error::Closed)));
	}
}
