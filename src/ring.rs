use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{
	future::{join_all, BoxFuture},
	FutureExt,
};
use resp::Data;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
	cmd::{cmds_first_err, set_cmds_err, Cmd},
	error::should_retry,
	pool::PoolStats,
	pubsub::PubSub,
	retry::{self, retry_backoff},
	tx::Tx,
	Client, Error, Options, Result,
};

/// Consistent hashing of keys onto shards.
pub mod hash;
/// The shard registry and its heartbeat.
pub mod sharding;

use self::{
	hash::{ConsistentHash, Rendezvous},
	sharding::{RingShard, RingSharding},
};

pub type NewClientFn = Arc<dyn Fn(Options) -> Result<Client> + Send + Sync>;
pub type NewConsistentHashFn = Arc<dyn Fn(Vec<String>) -> Box<dyn ConsistentHash> + Send + Sync>;
pub type HeartbeatFn = Arc<dyn Fn(Client) -> BoxFuture<'static, bool> + Send + Sync>;

/// Configuration for a [Ring].
#[derive(Clone)]
pub struct RingOptions {
	/// Shard name to `host:port`.
	pub addrs: HashMap<String, String>,
	/// Template for every shard client; `addr` is replaced per shard and retries are left to the
	/// ring.
	pub client: Options,
	pub new_client: Option<NewClientFn>,
	/// Builds the key distribution from the sorted names of the live shards. Defaults to
	/// [Rendezvous].
	pub new_consistent_hash: Option<NewConsistentHashFn>,

	pub heartbeat_frequency: Duration,
	/// Liveness probe for a shard. Defaults to `PING`, counting a pool timeout as alive.
	pub heartbeat_fn: Option<HeartbeatFn>,

	/// Retries after the first attempt; negative disables retries.
	pub max_retries: i32,
	pub min_retry_backoff: Duration,
	pub max_retry_backoff: Duration,
}

impl Default for RingOptions {
	fn default() -> Self {
		Self {
			addrs: HashMap::new(),
			client: Options::default(),
			new_client: None,
			new_consistent_hash: None,
			heartbeat_frequency: Duration::from_millis(500),
			heartbeat_fn: None,
			max_retries: 3,
			min_retry_backoff: Duration::from_millis(8),
			max_retry_backoff: Duration::from_millis(512),
		}
	}
}

impl fmt::Debug for RingOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RingOptions")
			.field("addrs", &self.addrs)
			.field("client", &self.client)
			.field("heartbeat_frequency", &self.heartbeat_frequency)
			.field("max_retries", &self.max_retries)
			.finish_non_exhaustive()
	}
}

async fn ping_heartbeat(client: Client) -> bool {
	match client.ping().await {
		Ok(_) | Err(Error::PoolTimeout) => true,
		Err(err) => {
			debug!(addr = client.addr(), %err, "ring shard heartbeat failed");
			false
		}
	}
}

impl RingOptions {
	/// Resolve every default once.
	pub fn init(self) -> RingConfig {
		let mut client = self.client;
		client.max_retries = -1;

		let new_client: NewClientFn = match self.new_client {
			Some(new_client) => new_client,
			None => Arc::new(Client::new),
		};
		let new_consistent_hash: NewConsistentHashFn = match self.new_consistent_hash {
			Some(new_consistent_hash) => new_consistent_hash,
			None => Arc::new(|names: Vec<String>| {
				Box::new(Rendezvous::new(names)) as Box<dyn ConsistentHash>
			}),
		};
		let heartbeat_fn: HeartbeatFn = match self.heartbeat_fn {
			Some(heartbeat_fn) => heartbeat_fn,
			None => Arc::new(|client: Client| ping_heartbeat(client).boxed()),
		};

		RingConfig {
			addrs: self.addrs,
			client,
			new_client,
			new_consistent_hash,
			heartbeat_frequency: self.heartbeat_frequency,
			heartbeat_fn,
			max_retries: usize::try_from(self.max_retries).unwrap_or(0),
			min_retry_backoff: self.min_retry_backoff,
			max_retry_backoff: self.max_retry_backoff.max(self.min_retry_backoff),
		}
	}
}

/// [RingOptions] with every default resolved.
pub struct RingConfig {
	pub addrs: HashMap<String, String>,
	pub client: Options,
	pub new_client: NewClientFn,
	pub new_consistent_hash: NewConsistentHashFn,
	pub heartbeat_frequency: Duration,
	pub heartbeat_fn: HeartbeatFn,
	pub max_retries: usize,
	pub min_retry_backoff: Duration,
	pub max_retry_backoff: Duration,
}

struct RingInner {
	opt: Arc<RingConfig>,
	sharding: Arc<RingSharding>,
	closing: CancellationToken,
}

impl Drop for RingInner {
	fn drop(&mut self) {
		self.closing.cancel();
	}
}

/// A client that shards keys across several independent Redis servers by consistent hashing.
///
/// Shards are health checked in the background; a shard that fails
/// [DOWN_THRESHOLD](sharding::DOWN_THRESHOLD) heartbeats in a row stops receiving keys until it
/// answers again. Pipelines and transactions are split per shard, so a transaction spanning
/// several shards is not atomic.
#[derive(Clone)]
pub struct Ring {
	inner: Arc<RingInner>,
}

impl fmt::Debug for Ring {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Ring")
			.field("sharding", &self.inner.sharding)
			.finish()
	}
}

impl Ring {
	/// Create the ring and start its heartbeat. Must be called within a Tokio runtime.
	pub fn new(opt: RingOptions) -> Result<Self> {
		let opt = Arc::new(opt.init());
		let sharding = Arc::new(RingSharding::new(Arc::clone(&opt)));
		sharding.set_addrs(opt.addrs.clone())?;

		let closing = CancellationToken::new();
		tokio::spawn(
			Arc::clone(&sharding).heartbeat(opt.heartbeat_frequency, closing.clone()),
		);

		Ok(Self {
			inner: Arc::new(RingInner {
				opt,
				sharding,
				closing,
			}),
		})
	}

	pub fn sharding(&self) -> &RingSharding {
		&self.inner.sharding
	}

	fn is_closed(&self) -> bool {
		self.inner.closing.is_cancelled()
	}

	async fn backoff(&self, attempt: usize) -> Result<()> {
		let dur = retry_backoff(
			attempt,
			self.inner.opt.min_retry_backoff,
			self.inner.opt.max_retry_backoff,
		);
		retry::sleep(&self.inner.closing, dur)
			.await
			.map_err(|_| Error::Closed)
	}

	fn cmd_shard(&self, cmd: &Cmd) -> Result<Arc<RingShard>> {
		match cmd.first_key() {
			Some(key) => self.inner.sharding.get_by_key(key),
			None => self.inner.sharding.random(),
		}
	}

	/// Route a command by its first key (keyless commands go to a random shard) and store its
	/// reply on it. The shard is resolved again before every retry.
	#[instrument(level = "debug", skip_all, fields(cmd = %cmd.name()))]
	pub async fn process(&self, cmd: &mut Cmd) -> Result<()> {
		let mut attempt = 0;

		loop {
			if attempt > 0 {
				if let Err(err) = self.backoff(attempt - 1).await {
					cmd.set_reply(Err(err.clone()));
					return Err(err);
				}
			}

			cmd.reset();
			let res = match self.cmd_shard(cmd) {
				Ok(shard) => shard.client().process(cmd).await,
				Err(err) => Err(err),
			};

			match res {
				Err(err)
					if attempt < self.inner.opt.max_retries
						&& should_retry(&err, true)
						&& !self.is_closed() =>
				{
					debug!(attempt, %err, "retrying command on ring");
					attempt += 1;
				}
				Err(err) => {
					if cmd.reply().is_none() {
						cmd.set_reply(Err(err.clone()));
					}
					return Err(err);
				}
				Ok(()) => return Ok(()),
			}
		}
	}

	/// Send a command built from `args` and return its reply.
	pub async fn cmd<I, B>(&self, args: I) -> Result<Data<'static>>
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		let mut cmd = Cmd::new(args);
		self.process(&mut cmd).await?;
		cmd.take_reply()
			.unwrap_or_else(|| Err(Error::Protocol("missing reply".into())))
	}

	/// Partition command indices by the name of the shard owning each first key, in order of
	/// first appearance. Keyless commands share the `""` group, which is sent to one random shard.
	pub fn group_by_shard(&self, cmds: &[Cmd]) -> Vec<(String, Vec<usize>)> {
		let mut groups: Vec<(String, Vec<usize>)> = Vec::new();

		for (i, cmd) in cmds.iter().enumerate() {
			let name = cmd
				.first_key()
				.map(|key| self.inner.sharding.hash(key))
				.unwrap_or_default();

			match groups.iter_mut().find(|(group, _)| *group == name) {
				Some((_, indices)) => indices.push(i),
				None => groups.push((name, vec![i])),
			}
		}

		groups
	}

	async fn process_group(&self, name: &str, cmds: &mut [Cmd], tx: bool) -> Result<()> {
		let mut attempt = 0;

		loop {
			if attempt > 0 {
				if let Err(err) = self.backoff(attempt - 1).await {
					set_cmds_err(cmds, &err);
					return Err(err);
				}
			}

			cmds.iter_mut().for_each(Cmd::reset);
			let res = match self.inner.sharding.get_by_name(name) {
				Ok(shard) if tx => shard.client().tx_pipeline(cmds).await,
				Ok(shard) => shard.client().pipeline(cmds).await,
				Err(err) => {
					set_cmds_err(cmds, &err);
					Err(err)
				}
			};

			match res {
				Err(err)
					if attempt < self.inner.opt.max_retries
						&& !self.is_closed()
						&& cmds
							.iter()
							.all(|cmd| cmd.err().map_or(false, |err| should_retry(err, true))) =>
				{
					debug!(attempt, shard = name, %err, "retrying pipeline on ring");
					attempt += 1;
				}
				res => return res,
			}
		}
	}

	async fn batch(&self, cmds: &mut [Cmd], tx: bool) -> Result<()> {
		if cmds.is_empty() {
			return Ok(());
		}

		let groups: Vec<(String, Vec<usize>, Vec<Cmd>)> = self
			.group_by_shard(cmds)
			.into_iter()
			.map(|(name, indices)| {
				let batch = indices.iter().map(|&i| cmds[i].clone()).collect();
				(name, indices, batch)
			})
			.collect();

		let results = join_all(groups.into_iter().map(|(name, indices, mut batch)| async move {
			let _ = self.process_group(&name, &mut batch, tx).await;
			(indices, batch)
		}))
		.await;

		for (indices, batch) in results {
			for (i, mut cmd) in indices.into_iter().zip(batch) {
				if let Some(reply) = cmd.take_reply() {
					cmds[i].set_reply(reply);
				}
			}
		}

		match cmds_first_err(cmds) {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	/// Send the commands grouped by shard, one concurrent pipeline per shard. Every command
	/// receives its own reply; the first error in input order is returned.
	pub async fn pipeline(&self, cmds: &mut [Cmd]) -> Result<()> {
		self.batch(cmds, false).await
	}

	/// Like [Self::pipeline()], with each shard's group wrapped in `MULTI`/`EXEC`.
	pub async fn tx_pipeline(&self, cmds: &mut [Cmd]) -> Result<()> {
		self.batch(cmds, true).await
	}

	/// `WATCH` keys which must all live on the same shard.
	pub async fn watch<I, B>(&self, keys: I) -> Result<Tx>
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		let keys: Vec<Bytes> = keys
			.into_iter()
			.map(|key| Bytes::copy_from_slice(key.as_ref()))
			.collect();

		let mut shard: Option<Arc<RingShard>> = None;
		for key in &keys {
			let owner = self.inner.sharding.get_by_key(key)?;
			match &shard {
				Some(shard) if !Arc::ptr_eq(shard, &owner) => return Err(Error::CrossShardWatch),
				Some(_) => {}
				None => shard = Some(owner),
			}
		}

		let shard = shard.ok_or(Error::NoWatchKeys)?;
		shard.client().watch(keys).await
	}

	fn channel_shard(&self, channel: Option<&[u8]>) -> Result<Arc<RingShard>> {
		match channel {
			Some(channel) => self.inner.sharding.get_by_key(channel),
			None => self.inner.sharding.random(),
		}
	}

	/// Subscribe on the shard owning the first channel.
	pub async fn subscribe<I, B>(&self, channels: I) -> Result<PubSub>
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		let channels: Vec<B> = channels.into_iter().collect();
		let shard = self.channel_shard(channels.first().map(|channel| channel.as_ref()))?;
		Ok(shard.client().subscribe(channels).await)
	}

	/// Subscribe to patterns on the shard owning the first pattern.
	pub async fn psubscribe<I, B>(&self, patterns: I) -> Result<PubSub>
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		let patterns: Vec<B> = patterns.into_iter().collect();
		let shard = self.channel_shard(patterns.first().map(|pattern| pattern.as_ref()))?;
		Ok(shard.client().psubscribe(patterns).await)
	}

	/// Subscribe to shard channels on the shard owning the first channel.
	pub async fn ssubscribe<I, B>(&self, channels: I) -> Result<PubSub>
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		let channels: Vec<B> = channels.into_iter().collect();
		let shard = self.channel_shard(channels.first().map(|channel| channel.as_ref()))?;
		Ok(shard.client().ssubscribe(channels).await)
	}

	/// Run `f` concurrently for the client of every live shard. Returns the first error in shard
	/// name order.
	pub async fn for_each_shard<F, Fut>(&self, f: F) -> Result<()>
	where
		F: Fn(Client) -> Fut,
		Fut: Future<Output = Result<()>>,
	{
		let shards = self.inner.sharding.list();
		join_all(
			shards
				.iter()
				.filter(|shard| shard.is_up())
				.map(|shard| f(shard.client().clone())),
		)
		.await
		.into_iter()
		.collect()
	}

	/// Replace the shard set. See [RingSharding::set_addrs()].
	pub fn set_addrs(&self, addrs: HashMap<String, String>) -> Result<()> {
		self.inner.sharding.set_addrs(addrs)
	}

	/// Register a hook run for every shard client created after this call.
	pub fn on_new_node(&self, hook: impl Fn(&Client) + Send + Sync + 'static) {
		self.inner.sharding.on_new_node(hook);
	}

	/// Number of live shards.
	pub fn len(&self) -> usize {
		self.inner.sharding.live_len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Pool statistics summed over every shard.
	pub fn pool_status(&self) -> PoolStats {
		self.inner
			.sharding
			.list()
			.iter()
			.map(|shard| shard.client().pool_status())
			.sum()
	}

	/// Stop the heartbeat and close every shard.
	pub fn close(&self) -> Result<()> {
		self.inner.closing.cancel();
		self.inner.sharding.close()
	}
}
