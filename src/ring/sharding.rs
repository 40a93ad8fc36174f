use std::{
	collections::HashMap,
	fmt,
	sync::{
		atomic::{AtomicI32, Ordering},
		Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
	},
	time::Duration,
};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{
	hash::{hash_tag, ConsistentHash},
	RingConfig,
};
use crate::{Client, Error, Options, Result};

/// Consecutive failed heartbeats before a shard stops receiving keys.
pub const DOWN_THRESHOLD: i32 = 3;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
	lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
	lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// One backend server of the ring.
pub struct RingShard {
	addr: String,
	client: Client,
	down: AtomicI32,
}

impl RingShard {
	pub fn new(addr: impl Into<String>, client: Client) -> Self {
		Self {
			addr: addr.into(),
			client,
			down: AtomicI32::new(0),
		}
	}

	pub fn addr(&self) -> &str {
		&self.addr
	}

	pub fn client(&self) -> &Client {
		&self.client
	}

	pub fn is_down(&self) -> bool {
		self.down.load(Ordering::Acquire) >= DOWN_THRESHOLD
	}

	pub fn is_up(&self) -> bool {
		!self.is_down()
	}

	/// Record one heartbeat result. Returns whether the shard flipped between up and down.
	pub fn vote(&self, up: bool) -> bool {
		if up {
			let changed = self.is_down();
			self.down.store(0, Ordering::Release);
			return changed;
		}

		if self.is_down() {
			return false;
		}

		self.down.fetch_add(1, Ordering::AcqRel);
		self.is_down()
	}
}

impl fmt::Display for RingShard {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let state = if self.is_up() { "up" } else { "down" };
		write!(f, "{} is {state}", self.client.addr())
	}
}

impl fmt::Debug for RingShard {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RingShard")
			.field("addr", &self.addr)
			.field("down", &self.down.load(Ordering::Relaxed))
			.finish()
	}
}

/// An immutable view of the configured shards; replaced wholesale, never mutated.
#[derive(Default)]
struct Shards {
	by_name: HashMap<String, Arc<RingShard>>,
	/// Sorted by name.
	list: Vec<(String, Arc<RingShard>)>,
}

impl Shards {
	fn new(by_name: HashMap<String, Arc<RingShard>>) -> Self {
		let mut list: Vec<_> = by_name
			.iter()
			.map(|(name, shard)| (name.clone(), Arc::clone(shard)))
			.collect();
		list.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

		Self { by_name, list }
	}

	fn contains(&self, shard: &Arc<RingShard>) -> bool {
		self.list.iter().any(|(_, s)| Arc::ptr_eq(s, shard))
	}
}

struct State {
	shards: Arc<Shards>,
	hash: Box<dyn ConsistentHash>,
	live: usize,
	closed: bool,
}

type NewNodeHook = Box<dyn Fn(&Client) + Send + Sync>;

/// The shard registry: configured shards, their liveness, and the consistent hash over the live
/// ones.
pub struct RingSharding {
	opt: Arc<RingConfig>,
	state: RwLock<State>,
	/// Serializes topology changes and rebalances.
	topology: Mutex<()>,
	on_new_node: Mutex<Vec<NewNodeHook>>,
}

impl fmt::Debug for RingSharding {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let state = read(&self.state);
		f.debug_struct("RingSharding")
			.field("shards", &state.shards.list)
			.field("live", &state.live)
			.field("closed", &state.closed)
			.finish()
	}
}

impl RingSharding {
	pub(crate) fn new(opt: Arc<RingConfig>) -> Self {
		let hash = (opt.new_consistent_hash)(Vec::new());
		Self {
			opt,
			state: RwLock::new(State {
				shards: Arc::default(),
				hash,
				live: 0,
				closed: false,
			}),
			topology: Mutex::new(()),
			on_new_node: Mutex::new(Vec::new()),
		}
	}

	/// Register a hook run, in registration order, for every shard client created from now on.
	pub fn on_new_node(&self, hook: impl Fn(&Client) + Send + Sync + 'static) {
		lock(&self.on_new_node).push(Box::new(hook));
	}

	fn new_shard(&self, addr: &str) -> Result<RingShard> {
		let opt = Options {
			addr: addr.to_owned(),
			..self.opt.client.clone()
		};
		let client = (self.opt.new_client)(opt)?;

		for hook in lock(&self.on_new_node).iter() {
			hook(&client);
		}

		Ok(RingShard::new(addr, client))
	}

	fn close_shards(shards: impl IntoIterator<Item = Arc<RingShard>>) {
		for shard in shards {
			if let Err(err) = shard.client.close() {
				debug!(addr = shard.addr(), %err, "ring shard already closed");
			}
		}
	}

	/// Reconcile the shard set with `addrs` (name to address). Shards whose address is still
	/// configured keep their client, whatever their name; removed shards are closed once they are
	/// no longer visible to lookups.
	#[instrument(level = "debug", skip_all, fields(len = addrs.len()))]
	pub fn set_addrs(&self, addrs: HashMap<String, String>) -> Result<()> {
		let topology = lock(&self.topology);

		let current = {
			let state = read(&self.state);
			if state.closed {
				return Err(Error::Closed);
			}
			Arc::clone(&state.shards)
		};

		let mut by_addr: HashMap<String, Arc<RingShard>> = current
			.list
			.iter()
			.map(|(_, shard)| (shard.addr.clone(), Arc::clone(shard)))
			.collect();
		let mut created = Vec::new();
		let mut by_name = HashMap::with_capacity(addrs.len());

		for (name, addr) in addrs {
			let shard = match by_addr.get(&addr) {
				Some(shard) => Arc::clone(shard),
				None => match self.new_shard(&addr) {
					Ok(shard) => {
						let shard = Arc::new(shard);
						by_addr.insert(addr, Arc::clone(&shard));
						created.push(Arc::clone(&shard));
						shard
					}
					Err(err) => {
						drop(topology);
						Self::close_shards(created);
						return Err(err);
					}
				},
			};
			by_name.insert(name, shard);
		}

		let shards = Arc::new(Shards::new(by_name));
		let unused: Vec<_> = current
			.list
			.iter()
			.filter(|(_, shard)| !shards.contains(shard))
			.map(|(_, shard)| Arc::clone(shard))
			.collect();

		{
			let mut state = write(&self.state);
			if state.closed {
				drop(state);
				drop(topology);
				Self::close_shards(created);
				return Err(Error::Closed);
			}

			state.shards = shards;
			self.rebalance_locked(&mut state);
		}

		drop(topology);

		if !unused.is_empty() {
			info!(removed = unused.len(), "closing removed ring shards");
		}
		Self::close_shards(unused);
		Ok(())
	}

	fn rebalance_locked(&self, state: &mut State) {
		let live: Vec<String> = state
			.shards
			.list
			.iter()
			.filter(|(_, shard)| shard.is_up())
			.map(|(name, _)| name.clone())
			.collect();

		debug!(live = live.len(), total = state.shards.list.len(), "rebalancing ring");
		state.live = live.len();
		state.hash = (self.opt.new_consistent_hash)(live);
	}

	/// The shard owning `key`, after hash tag extraction.
	pub fn get_by_key(&self, key: &[u8]) -> Result<Arc<RingShard>> {
		let state = read(&self.state);
		if state.closed {
			return Err(Error::Closed);
		}

		let name = state.hash.get(hash_tag(key)).ok_or(Error::ShardsDown)?;
		state
			.shards
			.by_name
			.get(name)
			.cloned()
			.ok_or_else(|| Error::ShardNotFound(name.to_owned()))
	}

	/// The shard named `name`; an empty name picks a random live shard.
	pub fn get_by_name(&self, name: &str) -> Result<Arc<RingShard>> {
		if name.is_empty() {
			return self.random();
		}

		let state = read(&self.state);
		if state.closed {
			return Err(Error::Closed);
		}

		state
			.shards
			.by_name
			.get(name)
			.cloned()
			.ok_or_else(|| Error::ShardNotFound(name.to_owned()))
	}

	/// A random live shard, weighted by its share of the hash space.
	pub fn random(&self) -> Result<Arc<RingShard>> {
		let key = rand::random::<u64>().to_string();
		self.get_by_key(key.as_bytes())
	}

	/// The name of the shard owning `key`, or an empty string when no shard is live.
	pub fn hash(&self, key: &[u8]) -> String {
		let state = read(&self.state);
		state
			.hash
			.get(hash_tag(key))
			.map(str::to_owned)
			.unwrap_or_default()
	}

	/// Every configured shard, live or not, in name order.
	pub fn list(&self) -> Vec<Arc<RingShard>> {
		read(&self.state)
			.shards
			.list
			.iter()
			.map(|(_, shard)| Arc::clone(shard))
			.collect()
	}

	/// Number of live shards.
	pub fn live_len(&self) -> usize {
		read(&self.state).live
	}

	pub fn is_closed(&self) -> bool {
		read(&self.state).closed
	}

	/// Probe every shard once. Returns whether the live set changed and the hash was rebuilt.
	pub async fn probe_shards(&self) -> bool {
		let shards = self.list();
		let results = join_all(
			shards
				.iter()
				.map(|shard| (self.opt.heartbeat_fn)(shard.client.clone())),
		)
		.await;

		let mut rebalance = false;
		for (shard, up) in shards.iter().zip(results) {
			if shard.vote(up) {
				info!(%shard, "ring shard state changed");
				rebalance = true;
			}
		}

		if rebalance {
			let _topology = lock(&self.topology);
			let mut state = write(&self.state);
			if !state.closed {
				self.rebalance_locked(&mut state);
			}
		}

		rebalance
	}

	/// Probe shards every `frequency` until `closing` fires.
	pub(crate) async fn heartbeat(self: Arc<Self>, frequency: Duration, closing: CancellationToken) {
		let mut interval = tokio::time::interval(frequency);
		interval.tick().await;

		loop {
			tokio::select! {
				_ = closing.cancelled() => break,
				_ = interval.tick() => {
					if self.is_closed() {
						break;
					}
					self.probe_shards().await;
				}
			}
		}

		debug!("ring heartbeat stopped");
	}

	/// Close every shard. Lookups fail with [Error::Closed] afterwards.
	pub fn close(&self) -> Result<()> {
		let topology = lock(&self.topology);

		let shards = {
			let mut state = write(&self.state);
			if state.closed {
				return Err(Error::Closed);
			}

			state.closed = true;
			state.live = 0;
			state.hash = (self.opt.new_consistent_hash)(Vec::new());
			std::mem::take(&mut state.shards)
		};
		drop(topology);

		for (_, shard) in &shards.list {
			if let Err(err) = shard.client.close() {
				warn!(addr = shard.addr(), %err, "closing ring shard");
			}
		}

		Ok(())
	}
}
