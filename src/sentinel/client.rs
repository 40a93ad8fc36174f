use tracing::instrument;

use crate::{
	command::sentinel::{
		CkQuorum, Failover, GetMasterAddrByName, Master, Masters, Monitor, NodeInfo, Remove,
		Replicas, Reset, Sentinels, Set,
	},
	pubsub::PubSub,
	Client, Options, Result,
};

/// Typed Sentinel commands over a pooled connection to one sentinel.
#[derive(Debug, Clone)]
pub struct SentinelClient {
	client: Client,
}

impl SentinelClient {
	pub fn new(opt: Options) -> Result<Self> {
		Ok(Self {
			client: Client::new(opt)?,
		})
	}

	pub fn addr(&self) -> &str {
		self.client.addr()
	}

	pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
		self.client.ptr_eq(&other.client)
	}

	/// The underlying client, for commands without a typed wrapper.
	pub fn client(&self) -> &Client {
		&self.client
	}

	pub async fn ping(&self) -> Result<()> {
		self.client.ping().await.map(drop)
	}

	/// The current address of the master `name`, as `host:port`.
	#[instrument(level = "debug", skip(self), fields(sentinel = %self.addr()))]
	pub async fn get_master_addr_by_name(&self, name: &str) -> Result<String> {
		self.client.run(GetMasterAddrByName(name)).await
	}

	pub async fn replicas(&self, name: &str) -> Result<Vec<NodeInfo>> {
		self.client.run(Replicas(name)).await
	}

	/// Other sentinels monitoring `name`.
	pub async fn sentinels(&self, name: &str) -> Result<Vec<NodeInfo>> {
		self.client.run(Sentinels(name)).await
	}

	pub async fn masters(&self) -> Result<Vec<NodeInfo>> {
		self.client.run(Masters).await
	}

	pub async fn master(&self, name: &str) -> Result<NodeInfo> {
		self.client.run(Master(name)).await
	}

	/// Force a failover as if the master was unreachable.
	pub async fn failover(&self, name: &str) -> Result<()> {
		self.client.run(Failover(name)).await
	}

	/// Reset every master matching `pattern`, returning how many were reset.
	pub async fn reset(&self, pattern: &str) -> Result<i64> {
		self.client.run(Reset(pattern)).await
	}

	/// Stop monitoring `name`.
	pub async fn remove(&self, name: &str) -> Result<()> {
		self.client.run(Remove(name)).await
	}

	pub async fn monitor(&self, name: &str, host: &str, port: u16, quorum: u32) -> Result<()> {
		self.client
			.run(Monitor {
				name,
				host,
				port,
				quorum,
			})
			.await
	}

	pub async fn set(&self, name: &str, option: &str, value: &str) -> Result<()> {
		self.client.run(Set { name, option, value }).await
	}

	pub async fn ckquorum(&self, name: &str) -> Result<String> {
		self.client.run(CkQuorum(name)).await
	}

	/// Subscribe to Sentinel event channels such as `+switch-master`.
	pub async fn subscribe<I, B>(&self, channels: I) -> PubSub
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		self.client.subscribe(channels).await
	}

	pub fn close(&self) -> Result<()> {
		self.client.close()
	}
}
