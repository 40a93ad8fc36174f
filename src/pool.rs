use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use deadpool::{
	managed::{self, RecycleError},
	Runtime,
};
pub use deadpool::Status;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
	command::{
		connection::{ClientSetName, Hello, Select},
		Command,
	},
	connection::{Connection, Dialer, TcpDialer},
	Error, Options, Result,
};

/// A Deadpool [managed::Manager] for a Redis [Connection].
///
/// New connections are initialized according to the [Options] they were created with:
/// authenticated, switched to the configured database and named.
#[derive(Debug, Clone)]
pub struct Manager {
	dialer: Arc<dyn Dialer>,
	opt: Arc<Options>,
}

impl Manager {
	pub fn new(opt: Arc<Options>) -> Self {
		let dialer = opt.dialer.clone().unwrap_or_else(|| {
			Arc::new(TcpDialer {
				addr: opt.addr.clone(),
				timeout: opt.dial_timeout,
			})
		});

		Self { dialer, opt }
	}

	/// Dial and initialize a connection outside of any pool.
	#[instrument(level = "debug", skip(self), fields(addr = %self.opt.addr))]
	pub async fn connect(&self) -> Result<Connection> {
		let mut conn = self.dialer.dial().await?;
		conn.set_timeouts(self.opt.read_timeout, self.opt.write_timeout);

		if self.opt.password.is_some() {
			Hello {
				username: self.opt.username.as_deref(),
				password: self.opt.password.as_deref(),
			}
			.run(&mut conn)
			.await?;
		}

		if self.opt.db != 0 {
			Select(self.opt.db).run(&mut conn).await?;
		}

		if let Some(name) = &self.opt.client_name {
			ClientSetName(name.as_str()).run(&mut conn).await?;
		}

		debug!(addr = conn.addr(), "connected");
		Ok(conn)
	}
}

#[async_trait]
impl managed::Manager for Manager {
	type Type = Connection;
	type Error = Error;

	async fn create(&self) -> Result<Connection, Error> {
		self.connect().await
	}

	async fn recycle(&self, conn: &mut Connection) -> managed::RecycleResult<Error> {
		if conn.is_broken() {
			return Err(RecycleError::StaticMessage("connection is broken"));
		}

		if !self.dialer.accepts(conn.addr()) {
			debug!(addr = conn.addr(), "dropping connection to a stale address");
			return Err(RecycleError::StaticMessage("connection points at a stale address"));
		}

		Ok(())
	}
}

pub type Pool = managed::Pool<Manager>;
pub type Object = managed::Object<Manager>;

/// Build a pool sized and timed according to `opt`.
pub(crate) fn build(manager: Manager, opt: &Options) -> Result<Pool> {
	Pool::builder(manager)
		.max_size(opt.pool_size)
		.wait_timeout(opt.pool_timeout)
		.runtime(Runtime::Tokio1)
		.build()
		.map_err(|err| Error::Pool(err.to_string()))
}

/// Close connections which sat idle for longer than `idle_timeout`, every `frequency`, until
/// `closing` fires.
pub(crate) fn spawn_reaper(
	pool: Pool,
	idle_timeout: Duration,
	frequency: Duration,
	closing: CancellationToken,
) {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(frequency);
		interval.tick().await;

		loop {
			tokio::select! {
				_ = closing.cancelled() => break,
				_ = interval.tick() => {
					let before = pool.status().size;
					pool.retain(|_, metrics| metrics.last_used() < idle_timeout);
					let reaped = before.saturating_sub(pool.status().size);
					if reaped > 0 {
						debug!(reaped, "closed idle connections");
					}
				}
			}
		}
	});
}

/// Pool statistics, summable across shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
	/// Maximum number of connections.
	pub max_size: usize,
	/// Current number of open connections.
	pub size: usize,
	/// Number of idle connections; negative when tasks are waiting for one.
	pub available: isize,
}

impl From<Status> for PoolStats {
	fn from(status: Status) -> Self {
		Self {
			max_size: status.max_size,
			size: status.size,
			available: status.available,
		}
	}
}

impl std::ops::Add for PoolStats {
	type Output = Self;

	fn add(self, rhs: Self) -> Self {
		Self {
			max_size: self.max_size + rhs.max_size,
			size: self.size + rhs.size,
			available: self.available + rhs.available,
		}
	}
}

impl std::iter::Sum for PoolStats {
	fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
		iter.fold(Self::default(), |acc, stats| acc + stats)
	}
}
