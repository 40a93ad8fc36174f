use std::{
	fmt,
	sync::{Arc, Weak},
};

use bytes::Bytes;
use resp::Data;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
	cmd::{cmds_first_err, set_cmds_err, Cmd},
	command::{connection::Ping, Command},
	error::{is_bad_conn, should_retry},
	pool::{self, Manager, Object, Pool, PoolStats},
	pubsub::PubSub,
	retry::{self, retry_backoff},
	tx::Tx,
	Error, Options, Result,
};

struct Inner {
	opt: Arc<Options>,
	manager: Manager,
	pool: Pool,
	closing: CancellationToken,
}

impl Drop for Inner {
	fn drop(&mut self) {
		self.closing.cancel();
	}
}

/// A [Client] reference that does not keep the pool alive.
#[derive(Debug, Clone)]
pub(crate) struct WeakClient(Weak<Inner>);

impl WeakClient {
	pub(crate) fn upgrade(&self) -> Option<Client> {
		self.0.upgrade().map(|inner| Client { inner })
	}
}

/// A pooled client for a single Redis server.
///
/// Cloning is cheap: every clone shares the same pool.
#[derive(Clone)]
pub struct Client {
	inner: Arc<Inner>,
}

impl fmt::Debug for Client {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Client")
			.field("addr", &self.inner.opt.addr)
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl Client {
	/// Create a client. Connections are dialed lazily. Must be called within a Tokio runtime.
	pub fn new(opt: Options) -> Result<Self> {
		let opt = Arc::new(opt.init());
		let manager = Manager::new(opt.clone());
		let pool = pool::build(manager.clone(), &opt)?;
		let closing = CancellationToken::new();

		if let Some(idle_timeout) = opt.idle_timeout {
			pool::spawn_reaper(
				pool.clone(),
				idle_timeout,
				opt.idle_check_frequency,
				closing.clone(),
			);
		}

		Ok(Self {
			inner: Arc::new(Inner {
				opt,
				manager,
				pool,
				closing,
			}),
		})
	}

	pub fn options(&self) -> &Options {
		&self.inner.opt
	}

	pub fn addr(&self) -> &str {
		&self.inner.opt.addr
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closing.is_cancelled()
	}

	pub fn pool_status(&self) -> PoolStats {
		self.inner.pool.status().into()
	}

	pub(crate) fn pool(&self) -> &Pool {
		&self.inner.pool
	}

	pub(crate) fn manager(&self) -> &Manager {
		&self.inner.manager
	}

	/// Cancelled once the client is closed or dropped.
	pub(crate) fn closing(&self) -> CancellationToken {
		self.inner.closing.clone()
	}

	pub(crate) fn downgrade(&self) -> WeakClient {
		WeakClient(Arc::downgrade(&self.inner))
	}

	pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}

	pub(crate) async fn conn(&self) -> Result<Object> {
		if self.is_closed() {
			return Err(Error::Closed);
		}

		Ok(self.inner.pool.get().await?)
	}

	/// Return a connection to the pool, or drop it when `err` shows it can't be trusted.
	pub(crate) fn release(conn: Object, err: Option<&Error>) {
		let bad = conn.is_broken()
			|| err.map_or(false, |err| is_bad_conn(err, false, conn.addr()));

		if bad {
			debug!(addr = conn.addr(), ?err, "discarding connection");
			drop(Object::take(conn));
		}
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

	async fn process_once(&self, cmd: &Cmd) -> Result<Data<'static>> {
		let mut conn = self.conn().await?;
		let res = cmd.to_data().run(&mut conn).await;

		Self::release(conn, res.as_ref().err());
		res
	}

	/// Send a command and store its reply on it, retrying transient failures.
	///
	/// Returns the command's error, if it failed.
	#[instrument(level = "debug", skip_all, fields(addr = %self.addr(), cmd = %cmd.name()))]
	pub async fn process(&self, cmd: &mut Cmd) -> Result<()> {
		let retries = self.inner.opt.retries();
		let mut attempt = 0;

		loop {
			if attempt > 0 {
				if let Err(err) = self.backoff(attempt - 1).await {
					cmd.set_reply(Err(err.clone()));
					return Err(err);
				}
			}

			cmd.reset();
			match self.process_once(cmd).await {
				Err(err) if attempt < retries && should_retry(&err, true) && !self.is_closed() => {
					debug!(attempt, %err, "retrying command");
					attempt += 1;
				}
				Err(err) => {
					cmd.set_reply(Err(err.clone()));
					return Err(err);
				}
				Ok(data) => {
					cmd.set_reply(Ok(data));
					return Ok(());
				}
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

	/// Run a typed command on a pooled connection. Typed commands are not retried.
	pub async fn run<C>(&self, command: C) -> Result<C::Response>
	where
		C: Command + Send,
	{
		let mut conn = self.conn().await?;
		let res = command.run(&mut conn).await;
		Self::release(conn, res.as_ref().err());
		res
	}

	pub async fn ping(&self) -> Result<Bytes> {
		self.run(Ping(None)).await
	}

	/// Publish `payload` to `channel`, returning the number of subscribers that received it.
	pub async fn publish(&self, channel: impl AsRef<[u8]>, payload: impl AsRef<[u8]>) -> Result<i64> {
		integer(self.cmd([&b"publish"[..], channel.as_ref(), payload.as_ref()]).await?)
	}

	/// Publish to a shard channel.
	pub async fn spublish(
		&self,
		channel: impl AsRef<[u8]>,
		payload: impl AsRef<[u8]>,
	) -> Result<i64> {
		integer(self.cmd([&b"spublish"[..], channel.as_ref(), payload.as_ref()]).await?)
	}

	async fn batch_once(&self, cmds: &mut [Cmd], tx: bool) -> Result<()> {
		let mut conn = self.conn().await?;
		let res = if tx {
			conn.tx_pipeline(cmds).await
		} else {
			conn.pipeline(cmds).await
		};

		Self::release(conn, res.as_ref().err());
		res
	}

	async fn batch(&self, cmds: &mut [Cmd], tx: bool) -> Result<()> {
		if cmds.is_empty() {
			return Ok(());
		}

		let retries = self.inner.opt.retries();
		let mut attempt = 0;

		let res = loop {
			if attempt > 0 {
				if let Err(err) = self.backoff(attempt - 1).await {
					break Err(err);
				}
			}

			cmds.iter_mut().for_each(Cmd::reset);
			match self.batch_once(cmds, tx).await {
				Err(err)
					if attempt < retries
						&& should_retry(&err, true)
						&& !self.is_closed()
						&& cmds.iter().all(|cmd| cmd.reply().is_none()) =>
				{
					debug!(attempt, %err, "retrying pipeline");
					attempt += 1;
				}
				res => break res,
			}
		};

		if let Err(err) = &res {
			set_cmds_err(cmds, err);
		}

		match cmds_first_err(cmds) {
			Some(err) => Err(err),
			None => res,
		}
	}

	/// Send every command in a single round trip. Each command receives its own reply; the first
	/// error in input order is returned.
	pub async fn pipeline(&self, cmds: &mut [Cmd]) -> Result<()> {
		self.batch(cmds, false).await
	}

	/// Like [Self::pipeline()], wrapped in `MULTI`/`EXEC`.
	pub async fn tx_pipeline(&self, cmds: &mut [Cmd]) -> Result<()> {
		self.batch(cmds, true).await
	}

	/// `WATCH` the keys on a dedicated connection, returning a handle for the optimistic
	/// transaction.
	#[instrument(level = "debug", skip_all, fields(addr = %self.addr()))]
	pub async fn watch<I, B>(&self, keys: I) -> Result<Tx>
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		let watch = Cmd::new(["watch"]);
		let watch = keys.into_iter().fold(watch, |cmd, key| cmd.arg(key));
		if watch.args().len() < 2 {
			return Err(Error::NoWatchKeys);
		}

		let mut conn = self.conn().await?;
		let res = async {
			conn.send(watch.to_data()).await?;
			conn.read_cmd().await
		}
		.await;

		match res {
			Ok(_) => Ok(Tx::new(conn)),
			Err(err) => {
				Self::release(conn, Some(&err));
				Err(err)
			}
		}
	}

	/// A Pub/Sub session on its own connection, without any subscriptions.
	pub fn pubsub(&self) -> PubSub {
		PubSub::new(self.inner.manager.clone())
	}

	/// Subscribe to `channels` on a new Pub/Sub session.
	pub async fn subscribe<I, B>(&self, channels: I) -> PubSub
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		let pubsub = self.pubsub();
		if let Err(err) = pubsub.subscribe(channels).await {
			warn!(addr = %self.addr(), %err, "subscribe failed; will retry on reconnect");
		}
		pubsub
	}

	/// Subscribe to `patterns` on a new Pub/Sub session.
	pub async fn psubscribe<I, B>(&self, patterns: I) -> PubSub
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		let pubsub = self.pubsub();
		if let Err(err) = pubsub.psubscribe(patterns).await {
			warn!(addr = %self.addr(), %err, "psubscribe failed; will retry on reconnect");
		}
		pubsub
	}

	/// Subscribe to shard `channels` on a new Pub/Sub session.
	pub async fn ssubscribe<I, B>(&self, channels: I) -> PubSub
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		let pubsub = self.pubsub();
		if let Err(err) = pubsub.ssubscribe(channels).await {
			warn!(addr = %self.addr(), %err, "ssubscribe failed; will retry on reconnect");
		}
		pubsub
	}

	/// Close the pool. Commands issued afterwards fail with [Error::Closed].
	pub fn close(&self) -> Result<()> {
		if self.is_closed() {
			return Err(Error::Closed);
		}

		self.inner.closing.cancel();
		self.inner.pool.close();
		Ok(())
	}
}

fn integer(data: Data<'_>) -> Result<i64> {
	data.as_integer()
		.ok_or_else(|| Error::Protocol(format!("expected integer, got {data:?}")))
}
