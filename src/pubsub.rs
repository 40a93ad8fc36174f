use std::{
	collections::HashSet,
	fmt, iter,
	sync::{Arc, OnceLock},
	time::Duration,
};

use bytes::Bytes;
use resp::Data;
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
	connection::{ConnReader, ConnWriter},
	error::is_bad_conn,
	model::pubsub::{Message, Response},
	pool::Manager,
	Error, Result,
};

/// Background delivery of received messages.
pub mod channel;

pub use self::channel::{Channel, ChannelOptions};

/// Consecutive broken connections a single receive call recovers from before giving up.
const MAX_RECONNECTS: usize = 3;

fn to_names<I, B>(names: I) -> Vec<Bytes>
where
	I: IntoIterator<Item = B>,
	B: AsRef<[u8]>,
{
	names
		.into_iter()
		.map(|name| Bytes::copy_from_slice(name.as_ref()))
		.collect()
}

fn command<'a>(name: &'static str, args: impl IntoIterator<Item = &'a Bytes>) -> Data<'a> {
	Data::Array(
		iter::once(Data::bulk_string(name))
			.chain(args.into_iter().map(|arg| Data::bulk_string(&arg[..])))
			.collect(),
	)
}

/// One generation of the dedicated connection, split so subscriptions can be written while a
/// reader is blocked.
struct PubSubConn {
	addr: String,
	reader: Mutex<ConnReader>,
	writer: Mutex<ConnWriter>,
	/// Fired when this generation is replaced or closed.
	cancel: CancellationToken,
}

impl PubSubConn {
	async fn send(&self, data: Data<'_>) -> Result<()> {
		let mut writer = self.writer.lock().await;
		tokio::select! {
			_ = self.cancel.cancelled() => Err(Error::Eof),
			res = writer.send(data) => res,
		}
	}

	async fn read(&self, exit: &CancellationToken) -> Result<Data<'static>> {
		tokio::select! {
			_ = exit.cancelled() => Err(Error::Closed),
			_ = self.cancel.cancelled() => Err(Error::Eof),
			res = async { self.reader.lock().await.read().await } => res,
		}
	}
}

#[derive(Default)]
struct State {
	conn: Option<Arc<PubSubConn>>,
	channels: HashSet<Bytes>,
	patterns: HashSet<Bytes>,
	shard_channels: HashSet<Bytes>,
	closed: bool,
}

pub(crate) struct Session {
	manager: Manager,
	state: Mutex<State>,
	/// Stops every background task of this session.
	exit: CancellationToken,
	delivery: OnceLock<(bool, Channel)>,
}

impl Session {
	/// The current connection, dialing and replaying every subscription when there is none.
	async fn conn_locked(&self, state: &mut State) -> Result<Arc<PubSubConn>> {
		if state.closed {
			return Err(Error::Closed);
		}

		if let Some(conn) = &state.conn {
			return Ok(Arc::clone(conn));
		}

		let conn = self.manager.connect().await?;
		let addr = conn.addr().to_owned();
		let (reader, writer) = conn.into_split();
		let conn = Arc::new(PubSubConn {
			addr,
			reader: Mutex::new(reader),
			writer: Mutex::new(writer),
			cancel: CancellationToken::new(),
		});

		for (name, set) in [
			("subscribe", &state.channels),
			("psubscribe", &state.patterns),
			("ssubscribe", &state.shard_channels),
		] {
			if set.is_empty() {
				continue;
			}

			if let Err(err) = conn.send(command(name, set)).await {
				conn.cancel.cancel();
				return Err(err);
			}
		}

		debug!(addr = %conn.addr, "pubsub connected");
		state.conn = Some(Arc::clone(&conn));
		Ok(conn)
	}

	/// Replace `stale` with a fresh, resubscribed connection, unless it was already replaced.
	async fn reconnect_locked(&self, state: &mut State, stale: &Arc<PubSubConn>, reason: &Error) {
		match &state.conn {
			Some(current) if Arc::ptr_eq(current, stale) => {}
			_ => return,
		}

		if let Some(conn) = state.conn.take() {
			conn.cancel.cancel();
		}

		warn!(addr = %stale.addr, %reason, "pubsub connection lost; reconnecting");
		if let Err(err) = self.conn_locked(state).await {
			warn!(addr = %stale.addr, %err, "pubsub reconnect failed");
		}
	}

	async fn release_locked(
		&self,
		state: &mut State,
		conn: &Arc<PubSubConn>,
		err: Option<&Error>,
		allow_timeout: bool,
	) {
		if let Some(err) = err {
			if is_bad_conn(err, allow_timeout, &conn.addr) {
				self.reconnect_locked(state, conn, err).await;
			}
		}
	}

	async fn send_locked(&self, state: &mut State, name: &'static str, args: &[Bytes]) -> Result<()> {
		let conn = self.conn_locked(state).await?;
		let res = conn.send(command(name, args)).await;
		self.release_locked(state, &conn, res.as_ref().err(), false).await;
		res
	}

	async fn subscribe(&self, kind: Kind, names: Vec<Bytes>) -> Result<()> {
		let mut state = self.state.lock().await;
		if state.closed {
			return Err(Error::Closed);
		}

		let res = self.send_locked(&mut state, kind.subscribe(), &names).await;
		kind.set(&mut state).extend(names);
		res
	}

	async fn unsubscribe(&self, kind: Kind, names: Vec<Bytes>) -> Result<()> {
		let mut state = self.state.lock().await;
		if names.is_empty() {
			kind.set(&mut state).clear();
		} else {
			let set = kind.set(&mut state);
			for name in &names {
				set.remove(name);
			}
		}

		// nothing is subscribed on the server without a connection
		if state.conn.is_none() {
			return if state.closed { Err(Error::Closed) } else { Ok(()) };
		}

		self.send_locked(&mut state, kind.unsubscribe(), &names).await
	}

	async fn ping(&self, payload: Option<&[u8]>) -> Result<()> {
		let payload = payload.map(Bytes::copy_from_slice);
		let mut state = self.state.lock().await;
		self.send_locked(&mut state, "ping", payload.as_slice()).await
	}

	/// Drop the current connection after a failed health check.
	async fn force_reconnect(&self, reason: &Error) {
		let mut state = self.state.lock().await;
		if let Some(conn) = state.conn.clone() {
			self.reconnect_locked(&mut state, &conn, reason).await;
		}
	}

	async fn receive(&self, timeout: Option<Duration>) -> Result<Response> {
		let deadline = timeout.map(|timeout| Instant::now() + timeout);
		let mut reconnects = 0;

		loop {
			let conn = {
				let mut state = self.state.lock().await;
				self.conn_locked(&mut state).await?
			};

			let res = match deadline {
				Some(deadline) => tokio::time::timeout_at(deadline, conn.read(&self.exit))
					.await
					.unwrap_or(Err(Error::Timeout)),
				None => conn.read(&self.exit).await,
			};

			match res {
				Ok(data) => return Ok(Response::try_from_data(data)?),
				Err(err) if reconnects < MAX_RECONNECTS && is_bad_conn(&err, true, &conn.addr) => {
					reconnects += 1;
					let mut state = self.state.lock().await;
					self.reconnect_locked(&mut state, &conn, &err).await;
				}
				Err(err) => return Err(err),
			}
		}
	}

	async fn close(&self) -> Result<()> {
		let mut state = self.state.lock().await;
		if state.closed {
			return Err(Error::Closed);
		}

		state.closed = true;
		self.exit.cancel();
		if let Some(conn) = state.conn.take() {
			conn.cancel.cancel();
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Copy)]
enum Kind {
	Channel,
	Pattern,
	Shard,
}

impl Kind {
	fn subscribe(self) -> &'static str {
		match self {
			Self::Channel => "subscribe",
			Self::Pattern => "psubscribe",
			Self::Shard => "ssubscribe",
		}
	}

	fn unsubscribe(self) -> &'static str {
		match self {
			Self::Channel => "unsubscribe",
			Self::Pattern => "punsubscribe",
			Self::Shard => "sunsubscribe",
		}
	}

	fn set(self, state: &mut State) -> &mut HashSet<Bytes> {
		match self {
			Self::Channel => &mut state.channels,
			Self::Pattern => &mut state.patterns,
			Self::Shard => &mut state.shard_channels,
		}
	}
}

/// A Pub/Sub session on a dedicated connection.
///
/// Subscriptions are tracked locally and replayed whenever the connection is replaced, so a
/// broken connection is repaired on the next read without losing any subscription. Dropping the
/// session closes it.
pub struct PubSub {
	session: Arc<Session>,
}

impl fmt::Debug for PubSub {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PubSub")
			.field("closed", &self.session.exit.is_cancelled())
			.finish_non_exhaustive()
	}
}

impl Drop for PubSub {
	fn drop(&mut self) {
		self.session.exit.cancel();
		if let Ok(mut state) = self.session.state.try_lock() {
			state.closed = true;
			if let Some(conn) = state.conn.take() {
				conn.cancel.cancel();
			}
		}
	}
}

impl PubSub {
	/// A session without subscriptions. Nothing is dialed until the first subscribe or receive.
	pub fn new(manager: Manager) -> Self {
		Self {
			session: Arc::new(Session {
				manager,
				state: Mutex::new(State::default()),
				exit: CancellationToken::new(),
				delivery: OnceLock::new(),
			}),
		}
	}

	#[instrument(level = "debug", skip_all)]
	pub async fn subscribe<I, B>(&self, channels: I) -> Result<()>
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		self.session.subscribe(Kind::Channel, to_names(channels)).await
	}

	#[instrument(level = "debug", skip_all)]
	pub async fn psubscribe<I, B>(&self, patterns: I) -> Result<()>
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		self.session.subscribe(Kind::Pattern, to_names(patterns)).await
	}

	#[instrument(level = "debug", skip_all)]
	pub async fn ssubscribe<I, B>(&self, channels: I) -> Result<()>
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		self.session.subscribe(Kind::Shard, to_names(channels)).await
	}

	/// Unsubscribe from `channels`, or from every channel when empty.
	pub async fn unsubscribe<I, B>(&self, channels: I) -> Result<()>
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		self.session.unsubscribe(Kind::Channel, to_names(channels)).await
	}

	/// Unsubscribe from `patterns`, or from every pattern when empty.
	pub async fn punsubscribe<I, B>(&self, patterns: I) -> Result<()>
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		self.session.unsubscribe(Kind::Pattern, to_names(patterns)).await
	}

	/// Unsubscribe from shard `channels`, or from every shard channel when empty.
	pub async fn sunsubscribe<I, B>(&self, channels: I) -> Result<()>
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		self.session.unsubscribe(Kind::Shard, to_names(channels)).await
	}

	/// Send a `PING`; the reply arrives through [Self::receive()] as [Response::Pong].
	pub async fn ping(&self, payload: Option<&[u8]>) -> Result<()> {
		self.session.ping(payload).await
	}

	/// Wait for the next frame, reconnecting transparently if the connection breaks.
	pub async fn receive(&self) -> Result<Response> {
		self.session.receive(None).await
	}

	/// Like [Self::receive()], failing with [Error::Timeout] when nothing arrives in time. A
	/// timeout does not affect the connection.
	pub async fn receive_timeout(&self, timeout: Duration) -> Result<Response> {
		self.session.receive(Some(timeout)).await
	}

	/// Wait for the next published message, skipping subscription confirmations and pongs.
	pub async fn receive_message(&self) -> Result<Message> {
		loop {
			if let Response::Message(msg) = self.receive().await? {
				return Ok(msg);
			}
		}
	}

	/// Messages delivered by a background task, with default [ChannelOptions].
	pub fn channel(&self) -> Channel {
		self.channel_with_options(ChannelOptions::default())
	}

	/// Messages delivered by a background task. The task is started by the first call; later
	/// calls share its queue and ignore `opts`.
	pub fn channel_with_options(&self, opts: ChannelOptions) -> Channel {
		self.delivery(false, opts)
	}

	/// Like [Self::channel_with_options()], also delivering subscription confirmations so that
	/// reconnects are observable.
	pub fn channel_with_subscriptions(&self, opts: ChannelOptions) -> Channel {
		self.delivery(true, opts)
	}

	fn delivery(&self, with_subscriptions: bool, opts: ChannelOptions) -> Channel {
		let (mode, channel) = self.session.delivery.get_or_init(|| {
			(
				with_subscriptions,
				channel::spawn(Arc::clone(&self.session), with_subscriptions, opts),
			)
		});

		if *mode != with_subscriptions {
			warn!("pubsub channel already started in a different delivery mode");
		}
		channel.clone()
	}

	/// Channels currently subscribed to.
	pub async fn channels(&self) -> Vec<Bytes> {
		self.session.state.lock().await.channels.iter().cloned().collect()
	}

	/// Patterns currently subscribed to.
	pub async fn patterns(&self) -> Vec<Bytes> {
		self.session.state.lock().await.patterns.iter().cloned().collect()
	}

	/// Shard channels currently subscribed to.
	pub async fn shard_channels(&self) -> Vec<Bytes> {
		self.session
			.state
			.lock()
			.await
			.shard_channels
			.iter()
			.cloned()
			.collect()
	}

	/// Close the connection and stop background delivery. A second call fails with
	/// [Error::Closed].
	pub async fn close(&self) -> Result<()> {
		self.session.close().await
	}
}
