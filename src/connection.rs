use std::{fmt::Debug, future::Future, iter, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use resp::{codec::Codec, Data};
use tokio::net::{
	tcp::{OwnedReadHalf, OwnedWriteHalf},
	TcpStream,
};
use tokio_util::codec::{Decoder, Framed, FramedRead, FramedWrite};
use tracing::instrument;

use crate::{
	cmd::{set_cmds_err, Cmd},
	Error, Result,
};

async fn deadline<T>(timeout: Option<Duration>, fut: impl Future<Output = Result<T>>) -> Result<T> {
	match timeout {
		Some(timeout) => tokio::time::timeout(timeout, fut).await?,
		None => fut.await,
	}
}

fn command(args: &[&'static str]) -> Data<'static> {
	Data::Array(args.iter().map(|arg| Data::bulk_string(*arg)).collect())
}

fn next_reply(
	frame: Option<Result<Result<Data<'static>, resp::Error>, resp::Error>>,
) -> Result<Data<'static>> {
	match frame {
		Some(Ok(reply)) => reply.map_err(Error::from),
		Some(Err(err)) => Err(err.into()),
		None => Err(Error::Eof),
	}
}

/// A TCP connection to a Redis server.
///
/// Any transport failure marks the connection as broken; a broken connection is never returned
/// to a pool.
#[derive(Debug)]
pub struct Connection {
	framed: Framed<TcpStream, Codec>,
	addr: String,
	broken: bool,
	read_timeout: Option<Duration>,
	write_timeout: Option<Duration>,
}

impl Connection {
	/// Connect to the Redis server at `addr`.
	pub async fn new(addr: impl Into<String>) -> Result<Self> {
		let addr = addr.into();
		let stream = TcpStream::connect(&addr).await?;
		stream.set_nodelay(true)?;
		Ok(Self::from_stream(stream, addr))
	}

	/// Wrap an already connected stream. `addr` is what [Self::addr()] reports.
	pub fn from_stream(stream: TcpStream, addr: impl Into<String>) -> Self {
		Self {
			framed: Codec.framed(stream),
			addr: addr.into(),
			broken: false,
			read_timeout: None,
			write_timeout: None,
		}
	}

	/// The address this connection was dialed to.
	pub fn addr(&self) -> &str {
		&self.addr
	}

	/// Set deadlines for each read and each write. `None` waits forever.
	pub fn set_timeouts(&mut self, read: Option<Duration>, write: Option<Duration>) {
		self.read_timeout = read;
		self.write_timeout = write;
	}

	pub fn is_broken(&self) -> bool {
		self.broken
	}

	pub fn mark_broken(&mut self) {
		self.broken = true;
	}

	fn check<T>(&mut self, res: Result<T>) -> Result<T> {
		if let Err(err) = &res {
			if !matches!(err, Error::Redis(_)) {
				self.broken = true;
			}
		}

		res
	}

	/// Send data without waiting for a response.
	pub async fn send(&mut self, data: Data<'_>) -> Result<()> {
		self.write_all(iter::once(data)).await
	}

	/// Send a command without waiting for a response.
	pub async fn send_cmd<'a, C, I>(&mut self, cmd: C) -> Result<()>
	where
		C: IntoIterator<Item = &'a I>,
		I: 'a + AsRef<[u8]> + ?Sized,
	{
		self.send(Data::from_bytes_iter(cmd)).await
	}

	async fn write_all<'a>(&mut self, data: impl IntoIterator<Item = Data<'a>>) -> Result<()> {
		let framed = &mut self.framed;
		let res = deadline(self.write_timeout, async move {
			for data in data {
				framed.feed(data).await?;
			}
			framed.flush().await?;
			Ok(())
		})
		.await;

		self.check(res)
	}

	/// Read a single reply. Error replies from the server are returned as [Error::Redis].
	pub async fn read_cmd(&mut self) -> Result<Data<'static>> {
		let framed = &mut self.framed;
		let res = deadline(self.read_timeout, async move { next_reply(framed.next().await) }).await;
		self.check(res)
	}

	/// Send a command to the server, awaiting a single response.
	pub async fn cmd<'a, C, I>(&mut self, cmd: C) -> Result<Data<'static>>
	where
		C: IntoIterator<Item = &'a I>,
		I: 'a + AsRef<[u8]> + ?Sized,
	{
		self.send_cmd(cmd).await?;
		self.read_cmd().await
	}

	/// Write every command, then read every reply in order. Error replies are stored on the
	/// command they belong to; a transport error aborts the whole pipeline.
	#[instrument(level = "debug", skip_all, fields(addr = %self.addr, len = cmds.len()))]
	pub async fn pipeline(&mut self, cmds: &mut [Cmd]) -> Result<()> {
		self.write_all(cmds.iter().map(Cmd::to_data)).await?;

		for cmd in cmds.iter_mut() {
			match self.read_cmd().await {
				Err(err @ Error::Redis(_)) => cmd.set_reply(Err(err)),
				Err(err) => return Err(err),
				Ok(data) => cmd.set_reply(Ok(data)),
			}
		}

		Ok(())
	}

	/// Wrap the commands in `MULTI`/`EXEC` and map the `EXEC` reply back onto them.
	///
	/// When the transaction is aborted, every command receives the abort error; a `WATCH`
	/// violation fails every command with [Error::TxFailed].
	#[instrument(level = "debug", skip_all, fields(addr = %self.addr, len = cmds.len()))]
	pub async fn tx_pipeline(&mut self, cmds: &mut [Cmd]) -> Result<()> {
		let data = iter::once(command(&["MULTI"]))
			.chain(cmds.iter().map(Cmd::to_data))
			.chain(iter::once(command(&["EXEC"])));
		self.write_all(data).await?;

		let multi = match self.read_cmd().await {
			Err(err @ Error::Redis(_)) => Err(err),
			Err(err) => return Err(err),
			Ok(_) => Ok(()),
		};

		for _ in 0..cmds.len() {
			match self.read_cmd().await {
				Ok(_) | Err(Error::Redis(_)) => {}
				Err(err) => return Err(err),
			}
		}

		let res = match self.read_cmd().await {
			Ok(Data::Array(replies)) if replies.len() == cmds.len() => {
				for (cmd, reply) in cmds.iter_mut().zip(replies) {
					cmd.set_reply(match reply {
						Data::Error(msg) => Err(Error::Redis(msg.into_owned())),
						data => Ok(data),
					});
				}
				multi
			}
			Ok(Data::Array(replies)) => {
				self.broken = true;
				Err(Error::Protocol(format!(
					"EXEC returned {} replies for {} commands",
					replies.len(),
					cmds.len()
				)))
			}
			Ok(Data::Null) => Err(Error::TxFailed),
			Ok(other) => {
				self.broken = true;
				Err(Error::Protocol(format!("unexpected EXEC reply: {other:?}")))
			}
			Err(err) => Err(err),
		};

		if let Err(err) = &res {
			set_cmds_err(cmds, err);
		}
		res
	}

	/// Split into independently owned read and write halves, keeping any buffered input.
	pub fn into_split(self) -> (ConnReader, ConnWriter) {
		let parts = self.framed.into_parts();
		let (read, write) = parts.io.into_split();

		let mut reader = FramedRead::new(read, parts.codec);
		reader.read_buffer_mut().extend_from_slice(&parts.read_buf);

		(
			ConnReader {
				framed: reader,
				addr: self.addr.clone(),
			},
			ConnWriter {
				framed: FramedWrite::new(write, parts.codec),
				addr: self.addr,
				write_timeout: self.write_timeout,
			},
		)
	}
}

/// The read half of a split [Connection].
#[derive(Debug)]
pub struct ConnReader {
	framed: FramedRead<OwnedReadHalf, Codec>,
	addr: String,
}

impl ConnReader {
	pub fn addr(&self) -> &str {
		&self.addr
	}

	/// Read a single frame. There is no deadline; wrap the call to impose one.
	pub async fn read(&mut self) -> Result<Data<'static>> {
		next_reply(self.framed.next().await)
	}
}

/// The write half of a split [Connection].
#[derive(Debug)]
pub struct ConnWriter {
	framed: FramedWrite<OwnedWriteHalf, Codec>,
	addr: String,
	write_timeout: Option<Duration>,
}

impl ConnWriter {
	pub fn addr(&self) -> &str {
		&self.addr
	}

	pub async fn send(&mut self, data: Data<'_>) -> Result<()> {
		let framed = &mut self.framed;
		deadline(self.write_timeout, async move { Ok(framed.send(data).await?) }).await
	}
}

/// Produces fresh connections for a pool.
#[async_trait]
pub trait Dialer: Debug + Send + Sync {
	async fn dial(&self) -> Result<Connection>;

	/// Whether a pooled connection to `addr` may be handed out again. Dialers whose target
	/// moves reject connections to anywhere else.
	fn accepts(&self, _addr: &str) -> bool {
		true
	}
}

/// Dials a fixed TCP address.
#[derive(Debug, Clone)]
pub struct TcpDialer {
	pub addr: String,
	pub timeout: Duration,
}

#[async_trait]
impl Dialer for TcpDialer {
	#[instrument(level = "debug")]
	async fn dial(&self) -> Result<Connection> {
		tokio::time::timeout(self.timeout, Connection::new(self.addr.clone())).await?
	}
}

#[cfg(test)]
mod test {
	use resp::Data;
	use test_log::test;
	use tokio::{
		io::{AsyncReadExt, AsyncWriteExt},
		net::TcpListener,
	};

	use super::Connection;
	use crate::{Cmd, Error};

	/// Accept one connection and answer it with `reply` once anything is received.
	async fn canned(reply: &'static [u8]) -> String {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr").to_string();

		tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.expect("accept");
			let mut buf = [0; 1024];
			let _ = stream.read(&mut buf).await;
			stream.write_all(reply).await.expect("write reply");
			let _ = stream.read(&mut buf).await;
		});

		addr
	}

	#[test(tokio::test)]
	async fn cmd() {
		let addr = canned(b"+PONG\r\n").await;
		let mut conn = Connection::new(addr).await.expect("new connection");

		let res = conn.cmd(["PING"]).await.expect("send command");
		assert_eq!(res, Data::SimpleString("PONG".into()));
	}

	#[test(tokio::test)]
	async fn pipeline_keeps_error_replies() {
		let addr = canned(b"+OK\r\n-ERR wrong type\r\n$3\r\nbar\r\n").await;
		let mut conn = Connection::new(addr).await.expect("new connection");

		let mut cmds = vec![
			Cmd::new(["SET", "foo", "bar"]),
			Cmd::new(["INCR", "foo"]),
			Cmd::new(["GET", "foo"]),
		];
		conn.pipeline(&mut cmds).await.expect("pipeline");

		assert!(matches!(cmds[1].err(), Some(Error::Redis(msg)) if msg == "ERR wrong type"));
		assert_eq!(cmds[2].reply().cloned().expect("reply").expect("data"), b"bar");
		assert!(!conn.is_broken());
	}

	#[test(tokio::test)]
	async fn tx_maps_exec_replies() {
		let addr = canned(b"+OK\r\n+QUEUED\r\n+QUEUED\r\n*2\r\n:1\r\n-ERR not an integer\r\n").await;
		let mut conn = Connection::new(addr).await.expect("new connection");

		let mut cmds = vec![Cmd::new(["INCR", "a"]), Cmd::new(["INCR", "b"])];
		conn.tx_pipeline(&mut cmds).await.expect("tx");

		assert_eq!(cmds[0].reply().cloned().expect("reply").expect("data"), Data::Integer(1));
		assert!(matches!(cmds[1].err(), Some(Error::Redis(_))));
	}

	#[test(tokio::test)]
	async fn tx_watch_failure() {
		let addr = canned(b"+OK\r\n+QUEUED\r\n*-1\r\n").await;
		let mut conn = Connection::new(addr).await.expect("new connection");

		let mut cmds = vec![Cmd::new(["INCR", "a"])];
		let err = conn.tx_pipeline(&mut cmds).await.expect_err("watch failure");

		assert!(matches!(err, Error::TxFailed));
		assert!(matches!(cmds[0].err(), Some(Error::TxFailed)));
	}

	#[test(tokio::test)]
	async fn eof_breaks_connection() {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr").to_string();
		tokio::spawn(async move {
			let _ = listener.accept().await;
		});

		let mut conn = Connection::new(addr).await.expect("new connection");
		let err = conn.cmd(["PING"]).await.expect_err("eof");

		assert!(matches!(err, Error::Eof | Error::Io(_)));
		assert!(conn.is_broken());
	}
}
