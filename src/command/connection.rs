use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use resp::Data;
use tracing::{debug, instrument};

use crate::{Connection, Error, Result};

use super::Command;

/// Authenticate with [`HELLO 2 AUTH`](https://redis.io/commands/hello/), staying on RESP2.
/// Servers older than 6.0 don't know `HELLO`; those get a plain
/// [`AUTH`](https://redis.io/commands/auth/) instead.
#[derive(Debug, Clone, Copy)]
pub struct Hello<'a> {
	pub username: Option<&'a str>,
	pub password: Option<&'a str>,
}

impl Hello<'_> {
	async fn auth(&self, connection: &mut Connection, password: &str) -> Result<()> {
		match self.username {
			Some(username) => connection.cmd(["auth", username, password]).await?,
			None => connection.cmd(["auth", password]).await?,
		};
		Ok(())
	}
}

#[async_trait]
impl Command for Hello<'_> {
	type Response = ();

	#[instrument(skip(self))]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		let Some(password) = self.password else {
			connection.cmd(["hello", "2"]).await?;
			return Ok(());
		};

		let username = self.username.unwrap_or("default");
		match connection
			.cmd(["hello", "2", "auth", username, password])
			.await
		{
			Ok(_) => Ok(()),
			Err(Error::Redis(msg)) if msg.starts_with("ERR unknown command") => {
				debug!("server has no HELLO, falling back to AUTH");
				self.auth(connection, password).await
			}
			Err(err) => Err(err),
		}
	}
}

/// A [`SELECT`](https://redis.io/commands/select/) command.
#[derive(Debug, Clone, Copy)]
pub struct Select(pub u32);

#[async_trait]
impl Command for Select {
	type Response = ();

	#[instrument]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		let db = self.0.to_string();
		connection.cmd(["select", db.as_str()]).await?;
		Ok(())
	}
}

/// A [`CLIENT SETNAME`](https://redis.io/commands/client-setname/) command.
#[derive(Debug, Clone)]
pub struct ClientSetName<N>(pub N);

#[async_trait]
impl<N> Command for ClientSetName<N>
where
	N: AsRef<[u8]> + Send + Debug,
{
	type Response = ();

	#[instrument]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		connection
			.cmd([&b"client"[..], b"setname", self.0.as_ref()])
			.await?;
		Ok(())
	}
}

/// A [`PING`](https://redis.io/commands/ping/) command, with an optional payload to echo.
#[derive(Debug, Clone, Default)]
pub struct Ping(pub Option<Bytes>);

#[async_trait]
impl Command for Ping {
	/// `PONG`, or the payload when one was sent.
	type Response = Bytes;

	#[instrument(level = "trace")]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		let res = match &self.0 {
			Some(payload) => connection.cmd([&b"ping"[..], &payload[..]]).await?,
			None => connection.cmd(["ping"]).await?,
		};

		match res {
			Data::SimpleString(str) => Ok(Bytes::from(str.into_owned())),
			Data::BulkString(bytes) => Ok(Bytes::from(bytes.into_owned())),
			other => Err(Error::Protocol(format!("unexpected PING reply: {other:?}"))),
		}
	}
}
