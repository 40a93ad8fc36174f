use std::fmt;

use resp::Data;
use tracing::debug;

use crate::{pool::Object, Client, Cmd, Error, Result};

/// An optimistic transaction: a dedicated connection with keys under `WATCH`.
///
/// Queue the transaction with [Self::tx_pipeline()]; it fails with [Error::TxFailed] when a
/// watched key changed. A `Tx` dropped while still watching closes its connection rather than
/// returning it to the pool.
pub struct Tx {
	conn: Option<Object>,
	watching: bool,
}

impl fmt::Debug for Tx {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Tx")
			.field("addr", &self.conn.as_ref().map(|conn| conn.addr()))
			.field("watching", &self.watching)
			.finish()
	}
}

impl Tx {
	pub(crate) fn new(conn: Object) -> Self {
		Self {
			conn: Some(conn),
			watching: true,
		}
	}

	fn conn(&mut self) -> Result<&mut Object> {
		self.conn.as_mut().ok_or(Error::Closed)
	}

	/// Run a single command on the watched connection, e.g. to read the watched keys.
	pub async fn process(&mut self, cmd: &mut Cmd) -> Result<()> {
		let conn = self.conn()?;
		cmd.reset();
		let res = async {
			conn.send(cmd.to_data()).await?;
			conn.read_cmd().await
		}
		.await;

		cmd.set_reply(res.clone());
		res.map(drop)
	}

	pub async fn cmd<I, B>(&mut self, args: I) -> Result<Data<'static>>
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		let mut cmd = Cmd::new(args);
		self.process(&mut cmd).await?;
		cmd.take_reply()
			.unwrap_or_else(|| Err(Error::Protocol("missing reply".into())))
	}

	/// Execute the commands in `MULTI`/`EXEC`. `EXEC` releases every watched key, whatever the
	/// outcome.
	pub async fn tx_pipeline(&mut self, cmds: &mut [Cmd]) -> Result<()> {
		cmds.iter_mut().for_each(Cmd::reset);
		let res = self.conn()?.tx_pipeline(cmds).await;
		if matches!(res, Ok(()) | Err(Error::TxFailed | Error::Redis(_))) {
			self.watching = false;
		}

		res?;
		match crate::cmd::cmds_first_err(cmds) {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	/// Release every watched key.
	pub async fn unwatch(&mut self) -> Result<()> {
		self.conn()?.cmd(["unwatch"]).await?;
		self.watching = false;
		Ok(())
	}

	/// Finish with the transaction, returning the connection to the pool.
	pub async fn close(mut self) -> Result<()> {
		if self.watching {
			self.unwatch().await?;
		}

		if let Some(conn) = self.conn.take() {
			Client::release(conn, None);
		}
		Ok(())
	}
}

impl Drop for Tx {
	fn drop(&mut self) {
		if let Some(conn) = self.conn.take() {
			if self.watching {
				debug!(addr = conn.addr(), "dropping transaction connection still under WATCH");
				drop(Object::take(conn));
			} else {
				Client::release(conn, None);
			}
		}
	}
}
