use std::collections::HashMap;

use async_trait::async_trait;
use resp::Data;
use tracing::instrument;

use crate::{
	model::{
		self,
		sentinel::{join_host_port, parse_info, parse_info_list},
	},
	Connection, Error, Result,
};

use super::Command;

/// Node information as reported by Sentinel: field name to value.
pub type NodeInfo = HashMap<String, String>;

fn text(data: Data<'_>) -> Result<String> {
	data.as_str()
		.map(str::to_owned)
		.ok_or(Error::Model(model::Error::InvalidFormat("expected string")))
}

/// `SENTINEL GET-MASTER-ADDR-BY-NAME`: the current master address as `host:port`.
#[derive(Debug, Clone)]
pub struct GetMasterAddrByName<'a>(pub &'a str);

#[async_trait]
impl Command for GetMasterAddrByName<'_> {
	type Response = String;

	#[instrument(level = "debug")]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		let res = connection
			.cmd(["sentinel", "get-master-addr-by-name", self.0])
			.await?;

		match res {
			Data::Null => Err(Error::Nil),
			res => {
				let mut parts = res
					.into_array()
					.ok_or(model::Error::InvalidFormat("expected [host, port]"))?
					.into_iter();
				match (parts.next(), parts.next()) {
					(Some(host), Some(port)) => Ok(join_host_port(&text(host)?, &text(port)?)),
					_ => Err(model::Error::InvalidFormat("expected [host, port]").into()),
				}
			}
		}
	}
}

/// `SENTINEL REPLICAS`: every replica of a master.
#[derive(Debug, Clone)]
pub struct Replicas<'a>(pub &'a str);

#[async_trait]
impl Command for Replicas<'_> {
	type Response = Vec<NodeInfo>;

	#[instrument(level = "debug")]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		let res = connection.cmd(["sentinel", "replicas", self.0]).await?;
		Ok(parse_info_list(res)?)
	}
}

/// `SENTINEL SENTINELS`: every other sentinel monitoring a master.
#[derive(Debug, Clone)]
pub struct Sentinels<'a>(pub &'a str);

#[async_trait]
impl Command for Sentinels<'_> {
	type Response = Vec<NodeInfo>;

	#[instrument(level = "debug")]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		let res = connection.cmd(["sentinel", "sentinels", self.0]).await?;
		Ok(parse_info_list(res)?)
	}
}

/// `SENTINEL MASTERS`: state of every monitored master.
#[derive(Debug, Clone, Copy)]
pub struct Masters;

#[async_trait]
impl Command for Masters {
	type Response = Vec<NodeInfo>;

	#[instrument(level = "debug")]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		let res = connection.cmd(["sentinel", "masters"]).await?;
		Ok(parse_info_list(res)?)
	}
}

/// `SENTINEL MASTER`: state of one master.
#[derive(Debug, Clone)]
pub struct Master<'a>(pub &'a str);

#[async_trait]
impl Command for Master<'_> {
	type Response = NodeInfo;

	#[instrument(level = "debug")]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		let res = connection.cmd(["sentinel", "master", self.0]).await?;
		Ok(parse_info(res)?)
	}
}

/// `SENTINEL FAILOVER`: force a failover as if the master was unreachable.
#[derive(Debug, Clone)]
pub struct Failover<'a>(pub &'a str);

#[async_trait]
impl Command for Failover<'_> {
	type Response = ();

	#[instrument(level = "debug")]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		connection.cmd(["sentinel", "failover", self.0]).await?;
		Ok(())
	}
}

/// `SENTINEL RESET`: reset every master matching the pattern. Returns the number reset.
#[derive(Debug, Clone)]
pub struct Reset<'a>(pub &'a str);

#[async_trait]
impl Command for Reset<'_> {
	type Response = i64;

	#[instrument(level = "debug")]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		connection
			.cmd(["sentinel", "reset", self.0])
			.await?
			.as_integer()
			.ok_or_else(|| model::Error::InvalidFormat("expected integer").into())
	}
}

/// `SENTINEL REMOVE`: stop monitoring a master.
#[derive(Debug, Clone)]
pub struct Remove<'a>(pub &'a str);

#[async_trait]
impl Command for Remove<'_> {
	type Response = ();

	#[instrument(level = "debug")]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		connection.cmd(["sentinel", "remove", self.0]).await?;
		Ok(())
	}
}

/// `SENTINEL MONITOR`: start monitoring a new master.
#[derive(Debug, Clone)]
pub struct Monitor<'a> {
	pub name: &'a str,
	pub host: &'a str,
	pub port: u16,
	pub quorum: u32,
}

#[async_trait]
impl Command for Monitor<'_> {
	type Response = ();

	#[instrument(level = "debug")]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		let port = self.port.to_string();
		let quorum = self.quorum.to_string();
		connection
			.cmd(["sentinel", "monitor", self.name, self.host, port.as_str(), quorum.as_str()])
			.await?;
		Ok(())
	}
}

/// `SENTINEL SET`: change a configuration parameter of a monitored master.
#[derive(Debug, Clone)]
pub struct Set<'a> {
	pub name: &'a str,
	pub option: &'a str,
	pub value: &'a str,
}

#[async_trait]
impl Command for Set<'_> {
	type Response = ();

	#[instrument(level = "debug")]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		connection
			.cmd(["sentinel", "set", self.name, self.option, self.value])
			.await?;
		Ok(())
	}
}

/// `SENTINEL CKQUORUM`: whether the current configuration can reach quorum and authorize a
/// failover. Returns the server's explanation.
#[derive(Debug, Clone)]
pub struct CkQuorum<'a>(pub &'a str);

#[async_trait]
impl Command for CkQuorum<'_> {
	type Response = String;

	#[instrument(level = "debug")]
	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		text(connection.cmd(["sentinel", "ckquorum", self.0]).await?)
	}
}
