use async_trait::async_trait;
use resp::Data;

use crate::{Cmd, Connection, Result};

/// [Connection](https://redis.io/commands/?group=connection) commands.
pub mod connection;
/// [Sentinel](https://redis.io/docs/management/sentinel/#sentinel-commands) commands.
pub mod sentinel;

/// Types that can be executed on the Redis server as a command.
#[async_trait]
pub trait Command {
	/// The expected response type of this command.
	type Response;

	/// Run the command using the given connection.
	async fn run(self, connection: &mut Connection) -> Result<Self::Response>;
}

#[async_trait]
impl Command for Data<'_> {
	type Response = Data<'static>;

	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		connection.send(self).await?;
		connection.read_cmd().await
	}
}

#[async_trait]
impl Command for Cmd {
	type Response = Data<'static>;

	async fn run(self, connection: &mut Connection) -> Result<Self::Response> {
		connection.send(self.to_data()).await?;
		connection.read_cmd().await
	}
}
