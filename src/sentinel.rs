use std::sync::Arc;

use crate::Options;

/// A client for the Sentinel processes themselves.
pub mod client;
/// Master discovery and failover tracking.
pub mod failover;

pub use self::{
	client::SentinelClient,
	failover::{new_failover_client, FailoverDialer, SentinelFailover},
};

/// Configuration for a Sentinel-managed master.
#[derive(Debug, Clone)]
pub struct FailoverOptions {
	/// Name of the master as configured in Sentinel.
	pub master_name: String,
	/// Seed list of sentinels. Sentinels they know about are added as they are discovered.
	pub sentinel_addrs: Vec<String>,
	pub sentinel_username: Option<String>,
	pub sentinel_password: Option<String>,
	/// Route every connection to a random replica instead of the master.
	pub replica_only: bool,
	/// Fall back to replicas that are disconnected from the master when no other replica is
	/// available.
	pub use_disconnected_replicas: bool,
	/// Template for data connections. `addr` and `dialer` are ignored.
	pub client: Options,
}

impl FailoverOptions {
	pub fn new<I, S>(master_name: impl Into<String>, sentinel_addrs: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			master_name: master_name.into(),
			sentinel_addrs: sentinel_addrs.into_iter().map(Into::into).collect(),
			sentinel_username: None,
			sentinel_password: None,
			replica_only: false,
			use_disconnected_replicas: false,
			client: Options::default(),
		}
	}

	/// Options for a connection to the sentinel at `addr`.
	pub(crate) fn sentinel_options(&self, addr: &str) -> Options {
		Options {
			addr: addr.to_owned(),
			dialer: None,
			username: self.sentinel_username.clone(),
			password: self.sentinel_password.clone(),
			db: 0,
			..self.client.clone()
		}
	}

	/// Options for the data client, dialing through `dialer`.
	pub(crate) fn client_options(&self, dialer: FailoverDialer) -> Options {
		Options {
			addr: format!("sentinel:{}", self.master_name),
			dialer: Some(Arc::new(dialer)),
			..self.client.clone()
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn sentinel_options() {
		let mut opt = FailoverOptions::new("mymaster", ["a:26379"]);
		opt.sentinel_password = Some("secret".into());
		opt.client.password = Some("data".into());
		opt.client.db = 3;
		opt.client.max_retries = 7;

		let sentinel = opt.sentinel_options("a:26379");
		assert_eq!(sentinel.addr, "a:26379");
		assert_eq!(sentinel.password.as_deref(), Some("secret"));
		assert_eq!(sentinel.db, 0);
		assert_eq!(sentinel.max_retries, 7);
		assert!(sentinel.dialer.is_none());
	}
}
