use std::{fmt, sync::Arc, time::Duration};

use crate::connection::Dialer;

/// Configuration for a single-node [Client](crate::Client).
///
/// Call [Self::init()] (done by every constructor in this crate) to resolve defaults.
#[derive(Clone)]
pub struct Options {
	/// `host:port` of the server.
	pub addr: String,
	/// Custom dialer; when set, `addr` is informational only.
	pub dialer: Option<Arc<dyn Dialer>>,
	pub username: Option<String>,
	pub password: Option<String>,
	/// Database selected on every new connection.
	pub db: u32,
	/// `CLIENT SETNAME` for every new connection.
	pub client_name: Option<String>,

	/// Retries after the first attempt; negative disables retries.
	pub max_retries: i32,
	pub min_retry_backoff: Duration,
	pub max_retry_backoff: Duration,

	pub dial_timeout: Duration,
	pub read_timeout: Option<Duration>,
	pub write_timeout: Option<Duration>,

	/// Maximum number of connections; zero means ten per available CPU.
	pub pool_size: usize,
	/// How long to wait for a free connection; defaults to the read timeout plus one second.
	pub pool_timeout: Option<Duration>,
	/// Connections unused for longer than this are closed by the reaper. `None` keeps them.
	pub idle_timeout: Option<Duration>,
	pub idle_check_frequency: Duration,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			addr: "localhost:6379".to_owned(),
			dialer: None,
			username: None,
			password: None,
			db: 0,
			client_name: None,
			max_retries: 3,
			min_retry_backoff: Duration::from_millis(8),
			max_retry_backoff: Duration::from_millis(512),
			dial_timeout: Duration::from_secs(5),
			read_timeout: Some(Duration::from_secs(3)),
			write_timeout: None,
			pool_size: 0,
			pool_timeout: None,
			idle_timeout: Some(Duration::from_secs(5 * 60)),
			idle_check_frequency: Duration::from_secs(60),
		}
	}
}

impl fmt::Debug for Options {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Options")
			.field("addr", &self.addr)
			.field("dialer", &self.dialer)
			.field("username", &self.username)
			.field("password", &self.password.as_ref().map(|_| "<redacted>"))
			.field("db", &self.db)
			.field("client_name", &self.client_name)
			.field("max_retries", &self.max_retries)
			.field("read_timeout", &self.read_timeout)
			.field("write_timeout", &self.write_timeout)
			.field("pool_size", &self.pool_size)
			.finish_non_exhaustive()
	}
}

impl Options {
	pub fn new(addr: impl Into<String>) -> Self {
		Self {
			addr: addr.into(),
			..Self::default()
		}
	}

	/// Resolve defaults that depend on other fields.
	pub fn init(mut self) -> Self {
		if self.pool_size == 0 {
			let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
			self.pool_size = 10 * cpus;
		}

		if self.pool_timeout.is_none() {
			self.pool_timeout =
				Some(self.read_timeout.unwrap_or_default() + Duration::from_secs(1));
		}

		if self.max_retry_backoff < self.min_retry_backoff {
			self.max_retry_backoff = self.min_retry_backoff;
		}

		self
	}

	/// Retries as an attempt bound; zero when retries are disabled.
	pub(crate) fn retries(&self) -> usize {
		usize::try_from(self.max_retries).unwrap_or(0)
	}
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use super::Options;

	#[test]
	fn init_resolves_defaults() {
		let opt = Options::new("127.0.0.1:7000").init();

		assert!(opt.pool_size >= 10);
		assert_eq!(opt.pool_timeout, Some(Duration::from_secs(4)));
		assert_eq!(opt.retries(), 3);
	}

	#[test]
	fn negative_retries_disable() {
		let opt = Options {
			max_retries: -1,
			..Options::default()
		}
		.init();

		assert_eq!(opt.retries(), 0);
	}

	#[test]
	fn password_is_redacted() {
		let opt = Options {
			password: Some("hunter2".into()),
			..Options::default()
		};

		assert!(!format!("{opt:?}").contains("hunter2"));
	}
}
