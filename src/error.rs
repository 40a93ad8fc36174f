use std::{fmt, io, sync::Arc};

use deadpool::managed::PoolError;
use thiserror::Error;

use crate::model;

#[derive(Debug, Error, Clone)]
pub enum Error {
	#[error("IO error: {0}")]
	Io(Arc<io::Error>),
	/// An error reply from the server. The message is kept verbatim so callers can match on it.
	#[error("{0}")]
	Redis(String),
	#[error("protocol error: {0}")]
	Protocol(String),
	#[error("unexpected end of stream")]
	Eof,
	#[error("i/o timeout")]
	Timeout,
	#[error("operation cancelled")]
	Cancelled,
	#[error("connection pool timeout")]
	PoolTimeout,
	#[error("connection pool: {0}")]
	Pool(String),
	#[error("client is closed")]
	Closed,
	#[error("nil reply")]
	Nil,
	#[error("transaction failed")]
	TxFailed,
	#[error("all ring shards are down")]
	ShardsDown,
	#[error("shard {0:?} is not in the ring")]
	ShardNotFound(String),
	#[error("Watch requires at least one key")]
	NoWatchKeys,
	#[error("Watch requires all keys to be in the same shard")]
	CrossShardWatch,
	#[error("all sentinels specified in configuration are unreachable: {}", Errors(.0))]
	SentinelsUnreachable(Vec<Error>),
	#[error("{0}")]
	Model(#[from] model::Error),
}

struct Errors<'a>(&'a [Error]);

impl fmt::Display for Errors<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (i, err) in self.0.iter().enumerate() {
			if i > 0 {
				f.write_str("; ")?;
			}
			write!(f, "{err}")?;
		}
		Ok(())
	}
}

impl From<io::Error> for Error {
	fn from(err: io::Error) -> Self {
		match err.kind() {
			io::ErrorKind::UnexpectedEof => Self::Eof,
			io::ErrorKind::TimedOut => Self::Timeout,
			_ => Self::Io(Arc::new(err)),
		}
	}
}

impl From<resp::Error> for Error {
	fn from(err: resp::Error) -> Self {
		match err {
			resp::Error::Redis(msg) => Self::Redis(msg),
			resp::Error::Parse(msg) => Self::Protocol(msg),
			resp::Error::Io(err) => match err.kind() {
				io::ErrorKind::UnexpectedEof => Self::Eof,
				io::ErrorKind::TimedOut => Self::Timeout,
				_ => Self::Io(err),
			},
		}
	}
}

impl From<tokio::time::error::Elapsed> for Error {
	fn from(_: tokio::time::error::Elapsed) -> Self {
		Self::Timeout
	}
}

impl From<PoolError<Error>> for Error {
	fn from(err: PoolError<Error>) -> Self {
		match err {
			PoolError::Timeout(_) => Self::PoolTimeout,
			PoolError::Backend(err) => err,
			PoolError::Closed => Self::Closed,
			other => Self::Pool(other.to_string()),
		}
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

const RETRYABLE_PREFIXES: [&str; 5] = [
	"LOADING ",
	"READONLY ",
	"MASTERDOWN ",
	"CLUSTERDOWN ",
	"TRYAGAIN ",
];

/// Whether a command that failed with `err` may be sent again.
///
/// `retry_timeout` controls whether read/write timeouts count as retryable; blocking commands
/// that carry their own timeout should not be retried on one.
pub fn should_retry(err: &Error, retry_timeout: bool) -> bool {
	match err {
		Error::Eof | Error::PoolTimeout | Error::Io(_) => true,
		Error::Timeout => retry_timeout,
		Error::Redis(msg) => {
			msg == "ERR max number of clients reached"
				|| RETRYABLE_PREFIXES.iter().any(|prefix| msg.starts_with(prefix))
		}
		_ => false,
	}
}

/// Whether the connection that produced `err` must be discarded instead of returned to the pool.
///
/// `addr` is the address the connection is dialed to; a redirect back to that same address means
/// the server's view of the topology disagrees with the connection.
pub fn is_bad_conn(err: &Error, allow_timeout: bool, addr: &str) -> bool {
	match err {
		Error::Cancelled | Error::Eof | Error::Io(_) | Error::Protocol(_) => true,
		Error::Timeout => !allow_timeout,
		Error::Redis(_) => is_read_only_error(err) || is_moved_same_conn_addr(err, addr),
		_ => false,
	}
}

pub fn is_redis_error(err: &Error) -> bool {
	matches!(err, Error::Redis(_))
}

pub fn is_read_only_error(err: &Error) -> bool {
	matches!(err, Error::Redis(msg) if msg.starts_with("READONLY "))
}

pub fn is_loading_error(err: &Error) -> bool {
	matches!(err, Error::Redis(msg) if msg.starts_with("LOADING "))
}

fn is_moved_same_conn_addr(err: &Error, addr: &str) -> bool {
	match err {
		Error::Redis(msg) if msg.starts_with("MOVED ") => {
			msg.rsplit(' ').next().map_or(false, |moved_to| moved_to == addr)
		}
		_ => false,
	}
}
