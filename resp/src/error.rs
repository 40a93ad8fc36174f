use std::{io, sync::Arc};

use thiserror::Error;

/// An error that can occur while reading or writing RESP.
#[derive(Debug, Error, Clone)]
pub enum Error {
	/// The server replied with an error. The stream remains usable.
	#[error("{0}")]
	Redis(String),
	/// The input is not valid RESP. The stream can no longer be trusted.
	#[error("parse error: {0}")]
	Parse(String),
	/// The underlying transport failed.
	#[error("IO error: {0}")]
	Io(Arc<io::Error>),
}

impl Error {
	/// Whether this error only affects a single frame. Transient errors leave the stream in a
	/// consistent state, so the next frame can still be read.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Redis(_))
	}
}

impl From<io::Error> for Error {
	fn from(err: io::Error) -> Self {
		Self::Io(Arc::new(err))
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
