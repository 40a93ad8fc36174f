use std::str::Utf8Error;

use thiserror::Error;

/// A reply did not have the shape its command promises.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
	#[error("Invalid data format: {0}")]
	InvalidFormat(&'static str),
	#[error("Missing element {0} in array response")]
	MissingElement(usize),
	#[error("Expected string")]
	NotString(#[from] Utf8Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
