use std::vec::IntoIter;

use bytes::Bytes;
use resp::Data;

use super::{Error, Result};

/// Information about a subscription, returned from `(p|s)(un)subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
	/// The command that produced this reply, e.g. `psubscribe`.
	pub kind: String,
	/// The channel or pattern.
	pub name: Bytes,
	/// The number of remaining subscriptions with this connection.
	pub count: i64,
}

impl Subscription {
	/// Whether the connection is still in pubsub mode. When this is false, the connection can be
	/// reused as a normal Redis connection.
	pub fn is_in_pubsub_mode(&self) -> bool {
		self.count > 0
	}
}

/// A message received from a PubSub subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	/// The pattern which was matched (only for `psubscribe`).
	pub pattern: Option<Bytes>,
	/// The channel this message was received from.
	pub channel: Bytes,
	/// The data that was published.
	pub payload: Bytes,
}

/// A reply to `PING` sent while subscribed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pong {
	pub payload: Bytes,
}

/// A pubsub message from Redis. Once a connection enters pubsub mode, every frame it receives
/// is one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
	/// Subscribed to a channel, pattern or shard channel.
	Subscribe(Subscription),
	/// Unsubscribed from a channel, pattern or shard channel.
	Unsubscribe(Subscription),
	/// Received a new message from one of the channels currently subscribed to.
	Message(Message),
	Pong(Pong),
}

struct Elements<'a> {
	items: IntoIter<Data<'a>>,
	index: usize,
}

impl<'a> Elements<'a> {
	fn next(&mut self) -> Result<Data<'a>> {
		self.index += 1;
		self.items.next().ok_or(Error::MissingElement(self.index))
	}

	fn bytes(&mut self) -> Result<Bytes> {
		match self.next()? {
			Data::Null => Ok(Bytes::new()),
			data => data
				.as_bytes()
				.map(Bytes::copy_from_slice)
				.ok_or(Error::InvalidFormat("expected string")),
		}
	}

	fn integer(&mut self) -> Result<i64> {
		self.next()?
			.as_integer()
			.ok_or(Error::InvalidFormat("expected integer"))
	}
}

impl Response {
	pub fn try_from_data(data: Data<'_>) -> Result<Self> {
		// PING outside of pubsub mode
		if let Data::SimpleString(str) = &data {
			if str.eq_ignore_ascii_case("pong") {
				return Ok(Response::Pong(Pong::default()));
			}
		}

		let items = data
			.into_array()
			.ok_or(Error::InvalidFormat("expected pubsub array"))?;
		let mut elements = Elements {
			items: items.into_iter(),
			index: 0,
		};

		let kind = elements.bytes()?;
		let kind = std::str::from_utf8(&kind)?.to_ascii_lowercase();

		Ok(match kind.as_str() {
			"subscribe" | "psubscribe" | "ssubscribe" => Response::Subscribe(Subscription {
				name: elements.bytes()?,
				count: elements.integer()?,
				kind,
			}),
			"unsubscribe" | "punsubscribe" | "sunsubscribe" => {
				Response::Unsubscribe(Subscription {
					name: elements.bytes()?,
					count: elements.integer()?,
					kind,
				})
			}
			"message" | "smessage" => Response::Message(Message {
				pattern: None,
				channel: elements.bytes()?,
				payload: elements.bytes()?,
			}),
			"pmessage" => Response::Message(Message {
				pattern: Some(elements.bytes()?),
				channel: elements.bytes()?,
				payload: elements.bytes()?,
			}),
			"pong" => Response::Pong(Pong {
				payload: elements.bytes()?,
			}),
			_ => return Err(Error::InvalidFormat("unknown pubsub message kind")),
		})
	}
}

#[cfg(test)]
mod test {
	use resp::{array, Data};

	use super::*;

	#[test]
	fn subscribe() {
		let res = Response::try_from_data(array![b"subscribe", b"foo", 1i64]).expect("response");
		assert_eq!(
			res,
			Response::Subscribe(Subscription {
				kind: "subscribe".into(),
				name: Bytes::from_static(b"foo"),
				count: 1,
			})
		);
	}

	#[test]
	fn unsubscribe_from_nothing() {
		let res = Response::try_from_data(array![b"unsubscribe", Data::Null, 0i64]).expect("response");
		match res {
			Response::Unsubscribe(sub) => {
				assert!(sub.name.is_empty());
				assert!(!sub.is_in_pubsub_mode());
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test]
	fn messages() {
		let res = Response::try_from_data(array![b"pmessage", b"f*", b"foo", b"bar"]).expect("pmessage");
		assert_eq!(
			res,
			Response::Message(Message {
				pattern: Some(Bytes::from_static(b"f*")),
				channel: Bytes::from_static(b"foo"),
				payload: Bytes::from_static(b"bar"),
			})
		);

		let res = Response::try_from_data(array![b"smessage", b"s", b"x"]).expect("smessage");
		assert!(matches!(res, Response::Message(Message { pattern: None, .. })));
	}

	#[test]
	fn pongs() {
		let res = Response::try_from_data(array![b"pong", b""]).expect("pong");
		assert_eq!(res, Response::Pong(Pong::default()));

		let res = Response::try_from_data(Data::simple_string("PONG")).expect("plain pong");
		assert_eq!(res, Response::Pong(Pong::default()));
	}

	#[test]
	fn malformed() {
		assert_eq!(
			Response::try_from_data(array![b"message", b"foo"]),
			Err(Error::MissingElement(3))
		);
		assert!(Response::try_from_data(array![b"bogus"]).is_err());
		assert!(Response::try_from_data(Data::Integer(1)).is_err());
	}
}
