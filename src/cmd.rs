use std::borrow::Cow;

use bytes::Bytes;
use resp::Data;

use crate::{Error, Result};

/// Commands which never carry a key, sorted for binary search.
const KEYLESS_COMMANDS: [&str; 46] = [
	"acl",
	"asking",
	"auth",
	"bgrewriteaof",
	"bgsave",
	"client",
	"cluster",
	"config",
	"debug",
	"discard",
	"echo",
	"exec",
	"failover",
	"function",
	"hello",
	"info",
	"latency",
	"lolwut",
	"module",
	"monitor",
	"multi",
	"pfselftest",
	"ping",
	"psubscribe",
	"psync",
	"publish",
	"pubsub",
	"punsubscribe",
	"quit",
	"readonly",
	"readwrite",
	"replconf",
	"replicaof",
	"role",
	"save",
	"script",
	"select",
	"shutdown",
	"slaveof",
	"slowlog",
	"subscribe",
	"swapdb",
	"sync",
	"unsubscribe",
	"unwatch",
	"wait",
];

/// A single command: its arguments and, once processed, its reply.
///
/// ```rust
/// # use shardis::Cmd;
/// let cmd = Cmd::new(["SET", "foo", "bar"]);
/// assert_eq!(cmd.name(), "set");
/// assert_eq!(cmd.first_key(), Some(&b"foo"[..]));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Cmd {
	args: Vec<Bytes>,
	key_pos: Option<usize>,
	reply: Option<Result<Data<'static>>>,
}

impl Cmd {
	pub fn new<I, B>(args: I) -> Self
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		Self {
			args: args
				.into_iter()
				.map(|arg| Bytes::copy_from_slice(arg.as_ref()))
				.collect(),
			..Self::default()
		}
	}

	/// Append an argument.
	pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
		self.args.push(Bytes::copy_from_slice(arg.as_ref()));
		self
	}

	/// Override the position of the first key. Useful for module commands the key table does not
	/// know about.
	pub fn with_first_key_pos(mut self, pos: usize) -> Self {
		self.key_pos = Some(pos);
		self
	}

	pub fn args(&self) -> &[Bytes] {
		&self.args
	}

	/// The lower-cased command name, or an empty string for an empty command.
	pub fn name(&self) -> String {
		self.args
			.first()
			.map(|name| String::from_utf8_lossy(name).to_ascii_lowercase())
			.unwrap_or_default()
	}

	/// Position of the first key argument, if the command has one.
	pub fn first_key_pos(&self) -> Option<usize> {
		if self.key_pos.is_some() {
			return self.key_pos;
		}

		let name = self.name();
		if KEYLESS_COMMANDS.binary_search(&name.as_str()).is_ok() {
			return None;
		}

		match name.as_str() {
			"" => None,
			"eval" | "evalsha" | "eval_ro" | "evalsha_ro" => match self.args.get(2) {
				Some(numkeys) if &numkeys[..] != b"0" => Some(3),
				_ => None,
			},
			"memory" => match self.args.get(1) {
				Some(sub) if sub.eq_ignore_ascii_case(b"usage") => Some(2),
				_ => Some(1),
			},
			_ => Some(1),
		}
	}

	/// The first key, if the command has one and it is non-empty.
	pub fn first_key(&self) -> Option<&[u8]> {
		self.first_key_pos()
			.and_then(|pos| self.args.get(pos))
			.map(|key| &key[..])
			.filter(|key| !key.is_empty())
	}

	pub fn set_reply(&mut self, reply: Result<Data<'static>>) {
		self.reply = Some(reply);
	}

	/// The reply, if the command has been processed.
	pub fn reply(&self) -> Option<&Result<Data<'static>>> {
		self.reply.as_ref()
	}

	/// The error this command failed with, if any.
	pub fn err(&self) -> Option<&Error> {
		self.reply.as_ref().and_then(|reply| reply.as_ref().err())
	}

	pub fn take_reply(&mut self) -> Option<Result<Data<'static>>> {
		self.reply.take()
	}

	/// Clear the reply so the command can be sent again.
	pub fn reset(&mut self) {
		self.reply = None;
	}

	/// The wire form of this command.
	pub fn to_data(&self) -> Data<'_> {
		Data::Array(
			self.args
				.iter()
				.map(|arg| Data::BulkString(Cow::Borrowed(&arg[..])))
				.collect(),
		)
	}
}

/// The first error among `cmds`, in input order.
pub fn cmds_first_err(cmds: &[Cmd]) -> Option<Error> {
	cmds.iter().find_map(|cmd| cmd.err().cloned())
}

/// Fail every command that has no reply yet with `err`.
pub fn set_cmds_err(cmds: &mut [Cmd], err: &Error) {
	for cmd in cmds.iter_mut().filter(|cmd| cmd.reply.is_none()) {
		cmd.set_reply(Err(err.clone()));
	}
}
