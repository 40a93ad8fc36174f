#![allow(dead_code)]

use std::{
	collections::{HashMap, HashSet},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use futures::{SinkExt, StreamExt};
use shardis::resp::{codec::Codec, Data};
use tokio::{
	net::{TcpListener, TcpStream},
	sync::{broadcast, watch},
};
use tokio_util::{codec::Framed, sync::CancellationToken};

pub type Reply = Data<'static>;
type Handler = Arc<dyn Fn(&[Vec<u8>]) -> Option<Reply> + Send + Sync>;

pub fn ok() -> Reply {
	Data::SimpleString("OK".into())
}

pub fn err(msg: &str) -> Reply {
	Data::Error(msg.to_owned().into())
}

pub fn bulk(bytes: impl AsRef<[u8]>) -> Reply {
	Data::BulkString(bytes.as_ref().to_vec().into())
}

/// An address nothing listens on.
pub async fn closed_addr() -> String {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	listener.local_addr().expect("local addr").to_string()
}

/// Poll `f` until it holds, for up to two seconds.
pub async fn eventually(mut f: impl FnMut() -> bool) {
	for _ in 0..200 {
		if f() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not reached");
}

#[derive(Default)]
struct Subscriptions {
	channels: HashSet<Vec<u8>>,
	patterns: HashSet<Vec<u8>>,
	shard_channels: HashSet<Vec<u8>>,
}

impl Subscriptions {
	fn len(&self) -> usize {
		self.channels.len() + self.patterns.len() + self.shard_channels.len()
	}

	fn set(&mut self, kind: &str) -> &mut HashSet<Vec<u8>> {
		match kind {
			"subscribe" | "unsubscribe" => &mut self.channels,
			"psubscribe" | "punsubscribe" => &mut self.patterns,
			_ => &mut self.shard_channels,
		}
	}
}

#[derive(Default)]
struct Shared {
	kv: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
	versions: Mutex<HashMap<Vec<u8>, u64>>,
	subscriptions: Mutex<HashMap<usize, Subscriptions>>,
	handler: Mutex<Option<Handler>>,
	commands: Mutex<Vec<String>>,
	accepted: AtomicUsize,
}

/// A RESP server speaking enough of the protocol for the client: strings, transactions with
/// `WATCH`, and Pub/Sub. Anything else can be answered by [MockServer::handle()].
pub struct MockServer {
	pub addr: String,
	shared: Arc<Shared>,
	events: broadcast::Sender<(Vec<u8>, Vec<u8>, bool)>,
	kill: Arc<watch::Sender<u64>>,
	shutdown: CancellationToken,
}

impl Drop for MockServer {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

impl MockServer {
	pub async fn start() -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr").to_string();
		let shared = Arc::new(Shared::default());
		let (events, _) = broadcast::channel(1024);
		let kill = Arc::new(watch::channel(0).0);
		let shutdown = CancellationToken::new();

		let server = Self {
			addr,
			shared: shared.clone(),
			events: events.clone(),
			kill: kill.clone(),
			shutdown: shutdown.clone(),
		};

		tokio::spawn(async move {
			loop {
				let stream = tokio::select! {
					_ = shutdown.cancelled() => break,
					res = listener.accept() => match res {
						Ok((stream, _)) => stream,
						Err(_) => break,
					},
				};

				let id = shared.accepted.fetch_add(1, Ordering::SeqCst);
				tokio::spawn(serve(
					id,
					stream,
					shared.clone(),
					events.clone(),
					kill.subscribe(),
					shutdown.clone(),
				));
			}
		});

		server
	}

	/// Answer commands with `handler` first; `None` falls through to the built-in commands.
	pub fn handle(&self, handler: impl Fn(&[Vec<u8>]) -> Option<Reply> + Send + Sync + 'static) {
		*self.shared.handler.lock().unwrap() = Some(Arc::new(handler));
	}

	/// Connections accepted so far.
	pub fn accepted(&self) -> usize {
		self.shared.accepted.load(Ordering::SeqCst)
	}

	/// How many times a command (lower case) was received.
	pub fn count(&self, name: &str) -> usize {
		self.shared
			.commands
			.lock()
			.unwrap()
			.iter()
			.filter(|cmd| *cmd == name)
			.count()
	}

	pub fn get(&self, key: &str) -> Option<Vec<u8>> {
		self.shared.kv.lock().unwrap().get(key.as_bytes()).cloned()
	}

	/// Connections currently subscribed to `channel`.
	pub fn subscribers(&self, channel: &str) -> usize {
		self.shared
			.subscriptions
			.lock()
			.unwrap()
			.values()
			.filter(|subs| subs.channels.contains(channel.as_bytes()))
			.count()
	}

	/// Publish as if another client had.
	pub fn publish(&self, channel: &str, payload: &str) {
		let _ = self
			.events
			.send((channel.as_bytes().to_vec(), payload.as_bytes().to_vec(), false));
	}

	/// Drop every open connection; the listener keeps accepting.
	pub fn kill_connections(&self) {
		self.kill.send_modify(|generation| *generation += 1);
	}

	/// Stop accepting and drop every connection.
	pub fn stop(&self) {
		self.shutdown.cancel();
	}
}

fn glob(pattern: &[u8], name: &[u8]) -> bool {
	match (pattern.first(), name.first()) {
		(None, None) => true,
		(Some(b'*'), _) => glob(&pattern[1..], name) || (!name.is_empty() && glob(pattern, &name[1..])),
		(Some(b'?'), Some(_)) => glob(&pattern[1..], &name[1..]),
		(Some(p), Some(n)) if p == n => glob(&pattern[1..], &name[1..]),
		_ => false,
	}
}

struct Conn {
	id: usize,
	shared: Arc<Shared>,
	events: broadcast::Sender<(Vec<u8>, Vec<u8>, bool)>,
	multi: Option<Vec<Vec<Vec<u8>>>>,
	watched: Vec<(Vec<u8>, u64)>,
}

impl Conn {
	fn version(&self, key: &[u8]) -> u64 {
		self.shared
			.versions
			.lock()
			.unwrap()
			.get(key)
			.copied()
			.unwrap_or_default()
	}

	fn touch(&self, key: &[u8]) {
		*self
			.shared
			.versions
			.lock()
			.unwrap()
			.entry(key.to_vec())
			.or_default() += 1;
	}

	fn subscribed(&self) -> bool {
		self.shared
			.subscriptions
			.lock()
			.unwrap()
			.get(&self.id)
			.map_or(false, |subs| subs.len() > 0)
	}

	fn exec(&mut self, args: Vec<Vec<u8>>) -> Vec<Reply> {
		let name = String::from_utf8_lossy(&args[0]).to_ascii_lowercase();
		self.shared.commands.lock().unwrap().push(name.clone());

		let handler = self.shared.handler.lock().unwrap().clone();
		if let Some(reply) = handler.and_then(|handler| handler(&args)) {
			return vec![reply];
		}

		if self.multi.is_some() && !matches!(name.as_str(), "exec" | "discard" | "multi" | "watch") {
			if let Some(queue) = &mut self.multi {
				queue.push(args);
			}
			return vec![Data::SimpleString("QUEUED".into())];
		}

		match name.as_str() {
			"multi" => {
				self.multi = Some(Vec::new());
				vec![ok()]
			}
			"discard" => {
				self.multi = None;
				self.watched.clear();
				vec![ok()]
			}
			"exec" => {
				let Some(queue) = self.multi.take() else {
					return vec![err("ERR EXEC without MULTI")];
				};

				let dirty = self
					.watched
					.iter()
					.any(|(key, version)| self.version(key) != *version);
				self.watched.clear();
				if dirty {
					return vec![Data::Null];
				}

				let replies = queue
					.into_iter()
					.flat_map(|args| self.exec(args))
					.collect::<Vec<_>>();
				vec![Data::Array(replies)]
			}
			"watch" => {
				for key in &args[1..] {
					let version = self.version(key);
					self.watched.push((key.clone(), version));
				}
				vec![ok()]
			}
			"unwatch" => {
				self.watched.clear();
				vec![ok()]
			}
			"subscribe" | "psubscribe" | "ssubscribe" => {
				let mut all = self.shared.subscriptions.lock().unwrap();
				let subs = all.entry(self.id).or_default();
				args[1..]
					.iter()
					.map(|name| {
						subs.set(&name_of(&args)).insert(name.clone());
						Data::Array(vec![bulk(&args[0]), bulk(name), Data::Integer(subs.len() as i64)])
					})
					.collect()
			}
			"unsubscribe" | "punsubscribe" | "sunsubscribe" => {
				let mut all = self.shared.subscriptions.lock().unwrap();
				let subs = all.entry(self.id).or_default();
				let kind = name_of(&args);
				let names: Vec<Vec<u8>> = if args.len() > 1 {
					args[1..].to_vec()
				} else {
					subs.set(&kind).iter().cloned().collect()
				};

				if names.is_empty() {
					return vec![Data::Array(vec![bulk(&args[0]), Data::Null, Data::Integer(subs.len() as i64)])];
				}

				names
					.iter()
					.map(|name| {
						subs.set(&kind).remove(name);
						Data::Array(vec![bulk(&args[0]), bulk(name), Data::Integer(subs.len() as i64)])
					})
					.collect()
			}
			"ping" if self.subscribed() => {
				let payload = args.get(1).cloned().unwrap_or_default();
				vec![Data::Array(vec![bulk("pong"), bulk(payload)])]
			}
			"ping" => match args.get(1) {
				Some(payload) => vec![bulk(payload)],
				None => vec![Data::SimpleString("PONG".into())],
			},
			"echo" => vec![bulk(&args[1])],
			"auth" | "select" | "client" => vec![ok()],
			"get" => vec![self
				.shared
				.kv
				.lock()
				.unwrap()
				.get(&args[1])
				.map_or(Data::Null, bulk)],
			"set" => {
				self.shared
					.kv
					.lock()
					.unwrap()
					.insert(args[1].clone(), args[2].clone());
				self.touch(&args[1]);
				vec![ok()]
			}
			"incr" => {
				let mut kv = self.shared.kv.lock().unwrap();
				let value = kv.entry(args[1].clone()).or_insert_with(|| b"0".to_vec());
				let Some(n) = std::str::from_utf8(value).ok().and_then(|v| v.parse::<i64>().ok()) else {
					return vec![err("ERR value is not an integer or out of range")];
				};
				*value = (n + 1).to_string().into_bytes();
				drop(kv);
				self.touch(&args[1]);
				vec![Data::Integer(n + 1)]
			}
			"del" => {
				let mut kv = self.shared.kv.lock().unwrap();
				let removed = args[1..].iter().filter(|key| kv.remove(*key).is_some()).count();
				drop(kv);
				args[1..].iter().for_each(|key| self.touch(key));
				vec![Data::Integer(removed as i64)]
			}
			"publish" | "spublish" => {
				let shard = name == "spublish";
				let receivers = self
					.shared
					.subscriptions
					.lock()
					.unwrap()
					.values()
					.filter(|subs| {
						if shard {
							subs.shard_channels.contains(&args[1])
						} else {
							subs.channels.contains(&args[1])
								|| subs.patterns.iter().any(|pattern| glob(pattern, &args[1]))
						}
					})
					.count();
				let _ = self.events.send((args[1].clone(), args[2].clone(), shard));
				vec![Data::Integer(receivers as i64)]
			}
			_ => vec![err(&format!("ERR unknown command '{name}'"))],
		}
	}

	fn deliver(&self, channel: &[u8], payload: &[u8], shard: bool) -> Vec<Reply> {
		let all = self.shared.subscriptions.lock().unwrap();
		let Some(subs) = all.get(&self.id) else {
			return Vec::new();
		};

		if shard {
			return if subs.shard_channels.contains(channel) {
				vec![Data::Array(vec![bulk("smessage"), bulk(channel), bulk(payload)])]
			} else {
				Vec::new()
			};
		}

		let mut replies = Vec::new();
		if subs.channels.contains(channel) {
			replies.push(Data::Array(vec![bulk("message"), bulk(channel), bulk(payload)]));
		}
		for pattern in &subs.patterns {
			if glob(pattern, channel) {
				replies.push(Data::Array(vec![
					bulk("pmessage"),
					bulk(pattern),
					bulk(channel),
					bulk(payload),
				]));
			}
		}
		replies
	}
}

fn name_of(args: &[Vec<u8>]) -> String {
	String::from_utf8_lossy(&args[0]).to_ascii_lowercase()
}

async fn serve(
	id: usize,
	stream: TcpStream,
	shared: Arc<Shared>,
	events: broadcast::Sender<(Vec<u8>, Vec<u8>, bool)>,
	mut kill: watch::Receiver<u64>,
	shutdown: CancellationToken,
) {
	let mut framed = Framed::new(stream, Codec);
	let mut published = events.subscribe();
	let mut conn = Conn {
		id,
		shared: shared.clone(),
		events,
		multi: None,
		watched: Vec::new(),
	};

	loop {
		let replies = tokio::select! {
			_ = shutdown.cancelled() => break,
			_ = kill.changed() => break,
			frame = framed.next() => {
				let Some(Ok(Ok(Data::Array(args)))) = frame else {
					break;
				};
				let args: Vec<Vec<u8>> = args
					.iter()
					.filter_map(|arg| arg.as_bytes().map(<[u8]>::to_vec))
					.collect();
				if args.is_empty() {
					break;
				}
				conn.exec(args)
			}
			event = published.recv() => match event {
				Ok((channel, payload, shard)) => conn.deliver(&channel, &payload, shard),
				Err(broadcast::error::RecvError::Lagged(_)) => continue,
				Err(broadcast::error::RecvError::Closed) => break,
			},
		};

		for reply in replies {
			if framed.send(reply).await.is_err() {
				break;
			}
		}
	}

	shared.subscriptions.lock().unwrap().remove(&id);
}
