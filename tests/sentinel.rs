use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use shardis::{
	resp::Data,
	sentinel::{
		new_failover_client, FailoverDialer, FailoverOptions, SentinelClient, SentinelFailover,
	},
	Client, Error, Options, Result,
};
use test_log::test;

use crate::common::{bulk, closed_addr, err, eventually, MockServer};

mod common;

#[derive(Clone, Default)]
struct Sentinel {
	master: Arc<Mutex<String>>,
	peers: Arc<Mutex<Vec<String>>>,
	replicas: Arc<Mutex<Vec<(String, &'static str)>>>,
	lookups: Arc<AtomicUsize>,
}

impl Sentinel {
	fn lookups(&self) -> usize {
		self.lookups.load(Ordering::SeqCst)
	}

	fn set_master(&self, addr: &str) {
		*self.master.lock().unwrap() = addr.to_owned();
	}
}

fn node(addr: &str, flags: &str) -> Data<'static> {
	let (ip, port) = addr.rsplit_once(':').expect("host:port");
	Data::Array(vec![
		bulk("name"),
		bulk(addr),
		bulk("ip"),
		bulk(ip),
		bulk("port"),
		bulk(port),
		bulk("flags"),
		bulk(flags),
	])
}

/// Serve `SENTINEL` commands for `mymaster` from `state`.
async fn sentinel(state: &Sentinel) -> MockServer {
	let server = MockServer::start().await;
	let state = state.clone();

	server.handle(move |args| {
		if !args[0].eq_ignore_ascii_case(b"sentinel") {
			return None;
		}

		let sub = args.get(1).map(|arg| arg.to_ascii_lowercase());
		match sub.as_deref() {
			Some(b"get-master-addr-by-name") => {
				state.lookups.fetch_add(1, Ordering::SeqCst);
				let master = state.master.lock().unwrap().clone();
				match master.rsplit_once(':') {
					Some((host, port)) => Some(Data::Array(vec![bulk(host), bulk(port)])),
					None => Some(err("ERR no such master")),
				}
			}
			Some(b"sentinels") => Some(Data::Array(
				state
					.peers
					.lock()
					.unwrap()
					.iter()
					.map(|addr| node(addr, "sentinel"))
					.collect(),
			)),
			Some(b"replicas") => Some(Data::Array(
				state
					.replicas
					.lock()
					.unwrap()
					.iter()
					.map(|(addr, flags)| node(addr, flags))
					.collect(),
			)),
			_ => Some(err("ERR unknown sentinel subcommand")),
		}
	});

	server
}

#[test(tokio::test)]
async fn first_answering_sentinel_is_cached() -> Result<()> {
	let broken = Sentinel::default();
	let good = Sentinel::default();
	good.set_master("127.0.0.1:7000");

	let down = closed_addr().await;
	let s2 = sentinel(&broken).await;
	let s3 = sentinel(&good).await;

	let failover = SentinelFailover::new(FailoverOptions::new(
		"mymaster",
		[down.clone(), s2.addr.clone(), s3.addr.clone()],
	));

	assert_eq!(failover.master_addr().await?, "127.0.0.1:7000");
	assert_eq!(failover.sentinel_addrs().await[0], s3.addr);
	assert_eq!(good.lookups(), 1);
	let asked = broken.lookups();
	assert!(asked <= 1);

	// only the cached sentinel is asked again
	assert_eq!(failover.master_addr().await?, "127.0.0.1:7000");
	assert_eq!(good.lookups(), 2);
	assert_eq!(broken.lookups(), asked);

	failover.close().await
}

#[test(tokio::test)]
async fn no_sentinel_answers() {
	let s1 = closed_addr().await;
	let s2 = closed_addr().await;
	let mut opt = FailoverOptions::new("mymaster", [s1, s2]);
	opt.client.max_retries = -1;

	let failover = SentinelFailover::new(opt);
	match failover.master_addr().await {
		Err(Error::SentinelsUnreachable(errors)) => assert_eq!(errors.len(), 2),
		other => panic!("unexpected {other:?}"),
	}
}

#[test(tokio::test)]
async fn discovers_peer_sentinels() -> Result<()> {
	let state = Sentinel::default();
	state.set_master("127.0.0.1:7000");
	state.peers.lock().unwrap().push("127.0.0.1:26999".to_owned());
	let s = sentinel(&state).await;

	let failover = SentinelFailover::new(FailoverOptions::new("mymaster", [s.addr.clone()]));
	failover.master_addr().await?;

	assert_eq!(failover.sentinel_addrs().await, vec![s.addr.clone(), "127.0.0.1:26999".to_owned()]);
	Ok(())
}

#[test(tokio::test)]
async fn replicas_skip_unhealthy_nodes() -> Result<()> {
	let state = Sentinel::default();
	state.set_master("127.0.0.1:7000");
	state.replicas.lock().unwrap().extend([
		("127.0.0.1:7101".to_owned(), "slave"),
		("127.0.0.1:7102".to_owned(), "slave,s_down"),
		("127.0.0.1:7103".to_owned(), "slave,disconnected"),
	]);
	let s = sentinel(&state).await;

	let failover = SentinelFailover::new(FailoverOptions::new("mymaster", [s.addr.clone()]));
	assert_eq!(failover.replica_addrs(false).await?, vec!["127.0.0.1:7101"]);
	assert_eq!(
		failover.replica_addrs(true).await?,
		vec!["127.0.0.1:7101", "127.0.0.1:7103"]
	);
	assert_eq!(failover.random_replica_addr().await?, "127.0.0.1:7101");

	state.replicas.lock().unwrap().clear();
	assert_eq!(failover.random_replica_addr().await?, "127.0.0.1:7000");

	Ok(())
}

#[test(tokio::test)]
async fn switch_master_events() -> Result<()> {
	let state = Sentinel::default();
	state.set_master("127.0.0.1:7000");
	let s = sentinel(&state).await;

	let failover = SentinelFailover::new(FailoverOptions::new("mymaster", [s.addr.clone()]));
	let switches = Arc::new(AtomicUsize::new(0));
	{
		let switches = switches.clone();
		failover.on_failover(move |_| {
			switches.fetch_add(1, Ordering::SeqCst);
		});
	}

	let addr = failover.master_addr().await?;
	assert!(failover.try_switch_master(&addr));
	assert!(!failover.try_switch_master(&addr));
	eventually(|| s.subscribers("+switch-master") == 1).await;

	s.publish("+switch-master", "othermaster 127.0.0.1 8000 127.0.0.1 8001");
	s.publish("+switch-master", "mymaster 127.0.0.1 7000 127.0.0.1 7001");
	eventually(|| failover.current_master_addr().as_deref() == Some("127.0.0.1:7001")).await;
	assert_eq!(switches.load(Ordering::SeqCst), 2);

	Ok(())
}

#[test(tokio::test)]
async fn failover_client_follows_the_master() -> Result<()> {
	let first = MockServer::start().await;
	let second = MockServer::start().await;
	let state = Sentinel::default();
	state.set_master(&first.addr);
	let s = sentinel(&state).await;

	let client = new_failover_client(FailoverOptions::new("mymaster", [s.addr.clone()]))?;
	client.cmd(["set", "before", "1"]).await?;
	assert!(first.get("before").is_some());
	eventually(|| s.subscribers("+switch-master") == 1).await;

	state.set_master(&second.addr);
	let (old_host, old_port) = first.addr.rsplit_once(':').expect("host:port");
	let (new_host, new_port) = second.addr.rsplit_once(':').expect("host:port");
	s.publish(
		"+switch-master",
		&format!("mymaster {old_host} {old_port} {new_host} {new_port}"),
	);

	for _ in 0..100 {
		client.cmd(["set", "after", "1"]).await?;
		if second.get("after").is_some() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	assert!(second.get("after").is_some(), "writes never reached the new master");

	client.close()
}

#[test(tokio::test)]
async fn connections_busy_during_a_switch_are_not_reused() -> Result<()> {
	let first = MockServer::start().await;
	let second = MockServer::start().await;
	let state = Sentinel::default();
	state.set_master(&first.addr);
	let s = sentinel(&state).await;

	let failover = SentinelFailover::new(FailoverOptions::new("mymaster", [s.addr.clone()]));
	let mut opt = Options::new("sentinel:mymaster");
	opt.dialer = Some(Arc::new(FailoverDialer::new(failover.clone(), Duration::from_secs(1))));
	let client = Client::new(opt)?;

	// the only connection is checked out while the master moves
	let tx = client.watch(["k"]).await?;
	assert_eq!(first.count("watch"), 1);

	state.set_master(&second.addr);
	assert!(failover.try_switch_master(&second.addr));
	tx.close().await?;

	client.cmd(["set", "after", "1"]).await?;
	assert!(second.get("after").is_some());
	assert!(first.get("after").is_none());

	client.close()
}

#[test(tokio::test)]
async fn sentinel_client_commands() -> Result<()> {
	let state = Sentinel::default();
	state.set_master("127.0.0.1:7000");
	state.replicas.lock().unwrap().push(("127.0.0.1:7101".to_owned(), "slave"));
	let s = sentinel(&state).await;

	let client = SentinelClient::new(Options::new(s.addr.as_str()))?;
	assert_eq!(client.get_master_addr_by_name("mymaster").await?, "127.0.0.1:7000");

	let replicas = client.replicas("mymaster").await?;
	assert_eq!(replicas.len(), 1);
	assert_eq!(replicas[0]["ip"], "127.0.0.1");
	assert_eq!(replicas[0]["flags"], "slave");

	assert!(client.sentinels("mymaster").await?.is_empty());
	assert!(matches!(client.failover("mymaster").await, Err(Error::Redis(_))));

	Ok(())
}
