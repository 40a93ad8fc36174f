use std::collections::HashMap;

use resp::Data;

use super::{Error, Result};

/// Join a host and port into an address, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: &str) -> String {
	if host.contains(':') {
		format!("[{host}]:{port}")
	} else {
		format!("{host}:{port}")
	}
}

/// Parse a flat `[key, value, key, value, ...]` reply, as returned by `SENTINEL MASTER` and
/// friends.
pub fn parse_info(data: Data<'_>) -> Result<HashMap<String, String>> {
	let items = data
		.into_array()
		.ok_or(Error::InvalidFormat("expected array of fields"))?;
	if items.len() % 2 != 0 {
		return Err(Error::MissingElement(items.len() + 1));
	}

	let mut info = HashMap::with_capacity(items.len() / 2);
	let mut items = items.into_iter();
	while let (Some(key), Some(value)) = (items.next(), items.next()) {
		let key = std::str::from_utf8(key.as_bytes().ok_or(Error::InvalidFormat("expected field name"))?)?;
		let value = match &value {
			Data::Integer(int) => int.to_string(),
			value => std::str::from_utf8(value.as_bytes().unwrap_or_default())?.to_owned(),
		};
		info.insert(key.to_owned(), value);
	}

	Ok(info)
}

/// Parse a list of flat info replies, as returned by `SENTINEL REPLICAS` and `SENTINEL SENTINELS`.
pub fn parse_info_list(data: Data<'_>) -> Result<Vec<HashMap<String, String>>> {
	data.into_array()
		.ok_or(Error::InvalidFormat("expected array of nodes"))?
		.into_iter()
		.map(parse_info)
		.collect()
}

/// Addresses of the nodes in `nodes` which are usable: not subjectively or objectively down and,
/// unless `keep_disconnected`, not disconnected from the master. Nodes without both an `ip` and a
/// `port` are skipped.
pub fn parse_replica_addrs(
	nodes: &[HashMap<String, String>],
	keep_disconnected: bool,
) -> Vec<String> {
	nodes
		.iter()
		.filter(|node| {
			let flags = node.get("flags").map(String::as_str).unwrap_or_default();
			!flags.split(',').any(|flag| {
				flag == "s_down" || flag == "o_down" || (!keep_disconnected && flag == "disconnected")
			})
		})
		.filter_map(|node| match (node.get("ip"), node.get("port")) {
			(Some(ip), Some(port)) if !ip.is_empty() && !port.is_empty() => {
				Some(join_host_port(ip, port))
			}
			_ => None,
		})
		.collect()
}

/// Addresses of other sentinels from a `SENTINEL SENTINELS` reply.
pub fn parse_sentinel_addrs(nodes: &[HashMap<String, String>]) -> Vec<String> {
	nodes
		.iter()
		.filter_map(|node| match (node.get("ip"), node.get("port")) {
			(Some(ip), Some(port)) if !ip.is_empty() && !port.is_empty() => {
				Some(join_host_port(ip, port))
			}
			_ => None,
		})
		.collect()
}

/// Parse a `+switch-master` payload: `<name> <old ip> <old port> <new ip> <new port>`.
///
/// Returns the master name and its new address.
pub fn parse_switch_master(payload: &[u8]) -> Option<(String, String)> {
	let payload = std::str::from_utf8(payload).ok()?;
	let parts: Vec<&str> = payload.split(' ').collect();
	match parts[..] {
		[name, _, _, ip, port] => Some((name.to_owned(), join_host_port(ip, port))),
		_ => None,
	}
}
