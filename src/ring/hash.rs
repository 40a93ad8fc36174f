/// Maps keys onto the names of live shards.
///
/// Implementations must be deterministic in the set of names they were built from, regardless of
/// the order the names were given in.
pub trait ConsistentHash: Send + Sync {
	/// The shard owning `key`, or `None` when there are no shards.
	fn get(&self, key: &[u8]) -> Option<&str>;
}

#[inline]
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
	const FNV_OFFSET: u64 = 0xcbf29ce484222325;
	const FNV_PRIME: u64 = 0x100000001b3;

	let mut hash = FNV_OFFSET;
	for byte in bytes {
		hash ^= u64::from(*byte);
		hash = hash.wrapping_mul(FNV_PRIME);
	}
	hash
}

/// Final avalanche step of SplitMix64.
#[inline]
fn mix(mut x: u64) -> u64 {
	x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
	x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
	x ^ (x >> 31)
}

/// Rendezvous (highest random weight) hashing.
///
/// Every key is scored against every shard and the highest score wins, so removing a shard only
/// moves the keys that shard owned.
#[derive(Debug, Clone, Default)]
pub struct Rendezvous {
	nodes: Vec<(String, u64)>,
}

impl Rendezvous {
	pub fn new<I, S>(names: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
		names.sort_unstable();
		names.dedup();

		Self {
			nodes: names
				.into_iter()
				.map(|name| {
					let seed = fnv1a(name.as_bytes());
					(name, seed)
				})
				.collect(),
		}
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}
}

impl ConsistentHash for Rendezvous {
	fn get(&self, key: &[u8]) -> Option<&str> {
		let key_hash = fnv1a(key);

		// ties go to the first name in sorted order
		let mut best: Option<(&str, u64)> = None;
		for (name, seed) in &self.nodes {
			let score = mix(key_hash ^ seed);
			if best.map_or(true, |(_, top)| score > top) {
				best = Some((name.as_str(), score));
			}
		}

		best.map(|(name, _)| name)
	}
}

/// The part of `key` used for hashing: the contents of the first non-empty `{...}`, or the whole
/// key.
pub fn hash_tag(key: &[u8]) -> &[u8] {
	let Some(start) = key.iter().position(|&b| b == b'{') else {
		return key;
	};

	match key[start + 1..].iter().position(|&b| b == b'}') {
		Some(len) if len > 0 => &key[start + 1..start + 1 + len],
		_ => key,
	}
}
