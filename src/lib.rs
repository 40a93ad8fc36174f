//! A Redis client with consistent-hash sharding, Pub/Sub and Sentinel failover.
//!
//! [Client] talks to a single server through a pool of connections. [Ring] spreads keys over
//! several servers by consistent hashing and routes around shards that stop answering.
//! [PubSub] keeps subscriptions alive across reconnects. [sentinel] follows a master through
//! failovers.

/// A pooled client for a single server.
pub mod client;
/// Queued commands and their replies.
pub mod cmd;
/// Typed commands.
pub mod command;
/// Items for connecting to Redis.
pub mod connection;
/// The crate error and its classification.
pub mod error;
/// Redis models.
pub mod model;
/// Client configuration.
pub mod options;
/// Items for managing Redis connections with Deadpool.
pub mod pool;
/// Pub/Sub sessions.
pub mod pubsub;
/// Retry backoff.
pub mod retry;
/// Consistent-hash sharding over several servers.
pub mod ring;
/// Sentinel-managed deployments.
pub mod sentinel;
/// Optimistic transactions.
pub mod tx;

pub use client::Client;
pub use cmd::Cmd;
pub use connection::Connection;
pub use error::{Error, Result};
pub use options::Options;
pub use pubsub::PubSub;
pub use resp;
pub use ring::{Ring, RingOptions};
pub use sentinel::{FailoverOptions, SentinelClient, SentinelFailover};
pub use tx::Tx;
