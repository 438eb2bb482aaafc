//! Multi-tenant realtime key-value storage fabric server: accepts WebSocket
//! connections, authenticates them against a token, and gives each tenant an isolated,
//! namespaced view over a shared Redis backing store with cross-connection broadcast.

pub mod bucket;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod storage;

pub use bucket::BucketManager;
pub use channel::ChannelBroker;
pub use config::{ServerArgs, ServerConfig, StorageConfig};
