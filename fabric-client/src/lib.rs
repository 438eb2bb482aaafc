//! Client-side storage adapter: a local key-value API that multiplexes typed
//! request/response RPCs over one long-lived encrypted connection, surfaces inbound
//! broadcasts as local events, and tolerates reconnects with bounded backoff.

pub mod adapter;
pub mod config;
pub mod events;
pub mod pending;

pub use adapter::ClientAdapter;
pub use config::ClientConfig;
pub use events::ClientEvent;
