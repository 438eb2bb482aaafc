//! Shared protocol, crypto, time, logging and error types used by the storage-fabric
//! server, its client storage adapter, and the gateway-style connection core.

pub mod crypto;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod time;

pub use error::{FabricError, FabricResult};

/// Correlation id type used on every client request and its matching response.
pub type CorrelationId = String;
