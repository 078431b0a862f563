//! Shared key-value store used as the command/response transport
//!
//! Every key the device touches is namespaced by its identity:
//!
//! | Key                              | Use                                  |
//! |----------------------------------|--------------------------------------|
//! | `<id>:heartbeat`                 | uptime, with expiry                  |
//! | `<id>:bootcount`                 | read-modify-write counter            |
//! | `<id>:config:<field>`            | remote configuration                 |
//! | `<id>:config:<command>`          | pending command request              |
//! | `<id>:config:<command>:<payload>`| correlation key for the response     |
//! | `<id>:info:publishLogs`          | publish-only log channel             |

pub mod client;
pub mod memory;
pub mod resp;

pub use client::RespClient;
pub use memory::MemoryStore;
pub use resp::{Reply, RespError};

use alloc::string::String;

use embassy_time::Duration;
use thiserror_no_std::Error;

pub const HEARTBEAT_SUFFIX: &str = ":heartbeat";
pub const BOOTCOUNT_SUFFIX: &str = ":bootcount";
pub const CONFIG_PREFIX: &str = ":config:";
pub const PUBLISH_LOGS_SUFFIX: &str = ":info:publishLogs";

/// Separates a request key from the payload in a correlation key
pub const CORRELATION_DELIMITER: char = ':';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transport error: {0:?}")]
    Transport(embedded_io::ErrorKind),
    #[error("connection closed by peer")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(#[from] RespError),
    #[error("server replied: {0}")]
    Server(String),
    #[error("unexpected reply to {command}")]
    UnexpectedReply { command: &'static str },
    #[error("value is not UTF-8")]
    NotUtf8,
    #[error("store unavailable")]
    Unavailable,
}

/// Blocking-in-spirit access to the shared store.
///
/// Exactly one operation is in flight at a time; callers await each result
/// before issuing the next. Implementations enforce their own timeouts.
#[allow(async_fn_in_trait)]
pub trait KeyValueStore {
    /// Value at `key`, `None` if the key does not exist
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Apply a time-to-live; `false` if the key does not exist
    async fn expire(&mut self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remove `key`; `false` if it did not exist
    async fn del(&mut self, key: &str) -> Result<bool, StoreError>;

    /// Publish on a channel, returning the number of receivers
    async fn publish(&mut self, channel: &str, message: &str) -> Result<u32, StoreError>;
}

/// `identity + suffix`
pub fn device_key(identity: &str, suffix: &str) -> String {
    let mut key = String::with_capacity(identity.len() + suffix.len());
    key.push_str(identity);
    key.push_str(suffix);
    key
}

/// `identity + ":config:" + field`
pub fn config_key(identity: &str, field: &str) -> String {
    let mut key = device_key(identity, CONFIG_PREFIX);
    key.push_str(field);
    key
}

/// `identity + suffix + ":" + payload`
///
/// The payload is appended verbatim. A payload that itself contains `:`
/// yields a key that is valid but cannot be split back unambiguously; the
/// device never parses these keys, it only writes to them.
pub fn correlation_key(identity: &str, suffix: &str, payload: &str) -> String {
    let mut key = device_key(identity, suffix);
    key.push(CORRELATION_DELIMITER);
    key.push_str(payload);
    key
}
