use std::io;

use super::{address::Address, uri::Uri};

/// Anything that ends a single connection. These are always local to the
/// connection: they are logged and turned into a "leave" for its owner.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("could not resolve {locator}: {source}")]
    Resolve { locator: Uri, source: io::Error },
    #[error("{locator} resolved to no addresses")]
    NoAddresses { locator: Uri },
    #[error("could not connect to {locator}: {source}")]
    Connect { locator: Uri, source: io::Error },
    #[error("timed out connecting to {locator}")]
    ConnectTimeout { locator: Uri },
    #[error("connection closed by peer")]
    Eof,
    #[error("connection reset: {0}")]
    Io(#[from] io::Error),
    #[error("write on a closed connection")]
    Closed,
    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// The byte stream no longer carries well-formed frames or packets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("network magic mismatch: expected {expected:#018x}, got {actual:#018x}")]
    BadMagic { expected: u64, actual: u64 },
    #[error("frame of {length} bytes exceeds the {limit} byte limit")]
    TooLarge { length: u64, limit: u64 },
    #[error("truncated packet: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
    #[error("unsupported packet version {0}")]
    UnsupportedVersion(u8),
}

/// Failures to move a locally originated packet towards its target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("{0:#} is blacklisted")]
    Blacklisted(Address),
    #[error("no route to {0:#}")]
    NoRoute(Address),
    #[error("service {0} is reserved for the node itself")]
    ReservedService(u16),
    #[error("node is not running")]
    NotRunning,
}

/// Systemic node failures. Unlike connection errors these reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("could not listen on port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("node is already running")]
    AlreadyRunning,
    #[error("node is not running")]
    NotRunning,
}
