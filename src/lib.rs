//! Peer-to-peer RPC transport.
//!
//! Nodes keep length-framed TCP connections to their peers, learn which
//! overlay [`Address`] sits behind each connection, and route packets and
//! remote calls between addresses. Outbound calls return a [`Promise`];
//! inbound calls are served by functions exposed on the [`Node`].

pub mod hex;
pub mod net;
pub mod rpc;

pub use net::{
    address::Address,
    config::NodeConfig,
    connection::{Direction, Handle},
    error::{ConnectionError, FramingError, NodeError, RouteError},
    node::{Node, PeerInfo},
    uri::Uri,
    wire::Packet,
};
pub use rpc::{
    error::CallError,
    promise::{Promise, PromiseError, PromiseState},
};
