//! Remote calls on top of the overlay: a serde argument codec, promises for
//! outbound calls and the table of exposed functions for inbound ones.

pub mod codec;
pub mod dispatch;
pub mod error;
pub mod pending;
pub mod promise;
