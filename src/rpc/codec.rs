//! Binary encoding of call arguments and results.
//!
//! Everything goes through `serde` with one fixed `bincode` configuration:
//! fixed-width little-endian integers, `u64` length prefixes, and no bytes
//! left over after a value. A result whose encoding would be empty, such as
//! the `()` of a void function, travels as the one-byte [`VOID_MARKER`].

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

/// The whole reply of a function returning nothing.
pub const VOID_MARKER: u8 = 0;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
    #[error("empty value")]
    Empty,
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// Decodes exactly one `T` from `buf`. Length prefixes are checked against
/// the input size before anything is allocated.
fn strict<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
    Ok(options().with_limit(buf.len() as u64).deserialize(buf)?)
}

/// Encodes a call result.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut out = options().serialize(value)?;
    if out.is_empty() {
        out.push(VOID_MARKER);
    }
    Ok(out)
}

/// Decodes a call result produced by [`to_bytes`].
pub fn from_bytes<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
    if buf.is_empty() {
        return Err(CodecError::Empty);
    }
    if buf == &[VOID_MARKER][..] {
        if let Ok(value) = strict(&[]) {
            return Ok(value);
        }
    }
    strict(buf)
}

/// A call's argument list: `()` or a tuple of up to six values. Arguments
/// are written back to back in order, so an empty list writes nothing.
pub trait Arguments: Serialize {}

impl Arguments for () {}

macro_rules! arguments {
    ($(($($name:ident),+);)*) => {$(
        impl<$($name: Serialize),+> Arguments for ($($name,)+) {}
    )*};
}

arguments! {
    (A);
    (A, B);
    (A, B, C);
    (A, B, C, D);
    (A, B, C, D, E);
    (A, B, C, D, E, F);
}

pub fn encode_args<A: Arguments + ?Sized>(args: &A) -> Result<Vec<u8>, CodecError> {
    Ok(options().serialize(args)?)
}

/// Decodes an argument tuple, rejecting missing and surplus arguments.
pub fn decode_args<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
    strict(buf)
}

/// Encodes a wire message. Unlike [`to_bytes`] an empty encoding stays empty.
pub(crate) fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    Ok(options().serialize(message)?)
}

pub(crate) fn decode_message<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
    strict(buf)
}
