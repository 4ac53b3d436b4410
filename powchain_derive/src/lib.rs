//! Derive macros for the powchain crate.
//!
//! - `#[derive(BinaryCodec)]` generates the deterministic `Encode`/`Decode` impls
//!   that blocks, transactions and peer messages are hashed and framed with.
//! - `#[derive(Error)]` generates `Display` and `std::error::Error`, with an
//!   optional `#[source]` field for error chaining.

mod binary_codec;
mod error;

use proc_macro::TokenStream;

/// Implements `Encode` and `Decode` from `crate::types::encoding`.
#[proc_macro_derive(BinaryCodec)]
pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    binary_codec::derive_binary_codec(input)
}

/// Implements `Display` and `Error` from `#[error("...")]` messages.
#[proc_macro_derive(Error, attributes(error, source))]
pub fn derive_error(input: TokenStream) -> TokenStream {
    error::derive_error(input)
}
