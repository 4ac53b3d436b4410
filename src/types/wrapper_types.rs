//! Shared type aliases.

use std::future::Future;
use std::pin::Pin;

/// Boxed, pinned, sendable future. Lets [`PeerClient`](crate::network::peer::PeerClient)
/// stay object-safe without pulling in `async-trait`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
