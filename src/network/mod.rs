//! Node-to-node communication.
//!
//! - [`message`]: request and response types
//! - [`peer`]: peer records and the client/handler seams
//! - [`tcp_transport`]: length-framed TCP client and accept loop
//! - [`local_transport`]: in-memory network for tests
//! - [`server`]: request handling, gossip and the periodic loops
//! - [`sync`]: per-peer synchronization and fork choice

pub mod local_transport;
pub mod message;
pub mod peer;
pub mod server;
pub mod sync;
pub mod tcp_transport;
