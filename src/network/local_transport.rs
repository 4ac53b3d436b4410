//! In-memory network for tests and single-process simulations.
//!
//! Requests go straight to the registered handler without any I/O, but are
//! still passed through the binary codec so that what a test exercises is
//! what would cross the wire. Hosts can be taken offline to simulate
//! unreachable peers.

use crate::network::message::{Request, Response};
use crate::network::peer::{Peer, PeerClient, PeerError, RequestHandler};
use crate::types::encoding::{Decode, Encode};
use crate::types::wrapper_types::BoxFuture;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct LocalNetwork {
    handlers: Arc<DashMap<String, Arc<dyn RequestHandler>>>,
    offline: Arc<DashSet<String>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, host: &str, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(host.to_string(), handler);
    }

    pub fn set_offline(&self, host: &str, offline: bool) {
        if offline {
            self.offline.insert(host.to_string());
        } else {
            self.offline.remove(host);
        }
    }
}

impl PeerClient for LocalNetwork {
    fn request(
        &self,
        peer: &Peer,
        request: Request,
    ) -> BoxFuture<'static, Result<Response, PeerError>> {
        let host = peer.host.clone();
        let handler = if self.offline.contains(&host) {
            None
        } else {
            self.handlers.get(&host).map(|h| h.value().clone())
        };
        let bytes = request.encode_to_vec();

        Box::pin(async move {
            let Some(handler) = handler else {
                return Err(PeerError::Unreachable {
                    host,
                    reason: "host is offline".into(),
                });
            };
            let protocol = |reason: String| PeerError::Protocol {
                host: host.clone(),
                reason,
            };
            let request = Request::from_bytes(&bytes).map_err(|e| protocol(e.to_string()))?;
            let response = handler.handle(request).await;
            Response::from_bytes(&response.encode_to_vec()).map_err(|e| protocol(e.to_string()))
        })
    }
}
