//! TCP transport: length-prefixed request/response framing.
//!
//! Every frame is a little-endian `u32` length followed by that many bytes of
//! binary-encoded [`Request`] or [`Response`]. A client opens one connection
//! per request; the server answers any number of requests on a connection
//! until the peer closes it or goes idle.
//!
//! Every client step (connect, write, read) shares one deadline. A peer that
//! misses it is reported as unreachable for that round.

use crate::network::message::{Request, Response};
use crate::network::peer::{Peer, PeerClient, PeerError, RequestHandler};
use crate::types::encoding::{Decode, Encode};
use crate::types::wrapper_types::BoxFuture;
use crate::{debug, warn};
use std::sync::Arc;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{Duration, timeout};

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Inbound connections with no request for this long are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
    }
    writer.write_all(&(data.len() as u32).to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// Reads one frame. `Ok(None)` means the peer closed the connection cleanly
/// between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length {len}"),
        ));
    }

    let mut msg = vec![0u8; len];
    reader.read_exact(&mut msg).await?;
    Ok(Some(msg))
}

/// [`PeerClient`] over TCP with a per-request deadline.
#[derive(Debug, Clone)]
pub struct TcpPeerClient {
    timeout: Duration,
}

impl TcpPeerClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(host: String, request: Vec<u8>) -> Result<Response, PeerError> {
        let unreachable = |reason: String| PeerError::Unreachable {
            host: host.clone(),
            reason,
        };

        let mut stream = TcpStream::connect(host.as_str())
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        write_frame(&mut stream, &request)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        let frame = read_frame(&mut stream)
            .await
            .map_err(|e| unreachable(e.to_string()))?
            .ok_or_else(|| unreachable("connection closed before the response".into()))?;

        Response::from_bytes(&frame).map_err(|e| PeerError::Protocol {
            host: host.clone(),
            reason: format!("undecodable response: {e}"),
        })
    }
}

impl PeerClient for TcpPeerClient {
    fn request(
        &self,
        peer: &Peer,
        request: Request,
    ) -> BoxFuture<'static, Result<Response, PeerError>> {
        let host = peer.host.clone();
        let deadline = self.timeout;
        let bytes = request.encode_to_vec();

        Box::pin(async move {
            match timeout(deadline, Self::exchange(host.clone(), bytes)).await {
                Ok(result) => result,
                Err(_) => Err(PeerError::Unreachable {
                    host,
                    reason: format!("no response within {} ms", deadline.as_millis()),
                }),
            }
        })
    }
}

/// Accepts connections on `listener` until `shutdown` fires, answering each
/// request with `handler`.
pub async fn serve<H>(listener: TcpListener, handler: Arc<H>, mut shutdown: oneshot::Receiver<()>)
where
    H: RequestHandler + 'static,
{
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!("Inbound connection from {remote}");
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            debug!("Connection from {remote} closed: {e}");
                        }
                    });
                }
                Err(e) => warn!("Failed to accept connection: {e}"),
            },
            _ = &mut shutdown => break,
        }
    }
}

async fn handle_connection<H>(mut stream: TcpStream, handler: Arc<H>) -> io::Result<()>
where
    H: RequestHandler + 'static,
{
    loop {
        let frame = match timeout(IDLE_TIMEOUT, read_frame(&mut stream)).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) | Err(_) => return Ok(()),
            Ok(Err(e)) => return Err(e),
        };

        let response = match Request::from_bytes(&frame) {
            Ok(request) => handler.clone().handle(request).await,
            Err(e) => Response::Rejected(format!("undecodable request: {e}")),
        };
        write_frame(&mut stream, &response.encode_to_vec()).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer::fetch_status;
    use crate::network::peer::PeerStatus;
    use crate::types::hash::Hash;

    struct Fixed;

    impl RequestHandler for Fixed {
        fn handle(self: Arc<Self>, request: Request) -> BoxFuture<'static, Response> {
            Box::pin(async move {
                match request {
                    Request::Status => Response::Status(PeerStatus {
                        latest_block_hash: Hash::zero(),
                        latest_block_number: 9,
                        known_peers: Vec::new(),
                    }),
                    _ => Response::Rejected("unsupported".into()),
                }
            })
        }
    }

    #[tokio::test]
    async fn framing_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes()).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn request_response_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = Peer::new(listener.local_addr().unwrap().to_string());
        let (stop, shutdown) = oneshot::channel();
        let server = tokio::spawn(serve(listener, Arc::new(Fixed), shutdown));

        let client = TcpPeerClient::new(Duration::from_secs(3));
        let status = fetch_status(&client, &peer).await.unwrap();
        assert_eq!(status.latest_block_number, 9);

        let rejected = client.request(&peer, Request::QueryMempool).await.unwrap();
        assert_eq!(rejected, Response::Rejected("unsupported".into()));

        let _ = stop.send(());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = Peer::new(listener.local_addr().unwrap().to_string());
        drop(listener);

        let client = TcpPeerClient::new(Duration::from_millis(500));
        assert!(matches!(
            client.request(&peer, Request::Status).await,
            Err(PeerError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        // Accepts the connection but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = Peer::new(listener.local_addr().unwrap().to_string());
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = TcpPeerClient::new(Duration::from_millis(200));
        match client.request(&peer, Request::Status).await {
            Err(PeerError::Unreachable { reason, .. }) => assert!(reason.contains("200 ms")),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
