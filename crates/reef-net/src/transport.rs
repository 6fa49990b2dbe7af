//! QUIC transport built on iroh.
//!
//! [`QuicTransport`] wraps an iroh [`Endpoint`] and provides:
//! - Connection pooling (reuse connections to the same peer).
//! - The shard-advertisement handshake performed on every new connection.
//! - Request/response bi-streams with length-prefixed postcard framing.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use reef_types::{Contract, PeerId};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::NetError;
use crate::message::{KvPayload, ShardAdvertisement, SyncMessage};
use crate::responder::SyncResponder;
use crate::{PeerEvents, SYNC_ALPN, SyncTransport};

/// Hard cap on a single wire frame. Responses are already bounded by the
/// responder's byte budget; this protects the decoder from a hostile
/// length prefix.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Network transport for inter-node sync traffic.
///
/// Manages an iroh QUIC endpoint, a connection pool keyed by endpoint ID,
/// and the address book mapping peer identities to dialable addresses.
pub struct QuicTransport {
    endpoint: Endpoint,
    /// Cached connections to remote peers, keyed by their endpoint ID.
    ///
    /// Uses `Mutex` (not `RwLock`) to prevent a TOCTOU race where
    /// concurrent callers all see "no cached connection", each establish
    /// a separate QUIC connection to the same peer, and overwrite each
    /// other in the cache.
    connections: Mutex<HashMap<EndpointId, Connection>>,
    /// Known dialable addresses, keyed by derived peer ID.
    address_book: RwLock<HashMap<PeerId, EndpointAddr>>,
    /// ALPN used for outgoing connections.
    alpn: Vec<u8>,
}

impl QuicTransport {
    /// Bind a new transport with the default ALPN (`reef/sync/0`).
    ///
    /// Use [`iroh::RelayMode::Disabled`] for tests that don't need relay
    /// servers.
    pub async fn bind(
        secret_key: SecretKey,
        relay_mode: iroh::RelayMode,
    ) -> Result<Arc<Self>, NetError> {
        Self::bind_with_alpn(secret_key, relay_mode, SYNC_ALPN.to_vec()).await
    }

    /// Bind a new transport with a network-specific ALPN.
    ///
    /// Use [`crate::sync_alpn`] to derive the ALPN from a shared secret.
    pub async fn bind_with_alpn(
        secret_key: SecretKey,
        relay_mode: iroh::RelayMode,
        alpn: Vec<u8>,
    ) -> Result<Arc<Self>, NetError> {
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![alpn.clone()])
            .relay_mode(relay_mode)
            .bind()
            .await
            .map_err(|e| NetError::Endpoint(e.to_string()))?;

        Ok(Arc::new(Self {
            endpoint,
            connections: Mutex::new(HashMap::new()),
            address_book: RwLock::new(HashMap::new()),
            alpn,
        }))
    }

    /// Return a reference to the underlying iroh endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Return the [`EndpointAddr`] of this transport (ID + addresses).
    pub fn addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// This node's peer identity as seen by the sync layer.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(*self.endpoint.id().as_bytes())
    }

    fn peer_id_of(id: &EndpointId) -> PeerId {
        PeerId::from(*id.as_bytes())
    }

    // -------------------------------------------------------------------
    // Connection management
    // -------------------------------------------------------------------

    /// Get or establish a QUIC connection to a remote peer.
    ///
    /// Holds the cache lock for the whole call so concurrent callers
    /// never dial the same peer twice.
    async fn get_connection(&self, addr: EndpointAddr) -> Result<Connection, NetError> {
        let remote_id = addr.id;
        let mut cache = self.connections.lock().await;

        if let Some(conn) = cache.get(&remote_id)
            && conn.close_reason().is_none()
        {
            return Ok(conn.clone());
        }

        debug!(remote = %remote_id.fmt_short(), "connecting to peer");
        let conn = self
            .endpoint
            .connect(addr, &self.alpn)
            .await
            .map_err(|e| NetError::Connect(e.to_string()))?;

        cache.insert(remote_id, conn.clone());
        Ok(conn)
    }

    /// Remove a cached connection (e.g. after detecting it's dead).
    pub async fn remove_connection(&self, id: &EndpointId) {
        self.connections.lock().await.remove(id);
    }

    async fn addr_for(&self, peer: PeerId) -> Result<EndpointAddr, NetError> {
        self.address_book
            .read()
            .await
            .get(&peer)
            .cloned()
            .ok_or(NetError::UnknownPeer(peer))
    }

    // -------------------------------------------------------------------
    // Framing
    // -------------------------------------------------------------------

    /// Send a message on an open send stream and finish it.
    ///
    /// The frame is a 4-byte big-endian length prefix followed by the
    /// postcard-encoded message.
    pub async fn send_on_stream(
        send: &mut SendStream,
        message: &SyncMessage,
    ) -> Result<(), NetError> {
        let payload =
            postcard::to_allocvec(message).map_err(|e| NetError::Serialization(e.to_string()))?;

        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.extend_from_slice(&payload);

        send.write_all(&frame).await?;
        send.finish()?;
        Ok(())
    }

    /// Receive one length-prefixed message from a receive stream.
    pub async fn recv_message(recv: &mut RecvStream) -> Result<SyncMessage, NetError> {
        let mut len_buf = [0u8; 4];
        recv.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(NetError::Serialization(format!(
                "message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"
            )));
        }

        let payload = recv.read_to_end(len).await?;
        postcard::from_bytes(&payload).map_err(|e| NetError::Serialization(e.to_string()))
    }

    /// One request/response exchange on a fresh bi-stream.
    async fn request(&self, conn: &Connection, request: &SyncMessage) -> Result<SyncMessage, NetError> {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| NetError::StreamOpen(e.to_string()))?;
        Self::send_on_stream(&mut send, request).await?;
        Self::recv_message(&mut recv).await
    }

    // -------------------------------------------------------------------
    // Handshake (dialer side)
    // -------------------------------------------------------------------

    /// Dial a peer and perform the shard-advertisement handshake.
    ///
    /// On success the peer's address is recorded in the address book and
    /// its advertisement is returned for the caller to register. A remote
    /// rejection surfaces as [`NetError::HandshakeRejected`].
    pub async fn connect_peer(
        &self,
        addr: EndpointAddr,
        local: &ShardAdvertisement,
    ) -> Result<(PeerId, ShardAdvertisement), NetError> {
        let peer = Self::peer_id_of(&addr.id);
        let conn = self.get_connection(addr.clone()).await?;

        let response = self
            .request(
                &conn,
                &SyncMessage::Handshake {
                    advertisement: local.clone(),
                },
            )
            .await?;

        match response {
            SyncMessage::HandshakeAck {
                advertisement,
                accepted,
            } => {
                if !accepted {
                    self.remove_connection(&addr.id).await;
                    return Err(NetError::HandshakeRejected(peer));
                }
                self.address_book.write().await.insert(peer, addr);
                info!(%peer, "handshake complete");
                Ok((peer, advertisement))
            }
            other => Err(NetError::Serialization(format!(
                "expected HandshakeAck, got: {other:?}"
            ))),
        }
    }

    // -------------------------------------------------------------------
    // Serving (acceptor side)
    // -------------------------------------------------------------------

    /// Accept and serve incoming connections until the endpoint closes.
    ///
    /// Each connection must open with a `Handshake`; `events` decides
    /// whether to keep the peer, and is notified when an accepted peer's
    /// connection ends. Subsequent bi-streams are served through the
    /// responder.
    pub async fn serve(
        self: Arc<Self>,
        responder: Arc<SyncResponder>,
        events: Arc<dyn PeerEvents>,
        local: ShardAdvertisement,
    ) {
        while let Some(incoming) = self.endpoint.accept().await {
            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                    continue;
                }
            };
            let transport = Arc::clone(&self);
            let responder = Arc::clone(&responder);
            let events = Arc::clone(&events);
            let local = local.clone();
            tokio::spawn(async move {
                transport
                    .handle_incoming(conn, responder, events, local)
                    .await;
            });
        }
    }

    async fn handle_incoming(
        &self,
        conn: Connection,
        responder: Arc<SyncResponder>,
        events: Arc<dyn PeerEvents>,
        local: ShardAdvertisement,
    ) {
        let remote_id = conn.remote_id();
        let peer = Self::peer_id_of(&remote_id);

        // First stream carries the handshake.
        let accepted = match conn.accept_bi().await {
            Ok((mut send, mut recv)) => match Self::recv_message(&mut recv).await {
                Ok(SyncMessage::Handshake { advertisement }) => {
                    let accepted =
                        advertisement.is_valid() && events.peer_connected(peer, &advertisement);
                    let ack = SyncMessage::HandshakeAck {
                        advertisement: local,
                        accepted,
                    };
                    if let Err(e) = Self::send_on_stream(&mut send, &ack).await {
                        warn!(%peer, "failed to send handshake ack: {e}");
                        false
                    } else {
                        accepted
                    }
                }
                Ok(other) => {
                    warn!(%peer, "expected Handshake, got: {other:?}");
                    false
                }
                Err(e) => {
                    warn!(%peer, "failed to decode handshake: {e}");
                    false
                }
            },
            Err(e) => {
                debug!(%peer, "connection closed before handshake: {e}");
                return;
            }
        };

        if !accepted {
            info!(%peer, "refusing peer, closing connection");
            conn.close(0u32.into(), b"refused");
            return;
        }

        // Serve request/response bi-streams until the connection ends.
        loop {
            match conn.accept_bi().await {
                Ok((mut send, mut recv)) => match Self::recv_message(&mut recv).await {
                    Ok(request) => {
                        if let Some(response) = responder.handle(peer, request)
                            && let Err(e) = Self::send_on_stream(&mut send, &response).await
                        {
                            warn!(%peer, "failed to send response: {e}");
                        }
                    }
                    Err(e) => {
                        warn!(%peer, "failed to decode request: {e}");
                    }
                },
                Err(e) => {
                    debug!(%peer, "connection closed: {e}");
                    break;
                }
            }
        }

        self.remove_connection(&remote_id).await;
        events.peer_disconnected(peer);
    }

    /// Gracefully close the transport.
    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}

#[async_trait::async_trait]
impl SyncTransport for QuicTransport {
    async fn request_range(
        &self,
        peer: PeerId,
        contract: Contract,
        shard_index: u64,
        origin: u64,
        limit: u64,
    ) -> Result<Vec<KvPayload>, NetError> {
        let addr = self.addr_for(peer).await?;
        let conn = self.get_connection(addr).await?;
        let response = self
            .request(
                &conn,
                &SyncMessage::GetKvsByRange {
                    contract,
                    shard_index,
                    origin,
                    limit,
                },
            )
            .await?;

        match response {
            SyncMessage::Kvs { payloads } => {
                debug!(%peer, origin, limit, served = payloads.len(), "range response");
                Ok(payloads)
            }
            other => Err(NetError::Serialization(format!(
                "unexpected response type: {other:?}"
            ))),
        }
    }

    async fn request_list(
        &self,
        peer: PeerId,
        contract: Contract,
        shard_index: u64,
        kv_indices: Vec<u64>,
    ) -> Result<Vec<KvPayload>, NetError> {
        let addr = self.addr_for(peer).await?;
        let conn = self.get_connection(addr).await?;
        let requested = kv_indices.len();
        let response = self
            .request(
                &conn,
                &SyncMessage::GetKvsByList {
                    contract,
                    shard_index,
                    kv_indices,
                },
            )
            .await?;

        match response {
            SyncMessage::Kvs { payloads } => {
                debug!(%peer, requested, served = payloads.len(), "list response");
                Ok(payloads)
            }
            other => Err(NetError::Serialization(format!(
                "unexpected response type: {other:?}"
            ))),
        }
    }
}
