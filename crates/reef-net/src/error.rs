//! Error types for network operations.
//!
//! All of these are connection-level: "entry absent" is a valid response
//! on the wire, never an error.

use reef_types::PeerId;

/// Errors that can occur during sync network operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Failed to connect to a remote endpoint.
    #[error("connection error: {0}")]
    Connect(String),

    /// A QUIC connection error.
    #[error("connection error: {0}")]
    Connection(#[from] iroh::endpoint::ConnectionError),

    /// Failed to open a stream.
    #[error("stream open error: {0}")]
    StreamOpen(String),

    /// Error writing to a stream.
    #[error("write error: {0}")]
    Write(#[from] iroh::endpoint::WriteError),

    /// Stream was already closed when trying to finish.
    #[error("stream closed: {0}")]
    ClosedStream(#[from] iroh::endpoint::ClosedStream),

    /// Error reading from a stream.
    #[error("read error: {0}")]
    ReadToEnd(#[from] iroh::endpoint::ReadToEndError),

    /// Error reading exact bytes.
    #[error("read exact error: {0}")]
    ReadExact(#[from] iroh::endpoint::ReadExactError),

    /// Serialization or deserialization failed, or the remote answered
    /// with an unexpected message type.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// No address is known for the requested peer.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// The remote refused our shard advertisement during the handshake.
    #[error("handshake rejected by peer {0}")]
    HandshakeRejected(PeerId),

    /// The remote endpoint was not found or unreachable.
    #[error("endpoint error: {0}")]
    Endpoint(String),
}
