//! The crate's error taxonomy (see the module table in the crate root).

use thiserror::Error;

/// Everything that can go wrong while driving a [`crate::connection::Connection`],
/// [`crate::pubsub::PubSubEndpoint`], or [`crate::rpc::RpcEndpoint`].
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying duplex stream failed, or hit EOF with no buffered bytes left.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `postcard` failed to encode or decode a value, including the case where
    /// bytes remained unconsumed after decoding (a wire-shape mismatch).
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// The connection is no longer open. Surfaced both from an explicit `close()`
    /// and from any in-flight operation that was suspended on a reply that will
    /// now never arrive.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The remote peer reported a failure for a `call`.
    #[error(transparent)]
    Host(#[from] HostError),
}

/// A failure reported by the remote side of a `call`, carrying its message text.
///
/// This is the only error variant a method handler can produce deliberately:
/// everything else is a local transport/codec condition.
#[derive(Debug, Clone, Error)]
#[error("host error: {0}")]
pub struct HostError(pub String);
