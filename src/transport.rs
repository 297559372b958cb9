//! Transport capability set the engine requires, plus an in-process
//! loopback pair for tests.
//!
//! `Transport` is a plain generic trait bound rather than a `dyn Trait` —
//! `PEManager`/`PEResponder` are generic over `T: Transport` the same way
//! the reactor elsewhere here is generic over its socket type, so there's
//! no boxing cost at the call site and callers can swap in a real MIDI I/O
//! transport without touching the engine.

use std::pin::Pin;

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Opaque transport-level address. Distinct from a `Muid`: a transport may
/// address ports/endpoints that don't map 1:1 to a CI node until Discovery
/// has run.
pub type DestinationId = u32;
pub type SourceId = DestinationId;

#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub source: SourceId,
    pub bytes: Bytes,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no such destination: {0}")]
    UnknownDestination(DestinationId),
    #[error("transport channel closed")]
    Closed,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, bytes: Bytes, destination: DestinationId) -> Result<(), TransportError>;
    async fn broadcast(&self, bytes: Bytes) -> Result<(), TransportError>;
    /// Stream of inbound frames. Intended to be consumed from a single
    /// dispatch loop, matching the container-isolation model elsewhere.
    fn received(&self) -> Pin<Box<dyn Stream<Item = ReceivedFrame> + Send + '_>>;
    fn destinations(&self) -> Vec<DestinationId>;
}

/// One half of an in-process loopback pair, built on `tokio::sync::mpsc`
/// channels (one per direction) so FIFO order per direction is preserved
/// for free.
pub struct Loopback {
    peer: DestinationId,
    out_tx: mpsc::UnboundedSender<Bytes>,
    in_rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl Loopback {
    /// Builds a connected pair: `a.send(x, b.id()) -> b.received()` yields
    /// `x`, and vice versa.
    pub fn pair() -> (Loopback, Loopback) {
        let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
        let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();
        let a = Loopback {
            peer: 1,
            out_tx: a_to_b_tx,
            in_rx: Mutex::new(b_to_a_rx),
        };
        let b = Loopback {
            peer: 0,
            out_tx: b_to_a_tx,
            in_rx: Mutex::new(a_to_b_rx),
        };
        (a, b)
    }

    pub fn id(&self) -> DestinationId {
        // The pair is symmetric: each side's own id is simply "not the peer".
        1 - self.peer
    }
}

#[async_trait]
impl Transport for Loopback {
    async fn send(&self, bytes: Bytes, destination: DestinationId) -> Result<(), TransportError> {
        if destination != self.peer {
            return Err(TransportError::UnknownDestination(destination));
        }
        self.out_tx.send(bytes).map_err(|_| TransportError::Closed)
    }

    async fn broadcast(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.out_tx.send(bytes).map_err(|_| TransportError::Closed)
    }

    fn received(&self) -> Pin<Box<dyn Stream<Item = ReceivedFrame> + Send + '_>> {
        let peer = self.peer;
        Box::pin(stream! {
            loop {
                let next = { self.in_rx.lock().await.recv().await };
                match next {
                    Some(bytes) => yield ReceivedFrame { source: peer, bytes },
                    None => break,
                }
            }
        })
    }

    fn destinations(&self) -> Vec<DestinationId> {
        vec![self.peer]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn loopback_pair_delivers_in_fifo_order() {
        let (a, b) = Loopback::pair();

        a.send(Bytes::from_static(b"one"), b.id()).await.unwrap();
        a.send(Bytes::from_static(b"two"), b.id()).await.unwrap();

        let mut stream = b.received();
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.bytes, Bytes::from_static(b"one"));
        assert_eq!(second.bytes, Bytes::from_static(b"two"));
        assert_eq!(first.source, a.id());
    }

    #[tokio::test]
    async fn send_to_unknown_destination_errors() {
        let (a, b) = Loopback::pair();
        let bogus = a.id().wrapping_add(b.id()).wrapping_add(7);
        let err = a.send(Bytes::from_static(b"x"), bogus).await.unwrap_err();
        assert_eq!(err, TransportError::UnknownDestination(bogus));
    }

    #[tokio::test]
    async fn broadcast_reaches_the_only_peer() {
        let (a, b) = Loopback::pair();
        a.broadcast(Bytes::from_static(b"hi")).await.unwrap();
        let mut stream = b.received();
        let frame = stream.next().await.unwrap();
        assert_eq!(frame.bytes, Bytes::from_static(b"hi"));
    }
}
