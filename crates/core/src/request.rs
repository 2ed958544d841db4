//! The outbound request channel.
//!
//! Components that would otherwise depend on each other (consensus and the
//! pin tracker, most notably) communicate through a neutral bounded channel
//! of [`Request`] values owned by the agent. The applier emits effects here
//! without blocking so a stalled consumer never stalls consensus.

use crate::cid::PinCid;
use crate::peer::PeerId;
use tokio::sync::mpsc;

/// Capacity of the outbound request channel.
pub const RPC_MAX_QUEUE: usize = 1024;

/// A message on the outbound request channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Ask the pin tracker to start tracking a CID in the local store.
    Track(PinCid),
    /// Ask the pin tracker to stop tracking a CID.
    Untrack(PinCid),
    /// Ask the pin tracker to reconcile the local store with the applied
    /// state. Emitted once after bootstrap catch-up.
    LocalSync,
    /// A request addressed to the current cluster leader, whoever that is.
    LeaderEnvelope(Box<Request>),
    /// Restore the shared state from the given snapshot bytes, cluster-wide.
    Rollback(Vec<u8>),
}

impl Request {
    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Track(_) => "track",
            Self::Untrack(_) => "untrack",
            Self::LocalSync => "local_sync",
            Self::LeaderEnvelope(_) => "leader_envelope",
            Self::Rollback(_) => "rollback",
        }
    }
}

/// Sending half of the outbound request channel.
///
/// Wraps the raw sender with the cluster's send policy: effects emitted from
/// the apply path use [`emit`](Self::emit) (non-blocking, drop on full);
/// callers that can afford to wait use [`send`](Self::send).
#[derive(Clone)]
pub struct RequestSender {
    tx: mpsc::Sender<Request>,
    peer: PeerId,
}

impl RequestSender {
    /// Emit a request without blocking. On a full channel the request is
    /// dropped with a warning; consumers must tolerate missed effects and
    /// reconcile via `LocalSync`.
    pub fn emit(&self, req: Request) -> bool {
        match self.tx.try_send(req) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(req)) => {
                tracing::warn!(
                    peer = %self.peer,
                    kind = req.tag(),
                    "outbound request channel full, dropping request"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(req)) => {
                tracing::debug!(
                    peer = %self.peer,
                    kind = req.tag(),
                    "outbound request channel closed, dropping request"
                );
                false
            }
        }
    }

    /// Send a request, waiting for channel capacity. Returns `false` if the
    /// receiving side is gone.
    pub async fn send(&self, req: Request) -> bool {
        self.tx.send(req).await.is_ok()
    }
}

/// Create the bounded outbound request channel for a peer.
pub fn request_channel(peer: PeerId) -> (RequestSender, mpsc::Receiver<Request>) {
    let (tx, rx) = mpsc::channel(RPC_MAX_QUEUE);
    (RequestSender { tx, peer }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_delivers() {
        let (tx, mut rx) = request_channel(PeerId::random());
        let cid = PinCid::from_raw_data(b"block");
        assert!(tx.emit(Request::Track(cid)));
        match rx.recv().await.unwrap() {
            Request::Track(got) => assert_eq!(got, cid),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn emit_drops_on_full_channel() {
        let (tx, _rx) = request_channel(PeerId::random());
        for _ in 0..RPC_MAX_QUEUE {
            assert!(tx.emit(Request::LocalSync));
        }
        // Channel is now full; the emit must not block, it must drop.
        assert!(!tx.emit(Request::LocalSync));
    }

    #[tokio::test]
    async fn emit_reports_closed_receiver() {
        let (tx, rx) = request_channel(PeerId::random());
        drop(rx);
        assert!(!tx.emit(Request::LocalSync));
    }
}
