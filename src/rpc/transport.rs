//! Message channel between an [`RpcClient`](super::RpcClient) and an
//! [`RpcServer`](super::RpcServer).

use tokio::sync::mpsc;

/// One end of a reliable, ordered, boundary-preserving text channel.
///
/// Each frame is one JSON message. The two directions are independent.
#[derive(Debug)]
pub struct Transport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Sending half of a [`Transport`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FrameSender(mpsc::UnboundedSender<String>);

/// Receiving half of a [`Transport`].
#[derive(Debug)]
pub struct FrameReceiver(mpsc::UnboundedReceiver<String>);

/// An in-process connected pair of transports.
///
/// Frames sent on one end arrive, in order, on the other.
///
/// # Examples
///
/// ```rust
/// # futures::executor::block_on(async {
/// let (a, b) = layerfs::rpc::duplex();
/// let (tx, _rx) = a.split();
/// let (_tx, mut rx) = b.split();
/// assert!(tx.send("hello".into()));
/// assert_eq!(rx.recv().await.as_deref(), Some("hello"));
/// # });
/// ```
pub fn duplex() -> (Transport, Transport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        Transport { tx: a_tx, rx: a_rx },
        Transport { tx: b_tx, rx: b_rx },
    )
}

impl Transport {
    /// Build an end from raw channel halves, for bridging to another carrier.
    pub fn from_channels(
        tx: mpsc::UnboundedSender<String>,
        rx: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self { tx, rx }
    }

    /// Split into independently owned halves.
    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (FrameSender(self.tx), FrameReceiver(self.rx))
    }
}

impl FrameSender {
    /// Queue a frame. Returns `false` once the peer is gone.
    pub fn send(&self, frame: String) -> bool {
        self.0.send(frame).is_ok()
    }
}

impl FrameReceiver {
    /// Next frame, or `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.0.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_arrive_in_order_and_close_is_observed() {
        let (a, b) = duplex();
        let (a_tx, mut a_rx) = a.split();
        let (b_tx, mut b_rx) = b.split();

        assert!(a_tx.send("1".into()));
        assert!(a_tx.send("2".into()));
        assert_eq!(b_rx.recv().await.as_deref(), Some("1"));
        assert_eq!(b_rx.recv().await.as_deref(), Some("2"));

        assert!(b_tx.send("back".into()));
        assert_eq!(a_rx.recv().await.as_deref(), Some("back"));

        drop(b_tx);
        assert_eq!(a_rx.recv().await, None);
        drop(b_rx);
        assert!(!a_tx.send("lost".into()));
    }
}
