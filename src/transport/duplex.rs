//! In-process duplex channels.
//!
//! A [`Duplex`] is one end of a two-way message pipe built from a pair of
//! unbounded mpsc channels. Each pipe has exactly two ends: the dispatcher
//! holds one, the subshell worker (or the control-plane peer) holds the
//! other. Dropping an end closes the pipe for the peer.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::wire::WireMessage;

/// Send failed because the peer end has been dropped.
#[derive(Debug, Error)]
#[error("peer end of the duplex channel is closed")]
pub struct ChannelClosed;

/// One end of an in-process duplex message channel.
#[derive(Debug)]
pub struct Duplex {
    tx: mpsc::UnboundedSender<WireMessage>,
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

/// Create a connected pair of channel ends.
#[must_use]
pub fn duplex() -> (Duplex, Duplex) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Duplex { tx: a_tx, rx: b_rx },
        Duplex { tx: b_tx, rx: a_rx },
    )
}

impl Duplex {
    /// Queue a message for the peer. Never blocks.
    pub fn send(&self, msg: WireMessage) -> Result<(), ChannelClosed> {
        self.tx.send(msg).map_err(|_| ChannelClosed)
    }

    /// Wait for the next message. `None` once the peer end is dropped and
    /// all queued messages have been drained.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }

    /// Take a queued message without waiting.
    pub fn try_recv(&mut self) -> Option<WireMessage> {
        self.rx.try_recv().ok()
    }

    /// True once the peer end has been dropped. Messages it queued before
    /// dropping can still be received.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}
